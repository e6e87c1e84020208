//! Parsers for the tables printed by `nvidia-smi mig`.
//!
//! Only rows describing a MIG profile or instance are considered: the first
//! column is the GPU index and the `MIG` marker precedes the profile name.
//! Borders, headers and continuation rows are skipped.

use std::collections::BTreeMap;

use api_types::MigProfileStatus;
use error_stack::Report;

use crate::error::DeviceError;
use crate::error::DeviceResult;

const MIG_MARKER: &str = "MIG";

/// A row of `nvidia-smi mig -lgip`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigProfile {
    pub id: u32,
    /// e.g. `MIG 3g.20gb`
    pub name: String,
    pub available: u32,
    pub total: u32,
}

/// A row of `nvidia-smi mig -lgi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuInstance {
    pub profile_id: u32,
    pub id: u32,
}

/// A row of `nvidia-smi mig -lci`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeInstance {
    pub gpu_instance: u32,
    pub id: u32,
}

/// Whitespace separated fields of a table row, with the `|` borders dropped.
fn fields(line: &str) -> Vec<&str> {
    line.split(|c: char| c == '|' || c.is_whitespace())
        .filter(|f| !f.is_empty())
        .collect()
}

fn number(field: &str, row: &str) -> DeviceResult<u32> {
    field.parse().map_err(|_| {
        Report::new(DeviceError::parse(format!(
            "unexpected value {field:?} in MIG row {row:?}"
        )))
    })
}

fn is_gpu_index(field: &str) -> bool {
    !field.is_empty() && field.bytes().all(|b| b.is_ascii_digit())
}

/// Rows of the form `<gpu> MIG <name> ...`.
fn marker_rows(text: &str) -> impl Iterator<Item = (&str, Vec<&str>)> {
    text.lines().filter_map(|line| {
        let f = fields(line);
        (f.len() >= 5 && is_gpu_index(f[0]) && f[1] == MIG_MARKER).then_some((line, f))
    })
}

pub fn parse_profiles(text: &str) -> DeviceResult<Vec<MigProfile>> {
    let mut profiles = Vec::new();
    for (row, f) in marker_rows(text) {
        let (available, total) = f[4].split_once('/').ok_or_else(|| {
            Report::new(DeviceError::parse(format!("no free/total column in {row:?}")))
        })?;
        profiles.push(MigProfile {
            id: number(f[3], row)?,
            name: format!("{MIG_MARKER} {}", f[2]),
            available: number(available, row)?,
            total: number(total, row)?,
        });
    }
    Ok(profiles)
}

pub fn parse_gpu_instances(text: &str) -> DeviceResult<Vec<GpuInstance>> {
    marker_rows(text)
        .map(|(row, f)| {
            Ok(GpuInstance {
                profile_id: number(f[3], row)?,
                id: number(f[4], row)?,
            })
        })
        .collect()
}

/// Compute instance rows carry the GPU instance id before the marker:
/// `<gpu> <gi> MIG <name> <profile> <ci> <placement>`.
pub fn parse_compute_instances(text: &str) -> DeviceResult<Vec<ComputeInstance>> {
    let mut instances = Vec::new();
    for line in text.lines() {
        let f = fields(line);
        if f.len() < 6 || !is_gpu_index(f[0]) || f[2] != MIG_MARKER {
            continue;
        }
        instances.push(ComputeInstance {
            gpu_instance: number(f[1], line)?,
            id: number(f[5], line)?,
        });
    }
    Ok(instances)
}

/// Joins profiles with the live instances created from them. `available`
/// is taken from the profile listing as printed.
pub fn profile_status(profiles: &[MigProfile], instances: &[GpuInstance]) -> Vec<MigProfileStatus> {
    let mut by_profile: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for instance in instances {
        by_profile
            .entry(instance.profile_id)
            .or_default()
            .push(instance.id);
    }

    profiles
        .iter()
        .map(|profile| {
            let mut ids = by_profile.get(&profile.id).cloned().unwrap_or_default();
            ids.sort_unstable();
            MigProfileStatus {
                id: profile.id,
                name: profile.name.clone(),
                available: profile.available,
                total: profile.total,
                vgpu_id: ids.iter().map(u32::to_string).collect(),
            }
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::fixtures::*;
    use super::*;

    #[test]
    fn parses_profile_rows_only() {
        let profiles = parse_profiles(PROFILES).expect("parse");
        assert_eq!(profiles.len(), 4);
        assert_eq!(
            profiles[2],
            MigProfile {
                id: 9,
                name: "MIG 3g.40gb".to_string(),
                available: 0,
                total: 2,
            }
        );
    }

    #[test]
    fn joins_instances_by_profile() {
        let profiles = parse_profiles(PROFILES).expect("profiles");
        let instances = parse_gpu_instances(INSTANCES).expect("instances");
        assert_eq!(
            instances,
            vec![
                GpuInstance { profile_id: 9, id: 1 },
                GpuInstance { profile_id: 9, id: 2 },
            ]
        );

        let status = profile_status(&profiles, &instances);
        let nine = status.iter().find(|p| p.id == 9).expect("profile 9");
        assert_eq!(nine.available, 0);
        assert_eq!(nine.total, 2);
        assert_eq!(nine.vgpu_id, vec!["1".to_string(), "2".to_string()]);
        assert!(status.iter().filter(|p| p.id != 9).all(|p| p.vgpu_id.is_empty()));
    }

    #[test]
    fn compute_rows_are_not_gpu_instances() {
        assert_eq!(parse_gpu_instances(COMPUTE).expect("parse"), Vec::new());
        assert_eq!(
            parse_compute_instances(COMPUTE).expect("parse"),
            vec![ComputeInstance { gpu_instance: 1, id: 0 }]
        );
        assert_eq!(parse_compute_instances(INSTANCES).expect("parse"), Vec::new());
    }

    #[test]
    fn malformed_capacity_is_an_error() {
        let row = "|   0  MIG 1g.10gb       19     seven        9.50       No     14 |";
        assert!(parse_profiles(row).is_err());
        assert!(parse_profiles("No MIG-enabled devices found.").expect("empty").is_empty());
    }
}
