//! IOMMU group membership.
//!
//! All functions in one group share a DMA isolation domain and can only be
//! passed through together.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use tracing::debug;

use super::list_dir;
use super::Sysfs;
use crate::error::DeviceResult;

/// Address to group-id map built from `/sys/kernel/iommu_groups`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IommuGroups {
    by_address: BTreeMap<String, u32>,
}

impl IommuGroups {
    /// Reads all groups. A host without an IOMMU has no groups directory,
    /// which yields an empty index.
    pub fn load(sysfs: &Sysfs) -> DeviceResult<Self> {
        let groups_dir = sysfs.iommu_groups_dir();
        let mut by_address = BTreeMap::new();

        for group in list_dir(&groups_dir)? {
            let Ok(id) = group.parse::<u32>() else {
                continue;
            };
            for address in list_dir(&groups_dir.join(&group).join("devices"))? {
                by_address.insert(address, id);
            }
        }

        debug!(devices = by_address.len(), "loaded iommu groups");
        Ok(Self { by_address })
    }

    /// Builds the index from explicit pairs, in any order.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        Self {
            by_address: pairs.into_iter().map(|(a, g)| (a.into(), g)).collect(),
        }
    }

    pub fn group_of(&self, address: &str) -> Option<u32> {
        self.by_address.get(address).copied()
    }

    /// All addresses in `group`, sorted.
    pub fn members(&self, group: u32) -> Vec<String> {
        self.by_address
            .iter()
            .filter(|(_, g)| **g == group)
            .map(|(a, _)| a.clone())
            .collect()
    }

    /// Group id to member set.
    pub fn membership(&self) -> BTreeMap<u32, BTreeSet<String>> {
        let mut out: BTreeMap<u32, BTreeSet<String>> = BTreeMap::new();
        for (address, group) in &self.by_address {
            out.entry(*group).or_default().insert(address.clone());
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}

/// Lists the members of one group straight from sysfs.
pub fn group_devices(sysfs: &Sysfs, group: u32) -> DeviceResult<Vec<String>> {
    list_dir(&sysfs.iommu_groups_dir().join(group.to_string()).join("devices"))
}
