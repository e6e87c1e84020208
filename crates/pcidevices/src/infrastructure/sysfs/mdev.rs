//! Mediated devices (vGPU partitions).
//!
//! Parents publish their partition types under
//! `/sys/class/mdev_bus/<addr>/mdev_supported_types/<type>/`, live instances
//! appear as `/sys/bus/mdev/devices/<uuid>` symlinks into the parent's
//! device directory.

use std::collections::BTreeMap;
use std::fs;

use error_stack::Report;
use tracing::debug;
use tracing::info;

use super::link_basename;
use super::list_dir;
use super::read_trimmed;
use super::write_value;
use super::Sysfs;
use crate::error::is_not_found;
use crate::error::DeviceError;
use crate::error::DeviceResult;

/// A partition type offered by a parent device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdevType {
    /// Driver type id, e.g. `nvidia-745`
    pub type_id: String,
    /// Human readable name, e.g. `NVIDIA A2-4Q`
    pub name: String,
    pub available_instances: u32,
}

/// A live mediated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdevInstance {
    pub uuid: String,
    pub parent: String,
    pub type_id: String,
    pub type_name: String,
    pub iommu_group: Option<u32>,
}

/// Addresses registered on the mdev bus, sorted.
pub fn capable_addresses(sysfs: &Sysfs) -> DeviceResult<Vec<String>> {
    list_dir(&sysfs.mdev_bus_dir())
}

pub fn is_capable(sysfs: &Sysfs, address: &str) -> bool {
    sysfs.mdev_bus_dir().join(address).exists()
}

/// Partition types of one parent. A parent without the directory yields none.
pub fn supported_types(sysfs: &Sysfs, address: &str) -> DeviceResult<Vec<MdevType>> {
    let types_dir = sysfs
        .mdev_bus_dir()
        .join(address)
        .join("mdev_supported_types");

    let mut types = Vec::new();
    for type_id in list_dir(&types_dir)? {
        let dir = types_dir.join(&type_id);
        let name = read_trimmed(&dir.join("name"))?;
        let raw = read_trimmed(&dir.join("available_instances"))?;
        let available_instances = raw.parse().map_err(|_| {
            Report::new(DeviceError::parse(format!(
                "{}: invalid available_instances {raw:?}",
                dir.display()
            )))
        })?;
        types.push(MdevType {
            type_id,
            name,
            available_instances,
        });
    }
    Ok(types)
}

/// Type name to type id for every type with at least one free instance.
pub fn available_types(sysfs: &Sysfs, address: &str) -> DeviceResult<BTreeMap<String, String>> {
    Ok(supported_types(sysfs, address)?
        .into_iter()
        .filter(|t| t.available_instances > 0)
        .map(|t| (t.name, t.type_id))
        .collect())
}

fn type_name(sysfs: &Sysfs, parent: &str, type_id: &str) -> DeviceResult<String> {
    let path = sysfs
        .mdev_bus_dir()
        .join(parent)
        .join("mdev_supported_types")
        .join(type_id)
        .join("name");
    match read_trimmed(&path) {
        Ok(name) => Ok(name),
        Err(e) if is_not_found(&e) => Ok(type_id.to_string()),
        Err(e) => Err(e),
    }
}

/// Resolves every live mdev back to its parent address and type. The bus
/// directory only exists once the mdev core is loaded, so its absence is an
/// empty result rather than an error.
pub fn discover_instances(sysfs: &Sysfs) -> DeviceResult<Vec<MdevInstance>> {
    let root = sysfs.mdev_devices_dir();
    let mut instances = Vec::new();

    for uuid in list_dir(&root)? {
        let entry = root.join(&uuid);
        let target = match fs::read_link(&entry) {
            Ok(target) => target,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(Report::new(DeviceError::from_io(&e, entry.display()))),
        };
        let Some(parent) = target
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .map(str::to_string)
        else {
            debug!(uuid, target = %target.display(), "mdev link without parent");
            continue;
        };
        let Some(type_id) = link_basename(&entry.join("mdev_type"))? else {
            debug!(uuid, "mdev without mdev_type link");
            continue;
        };
        let type_name = type_name(sysfs, &parent, &type_id)?;
        let iommu_group = link_basename(&entry.join("iommu_group"))?.and_then(|g| g.parse().ok());

        instances.push(MdevInstance {
            uuid,
            parent,
            type_id,
            type_name,
            iommu_group,
        });
    }
    Ok(instances)
}

pub fn iommu_group(sysfs: &Sysfs, uuid: &str) -> DeviceResult<Option<u32>> {
    Ok(
        link_basename(&sysfs.mdev_devices_dir().join(uuid).join("iommu_group"))?
            .and_then(|g| g.parse().ok()),
    )
}

/// Creates a partition of `type_id` on `parent` with the given UUID.
pub fn create(sysfs: &Sysfs, parent: &str, type_id: &str, uuid: &str) -> DeviceResult<()> {
    let path = sysfs
        .mdev_bus_dir()
        .join(parent)
        .join("mdev_supported_types")
        .join(type_id)
        .join("create");
    write_value(&path, uuid)?;
    info!(parent, type_id, uuid, "created mdev");
    Ok(())
}

/// Removes a partition. An mdev that is already gone counts as removed.
pub fn remove(sysfs: &Sysfs, uuid: &str) -> DeviceResult<()> {
    let path = sysfs.mdev_devices_dir().join(uuid).join("remove");
    match write_value(&path, "1") {
        Ok(()) => {
            info!(uuid, "removed mdev");
            Ok(())
        }
        Err(e) if is_not_found(&e) => {
            debug!(uuid, "mdev already removed");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
