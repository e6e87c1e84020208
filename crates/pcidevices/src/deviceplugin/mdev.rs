//! vGPU partitions handed over as mediated devices.

use std::path::PathBuf;

use error_stack::Report;

use super::device_spec;
use super::Allocation;
use super::DeviceKind;
use crate::error::DeviceError;
use crate::error::DeviceResult;
use crate::infrastructure::sysfs::mdev;
use crate::infrastructure::sysfs::Sysfs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdevUnit {
    pub uuid: String,
    pub parent: String,
    /// Known once the mdev is live; looked up at allocation otherwise.
    pub iommu_group: Option<u32>,
}

pub struct MdevKind {
    resource_name: String,
    sysfs: Sysfs,
    dev_root: PathBuf,
}

impl MdevKind {
    pub fn new(resource_name: impl Into<String>, sysfs: Sysfs, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            resource_name: resource_name.into(),
            sysfs,
            dev_root: dev_root.into(),
        }
    }
}

impl DeviceKind for MdevKind {
    type Unit = MdevUnit;

    fn resource_name(&self) -> &str {
        &self.resource_name
    }

    fn env_prefix(&self) -> &'static str {
        "MDEV_PCI_RESOURCE"
    }

    fn health_path(&self, unit: &MdevUnit) -> PathBuf {
        self.sysfs.mdev_devices_dir().join(&unit.uuid)
    }

    fn resolve(&self, _id: &str, unit: &MdevUnit) -> DeviceResult<Allocation> {
        let group = match unit.iommu_group {
            Some(group) => group,
            None => mdev::iommu_group(&self.sysfs, &unit.uuid)?.ok_or_else(|| {
                Report::new(DeviceError::not_found(format!(
                    "iommu group of mdev {}",
                    unit.uuid
                )))
            })?,
        };
        Ok(Allocation {
            values: vec![unit.uuid.clone()],
            devices: vec![
                device_spec(&self.dev_root, "vfio/vfio"),
                device_spec(&self.dev_root, &format!("vfio/{group}")),
            ],
        })
    }
}
