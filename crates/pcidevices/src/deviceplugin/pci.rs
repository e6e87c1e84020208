//! Whole PCI functions handed over through vfio.

use std::path::PathBuf;

use super::api::v1beta1::NumaNode;
use super::api::v1beta1::TopologyInfo;
use super::device_spec;
use super::Allocation;
use super::DeviceKind;
use crate::error::DeviceResult;
use crate::infrastructure::sysfs::iommu;
use crate::infrastructure::sysfs::pci;
use crate::infrastructure::sysfs::Sysfs;

/// A PCI function bound to vfio-pci.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciUnit {
    pub address: String,
    pub iommu_group: u32,
    pub numa_node: Option<i64>,
}

pub struct PciKind {
    resource_name: String,
    sysfs: Sysfs,
    dev_root: PathBuf,
}

impl PciKind {
    pub fn new(resource_name: impl Into<String>, sysfs: Sysfs, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            resource_name: resource_name.into(),
            sysfs,
            dev_root: dev_root.into(),
        }
    }

    /// Every function sharing the unit's IOMMU group, bridges excluded.
    fn group_members(&self, unit: &PciUnit) -> DeviceResult<Vec<String>> {
        let mut members = Vec::new();
        for address in iommu::group_devices(&self.sysfs, unit.iommu_group)? {
            let bridge = pci::class_id(&self.sysfs, &address)
                .map(|class| class.starts_with("06"))
                .unwrap_or(false);
            if !bridge {
                members.push(address);
            }
        }
        if members.is_empty() {
            members.push(unit.address.clone());
        }
        Ok(members)
    }
}

impl DeviceKind for PciKind {
    type Unit = PciUnit;

    fn resource_name(&self) -> &str {
        &self.resource_name
    }

    fn env_prefix(&self) -> &'static str {
        "PCI_RESOURCE"
    }

    fn health_path(&self, unit: &PciUnit) -> PathBuf {
        self.dev_root.join("vfio").join(unit.iommu_group.to_string())
    }

    fn topology(&self, unit: &PciUnit) -> Option<TopologyInfo> {
        unit.numa_node.map(|id| TopologyInfo {
            nodes: vec![NumaNode { id }],
        })
    }

    fn resolve(&self, _id: &str, unit: &PciUnit) -> DeviceResult<Allocation> {
        Ok(Allocation {
            values: self.group_members(unit)?,
            devices: vec![
                device_spec(&self.dev_root, "vfio/vfio"),
                device_spec(&self.dev_root, &format!("vfio/{}", unit.iommu_group)),
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::infrastructure::sysfs::testing::add_pci_function;

    #[test]
    fn allocation_covers_the_whole_group() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let sys = tmp.path().join("sys");
        add_pci_function(&sys, "0000:04:00.0", "10DE:2236", "30200", Some("vfio-pci"), Some(14));
        add_pci_function(&sys, "0000:04:00.1", "10DE:1AEF", "40300", Some("vfio-pci"), Some(14));
        add_pci_function(&sys, "0000:00:01.0", "8086:1901", "60400", Some("pcieport"), Some(14));

        let kind = PciKind::new("nvidia.com/GA102GL_A10", Sysfs::new(&sys), tmp.path().join("dev"));
        let unit = PciUnit {
            address: "0000:04:00.0".to_string(),
            iommu_group: 14,
            numa_node: Some(0),
        };

        let allocation = kind.resolve("0000:04:00.0", &unit).expect("resolve");
        assert_eq!(allocation.values, vec!["0000:04:00.0", "0000:04:00.1"]);
        let paths: Vec<_> = allocation
            .devices
            .iter()
            .map(|d| d.container_path.as_str())
            .collect();
        assert_eq!(paths, vec!["/dev/vfio/vfio", "/dev/vfio/14"]);
        assert_eq!(
            kind.health_path(&unit),
            tmp.path().join("dev").join("vfio").join("14")
        );
        assert_eq!(kind.topology(&unit).map(|t| t.nodes.len()), Some(1));
    }

    #[test]
    fn empty_group_falls_back_to_the_function() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let kind = PciKind::new("example.com/nic", Sysfs::new(tmp.path()), tmp.path().join("dev"));
        let unit = PciUnit {
            address: "0000:af:00.2".to_string(),
            iommu_group: 40,
            numa_node: None,
        };
        let allocation = kind.resolve("0000:af:00.2", &unit).expect("resolve");
        assert_eq!(allocation.values, vec!["0000:af:00.2"]);
        assert!(kind.topology(&unit).is_none());
    }
}
