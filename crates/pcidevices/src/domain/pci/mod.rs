//! PCIDevice inventory of one node.

pub mod claim;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use api_types::labels::node_selector;
use api_types::labels::NODE_LABEL;
use api_types::labels::PARENT_SRIOV_LABEL;
use api_types::PCIDevice;
use api_types::PciDeviceSpec;
use api_types::PciDeviceStatus;
use api_types::SRIOVNetworkDevice;
use kube::ResourceExt;
use tracing::debug;
use tracing::info;

use super::naming::pci_description;
use super::naming::pci_resource_name;
use super::naming::record_name;
use super::node_meta;
use crate::error::DeviceResult;
use crate::infrastructure::store::RecordStore;
use crate::infrastructure::sysfs::iommu::IommuGroups;
use crate::infrastructure::sysfs::net::ManagementNics;
use crate::infrastructure::sysfs::pci;
use crate::infrastructure::sysfs::pci::PciFunction;
use crate::infrastructure::sysfs::pci_ids::PciIds;
use crate::infrastructure::sysfs::Sysfs;

/// Keeps one PCIDevice per passthrough candidate on the node.
pub struct PciInventory {
    node_name: String,
    sysfs: Sysfs,
    pci_ids: Arc<PciIds>,
    management: ManagementNics,
    devices: Arc<dyn RecordStore<PCIDevice>>,
    sriov_nics: Arc<dyn RecordStore<SRIOVNetworkDevice>>,
}

impl PciInventory {
    pub fn new(
        node_name: impl Into<String>,
        sysfs: Sysfs,
        pci_ids: Arc<PciIds>,
        management: ManagementNics,
        devices: Arc<dyn RecordStore<PCIDevice>>,
        sriov_nics: Arc<dyn RecordStore<SRIOVNetworkDevice>>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            sysfs,
            pci_ids,
            management,
            devices,
            sriov_nics,
        }
    }

    /// VF address to the SRIOVNetworkDevice that published it.
    async fn vf_owners(&self) -> DeviceResult<BTreeMap<String, String>> {
        let mut owners = BTreeMap::new();
        for nic in self.sriov_nics.list(&node_selector(&self.node_name)).await? {
            let name = nic.name_any();
            for vf in nic.status.iter().flat_map(|s| s.vf_addresses.iter()) {
                owners.insert(vf.clone(), name.clone());
            }
        }
        Ok(owners)
    }

    fn desired_status(
        &self,
        function: &PciFunction,
        groups: &IommuGroups,
    ) -> DeviceResult<PciDeviceStatus> {
        Ok(PciDeviceStatus {
            address: function.address.clone(),
            vendor_id: function.vendor_id.clone(),
            device_id: function.device_id.clone(),
            class_id: function.class_id.clone(),
            node_name: self.node_name.clone(),
            resource_name: pci_resource_name(
                &self.pci_ids,
                &function.vendor_id,
                &function.device_id,
            ),
            description: pci_description(&self.pci_ids, &function.vendor_id, &function.device_id),
            kernel_driver_in_use: function.driver.clone().unwrap_or_default(),
            kernel_modules: pci::kernel_modules(&self.sysfs, &function.address)?,
            iommu_group: groups
                .group_of(&function.address)
                .map(|g| g.to_string())
                .unwrap_or_default(),
        })
    }

    fn desired_labels(
        &self,
        current: &BTreeMap<String, String>,
        owner: Option<&String>,
    ) -> BTreeMap<String, String> {
        let mut labels = current.clone();
        labels.insert(NODE_LABEL.to_string(), self.node_name.clone());
        match owner {
            Some(owner) => {
                labels.insert(PARENT_SRIOV_LABEL.to_string(), owner.clone());
            }
            None => {
                labels.remove(PARENT_SRIOV_LABEL);
            }
        }
        labels
    }

    /// One full pass. Any lookup or write failure aborts the pass.
    #[tracing::instrument(skip(self), fields(node = %self.node_name))]
    pub async fn reconcile(&self) -> DeviceResult<()> {
        let functions = pci::enumerate(&self.sysfs)?;
        let groups = IommuGroups::load(&self.sysfs)?;
        let skip = self.management.addresses()?;
        let owners = self.vf_owners().await?;

        let existing: BTreeMap<String, PCIDevice> = self
            .devices
            .list(&node_selector(&self.node_name))
            .await?
            .into_iter()
            .map(|d| (d.name_any(), d))
            .collect();

        let mut seen = BTreeSet::new();
        for function in &functions {
            if function.is_bridge() || skip.contains(&function.address) {
                continue;
            }
            let name = record_name(&self.node_name, &function.address);
            let status = self.desired_status(function, &groups)?;
            let owner = owners.get(&function.address);
            seen.insert(name.clone());

            match existing.get(&name) {
                None => {
                    let mut meta = node_meta(&name, &self.node_name);
                    meta.labels = Some(self.desired_labels(&BTreeMap::new(), owner));
                    let device = PCIDevice {
                        metadata: meta,
                        spec: PciDeviceSpec {},
                        status: Some(status),
                    };
                    self.devices.create(&device).await?;
                    info!(name, address = %function.address, "pci device recorded");
                }
                Some(current) => {
                    let labels = self.desired_labels(current.labels(), owner);
                    let mut current = current.clone();
                    if &labels != current.labels() {
                        current.metadata.labels = Some(labels);
                        current = self.devices.update(&current).await?;
                        debug!(name, "pci device labels updated");
                    }
                    if current.status.as_ref() != Some(&status) {
                        current.status = Some(status);
                        self.devices.update_status(&current).await?;
                        debug!(name, "pci device status updated");
                    }
                }
            }
        }

        for name in existing.keys().filter(|name| !seen.contains(*name)) {
            self.devices.delete(name).await?;
            info!(name, "pci device vanished, record removed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use api_types::SriovNetworkDeviceSpec;
    use api_types::SriovNetworkDeviceStatus;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::infrastructure::sysfs::net::testing::add_interface;
    use crate::infrastructure::sysfs::pci_ids::SAMPLE;
    use crate::infrastructure::sysfs::testing::add_pci_function;
    use crate::infrastructure::sysfs::testing::write;
    use crate::mock::MemoryStore;

    const ROUTES: &str = "Iface\tDestination\tGateway\n\
eno1\t00000000\t0101A8C0\n";

    struct Fixture {
        tmp: tempfile::TempDir,
        devices: Arc<MemoryStore<PCIDevice>>,
        nics: Arc<MemoryStore<SRIOVNetworkDevice>>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().expect("tempdir");
            let sys = tmp.path();
            add_pci_function(sys, "0000:00:01.0", "8086:1901", "60400", Some("pcieport"), Some(2));
            add_pci_function(sys, "0000:04:00.0", "10DE:2236", "30200", Some("nvidia"), Some(14));
            add_pci_function(sys, "0000:04:00.1", "10DE:1AEF", "40300", None, Some(14));
            add_pci_function(sys, "0000:3b:00.0", "8086:1572", "20000", Some("i40e"), Some(20));
            add_pci_function(sys, "0000:3b:02.0", "8086:154C", "20000", Some("iavf"), Some(21));
            add_interface(sys, "eno1", Some("0000:3b:00.0"));
            write(&sys.join("proc/net/route"), ROUTES);
            Self {
                tmp,
                devices: Arc::new(MemoryStore::new()),
                nics: Arc::new(MemoryStore::new()),
            }
        }

        fn inventory(&self) -> PciInventory {
            let sysfs = Sysfs::new(self.tmp.path());
            PciInventory::new(
                "node1",
                sysfs.clone(),
                Arc::new(PciIds::parse(SAMPLE)),
                ManagementNics::new(sysfs, self.tmp.path().join("proc"), Vec::new()),
                self.devices.clone(),
                self.nics.clone(),
            )
        }
    }

    #[test_log::test(tokio::test)]
    async fn records_candidates_and_skips_bridges_and_management() {
        let fx = Fixture::new();
        fx.inventory().reconcile().await.expect("reconcile");

        assert_eq!(
            fx.devices.names(),
            vec![
                "node1-000004000".to_string(),
                "node1-000004001".to_string(),
                "node1-00003b020".to_string(),
            ]
        );
        let gpu = fx
            .devices
            .snapshot("node1-000004000")
            .and_then(|d| d.status)
            .expect("status");
        assert_eq!(gpu.resource_name, "nvidia.com/GA102GL_A10");
        assert_eq!(gpu.kernel_driver_in_use, "nvidia");
        assert_eq!(gpu.iommu_group, "14");
        assert_eq!(gpu.class_id, "030200");

        let audio = fx
            .devices
            .snapshot("node1-000004001")
            .and_then(|d| d.status)
            .expect("status");
        assert_eq!(audio.iommu_group, "14");
        assert_eq!(audio.resource_name, "10de.com/1aef");
    }

    #[tokio::test]
    async fn second_pass_writes_nothing() {
        let fx = Fixture::new();
        let inventory = fx.inventory();
        inventory.reconcile().await.expect("first pass");
        let writes = fx.devices.writes().len();
        inventory.reconcile().await.expect("second pass");
        assert_eq!(fx.devices.writes().len(), writes);
    }

    #[tokio::test]
    async fn labels_vfs_with_their_owner() {
        let fx = Fixture::new();
        let mut nic = SRIOVNetworkDevice::new(
            "node1-eno2",
            SriovNetworkDeviceSpec {
                address: "0000:3b:00.1".to_string(),
                interface_name: "eno2".to_string(),
                node_name: "node1".to_string(),
                num_vfs: 1,
            },
        );
        nic.metadata = node_meta("node1-eno2", "node1");
        nic.status = Some(SriovNetworkDeviceStatus {
            vf_addresses: vec!["0000:3b:02.0".to_string()],
            ..Default::default()
        });
        fx.nics.insert(nic);

        fx.inventory().reconcile().await.expect("reconcile");
        let vf = fx.devices.snapshot("node1-00003b020").expect("vf record");
        assert_eq!(
            vf.labels().get(PARENT_SRIOV_LABEL).map(String::as_str),
            Some("node1-eno2")
        );
    }

    #[tokio::test]
    async fn vanished_function_is_deleted_once() {
        let fx = Fixture::new();
        let inventory = fx.inventory();
        inventory.reconcile().await.expect("first pass");

        std::fs::remove_dir_all(fx.tmp.path().join("bus/pci/devices/0000:04:00.1"))
            .expect("remove function");
        inventory.reconcile().await.expect("second pass");
        inventory.reconcile().await.expect("third pass");

        assert_eq!(fx.devices.deleted(), vec!["node1-000004001".to_string()]);
        assert!(fx.devices.snapshot("node1-000004001").is_none());
        // Deleting an absent record is not an error.
        fx.devices.delete("node1-000004001").await.expect("no-op delete");
    }

    #[tokio::test]
    async fn foreign_records_are_left_alone() {
        let fx = Fixture::new();
        let other = PCIDevice {
            metadata: node_meta("node2-000004000", "node2"),
            spec: PciDeviceSpec {},
            status: None,
        };
        fx.devices.insert(other);
        fx.inventory().reconcile().await.expect("reconcile");
        assert!(fx.devices.snapshot("node2-000004000").is_some());
        assert!(fx.devices.writes().iter().all(|w| !w.contains("node2")));
    }
}
