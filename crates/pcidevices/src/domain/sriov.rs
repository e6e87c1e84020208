//! SR-IOV capable NICs and their virtual functions.

use std::collections::BTreeMap;
use std::sync::Arc;

use api_types::labels::node_selector;
use api_types::DeviceState;
use api_types::SRIOVNetworkDevice;
use api_types::SriovNetworkDeviceSpec;
use api_types::SriovNetworkDeviceStatus;
use error_stack::Report;
use kube::ResourceExt;
use tokio::sync::Notify;
use tracing::debug;
use tracing::info;

use super::naming::record_name;
use super::naming::sriov_nic_name;
use super::node_meta;
use crate::error::DeviceError;
use crate::error::DeviceResult;
use crate::infrastructure::store::RecordStore;
use crate::infrastructure::sysfs::net::physical_interfaces;
use crate::infrastructure::sysfs::net::ManagementNics;
use crate::infrastructure::sysfs::pci;
use crate::infrastructure::sysfs::Sysfs;

pub struct SriovReconciler {
    node_name: String,
    sysfs: Sysfs,
    management: ManagementNics,
    nics: Arc<dyn RecordStore<SRIOVNetworkDevice>>,
    /// Wakes the PCI inventory so VF records follow VF changes.
    pci_resync: Arc<Notify>,
}

impl SriovReconciler {
    pub fn new(
        node_name: impl Into<String>,
        sysfs: Sysfs,
        management: ManagementNics,
        nics: Arc<dyn RecordStore<SRIOVNetworkDevice>>,
        pci_resync: Arc<Notify>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            sysfs,
            management,
            nics,
            pci_resync,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Creates a record for every SR-IOV capable physical NIC that is not a
    /// management interface and removes records of NICs no longer present.
    #[tracing::instrument(skip(self), fields(node = %self.node_name))]
    pub async fn setup_sriov_devices(&self) -> DeviceResult<()> {
        let excluded = self.management.interfaces()?;
        let mut desired = BTreeMap::new();
        for (iface, address) in physical_interfaces(&self.sysfs)? {
            if excluded.contains(&iface) {
                continue;
            }
            // VFs have a physfn and no SR-IOV capability of their own.
            let function = pci::read_function(&self.sysfs, &address)?;
            if function.physfn.is_some() || pci::sriov_totalvfs(&self.sysfs, &address)?.is_none() {
                continue;
            }
            desired.insert(sriov_nic_name(&self.node_name, &iface), (iface, address));
        }

        let existing: BTreeMap<String, SRIOVNetworkDevice> = self
            .nics
            .list(&node_selector(&self.node_name))
            .await?
            .into_iter()
            .map(|nic| (nic.name_any(), nic))
            .collect();

        for (name, (iface, address)) in &desired {
            if existing.contains_key(name) {
                continue;
            }
            let mut nic = SRIOVNetworkDevice::new(
                name,
                SriovNetworkDeviceSpec {
                    address: address.clone(),
                    interface_name: iface.clone(),
                    node_name: self.node_name.clone(),
                    num_vfs: 0,
                },
            );
            nic.metadata = node_meta(name, &self.node_name);
            nic.status = Some(SriovNetworkDeviceStatus::default());
            self.nics.create(&nic).await?;
            info!(name, iface, address, "sriov nic recorded");
        }

        for name in existing.keys().filter(|n| !desired.contains_key(*n)) {
            self.nics.delete(name).await?;
            info!(name, "sriov nic vanished, record removed");
        }
        Ok(())
    }

    /// Drives the VF count of one NIC to its spec and publishes the VFs.
    #[tracing::instrument(skip_all, fields(nic = %nic.name_any()))]
    pub async fn reconcile(&self, nic: &SRIOVNetworkDevice) -> DeviceResult<()> {
        if nic.spec.node_name != self.node_name {
            return Ok(());
        }
        let address = &nic.spec.address;
        let desired = nic.spec.num_vfs;
        let current = pci::sriov_numvfs(&self.sysfs, address)?;

        let status = if desired == 0 {
            if current != 0 {
                pci::set_sriov_numvfs(&self.sysfs, address, 0)?;
            }
            SriovNetworkDeviceStatus {
                status: DeviceState::Disabled,
                ..Default::default()
            }
        } else {
            if current != desired {
                let total = pci::sriov_totalvfs(&self.sysfs, address)?.unwrap_or(0);
                if desired > total {
                    return Err(Report::new(DeviceError::policy(format!(
                        "{address} supports at most {total} VFs, {desired} requested"
                    ))));
                }
                // The kernel refuses to change a non-zero count directly.
                if current != 0 {
                    pci::set_sriov_numvfs(&self.sysfs, address, 0)?;
                }
                pci::set_sriov_numvfs(&self.sysfs, address, desired)?;
            }
            let vf_addresses = pci::virtfn_addresses(&self.sysfs, address)?;
            let vf_pci_devices = vf_addresses
                .iter()
                .map(|vf| record_name(&self.node_name, vf))
                .collect();
            SriovNetworkDeviceStatus {
                vf_addresses,
                vf_pci_devices,
                status: DeviceState::Enabled,
            }
        };

        if nic.status.as_ref() != Some(&status) {
            let mut updated = nic.clone();
            updated.status = Some(status);
            self.nics.update_status(&updated).await?;
            debug!(address, desired, "sriov status updated");
        }
        self.pci_resync.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::infrastructure::sysfs::net::testing::add_interface;
    use crate::infrastructure::sysfs::testing::add_pci_function;
    use crate::infrastructure::sysfs::testing::link;
    use crate::infrastructure::sysfs::testing::write;
    use crate::mock::MemoryStore;

    const PF: &str = "0000:3b:00.0";

    fn numvfs_path(root: &std::path::Path) -> std::path::PathBuf {
        root.join("bus/pci/devices").join(PF).join("sriov_numvfs")
    }

    /// Materialises the VFs the kernel would create for a `sriov_numvfs`
    /// write.
    fn add_vfs(root: &std::path::Path, count: u32) {
        let pf = root.join("bus/pci/devices").join(PF);
        for i in 0..count {
            let vf = format!("0000:3b:02.{i}");
            add_pci_function(root, &vf, "8086:154C", "20000", Some("iavf"), Some(40 + i));
            link(&pf.join(format!("virtfn{i}")), &root.join("bus/pci/devices").join(&vf));
            link(&root.join("bus/pci/devices").join(&vf).join("physfn"), &pf);
        }
    }

    fn fixture() -> (tempfile::TempDir, SriovReconciler, Arc<MemoryStore<SRIOVNetworkDevice>>, Arc<Notify>) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        add_pci_function(root, PF, "8086:1572", "20000", Some("i40e"), Some(20));
        write(&root.join("bus/pci/devices").join(PF).join("sriov_totalvfs"), "8\n");
        write(&numvfs_path(root), "0\n");
        add_interface(root, "eno1", Some(PF));
        add_pci_function(root, "0000:18:00.0", "8086:1533", "20000", Some("igb"), Some(12));
        add_interface(root, "mgmt0", Some("0000:18:00.0"));
        write(&root.join("bus/pci/devices/0000:18:00.0/sriov_totalvfs"), "7\n");
        write(&root.join("proc/net/route"), "Iface\tDestination\nmgmt0\t00000000\n");

        let sysfs = Sysfs::new(root);
        let nics = Arc::new(MemoryStore::new());
        let resync = Arc::new(Notify::new());
        let reconciler = SriovReconciler::new(
            "node1",
            sysfs.clone(),
            ManagementNics::new(sysfs, root.join("proc"), Vec::new()),
            nics.clone(),
            resync.clone(),
        );
        (tmp, reconciler, nics, resync)
    }

    #[tokio::test]
    async fn setup_records_capable_non_management_nics() {
        let (_tmp, reconciler, nics, _) = fixture();
        nics.insert({
            let mut stale = SRIOVNetworkDevice::new("node1-eno9", Default::default());
            stale.metadata = node_meta("node1-eno9", "node1");
            stale
        });

        reconciler.setup_sriov_devices().await.expect("setup");
        assert_eq!(nics.names(), vec!["node1-eno1".to_string()]);
        let nic = nics.snapshot("node1-eno1").expect("nic");
        assert_eq!(nic.spec.address, PF);
        assert_eq!(nic.spec.interface_name, "eno1");
    }

    #[tokio::test]
    async fn enables_four_vfs_end_to_end() {
        let (tmp, reconciler, nics, resync) = fixture();
        reconciler.setup_sriov_devices().await.expect("setup");
        let mut nic = nics.snapshot("node1-eno1").expect("nic");
        nic.spec.num_vfs = 4;
        add_vfs(tmp.path(), 4);

        reconciler.reconcile(&nic).await.expect("reconcile");
        assert_eq!(fs::read_to_string(numvfs_path(tmp.path())).expect("numvfs"), "4");

        let status = nics
            .snapshot("node1-eno1")
            .and_then(|n| n.status)
            .expect("status");
        assert_eq!(status.status, DeviceState::Enabled);
        assert_eq!(status.vf_addresses.len(), 4);
        assert_eq!(
            status.vf_pci_devices,
            vec![
                "node1-00003b020".to_string(),
                "node1-00003b021".to_string(),
                "node1-00003b022".to_string(),
                "node1-00003b023".to_string(),
            ]
        );
        tokio::time::timeout(std::time::Duration::from_secs(1), resync.notified())
            .await
            .expect("pci resync requested");
    }

    #[tokio::test]
    async fn matching_count_performs_no_write() {
        let (tmp, reconciler, nics, _) = fixture();
        reconciler.setup_sriov_devices().await.expect("setup");
        write(&numvfs_path(tmp.path()), "4\n");
        add_vfs(tmp.path(), 4);
        let mut nic = nics.snapshot("node1-eno1").expect("nic");
        nic.spec.num_vfs = 4;
        nics.insert(nic.clone());

        reconciler.reconcile(&nic).await.expect("first");
        let nic = nics.snapshot("node1-eno1").expect("nic");
        assert_eq!(nic.spec.num_vfs, 4);
        assert_eq!(nic.status.as_ref().map(|s| s.status), Some(DeviceState::Enabled));
        let writes = nics.writes().len();
        reconciler.reconcile(&nic).await.expect("second");

        assert_eq!(fs::read_to_string(numvfs_path(tmp.path())).expect("numvfs"), "4\n");
        assert_eq!(nics.writes().len(), writes);
    }

    #[tokio::test]
    async fn zero_disables_and_clears() {
        let (tmp, reconciler, nics, _) = fixture();
        reconciler.setup_sriov_devices().await.expect("setup");
        write(&numvfs_path(tmp.path()), "2\n");
        let nic = nics.snapshot("node1-eno1").expect("nic");

        reconciler.reconcile(&nic).await.expect("reconcile");
        assert_eq!(fs::read_to_string(numvfs_path(tmp.path())).expect("numvfs"), "0");
        let status = nics
            .snapshot("node1-eno1")
            .and_then(|n| n.status)
            .expect("status");
        assert_eq!(status.status, DeviceState::Disabled);
        assert!(status.vf_addresses.is_empty());
    }

    #[tokio::test]
    async fn rejects_more_vfs_than_supported() {
        let (_tmp, reconciler, nics, _) = fixture();
        reconciler.setup_sriov_devices().await.expect("setup");
        let mut nic = nics.snapshot("node1-eno1").expect("nic");
        nic.spec.num_vfs = 16;
        let err = reconciler.reconcile(&nic).await.expect_err("too many");
        assert!(matches!(err.current_context(), DeviceError::Policy { .. }));
    }
}
