//! USBDevice inventory of one node.

pub mod claim;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use api_types::labels::node_selector;
use api_types::USBDevice;
use api_types::UsbDeviceSpec;
use api_types::UsbDeviceStatus;
use kube::ResourceExt;
use tracing::debug;
use tracing::info;

use super::naming::usb_record_name;
use super::naming::usb_resource_name;
use super::node_meta;
use crate::error::DeviceResult;
use crate::infrastructure::store::RecordStore;
use crate::infrastructure::sysfs::usb;
use crate::infrastructure::sysfs::usb::UsbEntry;
use crate::infrastructure::sysfs::Sysfs;

pub struct UsbInventory {
    node_name: String,
    sysfs: Sysfs,
    dev_root: PathBuf,
    devices: Arc<dyn RecordStore<USBDevice>>,
}

impl UsbInventory {
    pub fn new(
        node_name: impl Into<String>,
        sysfs: Sysfs,
        dev_root: impl Into<PathBuf>,
        devices: Arc<dyn RecordStore<USBDevice>>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            sysfs,
            dev_root: dev_root.into(),
            devices,
        }
    }

    fn desired_status(&self, entry: &UsbEntry, enabled: bool) -> UsbDeviceStatus {
        let uevent = &entry.uevent;
        UsbDeviceStatus {
            vendor_id: uevent.vendor_id.clone(),
            product_id: uevent.product_id.clone(),
            bus_number: uevent.bus_number,
            device_number: uevent.device_number,
            device_path: entry.device_path.clone(),
            resource_name: usb_resource_name(&uevent.vendor_id, &uevent.product_id),
            node_name: self.node_name.clone(),
            description: entry.description.clone(),
            pci_address: entry.pci_address.clone(),
            enabled,
        }
    }

    /// One full pass over the USB bus. The `enabled` flag belongs to the
    /// claim handler and is carried over untouched.
    #[tracing::instrument(skip(self), fields(node = %self.node_name))]
    pub async fn reconcile(&self) -> DeviceResult<()> {
        let entries = usb::enumerate(&self.sysfs, &self.dev_root)?;
        let existing: BTreeMap<String, USBDevice> = self
            .devices
            .list(&node_selector(&self.node_name))
            .await?
            .into_iter()
            .map(|d| (d.name_any(), d))
            .collect();

        let mut seen = BTreeSet::new();
        for entry in &entries {
            let uevent = &entry.uevent;
            let name = usb_record_name(
                &self.node_name,
                &uevent.vendor_id,
                &uevent.product_id,
                uevent.bus_number,
                uevent.device_number,
            );
            seen.insert(name.clone());

            match existing.get(&name) {
                None => {
                    let device = USBDevice {
                        metadata: node_meta(&name, &self.node_name),
                        spec: UsbDeviceSpec {},
                        status: Some(self.desired_status(entry, false)),
                    };
                    self.devices.create(&device).await?;
                    info!(name, path = %entry.device_path, "usb device recorded");
                }
                Some(current) => {
                    let enabled = current.status.as_ref().is_some_and(|s| s.enabled);
                    let status = self.desired_status(entry, enabled);
                    if current.status.as_ref() != Some(&status) {
                        let mut updated = current.clone();
                        updated.status = Some(status);
                        self.devices.update_status(&updated).await?;
                        debug!(name, "usb device status updated");
                    }
                }
            }
        }

        for name in existing.keys().filter(|name| !seen.contains(*name)) {
            self.devices.delete(name).await?;
            info!(name, "usb device unplugged, record removed");
        }
        Ok(())
    }
}
