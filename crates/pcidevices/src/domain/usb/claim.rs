//! USBDeviceClaim: serves a USB device node to workloads.

use std::sync::Arc;

use api_types::USBDevice;
use api_types::USBDeviceClaim;
use api_types::UsbDeviceClaimStatus;
use api_types::UsbDeviceStatus;
use error_stack::Report;
use kube::ResourceExt;
use tracing::info;

use crate::deviceplugin::registry::Registrar;
use crate::deviceplugin::usb::UsbUnit;
use crate::error::DeviceError;
use crate::error::DeviceResult;
use crate::infrastructure::store::RecordStore;

/// Claims are named after the USBDevice they reserve.
pub struct UsbClaimHandler {
    node_name: String,
    devices: Arc<dyn RecordStore<USBDevice>>,
    claims: Arc<dyn RecordStore<USBDeviceClaim>>,
    registrar: Arc<dyn Registrar<UsbUnit>>,
}

impl UsbClaimHandler {
    pub fn new(
        node_name: impl Into<String>,
        devices: Arc<dyn RecordStore<USBDevice>>,
        claims: Arc<dyn RecordStore<USBDeviceClaim>>,
        registrar: Arc<dyn Registrar<UsbUnit>>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            devices,
            claims,
            registrar,
        }
    }

    pub fn is_local(&self, claim: &USBDeviceClaim) -> bool {
        claim.spec.node_name == self.node_name
    }

    async fn device(&self, name: &str) -> DeviceResult<Option<(USBDevice, UsbDeviceStatus)>> {
        Ok(self
            .devices
            .get(name)
            .await?
            .and_then(|d| d.status.clone().map(|s| (d, s))))
    }

    async fn set_enabled(&self, mut device: USBDevice, mut status: UsbDeviceStatus, enabled: bool) -> DeviceResult<()> {
        if status.enabled == enabled {
            return Ok(());
        }
        status.enabled = enabled;
        device.status = Some(status);
        self.devices.update_status(&device).await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(claim = %claim.name_any()))]
    pub async fn apply(&self, claim: &USBDeviceClaim) -> DeviceResult<()> {
        let name = claim.name_any();
        let (device, status) = self
            .device(&name)
            .await?
            .ok_or_else(|| Report::new(DeviceError::not_found(format!("usb device {name}"))))?;

        self.registrar
            .add_device(
                &status.resource_name,
                &name,
                UsbUnit {
                    bus_number: status.bus_number,
                    device_number: status.device_number,
                },
            )
            .await?;

        let claim_status = UsbDeviceClaimStatus {
            pci_address: status.pci_address.clone(),
            enabled: true,
        };
        if claim.status.as_ref() != Some(&claim_status) {
            let mut updated = claim.clone();
            updated.status = Some(claim_status);
            self.claims.update_status(&updated).await?;
            info!(name, path = %status.device_path, "usb passthrough enabled");
        }
        self.set_enabled(device, status, true).await
    }

    /// Stops serving the device. A device unplugged in the meantime only
    /// has its unit removed.
    #[tracing::instrument(skip_all, fields(claim = %claim.name_any()))]
    pub async fn cleanup(&self, claim: &USBDeviceClaim) -> DeviceResult<()> {
        let name = claim.name_any();
        let Some((device, status)) = self.device(&name).await? else {
            info!(name, "usb device already gone");
            return Ok(());
        };
        self.registrar
            .remove_device(&status.resource_name, &name)
            .await?;
        self.set_enabled(device, status, false).await?;
        info!(name, "usb passthrough disabled");
        Ok(())
    }
}
