//! PCIDeviceClaim: hands a whole function to vfio-pci and serves it.

use std::sync::Arc;

use api_types::PCIDevice;
use api_types::PCIDeviceClaim;
use api_types::PciDeviceClaimStatus;
use error_stack::Report;
use kube::ResourceExt;
use tracing::info;
use tracing::warn;

use crate::deviceplugin::pci::PciUnit;
use crate::deviceplugin::registry::Registrar;
use crate::domain::naming::record_name;
use crate::error::DeviceError;
use crate::error::DeviceResult;
use crate::infrastructure::store::RecordStore;
use crate::infrastructure::sysfs::pci;
use crate::infrastructure::sysfs::Sysfs;

pub struct PciClaimHandler {
    node_name: String,
    sysfs: Sysfs,
    devices: Arc<dyn RecordStore<PCIDevice>>,
    claims: Arc<dyn RecordStore<PCIDeviceClaim>>,
    registrar: Arc<dyn Registrar<PciUnit>>,
}

impl PciClaimHandler {
    pub fn new(
        node_name: impl Into<String>,
        sysfs: Sysfs,
        devices: Arc<dyn RecordStore<PCIDevice>>,
        claims: Arc<dyn RecordStore<PCIDeviceClaim>>,
        registrar: Arc<dyn Registrar<PciUnit>>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            sysfs,
            devices,
            claims,
            registrar,
        }
    }

    pub fn is_local(&self, claim: &PCIDeviceClaim) -> bool {
        claim.spec.node_name == self.node_name
    }

    async fn resource_name(&self, address: &str) -> DeviceResult<String> {
        let name = record_name(&self.node_name, address);
        self.devices
            .get(&name)
            .await?
            .and_then(|d| d.status)
            .map(|s| s.resource_name)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| Report::new(DeviceError::not_found(format!("pci device {name}"))))
    }

    /// Binds the function to vfio-pci, serves it, and records the driver it
    /// was taken from. Repeating the call only re-registers the unit.
    #[tracing::instrument(skip_all, fields(claim = %claim.name_any()))]
    pub async fn apply(&self, claim: &PCIDeviceClaim) -> DeviceResult<()> {
        let address = &claim.spec.address;
        let resource_name = self.resource_name(address).await?;
        let function = pci::read_function(&self.sysfs, address)?;
        let mut status = claim.status.clone().unwrap_or_default();

        if !status.passthrough_enabled {
            if !function.is_vfio_bound() {
                status.kernel_driver_to_unbind = function.driver.clone().unwrap_or_default();
            }
            pci::bind_vfio(&self.sysfs, address)?;
        }

        let iommu_group = function.iommu_group.ok_or_else(|| {
            Report::new(DeviceError::policy(format!(
                "{address} has no IOMMU group, is the IOMMU enabled?"
            )))
        })?;
        self.registrar
            .add_device(
                &resource_name,
                address,
                PciUnit {
                    address: address.clone(),
                    iommu_group,
                    numa_node: function.numa_node,
                },
            )
            .await?;

        status.passthrough_enabled = true;
        if claim.status.as_ref() != Some(&status) {
            let mut updated = claim.clone();
            updated.status = Some(status);
            self.claims.update_status(&updated).await?;
            info!(address, resource_name, "pci passthrough enabled");
        }
        Ok(())
    }

    /// Stops serving the function and gives it back to its default driver.
    #[tracing::instrument(skip_all, fields(claim = %claim.name_any()))]
    pub async fn cleanup(&self, claim: &PCIDeviceClaim) -> DeviceResult<()> {
        let address = &claim.spec.address;
        match self.resource_name(address).await {
            Ok(resource_name) => self.registrar.remove_device(&resource_name, address).await?,
            Err(e) => warn!(address, "cannot resolve resource name, unit not removed: {e:?}"),
        }
        pci::unbind_vfio(&self.sysfs, address)?;
        info!(address, "pci passthrough disabled");
        Ok(())
    }
}
