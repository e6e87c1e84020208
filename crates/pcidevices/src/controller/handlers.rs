//! Binds each domain reconciler to its record kind.

use std::sync::Arc;
use std::time::Duration;

use api_types::MigConfiguration;
use api_types::PCIDeviceClaim;
use api_types::SRIOVGPUDevice;
use api_types::SRIOVNetworkDevice;
use api_types::USBDeviceClaim;
use api_types::VGPUDevice;
use async_trait::async_trait;
use kube::runtime::controller::Action;

use super::Reconciler;
use crate::domain::gpu::sriov_gpu::SriovGpuReconciler;
use crate::domain::gpu::vgpu::VgpuReconciler;
use crate::domain::mig::MigReconciler;
use crate::domain::pci::claim::PciClaimHandler;
use crate::domain::sriov::SriovReconciler;
use crate::domain::usb::claim::UsbClaimHandler;
use crate::error::DeviceResult;

pub const PCI_CLAIM_FINALIZER: &str = "devices.harvesterhci.io/pci-device-claim";
pub const USB_CLAIM_FINALIZER: &str = "devices.harvesterhci.io/usb-device-claim";

#[async_trait]
impl Reconciler<SRIOVNetworkDevice> for SriovReconciler {
    fn is_local(&self, obj: &SRIOVNetworkDevice) -> bool {
        obj.spec.node_name == self.node_name()
    }

    async fn apply(&self, obj: Arc<SRIOVNetworkDevice>) -> DeviceResult<Action> {
        self.reconcile(&obj).await?;
        Ok(Action::await_change())
    }
}

#[async_trait]
impl Reconciler<SRIOVGPUDevice> for SriovGpuReconciler {
    async fn apply(&self, obj: Arc<SRIOVGPUDevice>) -> DeviceResult<Action> {
        self.reconcile(&obj).await?;
        Ok(Action::await_change())
    }
}

#[async_trait]
impl Reconciler<VGPUDevice> for VgpuReconciler {
    async fn apply(&self, obj: Arc<VGPUDevice>) -> DeviceResult<Action> {
        self.reconcile(&obj).await?;
        Ok(Action::await_change())
    }
}

/// MIG state drifts through out-of-band `nvidia-smi` use, so every
/// configuration is re-derived on a fixed interval.
pub struct MigHandler {
    pub reconciler: Arc<MigReconciler>,
    pub resync: Duration,
}

#[async_trait]
impl Reconciler<MigConfiguration> for MigHandler {
    async fn apply(&self, obj: Arc<MigConfiguration>) -> DeviceResult<Action> {
        self.reconciler.reconcile(&obj).await?;
        Ok(Action::requeue(self.resync))
    }
}

#[async_trait]
impl Reconciler<PCIDeviceClaim> for PciClaimHandler {
    fn is_local(&self, obj: &PCIDeviceClaim) -> bool {
        PciClaimHandler::is_local(self, obj)
    }

    async fn apply(&self, obj: Arc<PCIDeviceClaim>) -> DeviceResult<Action> {
        PciClaimHandler::apply(self, &obj).await?;
        Ok(Action::await_change())
    }

    async fn cleanup(&self, obj: Arc<PCIDeviceClaim>) -> DeviceResult<Action> {
        PciClaimHandler::cleanup(self, &obj).await?;
        Ok(Action::await_change())
    }
}

#[async_trait]
impl Reconciler<USBDeviceClaim> for UsbClaimHandler {
    fn is_local(&self, obj: &USBDeviceClaim) -> bool {
        UsbClaimHandler::is_local(self, obj)
    }

    async fn apply(&self, obj: Arc<USBDeviceClaim>) -> DeviceResult<Action> {
        UsbClaimHandler::apply(self, &obj).await?;
        Ok(Action::await_change())
    }

    async fn cleanup(&self, obj: Arc<USBDeviceClaim>) -> DeviceResult<Action> {
        UsbClaimHandler::cleanup(self, &obj).await?;
        Ok(Action::await_change())
    }
}
