use std::sync::Arc;
use std::sync::Mutex;

use api_types::VGPUDevice;
use futures::stream::BoxStream;
use kube::runtime::reflector::ObjectRef;
use kube::Client;
use tokio::sync::Notify;

use crate::deviceplugin::mdev::MdevKind;
use crate::deviceplugin::pci::PciKind;
use crate::deviceplugin::registry::PluginRegistry;
use crate::deviceplugin::usb::UsbKind;
use crate::domain::gpu::sriov_gpu::SriovGpuReconciler;
use crate::domain::gpu::vgpu::VgpuReconciler;
use crate::domain::mig::MigReconciler;
use crate::domain::pci::claim::PciClaimHandler;
use crate::domain::pci::PciInventory;
use crate::domain::sriov::SriovReconciler;
use crate::domain::usb::claim::UsbClaimHandler;
use crate::domain::usb::UsbInventory;

/// Everything the tasks share, wired once by the builder.
pub struct ApplicationServices {
    pub client: Client,
    pub pci_inventory: Arc<PciInventory>,
    pub usb_inventory: Arc<UsbInventory>,
    pub sriov: Arc<SriovReconciler>,
    pub sriov_gpu: Arc<SriovGpuReconciler>,
    pub vgpu: Arc<VgpuReconciler>,
    pub mig: Arc<MigReconciler>,
    pub pci_claims: Arc<PciClaimHandler>,
    pub usb_claims: Arc<UsbClaimHandler>,
    pub pci_plugins: Arc<PluginRegistry<PciKind>>,
    pub mdev_plugins: Arc<PluginRegistry<MdevKind>>,
    pub usb_plugins: Arc<PluginRegistry<UsbKind>>,
    /// Wakes the PCI inventory pass.
    pub pci_resync: Arc<Notify>,
    /// Wakes the vGPU discovery pass.
    pub vgpu_resync: Arc<Notify>,
    /// Sibling requeues of the vGPU controller, taken once when it starts.
    pub vgpu_requeues: Mutex<Option<BoxStream<'static, ObjectRef<VGPUDevice>>>>,
}
