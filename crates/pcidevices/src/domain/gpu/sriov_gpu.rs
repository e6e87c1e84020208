//! SRIOVGPUDevice discovery and enablement.

use std::collections::BTreeMap;
use std::sync::Arc;

use api_types::labels::node_selector;
use api_types::labels::PARENT_SRIOV_GPU_LABEL;
use api_types::DeviceState;
use api_types::SRIOVGPUDevice;
use api_types::SriovGpuDeviceSpec;
use api_types::SriovGpuDeviceStatus;
use api_types::VGPUDevice;
use error_stack::Report;
use kube::ResourceExt;
use tokio::sync::Notify;
use tracing::debug;
use tracing::info;

use super::NVIDIA_VENDOR_ID;
use super::SRIOV_MANAGE;
use crate::domain::naming::record_name;
use crate::domain::node_meta;
use crate::error::DeviceError;
use crate::error::DeviceResult;
use crate::infrastructure::executor::run_checked;
use crate::infrastructure::executor::CommandExecutor;
use crate::infrastructure::store::RecordStore;
use crate::infrastructure::sysfs::pci;
use crate::infrastructure::sysfs::Sysfs;

pub struct SriovGpuReconciler {
    node_name: String,
    sysfs: Sysfs,
    executor: Arc<dyn CommandExecutor>,
    gpus: Arc<dyn RecordStore<SRIOVGPUDevice>>,
    vgpus: Arc<dyn RecordStore<VGPUDevice>>,
    /// Wakes vGPU discovery once VFs come or go.
    vgpu_resync: Arc<Notify>,
}

impl SriovGpuReconciler {
    pub fn new(
        node_name: impl Into<String>,
        sysfs: Sysfs,
        executor: Arc<dyn CommandExecutor>,
        gpus: Arc<dyn RecordStore<SRIOVGPUDevice>>,
        vgpus: Arc<dyn RecordStore<VGPUDevice>>,
        vgpu_resync: Arc<Notify>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            sysfs,
            executor,
            gpus,
            vgpus,
            vgpu_resync,
        }
    }

    /// Records every NVIDIA display function that can expose VFs.
    #[tracing::instrument(skip(self), fields(node = %self.node_name))]
    pub async fn discover(&self) -> DeviceResult<()> {
        let mut desired = BTreeMap::new();
        for function in pci::enumerate(&self.sysfs)? {
            if function.vendor_id != NVIDIA_VENDOR_ID
                || !function.is_display()
                || function.physfn.is_some()
            {
                continue;
            }
            if pci::sriov_totalvfs(&self.sysfs, &function.address)?.is_none() {
                continue;
            }
            let enabled = pci::sriov_numvfs(&self.sysfs, &function.address)? > 0;
            desired.insert(record_name(&self.node_name, &function.address), (function.address, enabled));
        }

        let existing: BTreeMap<String, SRIOVGPUDevice> = self
            .gpus
            .list(&node_selector(&self.node_name))
            .await?
            .into_iter()
            .map(|gpu| (gpu.name_any(), gpu))
            .collect();

        for (name, (address, enabled)) in &desired {
            if existing.contains_key(name) {
                continue;
            }
            let mut gpu = SRIOVGPUDevice::new(
                name,
                SriovGpuDeviceSpec {
                    address: address.clone(),
                    node_name: self.node_name.clone(),
                    enabled: *enabled,
                },
            );
            gpu.metadata = node_meta(name, &self.node_name);
            self.gpus.create(&gpu).await?;
            info!(name, address, enabled, "sriov gpu recorded");
        }

        for name in existing.keys().filter(|n| !desired.contains_key(*n)) {
            self.gpus.delete(name).await?;
            info!(name, "sriov gpu vanished, record removed");
        }
        Ok(())
    }

    async fn children(&self, gpu_name: &str) -> DeviceResult<Vec<VGPUDevice>> {
        let selector = format!(
            "{},{PARENT_SRIOV_GPU_LABEL}={gpu_name}",
            node_selector(&self.node_name)
        );
        self.vgpus.list(&selector).await
    }

    #[tracing::instrument(skip_all, fields(gpu = %gpu.name_any()))]
    pub async fn reconcile(&self, gpu: &SRIOVGPUDevice) -> DeviceResult<()> {
        if gpu.spec.node_name != self.node_name {
            return Ok(());
        }
        let name = gpu.name_any();
        let address = &gpu.spec.address;
        let current = pci::sriov_numvfs(&self.sysfs, address)?;

        let status = if gpu.spec.enabled {
            if current == 0 {
                run_checked(
                    self.executor.as_ref(),
                    SRIOV_MANAGE,
                    &["-e".to_string(), address.clone()],
                )
                .await?;
                info!(address, "sriov enabled on gpu");
            }
            SriovGpuDeviceStatus {
                vgpu_devices: pci::virtfn_addresses(&self.sysfs, address)?
                    .iter()
                    .map(|vf| record_name(&self.node_name, vf))
                    .collect(),
                status: DeviceState::Enabled,
            }
        } else {
            let busy: Vec<String> = self
                .children(&name)
                .await?
                .iter()
                .filter(|vgpu| vgpu.spec.enabled)
                .map(|vgpu| vgpu.name_any())
                .collect();
            if !busy.is_empty() {
                return Err(Report::new(DeviceError::policy(format!(
                    "{address} still has enabled vGPUs: {}",
                    busy.join(", ")
                ))));
            }
            if current != 0 {
                run_checked(
                    self.executor.as_ref(),
                    SRIOV_MANAGE,
                    &["-d".to_string(), address.clone()],
                )
                .await?;
                info!(address, "sriov disabled on gpu");
            }
            SriovGpuDeviceStatus::default()
        };

        if gpu.status.as_ref() != Some(&status) {
            let mut updated = gpu.clone();
            updated.status = Some(status);
            self.gpus.update_status(&updated).await?;
            debug!(address, "sriov gpu status updated");
        }
        self.vgpu_resync.notify_one();
        Ok(())
    }
}
