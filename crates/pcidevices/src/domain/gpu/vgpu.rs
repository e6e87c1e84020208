//! VGPUDevice lifecycle: Disabled (no mdev) and Enabled (mdev + type).

use std::collections::BTreeMap;
use std::sync::Arc;

use api_types::labels::node_selector;
use api_types::labels::NODE_LABEL;
use api_types::labels::PARENT_SRIOV_GPU_LABEL;
use api_types::DeviceState;
use api_types::VGPUDevice;
use api_types::VgpuDeviceSpec;
use api_types::VgpuDeviceStatus;
use error_stack::Report;
use kube::ResourceExt;
use tracing::debug;
use tracing::info;
use uuid::Uuid;

use crate::deviceplugin::mdev::MdevUnit;
use crate::deviceplugin::registry::Registrar;
use crate::domain::naming::record_name;
use crate::domain::naming::vgpu_resource_name;
use crate::domain::node_meta;
use crate::error::DeviceError;
use crate::error::DeviceResult;
use crate::infrastructure::store::Enqueue;
use crate::infrastructure::store::RecordStore;
use crate::infrastructure::sysfs::mdev;
use crate::infrastructure::sysfs::mdev::MdevInstance;
use crate::infrastructure::sysfs::pci;
use crate::infrastructure::sysfs::Sysfs;

pub struct VgpuReconciler {
    node_name: String,
    sysfs: Sysfs,
    vgpus: Arc<dyn RecordStore<VGPUDevice>>,
    registrar: Arc<dyn Registrar<MdevUnit>>,
    requeue: Arc<dyn Enqueue>,
}

impl VgpuReconciler {
    pub fn new(
        node_name: impl Into<String>,
        sysfs: Sysfs,
        vgpus: Arc<dyn RecordStore<VGPUDevice>>,
        registrar: Arc<dyn Registrar<MdevUnit>>,
        requeue: Arc<dyn Enqueue>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            sysfs,
            vgpus,
            registrar,
            requeue,
        }
    }

    /// The live mdev on `address`, if any. An absent mdev bus reads as none.
    fn discovered(&self, address: &str) -> DeviceResult<Option<MdevInstance>> {
        Ok(mdev::discover_instances(&self.sysfs)?
            .into_iter()
            .find(|instance| instance.parent == address))
    }

    /// Records every mdev capable function. Functions that already carry a
    /// partition are recorded as enabled with that partition's type.
    #[tracing::instrument(skip(self), fields(node = %self.node_name))]
    pub async fn discover(&self) -> DeviceResult<()> {
        let instances = mdev::discover_instances(&self.sysfs)?;
        let mut desired = BTreeMap::new();
        for address in mdev::capable_addresses(&self.sysfs)? {
            let parent = pci::read_function(&self.sysfs, &address)?.physfn;
            desired.insert(record_name(&self.node_name, &address), (address, parent));
        }

        let existing: BTreeMap<String, VGPUDevice> = self
            .vgpus
            .list(&node_selector(&self.node_name))
            .await?
            .into_iter()
            .map(|v| (v.name_any(), v))
            .collect();

        for (name, (address, parent)) in &desired {
            if existing.contains_key(name) {
                continue;
            }
            let live = instances.iter().find(|i| &i.parent == address);
            let mut vgpu = VGPUDevice::new(
                name,
                VgpuDeviceSpec {
                    address: address.clone(),
                    node_name: self.node_name.clone(),
                    enabled: live.is_some(),
                    vgpu_type_name: live.map(|i| i.type_name.clone()).unwrap_or_default(),
                    parent_gpu_device_address: parent.clone().unwrap_or_default(),
                },
            );
            vgpu.metadata = node_meta(name, &self.node_name);
            if let Some(parent) = parent {
                vgpu.labels_mut().insert(
                    PARENT_SRIOV_GPU_LABEL.to_string(),
                    record_name(&self.node_name, parent),
                );
            }
            vgpu.status = Some(VgpuDeviceStatus {
                available_types: mdev::available_types(&self.sysfs, address)?,
                ..Default::default()
            });
            self.vgpus.create(&vgpu).await?;
            info!(name, address, "vgpu device recorded");
        }

        for name in existing.keys().filter(|n| !desired.contains_key(*n)) {
            self.vgpus.delete(name).await?;
            info!(name, "vgpu device vanished, record removed");
        }
        Ok(())
    }

    /// Requeues the other partitions of the same physical GPU; their free
    /// type list changes with every create and remove.
    async fn requeue_siblings(&self, vgpu: &VGPUDevice) -> DeviceResult<()> {
        let Some(parent) = vgpu.labels().get(PARENT_SRIOV_GPU_LABEL) else {
            return Ok(());
        };
        let selector = format!(
            "{NODE_LABEL}={},{PARENT_SRIOV_GPU_LABEL}={parent}",
            self.node_name
        );
        let own = vgpu.name_any();
        for sibling in self.vgpus.list(&selector).await? {
            let name = sibling.name_any();
            if name != own {
                self.requeue.enqueue(&name);
            }
        }
        Ok(())
    }

    async fn register(&self, instance: &MdevInstance) -> DeviceResult<()> {
        self.registrar
            .add_device(
                &vgpu_resource_name(&instance.type_name),
                &instance.uuid,
                MdevUnit {
                    uuid: instance.uuid.clone(),
                    parent: instance.parent.clone(),
                    iommu_group: instance.iommu_group,
                },
            )
            .await
    }

    fn enable(&self, vgpu: &VGPUDevice, available: &BTreeMap<String, String>) -> DeviceResult<MdevInstance> {
        let address = &vgpu.spec.address;
        let type_name = &vgpu.spec.vgpu_type_name;
        let type_id = available.get(type_name).ok_or_else(|| {
            Report::new(DeviceError::policy(format!(
                "vGPU type {type_name:?} is not available on {address}"
            )))
        })?;

        let uuid = Uuid::new_v4().to_string();
        mdev::create(&self.sysfs, address, type_id, &uuid)?;
        Ok(MdevInstance {
            iommu_group: mdev::iommu_group(&self.sysfs, &uuid)?,
            uuid,
            parent: address.clone(),
            type_id: type_id.clone(),
            type_name: type_name.clone(),
        })
    }

    #[tracing::instrument(skip_all, fields(vgpu = %vgpu.name_any()))]
    pub async fn reconcile(&self, vgpu: &VGPUDevice) -> DeviceResult<()> {
        if vgpu.spec.node_name != self.node_name {
            return Ok(());
        }
        let address = &vgpu.spec.address;
        let available = mdev::available_types(&self.sysfs, address)?;

        let (live, changed) = match (vgpu.spec.enabled, self.discovered(address)?) {
            (true, None) => {
                let instance = self.enable(vgpu, &available)?;
                self.register(&instance).await?;
                info!(address, uuid = %instance.uuid, type_name = %instance.type_name, "vgpu enabled");
                (Some(instance), true)
            }
            (false, Some(instance)) => {
                mdev::remove(&self.sysfs, &instance.uuid)?;
                self.registrar
                    .remove_device(&vgpu_resource_name(&instance.type_name), &instance.uuid)
                    .await?;
                info!(address, uuid = %instance.uuid, "vgpu disabled");
                (None, true)
            }
            (true, Some(instance)) => {
                // Serves partitions that outlived a restart of this agent.
                self.register(&instance).await?;
                (Some(instance), false)
            }
            (false, None) => (None, false),
        };

        let status = match &live {
            Some(instance) => VgpuDeviceStatus {
                vgpu_status: DeviceState::Enabled,
                uuid: instance.uuid.clone(),
                configured_vgpu_type_name: instance.type_name.clone(),
                available_types: mdev::available_types(&self.sysfs, address)?,
            },
            None => VgpuDeviceStatus {
                available_types: mdev::available_types(&self.sysfs, address)?,
                ..Default::default()
            },
        };

        if vgpu.status.as_ref() != Some(&status) {
            let mut updated = vgpu.clone();
            updated.status = Some(status);
            self.vgpus.update_status(&updated).await?;
            debug!(address, "vgpu status updated");
        }
        if changed {
            self.requeue_siblings(vgpu).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::infrastructure::sysfs::mdev::testing::add_instance;
    use crate::infrastructure::sysfs::mdev::testing::add_type;
    use crate::infrastructure::sysfs::testing::add_pci_function;
    use crate::infrastructure::sysfs::testing::link;
    use crate::mock::MemoryStore;
    use crate::mock::RecordingEnqueue;
    use crate::mock::RecordingRegistrar;

    const GPU: &str = "0000:08:00.0";
    const VF0: &str = "0000:08:00.4";
    const VF1: &str = "0000:08:00.5";
    const TYPE: &str = "NVIDIA A16-4Q";
    const RESOURCE: &str = "nvidia.com/NVIDIA_A16-4Q";

    struct Fixture {
        tmp: tempfile::TempDir,
        vgpus: Arc<MemoryStore<VGPUDevice>>,
        registrar: Arc<RecordingRegistrar<MdevUnit>>,
        requeue: Arc<RecordingEnqueue>,
        reconciler: VgpuReconciler,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        add_pci_function(root, GPU, "10DE:25B6", "30200", Some("nvidia"), Some(30));
        for vf in [VF0, VF1] {
            add_pci_function(root, vf, "10DE:25B6", "30200", Some("nvidia"), None);
            link(
                &root.join("bus/pci/devices").join(vf).join("physfn"),
                &root.join("bus/pci/devices").join(GPU),
            );
            add_type(root, vf, "nvidia-745", TYPE, 1);
            add_type(root, vf, "nvidia-746", "NVIDIA A16-8Q", 1);
        }

        let vgpus = Arc::new(MemoryStore::new());
        let registrar = Arc::new(RecordingRegistrar::new());
        let requeue = Arc::new(RecordingEnqueue::new());
        let reconciler = VgpuReconciler::new(
            "node1",
            Sysfs::new(root),
            vgpus.clone(),
            registrar.clone(),
            requeue.clone(),
        );
        Fixture {
            tmp,
            vgpus,
            registrar,
            requeue,
            reconciler,
        }
    }

    fn create_file(fx: &Fixture) -> std::path::PathBuf {
        fx.tmp
            .path()
            .join("class/mdev_bus")
            .join(VF0)
            .join("mdev_supported_types/nvidia-745/create")
    }

    #[tokio::test]
    async fn discovery_labels_parent_gpu() {
        let fx = fixture();
        fx.reconciler.discover().await.expect("discover");
        assert_eq!(
            fx.vgpus.names(),
            vec!["node1-000008004".to_string(), "node1-000008005".to_string()]
        );
        let vgpu = fx.vgpus.snapshot("node1-000008004").expect("vgpu");
        assert_eq!(
            vgpu.labels().get(PARENT_SRIOV_GPU_LABEL).map(String::as_str),
            Some("node1-000008000")
        );
        assert_eq!(vgpu.spec.parent_gpu_device_address, GPU);
        assert!(!vgpu.spec.enabled);
        assert_eq!(
            vgpu.status.map(|s| s.available_types.len()),
            Some(2)
        );
    }

    #[test_log::test(tokio::test)]
    async fn enable_twice_keeps_the_same_uuid() {
        let fx = fixture();
        fx.reconciler.discover().await.expect("discover");
        let mut vgpu = fx.vgpus.snapshot("node1-000008004").expect("vgpu");
        vgpu.spec.enabled = true;
        vgpu.spec.vgpu_type_name = TYPE.to_string();

        fx.reconciler.reconcile(&vgpu).await.expect("enable");
        let status = fx
            .vgpus
            .snapshot("node1-000008004")
            .and_then(|v| v.status)
            .expect("status");
        assert_eq!(status.vgpu_status, DeviceState::Enabled);
        assert_eq!(status.configured_vgpu_type_name, TYPE);
        let uuid = status.uuid.clone();
        assert_eq!(std::fs::read_to_string(create_file(&fx)).expect("create"), uuid);
        assert_eq!(fx.registrar.ids(RESOURCE), vec![uuid.clone()]);
        assert_eq!(fx.requeue.names(), vec!["node1-000008005".to_string()]);

        // The kernel materialises the mdev after the create write.
        add_instance(fx.tmp.path(), VF0, "nvidia-745", &uuid, 70);
        std::fs::write(create_file(&fx), "").expect("reset create");

        let mut vgpu = fx.vgpus.snapshot("node1-000008004").expect("vgpu");
        vgpu.spec.enabled = true;
        vgpu.spec.vgpu_type_name = TYPE.to_string();
        fx.reconciler.reconcile(&vgpu).await.expect("enable again");

        let again = fx
            .vgpus
            .snapshot("node1-000008004")
            .and_then(|v| v.status)
            .expect("status");
        assert_eq!(again.uuid, uuid);
        assert_eq!(std::fs::read_to_string(create_file(&fx)).expect("create"), "");
        assert_eq!(fx.requeue.names().len(), 1);
    }

    #[tokio::test]
    async fn unknown_type_is_rejected_without_mutation() {
        let fx = fixture();
        fx.reconciler.discover().await.expect("discover");
        let mut vgpu = fx.vgpus.snapshot("node1-000008004").expect("vgpu");
        vgpu.spec.enabled = true;
        vgpu.spec.vgpu_type_name = "NVIDIA A16-16Q".to_string();

        let err = fx.reconciler.reconcile(&vgpu).await.expect_err("unknown type");
        assert!(matches!(err.current_context(), DeviceError::Policy { .. }));
        assert_eq!(std::fs::read_to_string(create_file(&fx)).expect("create"), "");
        assert!(fx.registrar.events().is_empty());
    }

    #[tokio::test]
    async fn disable_removes_mdev_and_unit() {
        let fx = fixture();
        fx.reconciler.discover().await.expect("discover");
        let uuid = "0b7d8f2e-4f5c-4d3e-9a41-7e2f5d1c3b6a";
        add_instance(fx.tmp.path(), VF0, "nvidia-745", uuid, 70);

        let vgpu = fx.vgpus.snapshot("node1-000008004").expect("vgpu");
        fx.reconciler.reconcile(&vgpu).await.expect("disable");

        let remove = fx
            .tmp
            .path()
            .join("devices/pci0000:00")
            .join(VF0)
            .join(uuid)
            .join("remove");
        assert_eq!(std::fs::read_to_string(remove).expect("remove"), "1");
        assert_eq!(
            fx.registrar.events(),
            vec![format!("remove {RESOURCE} {uuid}")]
        );
        let status = fx
            .vgpus
            .snapshot("node1-000008004")
            .and_then(|v| v.status)
            .expect("status");
        assert_eq!(status.vgpu_status, DeviceState::Disabled);
        assert!(status.uuid.is_empty());
    }

    #[tokio::test]
    async fn missing_mdev_root_reads_as_disabled() {
        let fx = fixture();
        fx.reconciler.discover().await.expect("discover");
        let vgpu = fx.vgpus.snapshot("node1-000008004").expect("vgpu");
        assert!(!fx.tmp.path().join("bus/mdev/devices").exists());
        fx.reconciler.reconcile(&vgpu).await.expect("reconcile");
        assert!(fx.registrar.events().is_empty());
    }
}
