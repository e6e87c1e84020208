use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use api_types::MigConfiguration;
use api_types::PCIDevice;
use api_types::PCIDeviceClaim;
use api_types::SRIOVGPUDevice;
use api_types::SRIOVNetworkDevice;
use api_types::USBDevice;
use api_types::USBDeviceClaim;
use api_types::VGPUDevice;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Client;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::app::core::Application;
use crate::app::services::ApplicationServices;
use crate::config::DaemonArgs;
use crate::deviceplugin::mdev::MdevKind;
use crate::deviceplugin::pci::PciKind;
use crate::deviceplugin::registry::PluginRegistry;
use crate::deviceplugin::usb::UsbKind;
use crate::domain::gpu::sriov_gpu::SriovGpuReconciler;
use crate::domain::gpu::vgpu::VgpuReconciler;
use crate::domain::mig::MigManager;
use crate::domain::mig::MigReconciler;
use crate::domain::pci::claim::PciClaimHandler;
use crate::domain::pci::PciInventory;
use crate::domain::sriov::SriovReconciler;
use crate::domain::usb::claim::UsbClaimHandler;
use crate::domain::usb::UsbInventory;
use crate::infrastructure::executor::CommandExecutor;
use crate::infrastructure::executor::LocalExecutor;
use crate::infrastructure::executor::RemotePodExecutor;
use crate::infrastructure::kube_client::init_kube_client;
use crate::infrastructure::kube_client::node_owner_reference;
use crate::infrastructure::store::ControllerTrigger;
use crate::infrastructure::store::KubeStore;
use crate::infrastructure::sysfs::net::ManagementNics;
use crate::infrastructure::sysfs::pci_ids::PciIds;
use crate::infrastructure::sysfs::Sysfs;

pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
}

impl ApplicationBuilder {
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self { daemon_args }
    }

    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");
        let args = &self.daemon_args;

        let client = init_kube_client(args.kubeconfig.clone())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {e:?}"))?;
        let owner = node_owner_reference(client.clone(), &args.node_name).await;
        let token = CancellationToken::new();
        let services = self.create_services(client, owner, &token);

        Ok(Application::new(services, self.daemon_args, token))
    }

    fn store<K>(client: &Client, owner: &Option<OwnerReference>) -> Arc<KubeStore<K>>
    where
        K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        Arc::new(KubeStore::cluster(client.clone()).with_owner(owner.clone()))
    }

    fn create_executor(&self, client: &Client) -> Arc<dyn CommandExecutor> {
        let args = &self.daemon_args;
        match args.driver_pods() {
            Some((namespace, selector)) => {
                tracing::info!(namespace, selector, "vendor commands run in driver pods");
                Arc::new(RemotePodExecutor::new(
                    client.clone(),
                    namespace,
                    selector,
                    args.node_name.clone(),
                    args.command_timeout(),
                ))
            }
            None => Arc::new(LocalExecutor::new(
                args.host_root.clone(),
                args.command_timeout(),
            )),
        }
    }

    fn create_services(
        &self,
        client: Client,
        owner: Option<OwnerReference>,
        token: &CancellationToken,
    ) -> ApplicationServices {
        let args = &self.daemon_args;
        let node = args.node_name.as_str();
        let sysfs = Sysfs::new(&args.sysfs_root);
        let management = ManagementNics::new(
            sysfs.clone(),
            &args.proc_root,
            args.management_interfaces.clone(),
        );
        let executor = self.create_executor(&client);
        let plugin_config = args.plugin_config();

        let pci_plugins = {
            let sysfs = sysfs.clone();
            let dev_root = args.dev_root.clone();
            Arc::new(PluginRegistry::new(
                plugin_config.clone(),
                token.child_token(),
                move |resource: &str| PciKind::new(resource, sysfs.clone(), dev_root.clone()),
            ))
        };
        let mdev_plugins = {
            let sysfs = sysfs.clone();
            let dev_root = args.dev_root.clone();
            Arc::new(PluginRegistry::new(
                plugin_config.clone(),
                token.child_token(),
                move |resource: &str| MdevKind::new(resource, sysfs.clone(), dev_root.clone()),
            ))
        };
        let usb_plugins = {
            let dev_root = args.dev_root.clone();
            Arc::new(PluginRegistry::new(
                plugin_config,
                token.child_token(),
                move |resource: &str| UsbKind::new(resource, dev_root.clone()),
            ))
        };

        let pci_devices = Self::store::<PCIDevice>(&client, &owner);
        let sriov_nics = Self::store::<SRIOVNetworkDevice>(&client, &owner);
        let vgpus = Self::store::<VGPUDevice>(&client, &owner);
        let usb_devices = Self::store::<USBDevice>(&client, &owner);
        let pci_resync = Arc::new(Notify::new());
        let vgpu_resync = Arc::new(Notify::new());
        let (vgpu_trigger, vgpu_requeues) = ControllerTrigger::<VGPUDevice>::new();

        ApplicationServices {
            pci_inventory: Arc::new(PciInventory::new(
                node,
                sysfs.clone(),
                Arc::new(PciIds::load(&args.pci_ids_path)),
                management.clone(),
                pci_devices.clone(),
                sriov_nics.clone(),
            )),
            usb_inventory: Arc::new(UsbInventory::new(
                node,
                sysfs.clone(),
                &args.dev_root,
                usb_devices.clone(),
            )),
            sriov: Arc::new(SriovReconciler::new(
                node,
                sysfs.clone(),
                management,
                sriov_nics,
                pci_resync.clone(),
            )),
            sriov_gpu: Arc::new(SriovGpuReconciler::new(
                node,
                sysfs.clone(),
                executor.clone(),
                Self::store::<SRIOVGPUDevice>(&client, &owner),
                vgpus.clone(),
                vgpu_resync.clone(),
            )),
            vgpu: Arc::new(VgpuReconciler::new(
                node,
                sysfs.clone(),
                vgpus,
                mdev_plugins.clone(),
                Arc::new(vgpu_trigger),
            )),
            mig: Arc::new(MigReconciler::new(
                node,
                sysfs.clone(),
                MigManager::new(executor),
                Self::store::<MigConfiguration>(&client, &owner),
            )),
            pci_claims: Arc::new(PciClaimHandler::new(
                node,
                sysfs,
                pci_devices,
                Self::store::<PCIDeviceClaim>(&client, &None),
                pci_plugins.clone(),
            )),
            usb_claims: Arc::new(UsbClaimHandler::new(
                node,
                usb_devices,
                Self::store::<USBDeviceClaim>(&client, &None),
                usb_plugins.clone(),
            )),
            pci_plugins,
            mdev_plugins,
            usb_plugins,
            pci_resync,
            vgpu_resync,
            vgpu_requeues: Mutex::new(Some(vgpu_requeues.boxed())),
            client,
        }
    }
}
