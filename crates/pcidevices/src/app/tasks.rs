use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use api_types::labels::node_selector;
use api_types::MigConfiguration;
use api_types::PCIDeviceClaim;
use api_types::SRIOVGPUDevice;
use api_types::SRIOVNetworkDevice;
use api_types::USBDeviceClaim;
use api_types::VGPUDevice;
use futures::stream;
use futures::Stream;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::Api;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::app::core::Application;
use crate::controller::handlers::MigHandler;
use crate::controller::handlers::PCI_CLAIM_FINALIZER;
use crate::controller::handlers::USB_CLAIM_FINALIZER;
use crate::controller::run_controller;
use crate::controller::ControllerSettings;
use crate::controller::Reconciler;
use crate::error::DeviceResult;

/// Owns the background tasks and the token that stops them.
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

async fn woken(notify: Option<&Notify>) {
    match notify {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}

impl Tasks {
    pub fn new(cancellation_token: CancellationToken) -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token,
        }
    }

    pub fn spawn_all_tasks(&mut self, app: &Application) -> Result<()> {
        let cli = app.daemon_args();
        let services = app.services();

        // Inventory and discovery passes
        let pci = services.pci_inventory.clone();
        let task = self.spawn_periodic(
            "pci inventory",
            cli.pci_resync(),
            Some(services.pci_resync.clone()),
            move || {
                let pci = pci.clone();
                async move { pci.reconcile().await }
            },
        );
        self.tasks.push(task);

        let usb = services.usb_inventory.clone();
        let task = self.spawn_periodic("usb inventory", cli.usb_resync(), None, move || {
            let usb = usb.clone();
            async move { usb.reconcile().await }
        });
        self.tasks.push(task);

        let sriov = services.sriov.clone();
        let task = self.spawn_periodic("sriov nic discovery", cli.pci_resync(), None, move || {
            let sriov = sriov.clone();
            async move { sriov.setup_sriov_devices().await }
        });
        self.tasks.push(task);

        let sriov_gpu = services.sriov_gpu.clone();
        let task = self.spawn_periodic("sriov gpu discovery", cli.mig_resync(), None, move || {
            let sriov_gpu = sriov_gpu.clone();
            async move { sriov_gpu.discover().await }
        });
        self.tasks.push(task);

        let vgpu = services.vgpu.clone();
        let task = self.spawn_periodic(
            "vgpu discovery",
            cli.mig_resync(),
            Some(services.vgpu_resync.clone()),
            move || {
                let vgpu = vgpu.clone();
                async move { vgpu.discover().await }
            },
        );
        self.tasks.push(task);

        let mig = services.mig.clone();
        let task = self.spawn_periodic("mig discovery", cli.mig_resync(), None, move || {
            let mig = mig.clone();
            async move { mig.discover().await }
        });
        self.tasks.push(task);

        // Record controllers
        let client = services.client.clone();
        let local = || watcher::Config::default().labels(&node_selector(&cli.node_name));

        let task = self.spawn_controller::<SRIOVNetworkDevice, _>(
            Api::all(client.clone()),
            ControllerSettings::new(local()),
            services.sriov.clone(),
            stream::pending(),
        );
        self.tasks.push(task);

        let task = self.spawn_controller::<SRIOVGPUDevice, _>(
            Api::all(client.clone()),
            ControllerSettings::new(local()),
            services.sriov_gpu.clone(),
            stream::pending(),
        );
        self.tasks.push(task);

        let vgpu_requeues = services
            .vgpu_requeues
            .lock()
            .map_err(|_| anyhow::anyhow!("vgpu requeue stream lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow::anyhow!("vgpu controller already started"))?;
        let task = self.spawn_controller::<VGPUDevice, _>(
            Api::all(client.clone()),
            ControllerSettings::new(local()),
            services.vgpu.clone(),
            vgpu_requeues,
        );
        self.tasks.push(task);

        let task = self.spawn_controller::<MigConfiguration, _>(
            Api::all(client.clone()),
            ControllerSettings::new(local()),
            Arc::new(MigHandler {
                reconciler: services.mig.clone(),
                resync: cli.mig_resync(),
            }),
            stream::pending(),
        );
        self.tasks.push(task);

        // Claims carry no node label; handlers filter on spec.nodeName.
        let task = self.spawn_controller::<PCIDeviceClaim, _>(
            Api::all(client.clone()),
            ControllerSettings::new(watcher::Config::default()).with_finalizer(PCI_CLAIM_FINALIZER),
            services.pci_claims.clone(),
            stream::pending(),
        );
        self.tasks.push(task);

        let task = self.spawn_controller::<USBDeviceClaim, _>(
            Api::all(client),
            ControllerSettings::new(watcher::Config::default()).with_finalizer(USB_CLAIM_FINALIZER),
            services.usb_claims.clone(),
            stream::pending(),
        );
        self.tasks.push(task);

        Ok(())
    }

    /// Runs `pass` every `every`, and early whenever `wake` is notified.
    fn spawn_periodic<F, Fut>(
        &self,
        name: &'static str,
        every: Duration,
        wake: Option<Arc<Notify>>,
        pass: F,
    ) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = DeviceResult<()>> + Send,
    {
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            tracing::info!("Starting {name} task");
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = woken(wake.as_deref()) => {}
                }
                if let Err(e) = pass().await {
                    tracing::warn!(task = name, "pass failed: {e:?}");
                }
            }
            tracing::info!("{name} task completed");
        })
    }

    fn spawn_controller<K, R>(
        &self,
        api: Api<K>,
        settings: ControllerSettings,
        reconciler: Arc<R>,
        requeues: impl Stream<Item = ObjectRef<K>> + Send + 'static,
    ) -> JoinHandle<()>
    where
        K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
        R: Reconciler<K>,
    {
        let token = self.cancellation_token.clone();
        tokio::spawn(run_controller(api, settings, reconciler, requeues, token))
    }

    /// Waits for SIGTERM/SIGINT or for any task to exit on its own.
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            use tokio::signal::unix::signal;
            use tokio::signal::unix::SignalKind;
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT, initiating graceful shutdown");
                    }
                }
            })
        };

        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.cancellation_token.cancel();
                self.wait_for_tasks_with_timeout(Duration::from_secs(30)).await;
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, _index, _remaining) = result;
                self.cancellation_token.cancel();
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    return Err(e.into());
                }
                tracing::warn!("Task completed unexpectedly");
            }
        }

        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;

    #[tokio::test]
    async fn periodic_pass_runs_on_tick_and_wake() {
        let token = CancellationToken::new();
        let mut tasks = Tasks::new(token.clone());
        let runs = Arc::new(AtomicUsize::new(0));
        let wake = Arc::new(Notify::new());

        let counter = runs.clone();
        let task = tasks.spawn_periodic("test", Duration::from_secs(3600), Some(wake.clone()), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        tasks.tasks.push(task);

        // The first tick fires immediately.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        wake.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        token.cancel();
        tasks.wait_for_tasks_with_timeout(Duration::from_secs(1)).await;
        assert!(tasks.tasks.iter().all(|t| t.is_finished()));
    }
}
