use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::app::services::ApplicationServices;
use crate::app::tasks::Tasks;
use crate::config::DaemonArgs;

pub struct Application {
    services: ApplicationServices,
    daemon_args: DaemonArgs,
    token: CancellationToken,
}

impl Application {
    pub fn new(services: ApplicationServices, daemon_args: DaemonArgs, token: CancellationToken) -> Self {
        Self {
            services,
            daemon_args,
            token,
        }
    }

    pub fn services(&self) -> &ApplicationServices {
        &self.services
    }

    pub fn daemon_args(&self) -> &DaemonArgs {
        &self.daemon_args
    }

    /// Starts every task and waits for a shutdown signal or an unexpected
    /// task exit.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(node = %self.daemon_args.node_name, "Starting all application tasks...");

        let mut tasks = Tasks::new(self.token.clone());
        if let Err(e) = tasks.spawn_all_tasks(self) {
            tracing::error!("Failed to spawn application tasks: {e}");
            return Err(e);
        }

        if let Err(e) = tasks.wait_for_completion().await {
            tracing::error!("Error during task execution: {e}");
            return Err(e);
        }

        tracing::info!("Application run completed");
        Ok(())
    }

    /// Stops the plugin servers so kubelet sees their sockets go away.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down application...");
        self.token.cancel();

        self.services.pci_plugins.stop_all().await;
        self.services.mdev_plugins.stop_all().await;
        self.services.usb_plugins.stop_all().await;

        tracing::info!("Application shutdown completed");
        Ok(())
    }
}
