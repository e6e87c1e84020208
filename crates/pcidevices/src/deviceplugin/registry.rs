//! Resource name to running plugin server.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::ResultExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::DeviceKind;
use super::PluginConfig;
use super::PluginServer;
use crate::error::DeviceError;
use crate::error::DeviceResult;

/// Adds and removes units under a resource name, starting and stopping the
/// backing plugin on demand.
#[async_trait]
pub trait Registrar<U>: Send + Sync {
    async fn add_device(&self, resource_name: &str, id: &str, unit: U) -> DeviceResult<()>;

    async fn remove_device(&self, resource_name: &str, id: &str) -> DeviceResult<()>;
}

type KindFactory<D> = Arc<dyn Fn(&str) -> D + Send + Sync>;

/// Plugin servers of one device kind, keyed by resource name.
pub struct PluginRegistry<D: DeviceKind> {
    servers: Mutex<HashMap<String, Arc<PluginServer<D>>>>,
    config: PluginConfig,
    token: CancellationToken,
    factory: KindFactory<D>,
}

impl<D: DeviceKind> PluginRegistry<D> {
    pub fn new(
        config: PluginConfig,
        token: CancellationToken,
        factory: impl Fn(&str) -> D + Send + Sync + 'static,
    ) -> Self {
        Self {
            servers: Mutex::new(HashMap::new()),
            config,
            token,
            factory: Arc::new(factory),
        }
    }

    pub async fn contains(&self, resource_name: &str, id: &str) -> bool {
        let server = self.servers.lock().await.get(resource_name).cloned();
        match server {
            Some(server) => server.contains(id).await,
            None => false,
        }
    }

    pub async fn resources(&self) -> Vec<String> {
        let mut names: Vec<_> = self.servers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn server(&self, resource_name: &str) -> Option<Arc<PluginServer<D>>> {
        self.servers.lock().await.get(resource_name).cloned()
    }

    /// Stops every server.
    pub async fn stop_all(&self) {
        let servers: Vec<_> = self.servers.lock().await.drain().map(|(_, s)| s).collect();
        for server in servers {
            server.stop().await;
        }
    }
}

#[async_trait]
impl<D: DeviceKind> Registrar<D::Unit> for PluginRegistry<D> {
    async fn add_device(&self, resource_name: &str, id: &str, unit: D::Unit) -> DeviceResult<()> {
        let mut servers = self.servers.lock().await;
        let server = match servers.get(resource_name) {
            Some(server) => server.clone(),
            None => {
                let server =
                    PluginServer::new((self.factory)(resource_name), self.config.clone(), &self.token);
                server.start().await.change_context_lazy(|| {
                    DeviceError::protocol(format!("failed to start plugin for {resource_name}"))
                })?;
                info!(resource = resource_name, "device plugin started");
                servers.insert(resource_name.to_string(), server.clone());
                server
            }
        };
        drop(servers);

        server.add_device(id, unit).await;
        Ok(())
    }

    async fn remove_device(&self, resource_name: &str, id: &str) -> DeviceResult<()> {
        let mut servers = self.servers.lock().await;
        let Some(server) = servers.get(resource_name).cloned() else {
            return Ok(());
        };
        if server.remove_device(id).await == 0 {
            servers.remove(resource_name);
            drop(servers);
            info!(resource = resource_name, "last device removed, stopping plugin");
            server.stop().await;
        }
        Ok(())
    }
}
