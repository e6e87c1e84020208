//! Persistence of device records.

use std::fmt::Debug;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use futures::Stream;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DeleteParams;
use kube::api::ListParams;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::api::PostParams;
use kube::runtime::reflector::ObjectRef;
use kube::Api;
use kube::Client;
use kube::Resource;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;
use tracing::warn;

use crate::error::DeviceError;
use crate::error::DeviceResult;

/// Create, read, update and delete access to one record kind.
#[async_trait]
pub trait RecordStore<K>: Send + Sync
where
    K: Clone + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> DeviceResult<Option<K>>;

    /// Lists records matching a `k=v,k2=v2` label selector.
    async fn list(&self, label_selector: &str) -> DeviceResult<Vec<K>>;

    /// Creates a record, persisting its status when one is set.
    async fn create(&self, obj: &K) -> DeviceResult<K>;

    async fn update(&self, obj: &K) -> DeviceResult<K>;

    async fn update_status(&self, obj: &K) -> DeviceResult<K>;

    /// Deletes a record. Deleting an absent record succeeds.
    async fn delete(&self, name: &str) -> DeviceResult<()>;
}

/// Requeues a record of some kind by name.
pub trait Enqueue: Send + Sync {
    fn enqueue(&self, name: &str);
}

/// Record store backed by the Kubernetes API.
pub struct KubeStore<K> {
    api: Api<K>,
    owner: Option<OwnerReference>,
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = ()>,
{
    /// Store for a cluster scoped kind.
    pub fn cluster(client: Client) -> Self {
        Self {
            api: Api::all(client),
            owner: None,
        }
    }

    /// Stamps every created record with `owner`, so records go away with
    /// their Node object.
    pub fn with_owner(mut self, owner: Option<OwnerReference>) -> Self {
        self.owner = owner;
        self
    }

    pub fn api(&self) -> &Api<K> {
        &self.api
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

fn store_error(action: &str, name: &str) -> DeviceError {
    DeviceError::store(format!("failed to {action} {name}"))
}

#[async_trait]
impl<K> RecordStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> DeviceResult<Option<K>> {
        self.api
            .get_opt(name)
            .await
            .change_context_lazy(|| store_error("get", name))
    }

    async fn list(&self, label_selector: &str) -> DeviceResult<Vec<K>> {
        let params = ListParams::default().labels(label_selector);
        Ok(self
            .api
            .list(&params)
            .await
            .change_context_lazy(|| store_error("list", label_selector))?
            .items)
    }

    async fn create(&self, obj: &K) -> DeviceResult<K> {
        let name = obj.name_any();
        let mut obj = obj.clone();
        if let Some(owner) = &self.owner {
            obj.owner_references_mut().push(owner.clone());
        }

        let created = self
            .api
            .create(&PostParams::default(), &obj)
            .await
            .change_context_lazy(|| store_error("create", &name))?;
        debug!(name, kind = %K::kind(&()), "record created");

        // Status is a subresource and ignored on create.
        let status = serde_json::to_value(&obj)
            .change_context_lazy(|| store_error("serialize", &name))?
            .get("status")
            .cloned()
            .filter(|s| !s.is_null());
        match status {
            Some(status) => self.patch_status(&name, status).await,
            None => Ok(created),
        }
    }

    async fn update(&self, obj: &K) -> DeviceResult<K> {
        let name = obj.name_any();
        self.api
            .replace(&name, &PostParams::default(), obj)
            .await
            .change_context_lazy(|| store_error("update", &name))
    }

    async fn update_status(&self, obj: &K) -> DeviceResult<K> {
        let name = obj.name_any();
        let status = serde_json::to_value(obj)
            .change_context_lazy(|| store_error("serialize", &name))?
            .get("status")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        self.patch_status(&name, status).await
    }

    async fn delete(&self, name: &str) -> DeviceResult<()> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(name, kind = %K::kind(&()), "record deleted");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Report::new(e).change_context(store_error("delete", name))),
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn patch_status(&self, name: &str, status: serde_json::Value) -> DeviceResult<K> {
        let patch = serde_json::json!({ "status": status });
        self.api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .change_context_lazy(|| store_error("update status of", name))
    }
}

/// Feeds record names into a controller's `reconcile_on` stream.
pub struct ControllerTrigger<K: Resource<DynamicType = ()>> {
    tx: mpsc::UnboundedSender<ObjectRef<K>>,
}

impl<K> ControllerTrigger<K>
where
    K: Resource<DynamicType = ()> + 'static,
{
    pub fn new() -> (Self, impl Stream<Item = ObjectRef<K>> + Send + 'static) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, UnboundedReceiverStream::new(rx))
    }
}

impl<K> Enqueue for ControllerTrigger<K>
where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
{
    fn enqueue(&self, name: &str) {
        if self.tx.send(ObjectRef::new(name)).is_err() {
            warn!(name, "controller gone, dropping requeue");
        }
    }
}
