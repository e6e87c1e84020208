//! Drives reconcilers from record watches through `kube::runtime`.

pub mod handlers;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use futures::Stream;
use futures::StreamExt;
use kube::runtime::controller::Action;
use kube::runtime::finalizer;
use kube::runtime::finalizer::Event;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::runtime::Controller;
use kube::Api;
use kube::Resource;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::DeviceError;
use crate::error::DeviceResult;
use crate::error::ReconcileError;

/// Per-kind reconcile logic handed to [`run_controller`].
#[async_trait]
pub trait Reconciler<K>: Send + Sync + 'static
where
    K: Send + Sync + 'static,
{
    /// Records of other nodes are skipped without touching finalizers.
    fn is_local(&self, _obj: &K) -> bool {
        true
    }

    async fn apply(&self, obj: Arc<K>) -> DeviceResult<Action>;

    /// Runs before a finalized record is removed.
    async fn cleanup(&self, _obj: Arc<K>) -> DeviceResult<Action> {
        Ok(Action::await_change())
    }
}

/// How one controller watches and retries.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub watch: watcher::Config,
    /// Set for kinds whose removal must run [`Reconciler::cleanup`] first.
    pub finalizer: Option<&'static str>,
    pub error_requeue: Duration,
}

impl ControllerSettings {
    pub fn new(watch: watcher::Config) -> Self {
        Self {
            watch,
            finalizer: None,
            error_requeue: Duration::from_secs(30),
        }
    }

    pub fn with_finalizer(mut self, name: &'static str) -> Self {
        self.finalizer = Some(name);
        self
    }

    pub fn with_error_requeue(mut self, delay: Duration) -> Self {
        self.error_requeue = delay;
        self
    }
}

struct Context<K, R> {
    api: Api<K>,
    reconciler: Arc<R>,
    settings: ControllerSettings,
}

fn unwrap_finalizer_error(err: finalizer::Error<ReconcileError>) -> ReconcileError {
    match err {
        finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => e,
        other => ReconcileError(Report::new(DeviceError::Kubernetes {
            message: format!("finalizer: {other}"),
        })),
    }
}

async fn reconcile<K, R>(obj: Arc<K>, ctx: Arc<Context<K, R>>) -> Result<Action, ReconcileError>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
    R: Reconciler<K>,
{
    if !ctx.reconciler.is_local(&obj) {
        return Ok(Action::await_change());
    }
    let Some(name) = ctx.settings.finalizer else {
        return ctx.reconciler.apply(obj).await.map_err(ReconcileError::from);
    };

    let reconciler = ctx.reconciler.clone();
    finalizer(&ctx.api, name, obj, |event| async move {
        match event {
            Event::Apply(obj) => reconciler.apply(obj).await,
            Event::Cleanup(obj) => reconciler.cleanup(obj).await,
        }
        .map_err(ReconcileError::from)
    })
    .await
    .map_err(unwrap_finalizer_error)
}

fn error_policy<K, R>(obj: Arc<K>, err: &ReconcileError, ctx: Arc<Context<K, R>>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    warn!(
        kind = %K::kind(&()),
        name = %obj.name_any(),
        "reconcile failed: {err}"
    );
    Action::requeue(ctx.settings.error_requeue)
}

/// Runs a controller for `K` until `token` is cancelled. `requeues` feeds
/// extra reconcile requests next to the watch.
pub async fn run_controller<K, R>(
    api: Api<K>,
    settings: ControllerSettings,
    reconciler: Arc<R>,
    requeues: impl Stream<Item = ObjectRef<K>> + Send + 'static,
    token: CancellationToken,
) where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
    R: Reconciler<K>,
{
    let kind = K::kind(&()).to_string();
    info!(kind, "starting controller");
    let ctx = Arc::new(Context {
        api: api.clone(),
        reconciler,
        settings: settings.clone(),
    });

    Controller::new(api, settings.watch)
        .reconcile_on(requeues)
        .run(reconcile::<K, R>, error_policy::<K, R>, ctx)
        .take_until(token.cancelled_owned())
        .for_each(|result| {
            let kind = kind.clone();
            async move {
                match result {
                    Ok((obj, _)) => debug!(kind, name = %obj.name, "reconciled"),
                    Err(e) => debug!(kind, "controller event: {e}"),
                }
            }
        })
        .await;
    info!(kind, "controller stopped");
}

#[cfg(test)]
mod tests {
    use api_types::PCIDeviceClaim;

    use super::*;

    #[test]
    fn finalizer_errors_keep_the_reconcile_report() {
        let inner = ReconcileError(Report::new(DeviceError::policy("too many")));
        let unwrapped = unwrap_finalizer_error(finalizer::Error::CleanupFailed(inner));
        assert!(matches!(
            unwrapped.0.current_context(),
            DeviceError::Policy { .. }
        ));

        let missing = unwrap_finalizer_error(finalizer::Error::UnnamedObject);
        assert!(matches!(
            missing.0.current_context(),
            DeviceError::Kubernetes { .. }
        ));
    }

    #[test]
    fn settings_default_to_no_finalizer() {
        let settings = ControllerSettings::new(watcher::Config::default());
        assert!(settings.finalizer.is_none());
        let settings = settings
            .with_finalizer("devices.harvesterhci.io/pci-claim")
            .with_error_requeue(Duration::from_secs(5));
        assert_eq!(settings.finalizer, Some("devices.harvesterhci.io/pci-claim"));
        assert_eq!(settings.error_requeue, Duration::from_secs(5));
        assert_eq!(PCIDeviceClaim::kind(&()), "PCIDeviceClaim");
    }
}
