//! Kubelet device plugin server, generic over the kind of device it serves.
//!
//! One [`PluginServer`] serves one resource name on its own unix socket. The
//! device kind only decides where a unit's health is observed and what a
//! unit resolves to at allocation time; registration, health streaming and
//! the allocation protocol are shared.

pub mod api;
pub mod health;
pub mod mdev;
pub mod pci;
pub mod registry;
pub mod usb;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::os::unix::fs::MetadataExt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use futures::Stream;
use hyper_util::rt::TokioIo;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::sync::RwLock;
use tokio::time::interval;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio::time::timeout_at;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tower::service_fn;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use self::api::v1beta1::device_plugin_server::DevicePlugin;
use self::api::v1beta1::device_plugin_server::DevicePluginServer;
use self::api::v1beta1::registration_client::RegistrationClient;
use self::api::v1beta1::AllocateRequest;
use self::api::v1beta1::AllocateResponse;
use self::api::v1beta1::ContainerAllocateResponse;
use self::api::v1beta1::ContainerPreferredAllocationResponse;
use self::api::v1beta1::Device;
use self::api::v1beta1::DevicePluginOptions;
use self::api::v1beta1::DeviceSpec;
use self::api::v1beta1::Empty;
use self::api::v1beta1::ListAndWatchResponse;
use self::api::v1beta1::PreStartContainerRequest;
use self::api::v1beta1::PreStartContainerResponse;
use self::api::v1beta1::PreferredAllocationRequest;
use self::api::v1beta1::PreferredAllocationResponse;
use self::api::v1beta1::RegisterRequest;
use self::api::v1beta1::TopologyInfo;
use self::health::HealthSignal;
use crate::error::DeviceError;
use crate::error::DeviceResult;

const MAX_REGISTER_BACKOFF: Duration = Duration::from_secs(30);

/// What a device kind contributes to the generic server.
pub trait DeviceKind: Send + Sync + 'static {
    /// Host resource a unit id stands for.
    type Unit: Clone + Debug + Send + Sync + 'static;

    fn resource_name(&self) -> &str;

    /// Prefix of the allocation environment variable, e.g. `PCI_RESOURCE`.
    fn env_prefix(&self) -> &'static str;

    /// Path whose presence means the unit is usable.
    fn health_path(&self, unit: &Self::Unit) -> PathBuf;

    fn topology(&self, _unit: &Self::Unit) -> Option<TopologyInfo> {
        None
    }

    /// Resolves a unit to the values exported to the container and the
    /// device nodes it needs.
    fn resolve(&self, id: &str, unit: &Self::Unit) -> DeviceResult<Allocation>;
}

/// Host resources one unit resolves to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Allocation {
    pub values: Vec<String>,
    pub devices: Vec<DeviceSpec>,
}

/// Device spec for a node under the dev root, exposed at its canonical
/// `/dev` path inside the container.
pub fn device_spec(dev_root: &Path, relative: &str) -> DeviceSpec {
    DeviceSpec {
        container_path: Path::new("/dev").join(relative).display().to_string(),
        host_path: dev_root.join(relative).display().to_string(),
        permissions: api::DEVICE_PERMISSIONS.to_string(),
    }
}

/// Environment variable carrying the allocated values, e.g.
/// `PCI_RESOURCE_NVIDIA_COM_GA102GL_A10`.
pub fn env_key(prefix: &str, resource_name: &str) -> String {
    let suffix: String = resource_name
        .chars()
        .map(|c| match c {
            '.' | '/' | '-' | ' ' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect();
    format!("{prefix}_{suffix}")
}

/// Socket file name for a resource, relative to the plugin directory.
pub fn socket_name(resource_name: &str) -> String {
    format!("{}.sock", resource_name.replace('/', "_"))
}

#[derive(Debug, Clone)]
pub struct PluginConfig {
    /// Kubelet device plugin directory holding `kubelet.sock`
    pub plugin_dir: PathBuf,
    /// Interval of the presence check backing up filesystem events
    pub heartbeat: Duration,
    /// How long `stop` waits for open streams to see the empty list
    pub stop_grace: Duration,
    pub register_timeout: Duration,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("/var/lib/kubelet/device-plugins"),
            heartbeat: Duration::from_secs(5),
            stop_grace: Duration::from_secs(1),
            register_timeout: Duration::from_secs(10),
        }
    }
}

struct UnitEntry<U> {
    unit: U,
    healthy: bool,
    pending_removal: bool,
    /// Heartbeats seen while pending removal
    missed: u8,
}

enum HealthInput {
    Fs(notify::Result<notify::Event>),
    Rescan,
}

/// Device plugin server for one resource name.
pub struct PluginServer<D: DeviceKind> {
    kind: D,
    config: PluginConfig,
    socket_path: PathBuf,
    units: RwLock<BTreeMap<String, UnitEntry<D::Unit>>>,
    snapshot: watch::Sender<Vec<Device>>,
    health_tx: mpsc::UnboundedSender<HealthInput>,
    health_rx: Mutex<Option<mpsc::UnboundedReceiver<HealthInput>>>,
    /// Lifetime of the whole server
    token: CancellationToken,
    /// Lifetime of the current gRPC listener, replaced on rebind
    serve_token: Mutex<CancellationToken>,
    /// Inode of the socket file of the current listener
    bound_inode: AtomicU64,
    /// Set while a re-registration task runs
    rebinding: AtomicBool,
    stopped: AtomicBool,
    active_streams: AtomicUsize,
    stream_closed: Notify,
}

impl<D: DeviceKind> PluginServer<D> {
    pub fn new(kind: D, config: PluginConfig, parent: &CancellationToken) -> Arc<Self> {
        let socket_path = config.plugin_dir.join(socket_name(kind.resource_name()));
        let (health_tx, health_rx) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(Vec::new());
        let token = parent.child_token();

        Arc::new(Self {
            kind,
            config,
            socket_path,
            units: RwLock::new(BTreeMap::new()),
            snapshot,
            health_tx,
            health_rx: Mutex::new(Some(health_rx)),
            serve_token: Mutex::new(token.child_token()),
            token,
            bound_inode: AtomicU64::new(0),
            rebinding: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            active_streams: AtomicUsize::new(0),
            stream_closed: Notify::new(),
        })
    }

    pub fn resource_name(&self) -> &str {
        self.kind.resource_name()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn options() -> DevicePluginOptions {
        DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: false,
        }
    }

    /// Binds the socket, registers with the kubelet and starts the health
    /// loop. A server whose registration fails is stopped again.
    pub async fn start(self: &Arc<Self>) -> DeviceResult<()> {
        let Some(health_rx) = self.health_rx.lock().await.take() else {
            return Err(Report::new(DeviceError::protocol(format!(
                "device plugin for {} already started",
                self.resource_name()
            ))));
        };

        self.serve().await?;
        if let Err(e) = self.register().await {
            self.stop().await;
            return Err(e);
        }

        let server = self.clone();
        tokio::spawn(async move { server.run_health_loop(health_rx).await });
        Ok(())
    }

    /// Binds a fresh listener, replacing any previous one.
    async fn serve(self: &Arc<Self>) -> DeviceResult<()> {
        let generation = self.token.child_token();
        {
            let mut current = self.serve_token.lock().await;
            current.cancel();
            *current = generation.clone();
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.config.plugin_dir).await {
            return Err(Report::new(DeviceError::protocol(format!(
                "failed to create {}: {e}",
                self.config.plugin_dir.display()
            ))));
        }
        match tokio::fs::remove_file(&self.socket_path).await {
            Ok(()) => debug!(socket = %self.socket_path.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Report::new(DeviceError::protocol(format!(
                    "failed to remove stale socket {}: {e}",
                    self.socket_path.display()
                ))))
            }
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            Report::new(DeviceError::protocol(format!(
                "failed to bind {}: {e}",
                self.socket_path.display()
            )))
        })?;
        if let Ok(meta) = std::fs::metadata(&self.socket_path) {
            self.bound_inode.store(meta.ino(), Ordering::SeqCst);
        }
        info!(socket = %self.socket_path.display(), resource = self.resource_name(), "device plugin listening");

        let service = PluginService {
            server: self.clone(),
            serve_token: generation.clone(),
        };
        let resource = self.resource_name().to_string();
        tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    generation.cancelled().await;
                    debug!(resource, "shutting down gRPC server");
                })
                .await;
            if let Err(e) = result {
                error!("device plugin gRPC server failed: {e}");
            }
        });
        Ok(())
    }

    /// Announces the socket to the kubelet.
    async fn register(&self) -> DeviceResult<()> {
        let kubelet_socket = self.config.plugin_dir.join(api::KUBELET_SOCKET);
        let channel = uds_channel(&kubelet_socket).await?;
        let mut client = RegistrationClient::new(channel);

        let endpoint = socket_name(self.resource_name());
        let request = RegisterRequest {
            version: api::VERSION.to_string(),
            endpoint: endpoint.clone(),
            resource_name: self.resource_name().to_string(),
            options: Some(Self::options()),
        };

        match timeout(
            self.config.register_timeout,
            client.register(Request::new(request)),
        )
        .await
        {
            Ok(Ok(_)) => {
                info!(resource = self.resource_name(), endpoint, "registered with kubelet");
                Ok(())
            }
            Ok(Err(status)) => Err(Report::new(DeviceError::protocol(format!(
                "kubelet rejected registration of {}: {status}",
                self.resource_name()
            )))),
            Err(_) => Err(Report::new(DeviceError::protocol(format!(
                "registration of {} timed out",
                self.resource_name()
            )))),
        }
    }

    /// Serves `id`. Adding an id that is already served is a no-op; adding
    /// one that awaits removal revives it.
    pub async fn add_device(&self, id: &str, unit: D::Unit) -> bool {
        let healthy = self.kind.health_path(&unit).exists();
        let mut units = self.units.write().await;
        match units.get_mut(id) {
            Some(entry) if !entry.pending_removal => return false,
            Some(entry) => {
                entry.unit = unit;
                entry.healthy = healthy;
                entry.pending_removal = false;
                entry.missed = 0;
            }
            None => {
                units.insert(
                    id.to_string(),
                    UnitEntry {
                        unit,
                        healthy,
                        pending_removal: false,
                        missed: 0,
                    },
                );
            }
        }
        self.publish(&units);
        drop(units);

        debug!(resource = self.resource_name(), id, healthy, "device added");
        let _ = self.health_tx.send(HealthInput::Rescan);
        true
    }

    /// Marks `id` unhealthy; the next heartbeat that confirms the unit is
    /// gone drops it. Returns the number of units still served.
    pub async fn remove_device(&self, id: &str) -> usize {
        let mut units = self.units.write().await;
        if let Some(entry) = units.get_mut(id) {
            if !entry.pending_removal {
                entry.healthy = false;
                entry.pending_removal = true;
                entry.missed = 0;
                self.publish(&units);
                debug!(resource = self.resource_name(), id, "device marked for removal");
            }
        }
        units.values().filter(|e| !e.pending_removal).count()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.units
            .read()
            .await
            .get(id)
            .is_some_and(|e| !e.pending_removal)
    }

    pub async fn live_count(&self) -> usize {
        self.units
            .read()
            .await
            .values()
            .filter(|e| !e.pending_removal)
            .count()
    }

    /// Device list as last published to the kubelet.
    pub fn devices(&self) -> Vec<Device> {
        self.snapshot.borrow().clone()
    }

    fn publish(&self, units: &BTreeMap<String, UnitEntry<D::Unit>>) {
        let devices = units
            .iter()
            .map(|(id, entry)| Device {
                id: id.clone(),
                health: if entry.healthy {
                    api::HEALTHY
                } else {
                    api::UNHEALTHY
                }
                .to_string(),
                topology: self.kind.topology(&entry.unit),
            })
            .collect();
        self.snapshot.send_replace(devices);
    }

    async fn apply_health(&self, id: &str, healthy: bool) {
        let mut units = self.units.write().await;
        let Some(entry) = units.get_mut(id) else {
            return;
        };
        if entry.pending_removal {
            if !healthy {
                units.remove(id);
                debug!(resource = self.resource_name(), id, "removed device is gone");
                self.publish(&units);
            }
            return;
        }
        if entry.healthy != healthy {
            entry.healthy = healthy;
            info!(resource = self.resource_name(), id, healthy, "device health changed");
            self.publish(&units);
        }
    }

    /// Probes every backing path and finalises pending removals.
    async fn heartbeat(&self) {
        let mut units = self.units.write().await;
        let mut changed = false;
        let kind = &self.kind;
        units.retain(|id, entry| {
            let present = kind.health_path(&entry.unit).exists();
            if entry.pending_removal {
                if !present || entry.missed >= 1 {
                    debug!(id, present, "dropping removed device");
                    changed = true;
                    return false;
                }
                entry.missed += 1;
                return true;
            }
            if entry.healthy != present {
                warn!(id, healthy = present, "heartbeat corrected device health");
                entry.healthy = present;
                changed = true;
            }
            true
        });
        if changed {
            self.publish(&units);
        }
    }

    async fn unit_paths(&self) -> Vec<(String, PathBuf)> {
        self.units
            .read()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), self.kind.health_path(&e.unit)))
            .collect()
    }

    async fn sync_watches(
        &self,
        watcher: &mut Option<RecommendedWatcher>,
        watched: &mut BTreeSet<PathBuf>,
    ) {
        let Some(watcher) = watcher.as_mut() else {
            return;
        };
        let paths = self.unit_paths().await;
        let mut wanted = health::watch_targets(paths.iter().map(|(_, p)| p.as_path()));
        wanted.insert(self.config.plugin_dir.clone());

        for stale in watched.difference(&wanted).cloned().collect::<Vec<_>>() {
            let _ = watcher.unwatch(&stale);
            watched.remove(&stale);
        }
        for dir in wanted {
            if watched.contains(&dir) {
                continue;
            }
            match watcher.watch(&dir, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    watched.insert(dir);
                }
                Err(e) => debug!(dir = %dir.display(), "cannot watch: {e}"),
            }
        }
    }

    #[tracing::instrument(skip(self, rx), fields(resource = %self.resource_name()))]
    async fn run_health_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<HealthInput>) {
        let tx = self.health_tx.clone();
        let mut watcher = match notify::recommended_watcher(move |res| {
            let _ = tx.send(HealthInput::Fs(res));
        }) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("file watcher unavailable, relying on heartbeat: {e}");
                None
            }
        };
        let mut watched = BTreeSet::new();
        self.sync_watches(&mut watcher, &mut watched).await;

        let mut ticker = interval(self.config.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            select! {
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {
                    self.heartbeat().await;
                    self.sync_watches(&mut watcher, &mut watched).await;
                }
                input = rx.recv() => {
                    let Some(input) = input else { break };
                    match input {
                        HealthInput::Rescan => self.sync_watches(&mut watcher, &mut watched).await,
                        HealthInput::Fs(Err(e)) => warn!("file watch error: {e}"),
                        HealthInput::Fs(Ok(event)) => {
                            let units = self.unit_paths().await;
                            for signal in health::classify(&event, &self.socket_path, &units) {
                                match signal {
                                    HealthSignal::Unit { id, healthy } => {
                                        self.apply_health(&id, healthy).await;
                                    }
                                    HealthSignal::SocketRemoved => self.on_socket_removed().await,
                                }
                            }
                        }
                    }
                }
            }
        }
        debug!("health loop stopped");
    }

    /// True while the socket file is the one the current listener bound.
    fn socket_is_current(&self) -> bool {
        std::fs::metadata(&self.socket_path)
            .is_ok_and(|meta| meta.ino() == self.bound_inode.load(Ordering::SeqCst))
    }

    /// Ends the open streams and re-registers in the background. Removals
    /// of sockets this server replaced itself are ignored.
    async fn on_socket_removed(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) || self.socket_is_current() {
            return;
        }
        if self.rebinding.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("plugin socket removed, kubelet restarted");
        self.serve_token.lock().await.cancel();

        let server = self.clone();
        tokio::spawn(async move {
            server.reregister().await;
            server.rebinding.store(false, Ordering::SeqCst);
        });
    }

    /// Rebinds and re-registers until it succeeds or the server is cancelled.
    async fn reregister(self: &Arc<Self>) {
        let mut backoff = Duration::from_secs(1);
        loop {
            if self.token.is_cancelled() {
                return;
            }
            let result = match self.serve().await {
                Ok(()) => self.register().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => return,
                Err(e) => {
                    warn!(?backoff, "re-registration failed: {e:?}");
                    select! {
                        _ = self.token.cancelled() => return,
                        _ = sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_REGISTER_BACKOFF);
                }
            }
        }
    }

    /// Sends the empty list on every open stream, waits a bounded time for
    /// them to close, then tears the socket down. Later calls do nothing.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.serve_token.lock().await.cancel();

        let deadline = Instant::now() + self.config.stop_grace;
        loop {
            let closed = self.stream_closed.notified();
            if self.active_streams.load(Ordering::SeqCst) == 0 {
                break;
            }
            if timeout_at(deadline, closed).await.is_err() {
                warn!(
                    resource = self.resource_name(),
                    "list and watch stream did not close in time"
                );
                break;
            }
        }

        self.token.cancel();
        match tokio::fs::remove_file(&self.socket_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(socket = %self.socket_path.display(), "failed to remove socket: {e}"),
        }
        info!(resource = self.resource_name(), "device plugin stopped");
    }
}

/// Connects a gRPC channel over a unix socket.
async fn uds_channel(socket_path: &Path) -> DeviceResult<Channel> {
    let socket_path = socket_path.to_path_buf();
    let display = socket_path.display().to_string();

    // The URI is a placeholder, the connector dials the socket.
    Endpoint::from_static("http://tonic")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                match UnixStream::connect(socket_path).await {
                    Ok(stream) => Ok(TokioIo::new(stream)),
                    Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                }
            }
        }))
        .await
        .map_err(|e| {
            Report::new(DeviceError::protocol(format!(
                "failed to connect to {display}: {e}"
            )))
        })
}

struct StreamGuard<D: DeviceKind> {
    server: Arc<PluginServer<D>>,
}

impl<D: DeviceKind> Drop for StreamGuard<D> {
    fn drop(&mut self) {
        self.server.active_streams.fetch_sub(1, Ordering::SeqCst);
        self.server.stream_closed.notify_waiters();
    }
}

/// gRPC face of a [`PluginServer`] for one listener generation.
struct PluginService<D: DeviceKind> {
    server: Arc<PluginServer<D>>,
    serve_token: CancellationToken,
}

impl<D: DeviceKind> PluginService<D> {
    async fn allocate_container(&self, ids: &[String]) -> ContainerAllocateResponse {
        let units = self.server.units.read().await;
        let kind = &self.server.kind;
        let mut allocation = Allocation::default();

        for id in ids {
            let Some(entry) = units.get(id).filter(|e| !e.pending_removal) else {
                warn!(resource = kind.resource_name(), id, "unknown device requested, skipping");
                continue;
            };
            match kind.resolve(id, &entry.unit) {
                Ok(resolved) => {
                    for value in resolved.values {
                        if !allocation.values.contains(&value) {
                            allocation.values.push(value);
                        }
                    }
                    for spec in resolved.devices {
                        if !allocation
                            .devices
                            .iter()
                            .any(|d| d.host_path == spec.host_path)
                        {
                            allocation.devices.push(spec);
                        }
                    }
                }
                Err(e) => warn!(id, "failed to resolve device, skipping: {e:?}"),
            }
        }

        let mut envs = HashMap::new();
        if !allocation.values.is_empty() {
            envs.insert(
                env_key(kind.env_prefix(), kind.resource_name()),
                allocation.values.join(","),
            );
        }
        ContainerAllocateResponse {
            envs,
            devices: allocation.devices,
            ..Default::default()
        }
    }
}

#[tonic::async_trait]
impl<D: DeviceKind> DevicePlugin for PluginService<D> {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        Ok(Response::new(PluginServer::<D>::options()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        let server = self.server.clone();
        let token = self.serve_token.clone();
        let resource = server.resource_name().to_string();
        let mut rx = server.snapshot.subscribe();
        server.active_streams.fetch_add(1, Ordering::SeqCst);
        let guard = StreamGuard { server };
        info!(resource, "kubelet opened list and watch stream");

        let stream = async_stream::stream! {
            let _guard = guard;
            let initial = rx.borrow_and_update().clone();
            yield Ok(ListAndWatchResponse { devices: initial });

            loop {
                let changed = select! {
                    changed = rx.changed() => changed.is_ok(),
                    _ = token.cancelled() => false,
                };
                if !changed {
                    break;
                }
                let devices = rx.borrow_and_update().clone();
                yield Ok(ListAndWatchResponse { devices });
            }

            yield Ok(ListAndWatchResponse { devices: Vec::new() });
            debug!(resource, "list and watch stream closed");
        };
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        let req = request.into_inner();
        Ok(Response::new(PreferredAllocationResponse {
            container_responses: req
                .container_requests
                .iter()
                .map(|_| ContainerPreferredAllocationResponse::default())
                .collect(),
        }))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        let mut container_responses = Vec::with_capacity(req.container_requests.len());
        for container in &req.container_requests {
            info!(
                resource = self.server.resource_name(),
                ids = ?container.devices_ids,
                "allocating devices"
            );
            container_responses.push(self.allocate_container(&container.devices_ids).await);
        }
        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}


#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::testing::FileKind;
    use super::testing::FileUnit;
    use super::*;
    use crate::deviceplugin::api::v1beta1::ContainerAllocateRequest;

    fn server(dir: &Path) -> Arc<PluginServer<FileKind>> {
        PluginServer::new(
            FileKind {
                resource: "example.com/disk".to_string(),
                dir: dir.to_path_buf(),
            },
            PluginConfig {
                plugin_dir: dir.join("plugins"),
                ..Default::default()
            },
            &CancellationToken::new(),
        )
    }

    fn unit(file: &str) -> FileUnit {
        FileUnit {
            file: file.to_string(),
            siblings: Vec::new(),
        }
    }

    fn health(server: &PluginServer<FileKind>) -> Vec<(String, String)> {
        server
            .devices()
            .into_iter()
            .map(|d| (d.id, d.health))
            .collect()
    }

    #[test]
    fn env_key_is_derived_from_resource_name() {
        assert_eq!(
            env_key("PCI_RESOURCE", "nvidia.com/GA102GL_A10"),
            "PCI_RESOURCE_NVIDIA_COM_GA102GL_A10"
        );
        assert_eq!(
            env_key("MDEV_PCI_RESOURCE", "nvidia.com/NVIDIA_A2-4Q"),
            "MDEV_PCI_RESOURCE_NVIDIA_COM_NVIDIA_A2_4Q"
        );
        assert_eq!(socket_name("nvidia.com/GA102GL_A10"), "nvidia.com_GA102GL_A10.sock");
    }

    #[tokio::test]
    async fn add_is_idempotent_and_remove_waits_for_heartbeat() {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(tmp.path().join("a"), "").expect("a");
        let server = server(tmp.path());

        assert!(server.add_device("a", unit("a")).await);
        assert!(!server.add_device("a", unit("a")).await);
        assert!(server.add_device("b", unit("b")).await);
        assert_eq!(
            health(&server),
            vec![
                ("a".to_string(), "Healthy".to_string()),
                ("b".to_string(), "Unhealthy".to_string()),
            ]
        );

        assert_eq!(server.remove_device("a").await, 1);
        assert!(!server.contains("a").await);
        assert_eq!(
            health(&server),
            vec![
                ("a".to_string(), "Unhealthy".to_string()),
                ("b".to_string(), "Unhealthy".to_string()),
            ]
        );

        // The backing file still exists, so the first heartbeat keeps it.
        server.heartbeat().await;
        assert_eq!(health(&server).len(), 2);
        server.heartbeat().await;
        assert_eq!(health(&server), vec![("b".to_string(), "Unhealthy".to_string())]);
    }

    #[tokio::test]
    async fn heartbeat_tracks_backing_paths() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let server = server(tmp.path());
        server.add_device("a", unit("a")).await;
        assert_eq!(health(&server), vec![("a".to_string(), "Unhealthy".to_string())]);

        std::fs::write(tmp.path().join("a"), "").expect("a");
        server.heartbeat().await;
        assert_eq!(health(&server), vec![("a".to_string(), "Healthy".to_string())]);

        std::fs::remove_file(tmp.path().join("a")).expect("rm a");
        server.apply_health("a", false).await;
        assert_eq!(health(&server), vec![("a".to_string(), "Unhealthy".to_string())]);
    }

    #[tokio::test]
    async fn allocate_skips_unknown_and_merges_siblings() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let server = server(tmp.path());
        server
            .add_device(
                "a",
                FileUnit {
                    file: "group".to_string(),
                    siblings: vec!["a-audio".to_string()],
                },
            )
            .await;
        server
            .add_device(
                "b",
                FileUnit {
                    file: "group".to_string(),
                    siblings: vec!["a-audio".to_string()],
                },
            )
            .await;

        let service = PluginService {
            server: server.clone(),
            serve_token: CancellationToken::new(),
        };
        let response = service
            .allocate(Request::new(AllocateRequest {
                container_requests: vec![ContainerAllocateRequest {
                    devices_ids: vec!["a".to_string(), "missing".to_string(), "b".to_string()],
                }],
            }))
            .await
            .expect("allocate")
            .into_inner();

        let container = &response.container_responses[0];
        assert_eq!(
            container.envs.get("FILE_RESOURCE_EXAMPLE_COM_DISK"),
            Some(&"a,a-audio,b".to_string())
        );
        assert_eq!(container.devices.len(), 1);
        assert_eq!(container.devices[0].container_path, "/dev/group");
        assert_eq!(container.devices[0].permissions, "mrw");
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let server = server(tmp.path());
        server.stop().await;
        server.stop().await;
        assert!(server.token.is_cancelled());
    }
}
