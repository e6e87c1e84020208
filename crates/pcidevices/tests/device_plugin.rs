//! Drives a plugin server against a fake kubelet over unix sockets.

use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use pcidevices::deviceplugin::api::v1beta1::device_plugin_client::DevicePluginClient;
use pcidevices::deviceplugin::api::v1beta1::registration_server::Registration;
use pcidevices::deviceplugin::api::v1beta1::registration_server::RegistrationServer;
use pcidevices::deviceplugin::api::v1beta1::AllocateRequest;
use pcidevices::deviceplugin::api::v1beta1::ContainerAllocateRequest;
use pcidevices::deviceplugin::api::v1beta1::Empty;
use pcidevices::deviceplugin::api::v1beta1::RegisterRequest;
use pcidevices::deviceplugin::device_spec;
use pcidevices::deviceplugin::Allocation;
use pcidevices::deviceplugin::DeviceKind;
use pcidevices::deviceplugin::PluginConfig;
use pcidevices::deviceplugin::PluginServer;
use pcidevices::DeviceResult;
use similar_asserts::assert_eq;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tower::service_fn;

const RESOURCE: &str = "example.com/disk";

struct DiskKind {
    dir: PathBuf,
}

impl DeviceKind for DiskKind {
    type Unit = String;

    fn resource_name(&self) -> &str {
        RESOURCE
    }

    fn env_prefix(&self) -> &'static str {
        "DISK_RESOURCE"
    }

    fn health_path(&self, unit: &String) -> PathBuf {
        self.dir.join(unit)
    }

    fn resolve(&self, id: &str, unit: &String) -> DeviceResult<Allocation> {
        Ok(Allocation {
            values: vec![id.to_string()],
            devices: vec![device_spec(&self.dir, unit)],
        })
    }
}

/// Kubelet registration service that records every call and can reject
/// one of them.
struct FakeKubelet {
    registrations: mpsc::UnboundedSender<RegisterRequest>,
    calls: AtomicUsize,
    /// 1-based number of the call to reject
    reject_call: Option<usize>,
}

#[tonic::async_trait]
impl Registration for FakeKubelet {
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<Empty>, Status> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.registrations.send(request.into_inner());
        if self.reject_call == Some(call) {
            return Err(Status::unavailable("kubelet not ready"));
        }
        Ok(Response::new(Empty {}))
    }
}

fn spawn_kubelet(plugin_dir: &Path, token: CancellationToken) -> mpsc::UnboundedReceiver<RegisterRequest> {
    spawn_rejecting_kubelet(plugin_dir, token, None)
}

fn spawn_rejecting_kubelet(
    plugin_dir: &Path,
    token: CancellationToken,
    reject_call: Option<usize>,
) -> mpsc::UnboundedReceiver<RegisterRequest> {
    std::fs::create_dir_all(plugin_dir).expect("plugin dir");
    let listener = UnixListener::bind(plugin_dir.join("kubelet.sock")).expect("bind kubelet socket");
    let (tx, rx) = mpsc::unbounded_channel();
    let kubelet = FakeKubelet {
        registrations: tx,
        calls: AtomicUsize::new(0),
        reject_call,
    };
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(RegistrationServer::new(kubelet))
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), token.cancelled_owned())
            .await
            .expect("kubelet server");
    });
    rx
}

async fn connect(socket: &Path) -> DevicePluginClient<Channel> {
    let socket = socket.to_path_buf();
    let channel = Endpoint::from_static("http://kubelet")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket = socket.clone();
            async move { UnixStream::connect(socket).await.map(TokioIo::new) }
        }))
        .await
        .expect("connect plugin socket");
    DevicePluginClient::new(channel)
}

#[test_log::test(tokio::test)]
async fn registers_streams_allocates_and_stops() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let plugin_dir = tmp.path().join("device-plugins");
    let dev_dir = tmp.path().join("dev");
    std::fs::create_dir_all(&dev_dir).expect("dev dir");
    std::fs::write(dev_dir.join("sda"), "").expect("sda");

    let token = CancellationToken::new();
    let mut registrations = spawn_kubelet(&plugin_dir, token.clone());

    let server = PluginServer::new(
        DiskKind { dir: dev_dir.clone() },
        PluginConfig {
            plugin_dir: plugin_dir.clone(),
            stop_grace: Duration::from_secs(2),
            ..Default::default()
        },
        &token,
    );
    server.add_device("sda", "sda".to_string()).await;
    server.start().await.expect("start plugin");

    let registration = tokio::time::timeout(Duration::from_secs(5), registrations.recv())
        .await
        .expect("registration in time")
        .expect("registration");
    assert_eq!(registration.version, "v1beta1");
    assert_eq!(registration.resource_name, RESOURCE);
    assert_eq!(registration.endpoint, "example.com_disk.sock");
    assert!(server.socket_path().exists());

    let mut client = connect(server.socket_path()).await;
    let mut stream = client
        .list_and_watch(Request::new(Empty {}))
        .await
        .expect("list and watch")
        .into_inner();

    let first = stream.message().await.expect("first list").expect("open stream");
    let listed: Vec<_> = first.devices.iter().map(|d| (d.id.as_str(), d.health.as_str())).collect();
    assert_eq!(listed, vec![("sda", "Healthy")]);

    // A unit without its backing node is advertised unhealthy.
    server.add_device("sdb", "sdb".to_string()).await;
    let second = stream.message().await.expect("second list").expect("open stream");
    let listed: Vec<_> = second.devices.iter().map(|d| (d.id.as_str(), d.health.as_str())).collect();
    assert_eq!(listed, vec![("sda", "Healthy"), ("sdb", "Unhealthy")]);

    let response = client
        .allocate(Request::new(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_ids: vec!["sda".to_string(), "unknown".to_string()],
            }],
        }))
        .await
        .expect("allocate")
        .into_inner();
    let container = &response.container_responses[0];
    assert_eq!(
        container.envs.get("DISK_RESOURCE_EXAMPLE_COM_DISK"),
        Some(&"sda".to_string())
    );
    assert_eq!(container.devices.len(), 1);
    assert_eq!(container.devices[0].container_path, "/dev/sda");

    let stopping = {
        let server = server.clone();
        tokio::spawn(async move { server.stop().await })
    };
    let last = stream.message().await.expect("final list").expect("open stream");
    assert!(last.devices.is_empty());
    stopping.await.expect("stop");

    assert!(!server.socket_path().exists());
    token.cancel();
}

#[tokio::test]
async fn start_fails_without_kubelet() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let server = PluginServer::new(
        DiskKind {
            dir: tmp.path().to_path_buf(),
        },
        PluginConfig {
            plugin_dir: tmp.path().join("device-plugins"),
            register_timeout: Duration::from_secs(1),
            ..Default::default()
        },
        &CancellationToken::new(),
    );

    assert!(server.start().await.is_err());
    assert!(!server.socket_path().exists());
}

fn drain(registrations: &mut mpsc::UnboundedReceiver<RegisterRequest>) -> usize {
    let mut count = 0;
    while registrations.try_recv().is_ok() {
        count += 1;
    }
    count
}

async fn started_server(
    tmp: &Path,
    token: &CancellationToken,
) -> std::sync::Arc<PluginServer<DiskKind>> {
    let dev_dir = tmp.join("dev");
    std::fs::create_dir_all(&dev_dir).expect("dev dir");
    std::fs::write(dev_dir.join("sda"), "").expect("sda");

    let server = PluginServer::new(
        DiskKind { dir: dev_dir },
        PluginConfig {
            plugin_dir: tmp.join("device-plugins"),
            ..Default::default()
        },
        token,
    );
    server.add_device("sda", "sda".to_string()).await;
    server.start().await.expect("start plugin");
    // Let the health loop install its watches.
    tokio::time::sleep(Duration::from_millis(300)).await;
    server
}

#[test_log::test(tokio::test)]
async fn socket_removal_ends_streams_and_registers_once() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let token = CancellationToken::new();
    let mut registrations = spawn_kubelet(&tmp.path().join("device-plugins"), token.clone());
    let server = started_server(tmp.path(), &token).await;
    assert_eq!(drain(&mut registrations), 1);

    let mut client = connect(server.socket_path()).await;
    let mut stream = client
        .list_and_watch(Request::new(Empty {}))
        .await
        .expect("list and watch")
        .into_inner();
    stream.message().await.expect("first list").expect("open stream");

    std::fs::remove_file(server.socket_path()).expect("remove socket");

    let last = tokio::time::timeout(Duration::from_secs(5), stream.message())
        .await
        .expect("final list in time")
        .expect("final list")
        .expect("open stream");
    assert!(last.devices.is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(drain(&mut registrations), 1);
    assert!(server.socket_path().exists());

    // The rebound socket serves the same units.
    let mut client = connect(server.socket_path()).await;
    let mut stream = client
        .list_and_watch(Request::new(Empty {}))
        .await
        .expect("list and watch after rebind")
        .into_inner();
    let listed = stream.message().await.expect("list").expect("open stream");
    assert_eq!(listed.devices.len(), 1);

    server.stop().await;
    token.cancel();
}

#[test_log::test(tokio::test)]
async fn rejected_reregistration_retries_with_backoff() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let token = CancellationToken::new();
    let mut registrations =
        spawn_rejecting_kubelet(&tmp.path().join("device-plugins"), token.clone(), Some(2));
    let server = started_server(tmp.path(), &token).await;
    assert_eq!(drain(&mut registrations), 1);

    std::fs::remove_file(server.socket_path()).expect("remove socket");

    // One rejected attempt, then one retry after the first backoff step.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(drain(&mut registrations), 2);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(drain(&mut registrations), 0);
    assert!(server.socket_path().exists());

    server.stop().await;
    token.cancel();
}
