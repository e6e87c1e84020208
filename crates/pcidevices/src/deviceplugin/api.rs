#![allow(clippy::doc_markdown)]
pub mod v1beta1 {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

/// API version sent with every registration.
pub const VERSION: &str = "v1beta1";

/// Socket name of the kubelet registration service inside the plugin dir.
pub const KUBELET_SOCKET: &str = "kubelet.sock";

pub const HEALTHY: &str = "Healthy";
pub const UNHEALTHY: &str = "Unhealthy";

/// Permissions granted on every device node handed to a container.
pub const DEVICE_PERMISSIONS: &str = "mrw";
