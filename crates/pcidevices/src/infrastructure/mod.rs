pub mod executor;
pub mod kube_client;
pub mod store;
pub mod sysfs;
