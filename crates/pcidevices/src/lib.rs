//! Node agent exposing PCI, USB and GPU partitions of a host to its
//! orchestrator as device records and kubelet device plugin resources.

pub mod app;
pub mod config;
pub mod controller;
pub mod deviceplugin;
pub mod domain;
pub mod error;
pub mod infrastructure;
#[cfg(any(test, feature = "testing"))]
pub mod mock;

pub use app::Application;
pub use app::ApplicationBuilder;
pub use error::DeviceError;
pub use error::DeviceResult;
