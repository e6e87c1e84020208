//! Shared record type definitions
//!
//! This crate contains the cluster-scoped custom resources used by the node
//! agent to describe passthrough-capable hardware: PCI functions and their
//! claims, SR-IOV network and GPU devices, vGPU partitions, MIG
//! configurations and USB devices. Every record belongs to exactly one node,
//! carried in the [`labels::NODE_LABEL`] label or in the claim spec.

pub mod gpu;
pub mod labels;
pub mod mig;
pub mod pci;
pub mod sriov;
pub mod usb;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

pub use gpu::*;
pub use mig::*;
pub use pci::*;
pub use sriov::*;
pub use usb::*;

/// API group shared by all record kinds.
pub const GROUP: &str = "devices.harvesterhci.io";
/// API version shared by all record kinds.
pub const VERSION: &str = "v1beta1";

/// Enablement state reported by SR-IOV and vGPU records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    #[default]
    Disabled,
    Enabled,
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceState::Disabled => write!(f, "disabled"),
            DeviceState::Enabled => write!(f, "enabled"),
        }
    }
}
