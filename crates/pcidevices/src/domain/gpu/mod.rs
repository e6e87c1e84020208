//! NVIDIA SR-IOV GPUs and the vGPU partitions carved from them.

pub mod sriov_gpu;
pub mod vgpu;

/// PCI vendor id of NVIDIA.
pub const NVIDIA_VENDOR_ID: &str = "10de";

/// Vendor tool toggling SR-IOV on a GPU.
pub const SRIOV_MANAGE: &str = "/usr/lib/nvidia/sriov-manage";
