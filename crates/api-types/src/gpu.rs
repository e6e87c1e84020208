//! SR-IOV GPUs and the vGPU partitions carved from their virtual functions.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::DeviceState;

/// A physical GPU exposing SR-IOV virtual functions.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "devices.harvesterhci.io",
    version = "v1beta1",
    kind = "SRIOVGPUDevice",
    status = "SriovGpuDeviceStatus",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct SriovGpuDeviceSpec {
    pub address: String,
    pub node_name: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SriovGpuDeviceStatus {
    /// Names of the child VGPUDevice records
    #[serde(rename = "vGPUDevices", default)]
    pub vgpu_devices: Vec<String>,
    #[serde(default)]
    pub status: DeviceState,
}

/// One mediated-device capable function, usually a VF of an SR-IOV GPU.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "devices.harvesterhci.io",
    version = "v1beta1",
    kind = "VGPUDevice",
    status = "VgpuDeviceStatus",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct VgpuDeviceSpec {
    pub address: String,
    pub node_name: String,
    #[serde(default)]
    pub enabled: bool,
    /// Partition type name as published by the driver, e.g. `NVIDIA A2-4Q`
    #[serde(rename = "vGPUTypeName", default)]
    pub vgpu_type_name: String,
    #[serde(default)]
    pub parent_gpu_device_address: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VgpuDeviceStatus {
    #[serde(rename = "vGPUStatus", default)]
    pub vgpu_status: DeviceState,
    /// mdev UUID, empty while disabled
    #[serde(default)]
    pub uuid: String,
    #[serde(rename = "configureVGPUTypeName", default)]
    pub configured_vgpu_type_name: String,
    /// Partition type name to driver type id (`nvidia-745`) for types that
    /// still have free instances
    #[serde(rename = "availableTypes", default)]
    pub available_types: BTreeMap<String, String>,
}
