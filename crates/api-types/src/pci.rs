//! PCI function records and their claims.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// A PCI function observed on a node. All observed data lives in the status.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "devices.harvesterhci.io",
    version = "v1beta1",
    kind = "PCIDevice",
    status = "PciDeviceStatus",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct PciDeviceSpec {}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PciDeviceStatus {
    /// PCI address, e.g. `0000:04:00.0`
    pub address: String,
    pub vendor_id: String,
    pub device_id: String,
    pub class_id: String,
    pub node_name: String,
    /// Resource name advertised to the kubelet once claimed
    pub resource_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kernel_driver_in_use: String,
    #[serde(default)]
    pub kernel_modules: Vec<String>,
    #[serde(rename = "iommuGroup", default)]
    pub iommu_group: String,
}

/// Reservation of one PCIDevice for passthrough. The claim carries the same
/// name as the device it reserves.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "devices.harvesterhci.io",
    version = "v1beta1",
    kind = "PCIDeviceClaim",
    status = "PciDeviceClaimStatus",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct PciDeviceClaimSpec {
    pub address: String,
    pub node_name: String,
    pub user_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PciDeviceClaimStatus {
    /// Driver that was bound before passthrough, restored on release
    #[serde(default)]
    pub kernel_driver_to_unbind: String,
    #[serde(default)]
    pub passthrough_enabled: bool,
}
