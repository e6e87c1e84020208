//! SR-IOV capable network interfaces.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::DeviceState;

/// A physical function of an SR-IOV capable NIC and the VF count requested
/// for it.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "devices.harvesterhci.io",
    version = "v1beta1",
    kind = "SRIOVNetworkDevice",
    status = "SriovNetworkDeviceStatus",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct SriovNetworkDeviceSpec {
    /// PCI address of the physical function
    pub address: String,
    pub interface_name: String,
    pub node_name: String,
    #[serde(rename = "numVFs", default)]
    pub num_vfs: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SriovNetworkDeviceStatus {
    #[serde(rename = "vfAddresses", default)]
    pub vf_addresses: Vec<String>,
    /// Names of the PCIDevice records derived from `vf_addresses`
    #[serde(rename = "vfPCIDevices", default)]
    pub vf_pci_devices: Vec<String>,
    #[serde(default)]
    pub status: DeviceState,
}
