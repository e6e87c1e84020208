//! USB devices and their claims.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "devices.harvesterhci.io",
    version = "v1beta1",
    kind = "USBDevice",
    status = "UsbDeviceStatus",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct UsbDeviceSpec {}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UsbDeviceStatus {
    pub vendor_id: String,
    pub product_id: String,
    pub bus_number: u32,
    pub device_number: u32,
    /// Device node, e.g. `/dev/bus/usb/001/002`
    pub device_path: String,
    pub resource_name: String,
    pub node_name: String,
    #[serde(default)]
    pub description: String,
    /// Address of the PCI host controller the device hangs off
    #[serde(rename = "pciAddress", default)]
    pub pci_address: String,
    #[serde(default)]
    pub enabled: bool,
}

/// Reservation of one USBDevice, named after the device it reserves.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "devices.harvesterhci.io",
    version = "v1beta1",
    kind = "USBDeviceClaim",
    status = "UsbDeviceClaimStatus",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct UsbDeviceClaimSpec {
    pub node_name: String,
    pub user_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UsbDeviceClaimStatus {
    #[serde(rename = "pciAddress", default)]
    pub pci_address: String,
    #[serde(default)]
    pub enabled: bool,
}
