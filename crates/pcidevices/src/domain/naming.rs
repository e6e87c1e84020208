//! Record names, resource names and descriptions.

use crate::infrastructure::sysfs::pci_ids::PciIds;

/// `<node>-<address without ':' and '.'>`, e.g. `node1-000004000`.
pub fn record_name(node: &str, address: &str) -> String {
    let compact: String = address
        .chars()
        .filter(|c| *c != ':' && *c != '.')
        .collect::<String>()
        .to_ascii_lowercase();
    format!("{node}-{compact}")
}

pub fn sriov_nic_name(node: &str, interface: &str) -> String {
    format!("{node}-{interface}")
}

pub fn usb_record_name(
    node: &str,
    vendor_id: &str,
    product_id: &str,
    bus: u32,
    device: u32,
) -> String {
    format!("{node}-{vendor_id}{product_id}-{bus:03}{device:03}")
}

/// Keeps alphanumerics and `-`, maps runs of anything else to one `_`.
fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut gap = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            if gap && !out.is_empty() {
                out.push('_');
            }
            gap = false;
            out.push(c);
        } else {
            gap = true;
        }
    }
    out
}

/// Resource name advertised for a whole PCI function, e.g.
/// `nvidia.com/GA102GL_A10`. Falls back to the raw ids when the database
/// does not know the device.
pub fn pci_resource_name(ids: &PciIds, vendor_id: &str, device_id: &str) -> String {
    let vendor = ids
        .vendor_name(vendor_id)
        .and_then(|name| name.split_whitespace().next())
        .map(|word| sanitize(word).to_ascii_lowercase())
        .filter(|word| !word.is_empty());
    let device = ids
        .device_name(vendor_id, device_id)
        .map(sanitize)
        .filter(|name| !name.is_empty());

    match (vendor, device) {
        (Some(vendor), Some(device)) => format!("{vendor}.com/{device}"),
        _ => format!("{vendor_id}.com/{device_id}"),
    }
}

/// Resource name of a vGPU partition type, e.g. `nvidia.com/NVIDIA_A2-4Q`.
pub fn vgpu_resource_name(type_name: &str) -> String {
    format!("nvidia.com/{}", type_name.trim().replace(' ', "_"))
}

pub fn usb_resource_name(vendor_id: &str, product_id: &str) -> String {
    format!("usb.devices.harvesterhci.io/{vendor_id}{product_id}")
}

/// `<vendor> <device>` from the database, or the raw ids.
pub fn pci_description(ids: &PciIds, vendor_id: &str, device_id: &str) -> String {
    match (
        ids.vendor_name(vendor_id),
        ids.device_name(vendor_id, device_id),
    ) {
        (Some(vendor), Some(device)) => format!("{vendor} {device}"),
        (Some(vendor), None) => format!("{vendor} device {device_id}"),
        _ => format!("{vendor_id}:{device_id}"),
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::infrastructure::sysfs::pci_ids::SAMPLE;

    #[test]
    fn record_names_drop_separators() {
        assert_eq!(record_name("node1", "0000:04:00.0"), "node1-000004000");
        assert_eq!(record_name("node1", "0000:AF:10.2"), "node1-0000af102");
        assert_eq!(sriov_nic_name("node1", "eno1"), "node1-eno1");
        assert_eq!(
            usb_record_name("node1", "046d", "c52b", 1, 2),
            "node1-046dc52b-001002"
        );
    }

    #[test]
    fn resource_names_from_database() {
        let ids = PciIds::parse(SAMPLE);
        assert_eq!(pci_resource_name(&ids, "10de", "2236"), "nvidia.com/GA102GL_A10");
        assert_eq!(
            pci_resource_name(&ids, "8086", "1572"),
            "intel.com/Ethernet_Controller_X710_for_10GbE_SFP"
        );
        assert_eq!(pci_resource_name(&ids, "1af4", "1000"), "1af4.com/1000");
        assert_eq!(vgpu_resource_name("NVIDIA A2-4Q"), "nvidia.com/NVIDIA_A2-4Q");
    }

    #[test]
    fn descriptions_fall_back_to_ids() {
        let ids = PciIds::parse(SAMPLE);
        assert_eq!(
            pci_description(&ids, "10de", "2236"),
            "NVIDIA Corporation GA102GL [A10]"
        );
        assert_eq!(
            pci_description(&ids, "10de", "ffff"),
            "NVIDIA Corporation device ffff"
        );
        assert_eq!(pci_description(&ids, "1af4", "1000"), "1af4:1000");
    }
}
