//! USB devices under `/sys/bus/usb/devices`.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use tracing::debug;
use tracing::warn;

use super::is_pci_address;
use super::list_dir;
use super::parse_uevent;
use super::read_trimmed;
use super::Sysfs;
use crate::error::is_not_found;
use crate::error::DeviceError;
use crate::error::DeviceResult;

/// USB device class of hubs.
const HUB_CLASS: &str = "9";

/// Fields of a USB device `uevent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbUevent {
    pub bus_number: u32,
    pub device_number: u32,
    /// Four lowercase hex digits
    pub vendor_id: String,
    pub product_id: String,
    pub bcd_device: String,
    pub device_class: String,
    /// Relative to the dev root, e.g. `bus/usb/001/002`
    pub dev_name: String,
}

impl UsbUevent {
    pub fn is_hub(&self) -> bool {
        self.device_class == HUB_CLASS
    }
}

/// A USB device ready to be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbEntry {
    pub uevent: UsbUevent,
    pub serial: Option<String>,
    pub description: String,
    /// Absolute device node path, e.g. `/dev/bus/usb/001/002`
    pub device_path: String,
    /// Host controller the device hangs off
    pub pci_address: String,
}

fn field<'a>(
    map: &'a std::collections::BTreeMap<String, String>,
    key: &str,
) -> DeviceResult<&'a str> {
    map.get(key)
        .map(String::as_str)
        .ok_or_else(|| Report::new(DeviceError::parse(format!("usb uevent missing {key}"))))
}

fn number(raw: &str, key: &str) -> DeviceResult<u32> {
    raw.parse()
        .map_err(|_| Report::new(DeviceError::parse(format!("usb uevent {key}={raw:?}"))))
}

pub fn parse_uevent_content(content: &str) -> DeviceResult<UsbUevent> {
    let map = parse_uevent(content);

    let product = field(&map, "PRODUCT")?;
    let mut parts = product.split('/');
    let (Some(vendor), Some(product_id), bcd) = (parts.next(), parts.next(), parts.next()) else {
        return Err(Report::new(DeviceError::parse(format!(
            "usb uevent PRODUCT={product:?}"
        ))));
    };

    let device_class = map
        .get("TYPE")
        .and_then(|t| t.split('/').next())
        .unwrap_or("0")
        .to_string();

    Ok(UsbUevent {
        bus_number: number(field(&map, "BUSNUM")?, "BUSNUM")?,
        device_number: number(field(&map, "DEVNUM")?, "DEVNUM")?,
        vendor_id: format!("{:0>4}", vendor.to_ascii_lowercase()),
        product_id: format!("{:0>4}", product_id.to_ascii_lowercase()),
        bcd_device: bcd.unwrap_or_default().to_string(),
        device_class,
        dev_name: field(&map, "DEVNAME")?.to_string(),
    })
}

/// Finds the last PCI address among the components of a sysfs link target,
/// i.e. the host controller closest to the device.
pub fn pci_parent(target: &Path) -> Option<String> {
    target
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .filter(|c| is_pci_address(c))
        .last()
        .map(str::to_string)
}

fn read_optional(path: &Path) -> Option<String> {
    read_trimmed(path).ok().filter(|s| !s.is_empty())
}

/// Walks the bus and returns every non-hub device. Root hubs (`usbN`) and
/// interface entries (`1-1:1.0`) are skipped.
pub fn enumerate(sysfs: &Sysfs, dev_root: &Path) -> DeviceResult<Vec<UsbEntry>> {
    let root = sysfs.usb_devices_dir();
    let mut entries = Vec::new();

    for name in list_dir(&root)? {
        if name.starts_with("usb") || name.contains(':') {
            continue;
        }
        let dir = root.join(&name);
        let uevent = match read_trimmed(&dir.join("uevent")).and_then(|c| parse_uevent_content(&c)) {
            Ok(uevent) => uevent,
            Err(report) if is_not_found(&report) => {
                debug!(name, "usb device vanished during enumeration");
                continue;
            }
            Err(report) => {
                warn!(name, "skipping unreadable usb device: {report:?}");
                continue;
            }
        };
        if uevent.is_hub() {
            continue;
        }

        let target = fs::read_link(&dir).unwrap_or_else(|_| PathBuf::from(&name));
        let pci_address = pci_parent(&target).unwrap_or_default();

        let description = [
            read_optional(&dir.join("manufacturer")),
            read_optional(&dir.join("product")),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");

        entries.push(UsbEntry {
            device_path: dev_root.join(&uevent.dev_name).display().to_string(),
            serial: read_optional(&dir.join("serial")),
            description,
            pci_address,
            uevent,
        });
    }
    Ok(entries)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;

    use crate::infrastructure::sysfs::testing::link;
    use crate::infrastructure::sysfs::testing::write;

    /// Adds a device below the given controller, e.g. `1-1` on `0000:00:14.0`.
    pub fn add_device(root: &Path, controller: &str, name: &str, uevent: &str, product: &str) {
        let bus = name.split('-').next().unwrap_or("1");
        let dir = root
            .join("devices/pci0000:00")
            .join(controller)
            .join(format!("usb{bus}"))
            .join(name);
        write(&dir.join("uevent"), uevent);
        write(&dir.join("product"), &format!("{product}\n"));
        link(&root.join("bus/usb/devices").join(name), &dir);
    }
}
