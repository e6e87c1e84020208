//! Typed access to the kernel's sysfs tree.
//!
//! Every function takes a [`Sysfs`] handle instead of hardcoding `/sys`, so
//! tests can point the same code at a synthetic tree in a temp directory.

pub mod iommu;
pub mod mdev;
pub mod net;
pub mod pci;
pub mod pci_ids;
pub mod usb;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;

use crate::error::DeviceError;
use crate::error::DeviceResult;

/// Root of a sysfs mount.
#[derive(Debug, Clone)]
pub struct Sysfs {
    root: PathBuf,
}

impl Sysfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pci_devices_dir(&self) -> PathBuf {
        self.root.join("bus/pci/devices")
    }

    pub fn pci_device(&self, address: &str) -> PathBuf {
        self.pci_devices_dir().join(address)
    }

    pub fn pci_drivers_probe(&self) -> PathBuf {
        self.root.join("bus/pci/drivers_probe")
    }

    pub fn iommu_groups_dir(&self) -> PathBuf {
        self.root.join("kernel/iommu_groups")
    }

    pub fn mdev_bus_dir(&self) -> PathBuf {
        self.root.join("class/mdev_bus")
    }

    pub fn mdev_devices_dir(&self) -> PathBuf {
        self.root.join("bus/mdev/devices")
    }

    pub fn usb_devices_dir(&self) -> PathBuf {
        self.root.join("bus/usb/devices")
    }

    pub fn net_class_dir(&self) -> PathBuf {
        self.root.join("class/net")
    }
}

/// Reads a sysfs attribute and trims trailing whitespace.
pub fn read_trimmed(path: &Path) -> DeviceResult<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| Report::new(DeviceError::from_io(&e, path.display())))
}

/// Writes a value to a sysfs attribute.
pub fn write_value(path: &Path, value: &str) -> DeviceResult<()> {
    fs::write(path, value).map_err(|e| Report::new(DeviceError::from_io(&e, path.display())))
}

/// Resolves a symlink and returns the file name of its target, or `None`
/// when the link does not exist.
pub fn link_basename(path: &Path) -> DeviceResult<Option<String>> {
    match fs::read_link(path) {
        Ok(target) => Ok(target
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Report::new(DeviceError::from_io(&e, path.display()))),
    }
}

/// Lists the entry names of a directory, sorted. A missing directory yields
/// an empty list.
pub fn list_dir(path: &Path) -> DeviceResult<Vec<String>> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Report::new(DeviceError::from_io(&e, path.display()))),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Report::new(DeviceError::from_io(&e, path.display())))?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Parses `KEY=VALUE` lines as found in `uevent` files.
pub fn parse_uevent(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Returns true for strings shaped like a PCI address, e.g. `0000:00:1f.6`.
pub fn is_pci_address(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 12
        && bytes[4] == b':'
        && bytes[7] == b':'
        && bytes[10] == b'.'
        && s.chars()
            .enumerate()
            .all(|(i, c)| matches!(i, 4 | 7 | 10) || c.is_ascii_hexdigit())
}


#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn parses_uevent_pairs() {
        let map = parse_uevent("DRIVER=nvidia\nPCI_CLASS=30200\nPCI_ID=10DE:2236\n\n");
        assert_eq!(map.get("DRIVER").map(String::as_str), Some("nvidia"));
        assert_eq!(map.get("PCI_ID").map(String::as_str), Some("10DE:2236"));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn recognises_pci_addresses() {
        assert!(is_pci_address("0000:00:1f.6"));
        assert!(is_pci_address("0000:af:00.1"));
        assert!(!is_pci_address("pci0000:00"));
        assert!(!is_pci_address("usb1"));
        assert!(!is_pci_address("0000:00:1g.6"));
    }

    #[test]
    fn missing_link_is_none() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert_eq!(link_basename(&tmp.path().join("driver")).expect("read"), None);
        assert_eq!(list_dir(&tmp.path().join("absent")).expect("list"), Vec::<String>::new());
    }
}
