//! PCI functions under `/sys/bus/pci/devices`.

use std::path::Path;

use error_stack::Report;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::is_pci_address;
use super::link_basename;
use super::list_dir;
use super::parse_uevent;
use super::read_trimmed;
use super::write_value;
use super::Sysfs;
use crate::error::is_not_found;
use crate::error::DeviceError;
use crate::error::DeviceResult;

pub const VFIO_PCI_DRIVER: &str = "vfio-pci";

/// One PCI function as the kernel reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PciFunction {
    pub address: String,
    /// Lowercase hex, e.g. `10de`
    pub vendor_id: String,
    pub device_id: String,
    /// Six hex digits, e.g. `030200`
    pub class_id: String,
    pub driver: Option<String>,
    pub iommu_group: Option<u32>,
    pub numa_node: Option<i64>,
    /// Physical function address when this is an SR-IOV VF
    pub physfn: Option<String>,
}

impl PciFunction {
    /// PCI class 0x06 covers host, ISA and PCI bridges.
    pub fn is_bridge(&self) -> bool {
        self.class_id.starts_with("06")
    }

    /// PCI class 0x03 covers VGA, 3D and display controllers.
    pub fn is_display(&self) -> bool {
        self.class_id.starts_with("03")
    }

    pub fn is_vfio_bound(&self) -> bool {
        self.driver.as_deref() == Some(VFIO_PCI_DRIVER)
    }
}

/// Reads one function's identity, driver and topology.
pub fn read_function(sysfs: &Sysfs, address: &str) -> DeviceResult<PciFunction> {
    let dev = sysfs.pci_device(address);
    let uevent = parse_uevent(&read_trimmed(&dev.join("uevent"))?);

    let (vendor_id, device_id) = uevent
        .get("PCI_ID")
        .and_then(|id| id.split_once(':'))
        .map(|(v, d)| (v.to_ascii_lowercase(), d.to_ascii_lowercase()))
        .ok_or_else(|| {
            Report::new(DeviceError::parse(format!("{address}: uevent has no PCI_ID")))
        })?;

    let class_id = uevent
        .get("PCI_CLASS")
        .map(|c| format!("{:0>6}", c.to_ascii_lowercase()))
        .unwrap_or_default();

    let driver = match uevent.get("DRIVER") {
        Some(driver) => Some(driver.clone()),
        None => link_basename(&dev.join("driver"))?,
    };

    let iommu_group = link_basename(&dev.join("iommu_group"))?.and_then(|g| g.parse().ok());

    Ok(PciFunction {
        address: address.to_string(),
        vendor_id,
        device_id,
        class_id,
        driver,
        iommu_group,
        numa_node: read_numa_node(&dev),
        physfn: link_basename(&dev.join("physfn"))?,
    })
}

/// Enumerates every function on the bus, sorted by address.
pub fn enumerate(sysfs: &Sysfs) -> DeviceResult<Vec<PciFunction>> {
    let mut functions = Vec::new();
    for address in list_dir(&sysfs.pci_devices_dir())? {
        if !is_pci_address(&address) {
            continue;
        }
        match read_function(sysfs, &address) {
            Ok(function) => functions.push(function),
            Err(report) if is_not_found(&report) => {
                debug!(address, "pci function vanished during enumeration");
            }
            Err(report) => warn!(address, "skipping unreadable pci function: {report:?}"),
        }
    }
    Ok(functions)
}

/// `numa_node` reads `-1` on single-socket hosts; that and a missing file both
/// mean "no affinity".
fn read_numa_node(dev: &Path) -> Option<i64> {
    read_trimmed(&dev.join("numa_node"))
        .ok()
        .and_then(|n| n.parse::<i64>().ok())
        .filter(|n| *n >= 0)
}

/// Kernel modules able to drive the function. sysfs only exposes the module
/// of the bound driver.
pub fn kernel_modules(sysfs: &Sysfs, address: &str) -> DeviceResult<Vec<String>> {
    Ok(link_basename(&sysfs.pci_device(address).join("driver/module"))?
        .into_iter()
        .collect())
}

pub fn class_id(sysfs: &Sysfs, address: &str) -> DeviceResult<String> {
    read_function(sysfs, address).map(|f| f.class_id)
}

/// Current VF count of an SR-IOV physical function.
pub fn sriov_numvfs(sysfs: &Sysfs, address: &str) -> DeviceResult<u32> {
    let path = sysfs.pci_device(address).join("sriov_numvfs");
    let raw = read_trimmed(&path)?;
    raw.parse().map_err(|_| {
        Report::new(DeviceError::parse(format!(
            "{}: invalid VF count {raw:?}",
            path.display()
        )))
    })
}

/// Maximum VF count, or `None` when the function is not SR-IOV capable.
pub fn sriov_totalvfs(sysfs: &Sysfs, address: &str) -> DeviceResult<Option<u32>> {
    let path = sysfs.pci_device(address).join("sriov_totalvfs");
    match read_trimmed(&path) {
        Ok(raw) => Ok(raw.parse().ok().filter(|n| *n > 0)),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn set_sriov_numvfs(sysfs: &Sysfs, address: &str, count: u32) -> DeviceResult<()> {
    info!(address, count, "setting sriov_numvfs");
    write_value(
        &sysfs.pci_device(address).join("sriov_numvfs"),
        &count.to_string(),
    )
}

/// VF addresses of a physical function ordered by VF index (`virtfn0`,
/// `virtfn1`, ..., `virtfn10`).
pub fn virtfn_addresses(sysfs: &Sysfs, address: &str) -> DeviceResult<Vec<String>> {
    let dev = sysfs.pci_device(address);
    let mut vfs = Vec::new();
    for entry in list_dir(&dev)? {
        let Some(index) = entry
            .strip_prefix("virtfn")
            .and_then(|i| i.parse::<u32>().ok())
        else {
            continue;
        };
        if let Some(vf) = link_basename(&dev.join(&entry))? {
            vfs.push((index, vf));
        }
    }
    vfs.sort();
    Ok(vfs.into_iter().map(|(_, vf)| vf).collect())
}

/// Hands the function to vfio-pci: pins the override, releases the current
/// driver and asks the bus to reprobe.
pub fn bind_vfio(sysfs: &Sysfs, address: &str) -> DeviceResult<()> {
    let function = read_function(sysfs, address)?;
    if function.is_vfio_bound() {
        debug!(address, "already bound to vfio-pci");
        return Ok(());
    }

    let dev = sysfs.pci_device(address);
    write_value(&dev.join("driver_override"), VFIO_PCI_DRIVER)?;
    if function.driver.is_some() {
        write_value(&dev.join("driver/unbind"), address)?;
    }
    write_value(&sysfs.pci_drivers_probe(), address)?;
    info!(address, previous = ?function.driver, "bound to vfio-pci");
    Ok(())
}

/// Releases the function from vfio-pci and lets the default driver claim it.
pub fn unbind_vfio(sysfs: &Sysfs, address: &str) -> DeviceResult<()> {
    let function = match read_function(sysfs, address) {
        Ok(function) => function,
        Err(e) if is_not_found(&e) => {
            debug!(address, "function vanished, nothing to unbind");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let dev = sysfs.pci_device(address);
    write_value(&dev.join("driver_override"), "\n")?;
    if function.is_vfio_bound() {
        write_value(&dev.join("driver/unbind"), address)?;
    }
    write_value(&sysfs.pci_drivers_probe(), address)?;
    info!(address, "released from vfio-pci");
    Ok(())
}
