//! Network interfaces, used to keep host management NICs out of passthrough.

use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;

use super::is_pci_address;
use super::link_basename;
use super::list_dir;
use super::Sysfs;
use crate::error::DeviceError;
use crate::error::DeviceResult;

/// Interfaces that carry a default route according to `/proc/net/route`.
pub fn default_route_interfaces(proc_root: &Path) -> DeviceResult<BTreeSet<String>> {
    let path = proc_root.join("net/route");
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(e) => return Err(Report::new(DeviceError::from_io(&e, path.display()))),
    };
    Ok(parse_default_routes(&content))
}

pub fn parse_default_routes(content: &str) -> BTreeSet<String> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let iface = fields.next()?;
            let destination = fields.next()?;
            (destination == "00000000").then(|| iface.to_string())
        })
        .collect()
}

/// Follows `lower_*` links of bonds, bridges and vlans down to the
/// physical members.
pub fn lower_devices(sysfs: &Sysfs, iface: &str) -> DeviceResult<BTreeSet<String>> {
    let mut out = BTreeSet::new();
    let mut pending = vec![iface.to_string()];
    while let Some(current) = pending.pop() {
        for entry in list_dir(&sysfs.net_class_dir().join(&current))? {
            if let Some(lower) = entry.strip_prefix("lower_") {
                if out.insert(lower.to_string()) {
                    pending.push(lower.to_string());
                }
            }
        }
    }
    Ok(out)
}

/// PCI address behind an interface, `None` for virtual interfaces.
pub fn interface_address(sysfs: &Sysfs, iface: &str) -> DeviceResult<Option<String>> {
    Ok(link_basename(&sysfs.net_class_dir().join(iface).join("device"))?
        .filter(|a| is_pci_address(a)))
}

/// Interfaces backed by a PCI function, as `(name, address)` pairs.
pub fn physical_interfaces(sysfs: &Sysfs) -> DeviceResult<Vec<(String, String)>> {
    let mut out = Vec::new();
    for iface in list_dir(&sysfs.net_class_dir())? {
        if let Some(address) = interface_address(sysfs, &iface)? {
            out.push((iface, address));
        }
    }
    Ok(out)
}

/// Host management NICs: the default-route interfaces, everything below
/// them, and any extra names from configuration.
#[derive(Debug, Clone)]
pub struct ManagementNics {
    sysfs: Sysfs,
    proc_root: PathBuf,
    extra: Vec<String>,
}

impl ManagementNics {
    pub fn new(sysfs: Sysfs, proc_root: impl Into<PathBuf>, extra: Vec<String>) -> Self {
        Self {
            sysfs,
            proc_root: proc_root.into(),
            extra,
        }
    }

    pub fn interfaces(&self) -> DeviceResult<BTreeSet<String>> {
        let mut names: BTreeSet<String> = self.extra.iter().cloned().collect();
        names.extend(default_route_interfaces(&self.proc_root)?);

        let mut all = names.clone();
        for name in &names {
            all.extend(lower_devices(&self.sysfs, name)?);
        }
        Ok(all)
    }

    /// PCI addresses of the management interfaces.
    pub fn addresses(&self) -> DeviceResult<BTreeSet<String>> {
        let mut out = BTreeSet::new();
        for iface in self.interfaces()? {
            if let Some(address) = interface_address(&self.sysfs, &iface)? {
                out.insert(address);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;

    use crate::infrastructure::sysfs::testing::link;

    pub fn add_interface(root: &Path, iface: &str, address: Option<&str>) {
        let dir = root.join("devices/net").join(iface);
        std::fs::create_dir_all(&dir).expect("iface dir");
        if let Some(address) = address {
            link(&dir.join("device"), &root.join("bus/pci/devices").join(address));
        }
        link(&root.join("class/net").join(iface), &dir);
    }

    pub fn add_lower(root: &Path, upper: &str, lower: &str) {
        link(
            &root.join("devices/net").join(upper).join(format!("lower_{lower}")),
            &root.join("devices/net").join(lower),
        );
    }
}
