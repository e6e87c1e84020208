//! Lookup of vendor and device names in the `pci.ids` database.

use std::collections::HashMap;
use std::path::Path;

use tracing::warn;

#[derive(Debug, Default)]
struct Vendor {
    name: String,
    devices: HashMap<String, String>,
}

/// Parsed `pci.ids`. An unreadable database is empty and every lookup misses.
#[derive(Debug, Default)]
pub struct PciIds {
    vendors: HashMap<String, Vendor>,
}

impl PciIds {
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(e) => {
                warn!(path = %path.display(), "pci.ids unavailable, using raw ids: {e}");
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> Self {
        let mut vendors: HashMap<String, Vendor> = HashMap::new();
        let mut current: Option<String> = None;

        for line in content.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            // The class list at the end of the file uses the same layout.
            if line.starts_with("C ") {
                break;
            }
            if line.starts_with("\t\t") {
                continue;
            }
            if let Some(rest) = line.strip_prefix('\t') {
                let (Some(vendor), Some((id, name))) = (current.as_ref(), split_entry(rest))
                else {
                    continue;
                };
                if let Some(v) = vendors.get_mut(vendor) {
                    v.devices.insert(id, name);
                }
                continue;
            }
            if let Some((id, name)) = split_entry(line) {
                vendors.insert(
                    id.clone(),
                    Vendor {
                        name,
                        devices: HashMap::new(),
                    },
                );
                current = Some(id);
            }
        }

        Self { vendors }
    }

    pub fn vendor_name(&self, vendor_id: &str) -> Option<&str> {
        self.vendors
            .get(&vendor_id.to_ascii_lowercase())
            .map(|v| v.name.as_str())
    }

    pub fn device_name(&self, vendor_id: &str, device_id: &str) -> Option<&str> {
        self.vendors
            .get(&vendor_id.to_ascii_lowercase())
            .and_then(|v| v.devices.get(&device_id.to_ascii_lowercase()))
            .map(String::as_str)
    }
}

fn split_entry(line: &str) -> Option<(String, String)> {
    let (id, name) = line.split_once(char::is_whitespace)?;
    if id.len() != 4 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some((id.to_ascii_lowercase(), name.trim().to_string()))
}

#[cfg(test)]
pub(crate) const SAMPLE: &str = "\
# List of PCI ID's
10de  NVIDIA Corporation
\t2236  GA102GL [A10]
\t\t10de 1482  A10
\t25b6  GA107GL [A16]
8086  Intel Corporation
\t1533  I210 Gigabit Network Connection
\t1572  Ethernet Controller X710 for 10GbE SFP+
C 00  Unclassified device
\t00  Non-VGA unclassified device
";
