//! USB devices handed over by device node.

use std::path::PathBuf;

use super::device_spec;
use super::Allocation;
use super::DeviceKind;
use crate::error::DeviceResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbUnit {
    pub bus_number: u32,
    pub device_number: u32,
}

impl UsbUnit {
    /// Node path relative to the dev root, e.g. `bus/usb/001/002`.
    pub fn dev_name(&self) -> String {
        format!("bus/usb/{:03}/{:03}", self.bus_number, self.device_number)
    }
}

pub struct UsbKind {
    resource_name: String,
    dev_root: PathBuf,
}

impl UsbKind {
    pub fn new(resource_name: impl Into<String>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            resource_name: resource_name.into(),
            dev_root: dev_root.into(),
        }
    }
}

impl DeviceKind for UsbKind {
    type Unit = UsbUnit;

    fn resource_name(&self) -> &str {
        &self.resource_name
    }

    fn env_prefix(&self) -> &'static str {
        "USB_RESOURCE"
    }

    fn health_path(&self, unit: &UsbUnit) -> PathBuf {
        self.dev_root.join(unit.dev_name())
    }

    fn resolve(&self, _id: &str, unit: &UsbUnit) -> DeviceResult<Allocation> {
        Ok(Allocation {
            values: vec![format!("{}:{}", unit.bus_number, unit.device_number)],
            devices: vec![device_spec(&self.dev_root, &unit.dev_name())],
        })
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn resolves_bus_and_device_node() {
        let kind = UsbKind::new("usb.devices.harvesterhci.io/046dc52b", "/host/dev");
        let unit = UsbUnit {
            bus_number: 1,
            device_number: 2,
        };
        let allocation = kind.resolve("node1-046dc52b-001002", &unit).expect("resolve");
        assert_eq!(allocation.values, vec!["1:2".to_string()]);
        assert_eq!(allocation.devices[0].host_path, "/host/dev/bus/usb/001/002");
        assert_eq!(allocation.devices[0].container_path, "/dev/bus/usb/001/002");
        assert_eq!(kind.health_path(&unit), PathBuf::from("/host/dev/bus/usb/001/002"));
    }
}
