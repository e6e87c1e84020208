//! Reconcilers turning host hardware state into device records and back.

pub mod gpu;
pub mod mig;
pub mod naming;
pub mod pci;
pub mod sriov;
pub mod usb;

use std::collections::BTreeMap;

use api_types::labels::NODE_LABEL;
use kube::api::ObjectMeta;
use kube::ResourceExt;

/// Metadata of a new record owned by `node`.
pub fn node_meta(name: &str, node: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(BTreeMap::from([(NODE_LABEL.to_string(), node.to_string())])),
        ..Default::default()
    }
}

/// True when the record's node label names `node`. Records without the label
/// belong to nobody and are left alone.
pub fn owned_by(obj: &impl ResourceExt, node: &str) -> bool {
    obj.labels().get(NODE_LABEL).is_some_and(|n| n == node)
}
