//! Label keys shared between the record kinds.

/// Label carrying the owning node of a record.
pub const NODE_LABEL: &str = "nodename";

/// Label on a VF PCIDevice naming the SRIOVNetworkDevice that created it.
pub const PARENT_SRIOV_LABEL: &str = "harvesterhci.io/parent-sriov";

/// Label on a VGPUDevice naming its parent SRIOVGPUDevice.
pub const PARENT_SRIOV_GPU_LABEL: &str = "harvesterhci.io/parent-sriov-gpu";

/// Label selector matching every record owned by `node`.
pub fn node_selector(node: &str) -> String {
    format!("{NODE_LABEL}={node}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_selector_uses_node_label() {
        assert_eq!(node_selector("node1"), "nodename=node1");
    }
}
