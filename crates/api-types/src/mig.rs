//! MIG partition configuration of a single GPU.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// Hardware ceiling on GPU instances per physical GPU.
pub const MAX_MIG_INSTANCES: u32 = 7;

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "devices.harvesterhci.io",
    version = "v1beta1",
    kind = "MigConfiguration",
    status = "MigConfigurationStatus",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct MigConfigurationSpec {
    #[serde(default)]
    pub enabled: bool,
    pub gpu_address: String,
    pub node_name: String,
    #[serde(default)]
    pub profile_spec: Vec<MigProfileRequest>,
}

impl MigConfigurationSpec {
    /// Sum of requested instances across all profiles.
    pub fn total_requested(&self) -> u32 {
        self.profile_spec.iter().map(|p| p.requested).sum()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigProfileRequest {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub requested: u32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum MigConfigurationState {
    #[serde(rename = "synced")]
    Synced,
    #[serde(rename = "out-of-sync")]
    OutOfSync,
    #[default]
    #[serde(rename = "disabled")]
    Disabled,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigConfigurationStatus {
    #[serde(default)]
    pub status: MigConfigurationState,
    #[serde(default)]
    pub profile_status: Vec<MigProfileStatus>,
}

impl MigConfigurationStatus {
    /// Number of live GPU instances across all profiles.
    pub fn instance_count(&self) -> usize {
        self.profile_status.iter().map(|p| p.vgpu_id.len()).sum()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigProfileStatus {
    pub id: u32,
    pub name: String,
    pub available: u32,
    pub total: u32,
    /// GPU instance ids currently created from this profile
    #[serde(rename = "vGPUID", default)]
    pub vgpu_id: Vec<String>,
}
