//! MIG partitioning of NVIDIA GPUs through `nvidia-smi`.
//!
//! Instances are carved in ascending profile id order: on NVIDIA hardware a
//! lower id is a larger slice, and placing the large slices first avoids
//! fragmenting the GPU. That ordering is specific to this vendor.

pub mod parse;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use api_types::labels::node_selector;
use api_types::MigConfiguration;
use api_types::MigConfigurationSpec;
use api_types::MigConfigurationState;
use api_types::MigConfigurationStatus;
use api_types::MigProfileRequest;
use api_types::MigProfileStatus;
use api_types::MAX_MIG_INSTANCES;
use error_stack::Report;
use kube::ResourceExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

use self::parse::GpuInstance;
use self::parse::MigProfile;
use super::gpu::NVIDIA_VENDOR_ID;
use super::naming::record_name;
use super::node_meta;
use crate::error::DeviceError;
use crate::error::DeviceResult;
use crate::infrastructure::executor::CommandExecutor;
use crate::infrastructure::executor::CommandOutput;
use crate::infrastructure::store::RecordStore;
use crate::infrastructure::sysfs::pci;
use crate::infrastructure::sysfs::Sysfs;

pub const NVIDIA_SMI: &str = "nvidia-smi";

/// Diagnostics `nvidia-smi` prints, with a failing exit code, for an empty
/// listing.
const EMPTY_LISTING: [&str; 3] = [
    "No MIG-enabled devices",
    "No GPU instances found",
    "No compute instances found",
];

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// Rejects specs requesting more instances than one GPU can hold.
pub fn check_ceiling(spec: &MigConfigurationSpec) -> DeviceResult<()> {
    let total = spec.total_requested();
    if total > MAX_MIG_INSTANCES {
        return Err(Report::new(DeviceError::policy(format!(
            "{} requests {total} MIG instances, at most {MAX_MIG_INSTANCES} are possible",
            spec.gpu_address
        ))));
    }
    Ok(())
}

/// Requested instance count per profile id, ignoring zero requests.
pub fn requested_counts(spec: &MigConfigurationSpec) -> BTreeMap<u32, u32> {
    let mut counts = BTreeMap::new();
    for request in spec.profile_spec.iter().filter(|p| p.requested > 0) {
        *counts.entry(request.id).or_insert(0) += request.requested;
    }
    counts
}

/// GPU instances beyond what the spec asks for, highest ids first.
pub fn surplus_instances(requested: &BTreeMap<u32, u32>, live: &[GpuInstance]) -> Vec<u32> {
    let mut by_profile: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for instance in live {
        by_profile.entry(instance.profile_id).or_default().push(instance.id);
    }
    let mut surplus = Vec::new();
    for (profile, mut ids) in by_profile {
        ids.sort_unstable();
        let keep = requested.get(&profile).copied().unwrap_or(0) as usize;
        surplus.extend(ids.into_iter().skip(keep).rev());
    }
    surplus
}

pub fn classify(spec: &MigConfigurationSpec, profiles: &[MigProfileStatus]) -> MigConfigurationState {
    let live: BTreeMap<u32, u32> = profiles
        .iter()
        .filter(|p| !p.vgpu_id.is_empty())
        .map(|p| (p.id, p.vgpu_id.len() as u32))
        .collect();
    match (spec.enabled, live.is_empty()) {
        (false, true) => MigConfigurationState::Disabled,
        (false, false) => MigConfigurationState::OutOfSync,
        (true, _) if live == requested_counts(spec) => MigConfigurationState::Synced,
        (true, _) => MigConfigurationState::OutOfSync,
    }
}

/// Issues `nvidia-smi` commands against one GPU at a time.
#[derive(Clone)]
pub struct MigManager {
    executor: Arc<dyn CommandExecutor>,
}

impl MigManager {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    async fn run(&self, args: Vec<String>) -> DeviceResult<CommandOutput> {
        self.executor.execute(NVIDIA_SMI, &args).await
    }

    /// Runs a listing command, mapping the "nothing found" diagnostics to an
    /// empty table.
    async fn list(&self, args: Vec<String>) -> DeviceResult<String> {
        let line = args.join(" ");
        let output = self.run(args).await?;
        let text = output.combined();
        if EMPTY_LISTING.iter().any(|marker| text.contains(marker)) {
            return Ok(String::new());
        }
        if !output.success {
            return Err(Report::new(DeviceError::command(format!(
                "{NVIDIA_SMI} {line}: {}",
                text.trim()
            ))));
        }
        Ok(output.stdout_str())
    }

    /// Runs a delete command; an already absent instance is not an error.
    async fn delete(&self, args: Vec<String>) -> DeviceResult<()> {
        let line = args.join(" ");
        let output = self.run(args).await?;
        if output.success || output.combined().to_lowercase().contains("not found") {
            return Ok(());
        }
        Err(Report::new(DeviceError::command(format!(
            "{NVIDIA_SMI} {line}: {}",
            output.combined().trim()
        ))))
    }

    /// Current MIG mode, `None` when the GPU does not support MIG.
    pub async fn mig_mode(&self, address: &str) -> DeviceResult<Option<bool>> {
        let output = self
            .run(args([
                "--query-gpu=mig.mode.current",
                "--format=csv,noheader",
                "-i",
                address,
            ]))
            .await?;
        if !output.success {
            return Ok(None);
        }
        Ok(match output.stdout_str().trim() {
            "Enabled" => Some(true),
            "Disabled" => Some(false),
            _ => None,
        })
    }

    pub async fn ensure_mig_mode(&self, address: &str) -> DeviceResult<()> {
        match self.mig_mode(address).await? {
            Some(true) => Ok(()),
            Some(false) => {
                let output = self.run(args(["-i", address, "-mig", "1"])).await?;
                if !output.success {
                    return Err(Report::new(DeviceError::command(format!(
                        "enabling MIG mode on {address}: {}",
                        output.combined().trim()
                    ))));
                }
                info!(address, "MIG mode enabled");
                Ok(())
            }
            None => Err(Report::new(DeviceError::policy(format!(
                "{address} does not support MIG"
            )))),
        }
    }

    pub async fn profiles(&self, address: &str) -> DeviceResult<Vec<MigProfile>> {
        parse::parse_profiles(&self.list(args(["mig", "-i", address, "-lgip"])).await?)
    }

    pub async fn gpu_instances(&self, address: &str) -> DeviceResult<Vec<GpuInstance>> {
        parse::parse_gpu_instances(&self.list(args(["mig", "-i", address, "-lgi"])).await?)
    }

    async fn create_instance(&self, address: &str, profile: u32) -> DeviceResult<()> {
        let profile = profile.to_string();
        let output = self
            .run(args(["mig", "-i", address, "-cgi", &profile, "-C"]))
            .await?;
        if !output.success {
            return Err(Report::new(DeviceError::command(format!(
                "creating MIG profile {profile} instance on {address}: {}",
                output.combined().trim()
            ))));
        }
        debug!(address, profile, "MIG instance created");
        Ok(())
    }

    /// Deletes a GPU instance along with the compute instances attached to it.
    pub async fn delete_instance(&self, address: &str, gpu_instance: u32) -> DeviceResult<()> {
        let gi = gpu_instance.to_string();
        let listing = self.list(args(["mig", "-i", address, "-gi", &gi, "-lci"])).await?;
        for compute in parse::parse_compute_instances(&listing)?
            .into_iter()
            .filter(|c| c.gpu_instance == gpu_instance)
        {
            let ci = compute.id.to_string();
            self.delete(args(["mig", "-i", address, "-gi", &gi, "-ci", &ci, "-dci"]))
                .await?;
        }
        self.delete(args(["mig", "-i", address, "-gi", &gi, "-dgi"])).await?;
        debug!(address, gpu_instance, "MIG instance deleted");
        Ok(())
    }

    /// Drives the GPU to the instance counts in `spec`.
    #[tracing::instrument(skip_all, fields(address = %spec.gpu_address))]
    pub async fn apply(&self, spec: &MigConfigurationSpec) -> DeviceResult<()> {
        check_ceiling(spec)?;
        let address = spec.gpu_address.as_str();
        self.ensure_mig_mode(address).await?;

        let requested = requested_counts(spec);
        let instances = self.gpu_instances(address).await?;
        let surplus = surplus_instances(&requested, &instances);

        let mut live: BTreeMap<u32, u32> = BTreeMap::new();
        for instance in instances.iter().filter(|i| !surplus.contains(&i.id)) {
            *live.entry(instance.profile_id).or_insert(0) += 1;
        }

        let profiles = self.profiles(address).await?;
        let mut creates = Vec::new();
        // BTreeMap iteration gives ascending profile ids.
        for (&profile, &want) in &requested {
            let have = live.get(&profile).copied().unwrap_or(0);
            if want <= have {
                continue;
            }
            let need = want - have;
            let available = profiles
                .iter()
                .find(|p| p.id == profile)
                .map(|p| p.available)
                .ok_or_else(|| {
                    Report::new(DeviceError::policy(format!(
                        "{address} has no MIG profile {profile}"
                    )))
                })?;
            if need > available {
                return Err(Report::new(DeviceError::policy(format!(
                    "{address} profile {profile}: {need} more instances requested, {available} available"
                ))));
            }
            creates.extend(std::iter::repeat(profile).take(need as usize));
        }

        for gpu_instance in surplus {
            self.delete_instance(address, gpu_instance).await?;
        }
        for profile in creates {
            self.create_instance(address, profile).await?;
        }
        Ok(())
    }

    /// Deletes the instances recorded in `status` and any other live one.
    #[tracing::instrument(skip(self, status))]
    pub async fn disable(&self, address: &str, status: Option<&MigConfigurationStatus>) -> DeviceResult<()> {
        let mut targets: BTreeSet<u32> = status
            .map(|s| {
                s.profile_status
                    .iter()
                    .flat_map(|p| p.vgpu_id.iter())
                    .filter_map(|id| id.parse().ok())
                    .collect()
            })
            .unwrap_or_default();
        targets.extend(self.gpu_instances(address).await?.iter().map(|i| i.id));

        for gpu_instance in targets {
            self.delete_instance(address, gpu_instance).await?;
        }
        Ok(())
    }

    pub async fn status(&self, spec: &MigConfigurationSpec) -> DeviceResult<MigConfigurationStatus> {
        let profiles = self.profiles(&spec.gpu_address).await?;
        let instances = self.gpu_instances(&spec.gpu_address).await?;
        let profile_status = parse::profile_status(&profiles, &instances);
        Ok(MigConfigurationStatus {
            status: classify(spec, &profile_status),
            profile_status,
        })
    }
}

pub struct MigReconciler {
    node_name: String,
    sysfs: Sysfs,
    manager: MigManager,
    configs: Arc<dyn RecordStore<MigConfiguration>>,
}

impl MigReconciler {
    pub fn new(
        node_name: impl Into<String>,
        sysfs: Sysfs,
        manager: MigManager,
        configs: Arc<dyn RecordStore<MigConfiguration>>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            sysfs,
            manager,
            configs,
        }
    }

    async fn capable_gpus(&self) -> DeviceResult<Vec<String>> {
        let mut capable = Vec::new();
        for function in pci::enumerate(&self.sysfs)? {
            if function.vendor_id != NVIDIA_VENDOR_ID
                || !function.is_display()
                || function.physfn.is_some()
            {
                continue;
            }
            match self.manager.mig_mode(&function.address).await {
                Ok(Some(_)) => capable.push(function.address),
                Ok(None) => {}
                Err(report) => warn!(address = %function.address, "MIG mode query failed: {report:?}"),
            }
        }
        Ok(capable)
    }

    fn seed_profiles(profiles: &[MigProfile]) -> Vec<MigProfileRequest> {
        profiles
            .iter()
            .map(|p| MigProfileRequest {
                id: p.id,
                name: p.name.clone(),
                requested: 0,
            })
            .collect()
    }

    /// Creates a MigConfiguration for every MIG-capable GPU. Records created
    /// while MIG mode was off have no profiles yet; they are seeded once the
    /// profile listing becomes available.
    #[tracing::instrument(skip(self), fields(node = %self.node_name))]
    pub async fn discover(&self) -> DeviceResult<()> {
        let existing: BTreeMap<String, MigConfiguration> = self
            .configs
            .list(&node_selector(&self.node_name))
            .await?
            .into_iter()
            .map(|c| (c.name_any(), c))
            .collect();

        let mut seen = BTreeSet::new();
        for address in self.capable_gpus().await? {
            let name = record_name(&self.node_name, &address);
            let profiles = self.manager.profiles(&address).await?;
            seen.insert(name.clone());

            match existing.get(&name) {
                Some(config) if config.spec.profile_spec.is_empty() && !profiles.is_empty() => {
                    let mut updated = config.clone();
                    updated.spec.profile_spec = Self::seed_profiles(&profiles);
                    self.configs.update(&updated).await?;
                    info!(name, "MIG profiles seeded");
                }
                Some(_) => {}
                None => {
                    let mut config = MigConfiguration::new(
                        &name,
                        MigConfigurationSpec {
                            enabled: false,
                            gpu_address: address.clone(),
                            node_name: self.node_name.clone(),
                            profile_spec: Self::seed_profiles(&profiles),
                        },
                    );
                    config.metadata = node_meta(&name, &self.node_name);
                    self.configs.create(&config).await?;
                    info!(name, address, "MIG configuration recorded");
                }
            }
        }

        for name in existing.keys().filter(|n| !seen.contains(*n)) {
            self.configs.delete(name).await?;
            info!(name, "MIG capable gpu vanished, record removed");
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(config = %config.name_any()))]
    pub async fn reconcile(&self, config: &MigConfiguration) -> DeviceResult<()> {
        if config.spec.node_name != self.node_name {
            return Ok(());
        }
        if config.spec.enabled {
            self.manager.apply(&config.spec).await?;
        } else {
            self.manager
                .disable(&config.spec.gpu_address, config.status.as_ref())
                .await?;
        }

        let status = self.manager.status(&config.spec).await?;
        if config.status.as_ref() != Some(&status) {
            info!(state = ?status.status, instances = status.instance_count(), "MIG status changed");
            let mut updated = config.clone();
            updated.status = Some(status);
            self.configs.update_status(&updated).await?;
        }
        Ok(())
    }
}
