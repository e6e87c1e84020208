use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::deviceplugin::PluginConfig;

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "NODE_NAME",
        help = "Name of the node this agent manages; records of other nodes are ignored"
    )]
    pub node_name: String,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to a kubeconfig file, in-cluster config is used when unset"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(long, default_value = "/sys", value_hint = clap::ValueHint::DirPath)]
    pub sysfs_root: PathBuf,

    #[arg(long, default_value = "/dev", value_hint = clap::ValueHint::DirPath)]
    pub dev_root: PathBuf,

    #[arg(long, default_value = "/proc", value_hint = clap::ValueHint::DirPath)]
    pub proc_root: PathBuf,

    #[arg(
        long,
        default_value = "/var/lib/kubelet/device-plugins",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory holding the kubelet socket and the plugin sockets"
    )]
    pub device_plugin_dir: PathBuf,

    #[arg(
        long,
        default_value = "/usr/share/hwdata/pci.ids",
        value_hint = clap::ValueHint::FilePath,
        help = "pci.ids database used for descriptions and resource names"
    )]
    pub pci_ids_path: PathBuf,

    #[arg(
        long,
        value_hint = clap::ValueHint::DirPath,
        help = "Host filesystem to chroot into for local vendor commands, e.g. /host"
    )]
    pub host_root: Option<PathBuf>,

    #[arg(
        long,
        requires = "driver_pod_selector",
        help = "Namespace of the vendor driver pods; vendor commands run inside them when set"
    )]
    pub driver_namespace: Option<String>,

    #[arg(
        long,
        requires = "driver_namespace",
        help = "Label selector of the vendor driver pods, e.g. app=nvidia-driver-daemonset"
    )]
    pub driver_pod_selector: Option<String>,

    #[arg(long, default_value = "60")]
    pub command_timeout_secs: u64,

    #[arg(long, default_value = "30", help = "Interval of the PCI inventory pass")]
    pub pci_resync_secs: u64,

    #[arg(long, default_value = "30", help = "Interval of the USB inventory pass")]
    pub usb_resync_secs: u64,

    #[arg(
        long,
        default_value = "60",
        help = "Requeue interval of MigConfigurations and of the GPU discovery passes"
    )]
    pub mig_resync_secs: u64,

    #[arg(
        long,
        value_delimiter = ',',
        help = "Extra interfaces to treat as management NICs, comma separated"
    )]
    pub management_interfaces: Vec<String>,
}

impl DaemonArgs {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn pci_resync(&self) -> Duration {
        Duration::from_secs(self.pci_resync_secs.max(1))
    }

    pub fn usb_resync(&self) -> Duration {
        Duration::from_secs(self.usb_resync_secs.max(1))
    }

    pub fn mig_resync(&self) -> Duration {
        Duration::from_secs(self.mig_resync_secs.max(1))
    }

    pub fn plugin_config(&self) -> PluginConfig {
        PluginConfig {
            plugin_dir: self.device_plugin_dir.clone(),
            ..PluginConfig::default()
        }
    }

    /// Namespace and selector of the driver pods, when remote execution is
    /// configured.
    pub fn driver_pods(&self) -> Option<(&str, &str)> {
        self.driver_namespace
            .as_deref()
            .zip(self.driver_pod_selector.as_deref())
    }
}
