use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use serde::Serialize;
use utils::version;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the node daemon
    Daemon(Box<DaemonArgs>),
    /// Scan the node once and print the discovered inventory as JSON
    Scan(ScanArgs),
}

/// How regions are offered to the scheduler. Fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginMode {
    /// `region-<interfaceId>` resources, reprogrammed on demand
    Region,
    /// `af-...` resources for ports that already carry a function
    Af,
}

#[derive(Parser, Clone, Debug)]
pub struct SysfsArgs {
    #[arg(
        long,
        env = "FPGA_PLUGIN_MODE",
        value_enum,
        default_value = "region",
        help = "Resource mode: 'region' (orchestrated) or 'af' (preprogrammed)"
    )]
    pub mode: PluginMode,

    #[arg(
        long,
        default_value = "/sys",
        value_hint = clap::ValueHint::DirPath,
        help = "Root of the sysfs tree to scan"
    )]
    pub sysfs_root: PathBuf,

    #[arg(
        long,
        default_value = "/dev",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory holding the FPGA port device nodes"
    )]
    pub dev_root: PathBuf,
}

#[derive(Parser, Clone, Debug)]
pub struct ScanArgs {
    #[command(flatten)]
    pub sysfs: SysfsArgs,
}

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[command(flatten)]
    pub sysfs: SysfsArgs,

    #[arg(
        long,
        env = "NODE_NAME",
        help = "Node name for filtering pending pods to this node only"
    )]
    pub node_name: String,

    #[arg(
        long,
        default_value = "/var/lib/kubelet/device-plugins",
        value_hint = clap::ValueHint::DirPath,
        help = "Kubelet device plugin directory; plugin sockets and kubelet.sock live here"
    )]
    pub device_plugin_dir: PathBuf,

    #[arg(
        long,
        default_value = "/var/lib/kubelet/device-plugins/kubelet_internal_checkpoint",
        value_hint = clap::ValueHint::FilePath,
        help = "Kubelet checkpoint used to find regions whose pods are gone"
    )]
    pub kubelet_checkpoint: PathBuf,

    #[arg(
        long,
        env = "FPGA_BITSTREAM_DIR",
        default_value = "/srv/intel.com/fpga",
        value_hint = clap::ValueHint::DirPath,
        help = "Bitstream repository laid out as <interfaceId>/<functionId>.gbs"
    )]
    pub bitstream_dir: PathBuf,

    #[arg(
        long,
        default_value = "fpgaconf",
        help = "Programming tool, invoked as '<command> -D <device> <bitstream>'"
    )]
    pub programmer_command: String,

    #[arg(
        long,
        default_value = "60",
        help = "Wall-clock limit for one reprogramming, in seconds"
    )]
    pub reprogram_timeout_secs: u64,

    #[arg(long, default_value = "5", help = "Inventory rescan interval, in seconds")]
    pub scan_interval_secs: u64,

    #[arg(
        long,
        default_value = "30",
        help = "Seconds a granted region may stay absent from the kubelet checkpoint before it is released"
    )]
    pub lease_grace_secs: u64,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        help = "Watch pending pods to resolve the function annotation of orchestrated requests",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_k8s: bool,
}

impl DaemonArgs {
    pub fn kubelet_socket(&self) -> PathBuf {
        self.device_plugin_dir.join("kubelet.sock")
    }

    pub fn reprogram_timeout(&self) -> Duration {
        Duration::from_secs(self.reprogram_timeout_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }

    pub fn lease_grace(&self) -> Duration {
        Duration::from_secs(self.lease_grace_secs)
    }
}
