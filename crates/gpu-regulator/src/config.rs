//! Command line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use utils::version;

use crate::policy::Quota;
use crate::policy::DEFAULT_MAX_DEVICES_PER_TENANT;
use crate::policy::DEFAULT_MEMORY_THRESHOLD_MB;
use crate::terminator::Signal;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a single regulation pass and exit
    Check(PolicyArgs),
    /// Run regulation passes periodically until interrupted
    Daemon(DaemonArgs),
}

/// Where the GPU process inventory comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InventoryBackend {
    /// Query the driver through NVML
    Nvml,
    /// Parse `nvidia-smi --query-compute-apps` output
    NvidiaSmi,
}

#[derive(Args, Debug, Clone)]
pub struct PolicyArgs {
    #[arg(
        long,
        env = "GPU_MEMORY_THRESHOLD_MB",
        default_value_t = DEFAULT_MEMORY_THRESHOLD_MB,
        help = "Processes using this much GPU memory or less are ignored"
    )]
    pub memory_threshold_mb: u64,

    #[arg(
        long = "max-gpu-per-user",
        env = "MAX_GPU_PER_USER",
        default_value_t = DEFAULT_MAX_DEVICES_PER_TENANT,
        help = "Maximum number of GPUs one user may occupy at a time"
    )]
    pub max_devices_per_tenant: usize,

    #[arg(
        long,
        env = "GPU_REGULATOR_INVENTORY",
        value_enum,
        default_value_t = InventoryBackend::Nvml,
        help = "Source of the GPU process inventory"
    )]
    pub inventory: InventoryBackend,

    #[arg(
        long,
        env = "NVIDIA_SMI_PATH",
        value_hint = clap::ValueHint::ExecutablePath,
        default_value = "/usr/bin/nvidia-smi",
        help = "nvidia-smi binary used by the nvidia-smi inventory"
    )]
    pub nvidia_smi_path: PathBuf,

    #[arg(
        long,
        env = "GPU_REGULATOR_PROC_ROOT",
        value_hint = clap::ValueHint::DirPath,
        default_value = "/proc",
        help = "procfs mount used to resolve process owners and start times"
    )]
    pub proc_root: PathBuf,

    #[arg(
        long,
        env = "GPU_REGULATOR_SIGNAL",
        value_enum,
        default_value_t = Signal::Term,
        help = "Signal sent to selected processes"
    )]
    pub signal: Signal,

    #[arg(
        long,
        env = "GPU_REGULATOR_DRY_RUN",
        help = "Log decisions without signalling any process"
    )]
    pub dry_run: bool,

    #[arg(
        long,
        env = "GPU_REGULATOR_METRICS_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Write per-pass usage metrics in influx line protocol, e.g. /logs/regulator.metrics"
    )]
    pub metrics_file: Option<PathBuf>,
}

impl PolicyArgs {
    pub fn quota(&self) -> Quota {
        Quota {
            memory_threshold_mb: self.memory_threshold_mb,
            max_devices_per_tenant: self.max_devices_per_tenant,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct DaemonArgs {
    #[command(flatten)]
    pub policy: PolicyArgs,

    #[arg(
        long,
        env = "GPU_REGULATOR_INTERVAL_SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Seconds between regulation passes"
    )]
    pub interval_secs: u64,
}

impl DaemonArgs {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}
