use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use gpu_regulator::config::Cli;
use gpu_regulator::config::Commands;
use gpu_regulator::config::DaemonArgs;
use gpu_regulator::config::InventoryBackend;
use gpu_regulator::config::PolicyArgs;
use gpu_regulator::inventory::InventorySource;
use gpu_regulator::inventory::NvidiaSmiInventory;
use gpu_regulator::inventory::NvmlInventory;
use gpu_regulator::logging;
use gpu_regulator::process_meta::ProcfsMetadata;
use gpu_regulator::terminator::DryRunTerminator;
use gpu_regulator::terminator::SignalTerminator;
use gpu_regulator::terminator::Terminator;
use gpu_regulator::Regulator;
use tokio_util::sync::CancellationToken;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check(policy_args) => run_check(policy_args).await,
        Commands::Daemon(daemon_args) => run_daemon(daemon_args).await,
    }
}

async fn run_check(policy_args: PolicyArgs) -> Result<()> {
    let _guard = logging::init(policy_args.metrics_file.as_deref())?;

    let regulator = build_regulator(&policy_args);
    tracing::info!(
        quota = ?regulator.quota(),
        dry_run = policy_args.dry_run,
        "Running single regulation pass, gpu-regulator {}",
        &**version::VERSION
    );
    regulator.run_pass().await;

    Ok(())
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(daemon_args.policy.metrics_file.as_deref())?;

    let regulator = build_regulator(&daemon_args.policy);
    tracing::info!(
        quota = ?regulator.quota(),
        interval_secs = daemon_args.interval_secs,
        dry_run = daemon_args.policy.dry_run,
        "Starting gpu-regulator daemon {}",
        &**version::VERSION
    );

    let token = CancellationToken::new();
    spawn_signal_handler(token.clone())?;
    regulator.run(daemon_args.interval(), token).await;

    tracing::info!("Monitoring interrupted by operator");
    Ok(())
}

fn build_regulator(args: &PolicyArgs) -> Regulator {
    let inventory: Arc<dyn InventorySource> = match args.inventory {
        InventoryBackend::Nvml => Arc::new(NvmlInventory::new()),
        InventoryBackend::NvidiaSmi => Arc::new(NvidiaSmiInventory::new(&args.nvidia_smi_path)),
    };
    let terminator: Arc<dyn Terminator> = if args.dry_run {
        Arc::new(DryRunTerminator)
    } else {
        Arc::new(SignalTerminator::new(args.signal))
    };

    Regulator::new(
        inventory,
        Arc::new(ProcfsMetadata::with_root(&args.proc_root)),
        terminator,
        args.quota(),
    )
}

/// Cancels `token` on SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) -> Result<()> {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }
        token.cancel();
    });

    Ok(())
}
