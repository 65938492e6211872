use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use governor::app::{Governor, Tasks, WorkerPool};
use governor::config::{Cli, Commands, DaemonArgs, PrintConfigArgs};
use utils::{logging, version};

const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

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
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::PrintConfig(print_args) => run_print_config(print_args),
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guards = logging::init(daemon_args.metrics_file.clone());

    tracing::info!("Starting governor daemon {}", &**version::VERSION);

    // error-stack reports are not std errors; render them with their attachments
    let cfg = daemon_args
        .load_config()
        .map_err(|report| anyhow!("{report:?}"))
        .context("failed to load governor configuration")?;
    let governor = Arc::new(
        Governor::new(&cfg)
            .map_err(|report| anyhow!("{report:?}"))
            .context("failed to build governor")?,
    );

    let mut tasks = Tasks::new();
    let workers = WorkerPool::start(governor.clone(), &cfg.workers, tasks.cancellation_token())?;
    tasks.spawn_all_tasks(&governor, &cfg);

    let result = tasks.wait_for_completion().await;

    match workers.shutdown_with_timeout(WORKER_SHUTDOWN_TIMEOUT).await {
        Some(cancelled) => tracing::info!(cancelled, "governor daemon stopped"),
        None => tracing::warn!("governor daemon stopped with workers still running"),
    }

    result
}

fn run_print_config(print_args: PrintConfigArgs) -> Result<()> {
    let cfg = print_args
        .load_config()
        .map_err(|report| anyhow!("{report:?}"))?;
    let yaml = cfg.to_yaml().map_err(|report| anyhow!("{report:?}"))?;
    print!("{yaml}");
    Ok(())
}
