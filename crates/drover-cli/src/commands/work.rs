//! Work command - run a worker over a Redis list queue
//!
//! Usage:
//! ```bash
//! drover work --queue thumbs -- ./make-thumbnail.sh --size 128
//! ```

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use drover_queue::redis::RedisListClient;
use drover_queue::{ExitReason, ListQueue, ListSettings, Worker, WorkerConfig};

use crate::handler::CommandHandler;

/// Arguments for the work command
#[derive(Args)]
pub struct WorkArgs {
    /// Base queue name (overrides DROVER_QUEUE)
    #[arg(short, long)]
    queue: Option<String>,

    /// Redis URL (overrides DROVER_REDIS_URL)
    #[arg(long)]
    redis_url: Option<String>,

    /// Upper bound in seconds on one blocking fetch
    #[arg(long)]
    wait_secs: Option<u64>,

    /// Stop after this many fetch attempts (0 runs until stopped)
    #[arg(long)]
    max_iterations: Option<u64>,

    /// Seconds to wait after an interrupt before exiting
    #[arg(long)]
    cooldown_secs: Option<u64>,

    /// Command run for every job, receiving the job on stdin
    #[arg(last = true, required = true, value_name = "COMMAND")]
    command: Vec<String>,
}

/// Run the work command
pub async fn run(args: WorkArgs) -> Result<()> {
    let settings = super::queue_settings(args.queue, args.redis_url, args.wait_secs)?;

    let mut config = WorkerConfig::from_env().context("Invalid worker settings")?;
    if let Some(max) = args.max_iterations {
        config.max_iterations = max;
    }
    if let Some(secs) = args.cooldown_secs {
        config.shutdown_cooldown = Duration::from_secs(secs);
    }

    let handler = CommandHandler::from_argv(args.command)?;
    let client = RedisListClient::connect(&settings.url).await?;
    let queue = ListQueue::new(
        client,
        &settings.queue,
        ListSettings {
            max_wait: settings.max_wait,
        },
    );

    info!(
        queue = %settings.queue,
        max_iterations = config.max_iterations,
        "Starting worker"
    );

    let worker = Worker::new(queue, handler, config);
    let token = worker.cancellation_token();
    tokio::spawn(async move {
        if watch_interrupts(token, tokio::signal::ctrl_c(), tokio::signal::ctrl_c()).await {
            warn!("Second interrupt received, exiting without cooldown");
            std::process::exit(130);
        }
    });

    let report = worker.run().await;

    let reason = match report.exit {
        ExitReason::IterationBudget => "iteration budget reached",
        ExitReason::StopSentinel => "stop instruction received",
        ExitReason::Cancelled => "interrupted",
    };
    crate::print_success(&format!("Worker finished: {reason}"));
    println!(
        "  {} {}  {} {}  {} {}  {} {}",
        "succeeded".green(),
        report.succeeded,
        "failed".yellow(),
        report.failed,
        "errored".red(),
        report.errored,
        "idle".dimmed(),
        report.idle,
    );
    if report.fetch_faults > 0 {
        crate::print_warning(&format!("{} fetch attempts failed", report.fetch_faults));
    }

    Ok(())
}

/// Cancel the worker on the first interrupt. Returns `true` when a second
/// interrupt arrives, asking for an immediate exit.
async fn watch_interrupts<A, B>(token: CancellationToken, first: A, second: B) -> bool
where
    A: Future<Output = io::Result<()>>,
    B: Future<Output = io::Result<()>>,
{
    if first.await.is_err() {
        return false;
    }
    warn!("Interrupt received, finishing current job (interrupt again to exit now)");
    token.cancel();

    second.await.is_ok()
}
