//! Drover CLI - run queue workers from the shell
//!
//! # Usage
//!
//! ```bash
//! # Feed every job on the "thumbs" queue to a script
//! drover work --queue thumbs -- ./make-thumbnail.sh
//!
//! # Enqueue a job
//! drover send --queue thumbs '{"image": "cat.png"}'
//!
//! # Ask one worker to shut down
//! drover send --queue thumbs --stop
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;

mod commands;
mod handler;

use commands::{send, work};

/// Drover - background job worker
#[derive(Parser)]
#[command(
    name = "drover",
    version,
    about = "Drover - background job worker",
    long_about = "Drover pulls jobs off a Redis list queue and hands each one to a command.\n\n\
                  Jobs the command rejects land on the failed list, jobs it\n\
                  cannot run at all land on the error list."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a worker that pipes each job into a command
    #[command(name = "work")]
    Work(work::WorkArgs),

    /// Enqueue a job or the stop instruction
    #[command(name = "send")]
    Send(send::SendArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Work(args) => work::run(args).await,
        Commands::Send(args) => send::run(args).await,
    }
}

/// Setup logging based on verbosity level
fn setup_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}

/// Print a success message with a checkmark
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Print a warning message
pub fn print_warning(msg: &str) {
    println!("{} {}", "⚠".yellow().bold(), msg);
}
