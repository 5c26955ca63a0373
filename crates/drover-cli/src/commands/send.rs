//! Send command - enqueue a job
//!
//! Usage:
//! ```bash
//! drover send --queue thumbs '{"image": "cat.png"}'
//! drover send --queue thumbs --stop
//! ```

use anyhow::{Context, Result};
use clap::Args;
use serde_json::Value;

use drover_queue::redis::RedisListClient;
use drover_queue::{ListQueue, ListSettings, Queue, STOP_SENTINEL};

/// Arguments for the send command
#[derive(Args)]
pub struct SendArgs {
    /// Base queue name (overrides DROVER_QUEUE)
    #[arg(short, long)]
    queue: Option<String>,

    /// Redis URL (overrides DROVER_REDIS_URL)
    #[arg(long)]
    redis_url: Option<String>,

    /// JSON payload
    #[arg(required_unless_present = "stop", conflicts_with = "stop")]
    payload: Option<String>,

    /// Enqueue the stop instruction instead of a job
    #[arg(long)]
    stop: bool,
}

/// Run the send command
pub async fn run(args: SendArgs) -> Result<()> {
    let body = parse_payload(args.payload.as_deref(), args.stop)?;
    let settings = super::queue_settings(args.queue, args.redis_url, None)?;

    let client = RedisListClient::connect(&settings.url).await?;
    let queue = ListQueue::new(client, &settings.queue, ListSettings::default());
    let length = queue.send(&body).await?;

    crate::print_success(&format!(
        "Enqueued on {} (length {length})",
        queue.names().source
    ));
    Ok(())
}

fn parse_payload(payload: Option<&str>, stop: bool) -> Result<Value> {
    if stop {
        return Ok(Value::String(STOP_SENTINEL.to_string()));
    }
    let raw = payload.context("No payload given")?;
    serde_json::from_str(raw).with_context(|| format!("Invalid JSON: {raw}"))
}
