//! CLI subcommands

pub mod send;
pub mod work;

use anyhow::{ensure, Context, Result};
use drover_queue::QueueSettings;

/// Environment settings with command-line overrides applied
pub(crate) fn queue_settings(
    queue: Option<String>,
    redis_url: Option<String>,
    wait_secs: Option<u64>,
) -> Result<QueueSettings> {
    let mut settings = QueueSettings::from_env().context("Invalid queue settings")?;

    if let Some(queue) = queue {
        settings.queue = queue;
    }
    if let Some(url) = redis_url {
        settings.url = url;
    }
    if let Some(secs) = wait_secs {
        settings.max_wait = std::time::Duration::from_secs(secs);
    }

    ensure!(!settings.queue.trim().is_empty(), "Queue name must not be empty");
    Ok(settings)
}
