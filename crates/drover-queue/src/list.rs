//! Atomic list-move backend
//!
//! Fetching moves the job from the source list onto a processing list in one
//! step, so a crashed worker leaves the job parked in `processing` instead of
//! losing it. Every outcome removes it from there again.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::naming::QueueNames;
use crate::queue::{decode_json, Queue, QueueError};

/// List store client (Redis-style list commands)
#[async_trait]
pub trait ListClient: Send + Sync {
    /// Atomically pop the tail of `source` and push it onto the head of
    /// `destination`, waiting up to `timeout` for an element.
    async fn move_blocking(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<String>, QueueError>;

    /// Push onto the head of `list`, returning its new length
    async fn push(&self, list: &str, value: &str) -> Result<u64, QueueError>;

    /// Remove up to `count` occurrences of `value`, returning how many went
    async fn remove(&self, list: &str, count: usize, value: &str) -> Result<u64, QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;
}

#[derive(Debug, Clone, Copy)]
pub struct ListSettings {
    /// Upper bound on one blocking fetch
    pub max_wait: Duration,
}

impl Default for ListSettings {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(30),
        }
    }
}

/// A job parked on the processing list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListJob {
    raw: String,
}

impl ListJob {
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

pub struct ListQueue<C> {
    client: C,
    names: QueueNames,
    processing: String,
    settings: ListSettings,
}

impl<C: ListClient> ListQueue<C> {
    pub fn new(client: C, base_name: &str, settings: ListSettings) -> Self {
        Self {
            client,
            names: QueueNames::for_list(base_name),
            processing: QueueNames::list_processing(base_name),
            settings,
        }
    }

    pub fn names(&self) -> &QueueNames {
        &self.names
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    async fn release(&self, job: &ListJob) -> Result<(), QueueError> {
        self.client.remove(&self.processing, 1, &job.raw).await?;
        Ok(())
    }

    async fn dead_letter(&self, destination: &str, job: &ListJob) -> Result<(), QueueError> {
        self.client.push(destination, &job.raw).await?;
        self.release(job).await
    }
}

#[async_trait]
impl<C: ListClient> Queue for ListQueue<C> {
    type Envelope = ListJob;

    async fn get_next(&self) -> Result<Option<ListJob>, QueueError> {
        let item = self
            .client
            .move_blocking(&self.names.source, &self.processing, self.settings.max_wait)
            .await?;

        Ok(item.map(|raw| ListJob { raw }))
    }

    async fn successful(&self, job: ListJob) -> Result<(), QueueError> {
        self.release(&job).await
    }

    async fn failed(&self, job: ListJob) -> Result<(), QueueError> {
        self.dead_letter(&self.names.failed, &job).await
    }

    async fn error(&self, job: Option<ListJob>, cause: &str) -> Result<(), QueueError> {
        match job {
            Some(job) => {
                debug!(queue = %self.names.error, cause = %cause, "Dead-lettering errored job");
                self.dead_letter(&self.names.error, &job).await
            }
            None => {
                warn!(queue = %self.names.source, cause = %cause, "Fetch error recorded");
                Ok(())
            }
        }
    }

    async fn stopped(&self, job: ListJob) -> Result<(), QueueError> {
        self.release(&job).await
    }

    async fn nothing_to_do(&self) {
        if let Err(e) = self.client.ping().await {
            warn!(queue = %self.names.source, error = %e, "Idle ping failed");
        }
    }

    fn decode(&self, job: &ListJob) -> Result<Value, QueueError> {
        decode_json(&job.raw)
    }

    fn describe(&self, job: &ListJob) -> String {
        job.raw.clone()
    }

    async fn send(&self, body: &Value) -> Result<String, QueueError> {
        let raw = serde_json::to_string(body)?;
        let len = self.client.push(&self.names.source, &raw).await?;
        Ok(len.to_string())
    }
}
