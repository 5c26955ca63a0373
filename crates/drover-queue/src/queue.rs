//! Queue Contract

use async_trait::async_trait;
use serde_json::Value;

use crate::idempotency::IdempotencyError;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Idempotency store error: {0}")]
    Idempotency(#[from] IdempotencyError),
}

/// Contract every backend adapter satisfies.
///
/// The worker hands each fetched envelope back through exactly one of
/// [`successful`](Queue::successful), [`failed`](Queue::failed),
/// [`error`](Queue::error) or [`stopped`](Queue::stopped). Those methods take
/// the envelope by value, so a second acknowledgment of the same job does
/// not type-check.
///
/// Dead-letter destinations always receive the raw body exactly as it was
/// fetched, never a re-encoded one.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Backend handle plus raw body for one fetched job
    type Envelope: Send + Sync;

    /// Wait up to the configured bound for the next job.
    ///
    /// `Ok(None)` means nothing arrived in time. Errors are reserved for real
    /// backend failures.
    async fn get_next(&self) -> Result<Option<Self::Envelope>, QueueError>;

    /// Acknowledge a job whose handler reported success
    async fn successful(&self, job: Self::Envelope) -> Result<(), QueueError>;

    /// Copy the raw body to the failed destination, then acknowledge
    async fn failed(&self, job: Self::Envelope) -> Result<(), QueueError>;

    /// Copy the raw body to the error destination, then acknowledge.
    ///
    /// Called with `None` when the fault happened while fetching; the adapter
    /// then only records the cause.
    async fn error(&self, job: Option<Self::Envelope>, cause: &str) -> Result<(), QueueError>;

    /// Acknowledge a stop instruction without dead-lettering it
    async fn stopped(&self, job: Self::Envelope) -> Result<(), QueueError>;

    /// Idle hook fired after an empty fetch. Must not fail.
    async fn nothing_to_do(&self);

    /// Decode the raw body into a structured payload
    fn decode(&self, job: &Self::Envelope) -> Result<Value, QueueError>;

    /// One-line rendering of a job for log output
    fn describe(&self, job: &Self::Envelope) -> String;

    /// Enqueue a new job on the source destination, returning the backend's ack
    async fn send(&self, body: &Value) -> Result<String, QueueError>;
}

/// Decode a raw JSON body, shared by the adapters.
pub(crate) fn decode_json(raw: &str) -> Result<Value, QueueError> {
    serde_json::from_str(raw).map_err(|e| QueueError::Decode(e.to_string()))
}
