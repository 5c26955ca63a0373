//! Reservation-based backend (beanstalkd-style tubes)

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

use crate::naming::QueueNames;
use crate::queue::{decode_json, Queue, QueueError};

/// A job reserved by this worker; other consumers cannot see it until it is
/// deleted or the reservation lapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedJob {
    pub id: u64,
    pub data: String,
}

/// Tube-based work queue client
#[async_trait]
pub trait ReservationClient: Send + Sync {
    /// Add `tube` to the watch list used by `reserve`
    async fn watch(&self, tube: &str) -> Result<(), QueueError>;

    /// Reserve the next ready job from a watched tube
    async fn reserve(&self, timeout: Duration) -> Result<Option<ReservedJob>, QueueError>;

    async fn delete(&self, job: &ReservedJob) -> Result<(), QueueError>;

    /// Put `data` into `tube`, returning the new job id
    async fn put_in_tube(&self, tube: &str, data: &str) -> Result<u64, QueueError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReservationSettings {
    /// Reserve timeout; zero polls without waiting
    pub max_wait: Duration,
}

pub struct ReservationQueue<C> {
    client: C,
    names: QueueNames,
    settings: ReservationSettings,
}

impl<C: ReservationClient> ReservationQueue<C> {
    pub fn new(client: C, base_name: &str, settings: ReservationSettings) -> Self {
        Self {
            client,
            names: QueueNames::for_reservation(base_name),
            settings,
        }
    }

    pub fn names(&self) -> &QueueNames {
        &self.names
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    async fn bury_in(&self, tube: &str, job: &ReservedJob) -> Result<(), QueueError> {
        self.client.put_in_tube(tube, &job.data).await?;
        self.client.delete(job).await
    }
}

#[async_trait]
impl<C: ReservationClient> Queue for ReservationQueue<C> {
    type Envelope = ReservedJob;

    async fn get_next(&self) -> Result<Option<ReservedJob>, QueueError> {
        self.client.watch(&self.names.source).await?;
        self.client.reserve(self.settings.max_wait).await
    }

    async fn successful(&self, job: ReservedJob) -> Result<(), QueueError> {
        self.client.delete(&job).await
    }

    async fn failed(&self, job: ReservedJob) -> Result<(), QueueError> {
        self.bury_in(&self.names.failed, &job).await
    }

    async fn error(&self, job: Option<ReservedJob>, cause: &str) -> Result<(), QueueError> {
        match job {
            Some(job) => self.bury_in(&self.names.error, &job).await,
            None => {
                warn!(tube = %self.names.source, cause = %cause, "Fetch error recorded");
                Ok(())
            }
        }
    }

    async fn stopped(&self, job: ReservedJob) -> Result<(), QueueError> {
        self.client.delete(&job).await
    }

    async fn nothing_to_do(&self) {}

    fn decode(&self, job: &ReservedJob) -> Result<Value, QueueError> {
        decode_json(&job.data)
    }

    fn describe(&self, job: &ReservedJob) -> String {
        json!({ "id": job.id, "data": job.data }).to_string()
    }

    async fn send(&self, body: &Value) -> Result<String, QueueError> {
        let data = serde_json::to_string(body)?;
        let id = self.client.put_in_tube(&self.names.source, &data).await?;
        Ok(id.to_string())
    }
}
