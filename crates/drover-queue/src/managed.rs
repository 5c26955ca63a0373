//! Managed queue backend with a visibility timeout (SQS-style)
//!
//! A received message stays hidden for the visibility window and is
//! redelivered if it is not deleted in time, so the same message can reach
//! a worker twice. Attach an [`IdempotencyStore`] to suppress those repeats.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::idempotency::{IdempotencyStore, TypedValue};
use crate::naming::QueueNames;
use crate::queue::{decode_json, Queue, QueueError};

/// One delivery of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Stable across redeliveries
    pub message_id: String,
    /// Valid for this delivery only
    pub receipt_handle: String,
    pub body: String,
}

/// Managed queue service client
#[async_trait]
pub trait ManagedQueueClient: Send + Sync {
    /// Create the queue if missing and return its URL
    async fn create_queue(
        &self,
        name: &str,
        visibility_timeout: Duration,
    ) -> Result<String, QueueError>;

    /// Receive at most one message, long-polling up to `wait`
    async fn receive(
        &self,
        queue_url: &str,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError>;

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), QueueError>;

    /// Send a message, returning its message id
    async fn send(&self, queue_url: &str, body: &str) -> Result<String, QueueError>;
}

#[derive(Debug, Clone, Copy)]
pub struct ManagedSettings {
    pub max_wait: Duration,
    pub visibility_timeout: Duration,
}

impl Default for ManagedSettings {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(43_200),
        }
    }
}

#[derive(Debug, Clone)]
struct QueueUrls {
    source: String,
    failed: String,
    error: String,
}

pub struct ManagedQueue<C> {
    client: C,
    names: QueueNames,
    urls: QueueUrls,
    settings: ManagedSettings,
    idempotency: Option<IdempotencyStore>,
}

impl<C: ManagedQueueClient> ManagedQueue<C> {
    /// Resolve (creating if needed) the source, failed and error queues
    pub async fn connect(
        client: C,
        base_name: &str,
        settings: ManagedSettings,
    ) -> Result<Self, QueueError> {
        let names = QueueNames::for_managed(base_name);
        let visibility = settings.visibility_timeout;

        let urls = QueueUrls {
            source: client.create_queue(&names.source, visibility).await?,
            failed: client.create_queue(&names.failed, visibility).await?,
            error: client.create_queue(&names.error, visibility).await?,
        };

        info!(source = %urls.source, "Managed queue ready");

        Ok(Self {
            client,
            names,
            urls,
            settings,
            idempotency: None,
        })
    }

    /// Guard deliveries with an idempotency store
    pub fn with_idempotency(mut self, store: IdempotencyStore) -> Self {
        self.idempotency = Some(store);
        self
    }

    pub fn names(&self) -> &QueueNames {
        &self.names
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn source_url(&self) -> &str {
        &self.urls.source
    }

    async fn already_handled(&self, message: &ReceivedMessage) -> Result<bool, QueueError> {
        let Some(store) = &self.idempotency else {
            return Ok(false);
        };

        let record = store.get(message.message_id.as_str()).await?;
        Ok(record.is_some_and(|r| r.is_terminal()))
    }

    /// Record the outcome, then delete the message from the source queue.
    ///
    /// The delete happens even when recording fails; the recording error is
    /// returned afterwards.
    async fn acknowledge(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        let recorded = match &self.idempotency {
            Some(store) => store
                .update(TypedValue::from(message.message_id.as_str()), 1)
                .await
                .map(|_| ()),
            None => Ok(()),
        };

        self.client
            .delete(&self.urls.source, &message.receipt_handle)
            .await?;
        recorded.map_err(QueueError::from)
    }

    async fn dead_letter(&self, url: &str, message: &ReceivedMessage) -> Result<(), QueueError> {
        self.client.send(url, &message.body).await?;
        self.acknowledge(message).await
    }
}

#[async_trait]
impl<C: ManagedQueueClient> Queue for ManagedQueue<C> {
    type Envelope = ReceivedMessage;

    async fn get_next(&self) -> Result<Option<ReceivedMessage>, QueueError> {
        let message = self
            .client
            .receive(
                &self.urls.source,
                self.settings.max_wait,
                self.settings.visibility_timeout,
            )
            .await?;

        let Some(message) = message else {
            return Ok(None);
        };

        // The message is already leased; an unreadable record must not strand it.
        let handled = match self.already_handled(&message).await {
            Ok(handled) => handled,
            Err(e) => {
                warn!(
                    message_id = %message.message_id,
                    error = %e,
                    "Idempotency lookup failed, delivering message"
                );
                false
            }
        };

        if handled {
            debug!(message_id = %message.message_id, "Suppressing redelivered message");
            self.client
                .delete(&self.urls.source, &message.receipt_handle)
                .await?;
            return Ok(None);
        }

        Ok(Some(message))
    }

    async fn successful(&self, job: ReceivedMessage) -> Result<(), QueueError> {
        self.acknowledge(&job).await
    }

    async fn failed(&self, job: ReceivedMessage) -> Result<(), QueueError> {
        self.dead_letter(&self.urls.failed, &job).await
    }

    async fn error(&self, job: Option<ReceivedMessage>, cause: &str) -> Result<(), QueueError> {
        match job {
            Some(job) => self.dead_letter(&self.urls.error, &job).await,
            None => {
                warn!(queue = %self.names.source, cause = %cause, "Fetch error recorded");
                Ok(())
            }
        }
    }

    async fn stopped(&self, job: ReceivedMessage) -> Result<(), QueueError> {
        self.acknowledge(&job).await
    }

    async fn nothing_to_do(&self) {}

    fn decode(&self, job: &ReceivedMessage) -> Result<Value, QueueError> {
        decode_json(&job.body)
    }

    fn describe(&self, job: &ReceivedMessage) -> String {
        json!({ "message_id": job.message_id, "body": job.body }).to_string()
    }

    async fn send(&self, body: &Value) -> Result<String, QueueError> {
        let raw = serde_json::to_string(body)?;
        self.client.send(&self.urls.source, &raw).await
    }
}
