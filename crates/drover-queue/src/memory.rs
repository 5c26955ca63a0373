//! In-memory backend clients
//!
//! Each client is cheap to clone and clones share state, so a test can keep
//! a handle while an adapter owns another one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::idempotency::{IdempotencyError, Item, ItemKey, KeyValueClient};
use crate::list::ListClient;
use crate::managed::{ManagedQueueClient, ReceivedMessage};
use crate::queue::QueueError;
use crate::reservation::{ReservationClient, ReservedJob};

/// Longest a waiter sleeps before re-checking on its own. Bounds the delay
/// for state that changes without a notification, such as a lapsing
/// visibility window.
const POLL_SLICE: Duration = Duration::from_millis(25);

/// Retry `attempt` until it yields a value or `timeout` elapses.
///
/// Waiters wake on every `notify_waiters` and at least once per
/// [`POLL_SLICE`]. The last attempt runs at or after the deadline, so a value
/// that appears while waiting is never missed.
async fn wait_for<T, F, Fut>(notify: &Notify, timeout: Duration, mut attempt: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        // Register before attempting so a notification sent in between is kept.
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(value) = attempt().await {
            return Some(value);
        }

        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        let _ = tokio::time::timeout_at((now + POLL_SLICE).min(deadline), notified).await;
    }
}

// ---------------------------------------------------------------------------
// Lists
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MemoryListClient {
    lists: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
    pushed: Arc<Notify>,
    pings: Arc<AtomicU64>,
}

impl MemoryListClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a list, head first
    pub async fn items(&self, list: &str) -> Vec<String> {
        let lists = self.lists.lock().await;
        lists
            .get(list)
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn ping_count(&self) -> u64 {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ListClient for MemoryListClient {
    async fn move_blocking(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<String>, QueueError> {
        let moved = wait_for(&self.pushed, timeout, move || async move {
            let mut lists = self.lists.lock().await;
            let item = lists.get_mut(source).and_then(VecDeque::pop_back);
            if let Some(item) = &item {
                lists
                    .entry(destination.to_string())
                    .or_default()
                    .push_front(item.clone());
            }
            item
        })
        .await;

        Ok(moved)
    }

    async fn push(&self, list: &str, value: &str) -> Result<u64, QueueError> {
        let mut lists = self.lists.lock().await;
        let items = lists.entry(list.to_string()).or_default();
        items.push_front(value.to_string());
        let len = items.len() as u64;
        drop(lists);

        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn remove(&self, list: &str, count: usize, value: &str) -> Result<u64, QueueError> {
        let mut lists = self.lists.lock().await;
        let Some(items) = lists.get_mut(list) else {
            return Ok(0);
        };

        let mut removed = 0;
        while removed < count {
            match items.iter().position(|item| item == value) {
                Some(index) => {
                    items.remove(index);
                    removed += 1;
                }
                None => break,
            }
        }

        Ok(removed as u64)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tubes
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TubeState {
    ready: HashMap<String, VecDeque<ReservedJob>>,
    watched: Vec<String>,
    reserved: HashMap<u64, String>,
    next_id: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryReservationClient {
    state: Arc<Mutex<TubeState>>,
    ready: Arc<Notify>,
}

impl MemoryReservationClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Data of the ready jobs in `tube`, oldest first
    pub async fn ready(&self, tube: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .ready
            .get(tube)
            .map(|jobs| jobs.iter().map(|job| job.data.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of jobs currently reserved and not yet deleted
    pub async fn reserved_count(&self) -> usize {
        self.state.lock().await.reserved.len()
    }
}

#[async_trait]
impl ReservationClient for MemoryReservationClient {
    async fn watch(&self, tube: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if !state.watched.iter().any(|t| t == tube) {
            state.watched.push(tube.to_string());
        }
        Ok(())
    }

    async fn reserve(&self, timeout: Duration) -> Result<Option<ReservedJob>, QueueError> {
        let job = wait_for(&self.ready, timeout, move || async move {
            let mut state = self.state.lock().await;
            let TubeState {
                ready,
                watched,
                reserved,
                ..
            } = &mut *state;

            for tube in watched.iter() {
                if let Some(job) = ready.get_mut(tube).and_then(VecDeque::pop_front) {
                    reserved.insert(job.id, tube.clone());
                    return Some(job);
                }
            }
            None
        })
        .await;

        Ok(job)
    }

    async fn delete(&self, job: &ReservedJob) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state
            .reserved
            .remove(&job.id)
            .map(|_| ())
            .ok_or_else(|| QueueError::Backend(format!("job {} is not reserved", job.id)))
    }

    async fn put_in_tube(&self, tube: &str, data: &str) -> Result<u64, QueueError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        state
            .ready
            .entry(tube.to_string())
            .or_default()
            .push_back(ReservedJob {
                id,
                data: data.to_string(),
            });
        drop(state);

        self.ready.notify_waiters();
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// Managed queues
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: String,
    receipt_handle: Option<String>,
    invisible_until: Option<DateTime<Utc>>,
}

impl StoredMessage {
    fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.invisible_until.map_or(true, |until| until <= now)
    }
}

/// Managed queue with a real visibility window: a received message that is
/// not deleted before the window closes is delivered again, with the same
/// message id and a fresh receipt handle.
#[derive(Debug, Clone, Default)]
pub struct MemoryManagedClient {
    queues: Arc<Mutex<HashMap<String, Vec<StoredMessage>>>>,
    sent: Arc<Notify>,
}

impl MemoryManagedClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn url_for(name: &str) -> String {
        format!("memory://{name}")
    }

    /// Bodies held by the named queue, visible or not
    pub async fn bodies(&self, name: &str) -> Vec<String> {
        let queues = self.queues.lock().await;
        queues
            .get(&Self::url_for(name))
            .map(|messages| messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ManagedQueueClient for MemoryManagedClient {
    async fn create_queue(
        &self,
        name: &str,
        _visibility_timeout: Duration,
    ) -> Result<String, QueueError> {
        let url = Self::url_for(name);
        self.queues.lock().await.entry(url.clone()).or_default();
        Ok(url)
    }

    async fn receive(
        &self,
        queue_url: &str,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError> {
        {
            let queues = self.queues.lock().await;
            if !queues.contains_key(queue_url) {
                return Err(QueueError::Backend(format!("no such queue: {queue_url}")));
            }
        }

        let window = chrono::Duration::from_std(visibility_timeout)
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        let received = wait_for(&self.sent, wait, move || async move {
            let mut queues = self.queues.lock().await;
            let now = Utc::now();
            let message = queues
                .get_mut(queue_url)
                .and_then(|messages| messages.iter_mut().find(|m| m.is_visible(now)));

            message.map(|message| {
                let receipt = Uuid::new_v4().to_string();
                message.receipt_handle = Some(receipt.clone());
                message.invisible_until = Some(now + window);

                ReceivedMessage {
                    message_id: message.message_id.clone(),
                    receipt_handle: receipt,
                    body: message.body.clone(),
                }
            })
        })
        .await;

        Ok(received)
    }

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        let messages = queues
            .get_mut(queue_url)
            .ok_or_else(|| QueueError::Backend(format!("no such queue: {queue_url}")))?;

        // Stale receipt handles are accepted and ignored, as the managed services do.
        messages.retain(|m| m.receipt_handle.as_deref() != Some(receipt_handle));
        Ok(())
    }

    async fn send(&self, queue_url: &str, body: &str) -> Result<String, QueueError> {
        let mut queues = self.queues.lock().await;
        let messages = queues
            .get_mut(queue_url)
            .ok_or_else(|| QueueError::Backend(format!("no such queue: {queue_url}")))?;

        let message_id = Uuid::new_v4().to_string();
        messages.push(StoredMessage {
            message_id: message_id.clone(),
            body: body.to_string(),
            receipt_handle: None,
            invisible_until: None,
        });
        drop(queues);

        self.sent.notify_waiters();
        Ok(message_id)
    }
}

// ---------------------------------------------------------------------------
// Key-value tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MemoryKeyValue {
    tables: Arc<RwLock<HashMap<String, HashMap<ItemKey, Item>>>>,
}

impl MemoryKeyValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, table: &str) -> usize {
        self.tables.read().await.get(table).map_or(0, HashMap::len)
    }

    pub async fn is_empty(&self, table: &str) -> bool {
        self.len(table).await == 0
    }
}

#[async_trait]
impl KeyValueClient for MemoryKeyValue {
    async fn put_item(&self, table: &str, item: Item) -> Result<(), IdempotencyError> {
        let mut tables = self.tables.write().await;
        tables
            .entry(table.to_string())
            .or_default()
            .insert(item.key.clone(), item);
        Ok(())
    }

    async fn get_item(&self, table: &str, key: &ItemKey) -> Result<Option<Item>, IdempotencyError> {
        let tables = self.tables.read().await;
        Ok(tables.get(table).and_then(|items| items.get(key)).cloned())
    }

    async fn delete_item(&self, table: &str, key: &ItemKey) -> Result<(), IdempotencyError> {
        let mut tables = self.tables.write().await;
        if let Some(items) = tables.get_mut(table) {
            items.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_move_is_fifo() {
        let client = MemoryListClient::new();
        client.push("src", "a").await.unwrap();
        client.push("src", "b").await.unwrap();

        let first = client
            .move_blocking("src", "work", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(first.as_deref(), Some("a"));
        assert_eq!(client.items("work").await, vec!["a"]);
        assert_eq!(client.items("src").await, vec!["b"]);
    }

    #[tokio::test]
    async fn test_list_move_waits_for_push() {
        let client = MemoryListClient::new();
        let producer = client.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push("src", "late").await.unwrap();
        });

        let moved = client
            .move_blocking("src", "work", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(moved.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_list_remove_counts() {
        let client = MemoryListClient::new();
        for value in ["x", "y", "x", "x"] {
            client.push("l", value).await.unwrap();
        }

        assert_eq!(client.remove("l", 2, "x").await.unwrap(), 2);
        assert_eq!(client.items("l").await, vec!["y", "x"]);
        assert_eq!(client.remove("missing", 1, "x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reservation_hides_reserved_jobs() {
        let client = MemoryReservationClient::new();
        client.put_in_tube("jobs", "one").await.unwrap();
        client.watch("jobs").await.unwrap();

        let job = client.reserve(Duration::ZERO).await.unwrap().expect("job");
        assert_eq!(job.data, "one");
        assert!(client.reserve(Duration::ZERO).await.unwrap().is_none());
        assert_eq!(client.reserved_count().await, 1);

        client.delete(&job).await.unwrap();
        assert_eq!(client.reserved_count().await, 0);
        assert!(client.delete(&job).await.is_err());
    }

    #[tokio::test]
    async fn test_reservation_ignores_unwatched_tubes() {
        let client = MemoryReservationClient::new();
        client.put_in_tube("other", "x").await.unwrap();
        client.watch("jobs").await.unwrap();

        assert!(client.reserve(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_managed_visibility_window() {
        let client = MemoryManagedClient::new();
        let url = client.create_queue("q", Duration::ZERO).await.unwrap();
        let id = client.send(&url, "hello").await.unwrap();

        let hidden = client
            .receive(&url, Duration::ZERO, Duration::from_secs(60))
            .await
            .unwrap()
            .expect("first delivery");
        assert_eq!(hidden.message_id, id);
        assert!(client
            .receive(&url, Duration::ZERO, Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());

        let other = client.create_queue("r", Duration::ZERO).await.unwrap();
        client.send(&other, "again").await.unwrap();
        let first = client
            .receive(&other, Duration::ZERO, Duration::ZERO)
            .await
            .unwrap()
            .expect("delivery");
        let second = client
            .receive(&other, Duration::ZERO, Duration::ZERO)
            .await
            .unwrap()
            .expect("redelivery");
        assert_eq!(first.message_id, second.message_id);
        assert_ne!(first.receipt_handle, second.receipt_handle);

        // The first receipt is stale now.
        client.delete(&other, &first.receipt_handle).await.unwrap();
        assert_eq!(client.bodies("r").await, vec!["again"]);
        client.delete(&other, &second.receipt_handle).await.unwrap();
        assert!(client.bodies("r").await.is_empty());
    }

    #[tokio::test]
    async fn test_managed_unknown_queue() {
        let client = MemoryManagedClient::new();
        assert!(client.send("memory://nope", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_long_poll_sees_lapsed_visibility() {
        let client = MemoryManagedClient::new();
        let url = client.create_queue("q", Duration::ZERO).await.unwrap();
        let id = client.send(&url, "hello").await.unwrap();

        client
            .receive(&url, Duration::ZERO, Duration::from_millis(100))
            .await
            .unwrap()
            .expect("first delivery");

        let again = client
            .receive(&url, Duration::from_secs(2), Duration::from_secs(60))
            .await
            .unwrap()
            .expect("redelivery once the window lapses");
        assert_eq!(again.message_id, id);
    }

    #[tokio::test]
    async fn test_push_wakes_waiter_on_that_list() {
        let client = MemoryListClient::new();

        let on_b = client.clone();
        let waiter_b = tokio::spawn(async move {
            on_b.move_blocking("b", "b-work", Duration::from_millis(300)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let on_a = client.clone();
        let waiter_a = tokio::spawn(async move {
            on_a.move_blocking("a", "a-work", Duration::from_secs(2)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        client.push("a", "job").await.unwrap();

        assert_eq!(waiter_a.await.unwrap().unwrap().as_deref(), Some("job"));
        assert!(waiter_b.await.unwrap().unwrap().is_none());
        assert!(client.items("a").await.is_empty());
    }

    #[tokio::test]
    async fn test_put_wakes_every_reserving_waiter() {
        let client = MemoryReservationClient::new();
        client.watch("jobs").await.unwrap();

        let mut waiters = Vec::new();
        for _ in 0..2 {
            let c = client.clone();
            waiters.push(tokio::spawn(async move {
                c.reserve(Duration::from_secs(2)).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        client.put_in_tube("jobs", "one").await.unwrap();
        client.put_in_tube("jobs", "two").await.unwrap();

        let mut got = Vec::new();
        for waiter in waiters {
            got.push(waiter.await.unwrap().unwrap().expect("job").data);
        }
        got.sort();
        assert_eq!(got, vec!["one", "two"]);
    }
}
