//! Redis list client

use async_trait::async_trait;
use ::redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{debug, info};

use crate::list::ListClient;
use crate::queue::QueueError;

/// [`ListClient`] over a Redis connection manager.
///
/// Cloning is cheap; clones share the underlying connection.
#[derive(Clone)]
pub struct RedisListClient {
    conn: ConnectionManager,
}

impl RedisListClient {
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let client = ::redis::Client::open(url).map_err(|e| {
            QueueError::Backend(format!("invalid redis url {}: {e}", redacted(url)))
        })?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::Backend(format!("redis connection failed: {e}")))?;

        info!(url = %redacted(url), "Connected to Redis");
        Ok(Self { conn })
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

fn backend_err(e: ::redis::RedisError) -> QueueError {
    QueueError::Backend(format!("Redis error: {e}"))
}

#[async_trait]
impl ListClient for RedisListClient {
    async fn move_blocking(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();

        // BRPOPLPUSH with a zero timeout blocks forever, so a zero wait polls instead.
        let item: Option<String> = if timeout.is_zero() {
            ::redis::cmd("RPOPLPUSH")
                .arg(source)
                .arg(destination)
                .query_async(&mut conn)
                .await
                .map_err(backend_err)?
        } else {
            ::redis::cmd("BRPOPLPUSH")
                .arg(source)
                .arg(destination)
                .arg(timeout.as_secs().max(1))
                .query_async(&mut conn)
                .await
                .map_err(backend_err)?
        };

        if item.is_some() {
            debug!(source = %source, destination = %destination, "BRPOPLPUSH");
        }
        Ok(item)
    }

    async fn push(&self, list: &str, value: &str) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        ::redis::cmd("LPUSH")
            .arg(list)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn remove(&self, list: &str, count: usize, value: &str) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        ::redis::cmd("LREM")
            .arg(list)
            .arg(count)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }
}

/// Redact credentials in logs
fn redacted(url: &str) -> String {
    if let Some(idx) = url.find('@') {
        let head = &url[..idx];
        if let Some(scheme_end) = head.find("://") {
            let scheme_end = scheme_end + 3;
            return format!("{}***:***{}", &url[..scheme_end], &url[idx..]);
        }
    }
    url.to_string()
}
