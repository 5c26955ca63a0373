//! SQLite key-value backend
//!
//! Each idempotency table maps to one SQLite table, created on first use.
//! Keys and statuses are stored with their `N`/`S` type tag so numeric
//! counters read back as numbers.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashSet;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, info};

use drover_queue::idempotency::{IdempotencyError, Item, ItemKey, KeyValueClient, TypedValue};

/// SQLite configuration options
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database URL (e.g., "sqlite:drover.db?mode=rwc" or "sqlite::memory:")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable WAL journal mode for better concurrency
    pub wal_mode: bool,
    /// Busy timeout in seconds
    pub busy_timeout_secs: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:drover.db?mode=rwc".to_string(),
            max_connections: 5,
            wal_mode: true,
            busy_timeout_secs: 30,
        }
    }
}

impl SqliteConfig {
    /// Create config for in-memory database (testing)
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
            busy_timeout_secs: 5,
        }
    }
}

/// [`KeyValueClient`] over a SQLite pool
#[derive(Debug)]
pub struct SqliteKeyValue {
    pool: SqlitePool,
    ready_tables: Mutex<HashSet<String>>,
}

fn client_err(e: sqlx::Error) -> IdempotencyError {
    IdempotencyError::Client(e.to_string())
}

/// Table names are interpolated into SQL, so only a safe alphabet is accepted
fn validate_table(table: &str) -> Result<(), IdempotencyError> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if valid {
        Ok(())
    } else {
        Err(IdempotencyError::Client(format!("invalid table name: {table:?}")))
    }
}

impl SqliteKeyValue {
    /// Open a database with default settings
    pub async fn new(url: &str) -> Result<Self, IdempotencyError> {
        let config = SqliteConfig {
            url: url.to_string(),
            ..Default::default()
        };
        Self::new_with_config(config).await
    }

    pub async fn new_with_config(config: SqliteConfig) -> Result<Self, IdempotencyError> {
        let mut options = SqliteConnectOptions::from_str(&config.url).map_err(client_err)?;
        options = options.pragma("busy_timeout", (config.busy_timeout_secs * 1000).to_string());
        if config.wal_mode {
            options = options.pragma("journal_mode", "WAL");
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            // An in-memory database lives only as long as its connection.
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(client_err)?;

        info!(url = %config.url, wal = config.wal_mode, "Connected to SQLite");

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            ready_tables: Mutex::new(HashSet::new()),
        }
    }

    async fn ensure_table(&self, table: &str) -> Result<(), IdempotencyError> {
        validate_table(table)?;

        let mut ready = self.ready_tables.lock().await;
        if ready.contains(table) {
            return Ok(());
        }

        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{table}" (
                attribute TEXT NOT NULL,
                item_key TEXT NOT NULL,
                key_type TEXT NOT NULL,
                status TEXT NOT NULL,
                status_type TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (attribute, item_key, key_type)
            )
            "#
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(client_err)?;

        debug!(table = %table, "Idempotency table ready");
        ready.insert(table.to_string());
        Ok(())
    }
}

#[async_trait]
impl KeyValueClient for SqliteKeyValue {
    async fn put_item(&self, table: &str, item: Item) -> Result<(), IdempotencyError> {
        self.ensure_table(table).await?;

        let sql = format!(
            r#"
            INSERT INTO "{table}" (attribute, item_key, key_type, status, status_type)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (attribute, item_key, key_type) DO UPDATE
            SET status = excluded.status,
                status_type = excluded.status_type,
                updated_at = CURRENT_TIMESTAMP
            "#
        );
        sqlx::query(&sql)
            .bind(&item.key.attribute)
            .bind(item.key.value.to_string())
            .bind(item.key.value.type_tag())
            .bind(item.status.to_string())
            .bind(item.status.type_tag())
            .execute(&self.pool)
            .await
            .map_err(client_err)?;

        Ok(())
    }

    async fn get_item(&self, table: &str, key: &ItemKey) -> Result<Option<Item>, IdempotencyError> {
        self.ensure_table(table).await?;

        let sql = format!(
            r#"SELECT status, status_type FROM "{table}"
               WHERE attribute = ? AND item_key = ? AND key_type = ?"#
        );
        let row = sqlx::query(&sql)
            .bind(&key.attribute)
            .bind(key.value.to_string())
            .bind(key.value.type_tag())
            .fetch_optional(&self.pool)
            .await
            .map_err(client_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.try_get("status").map_err(client_err)?;
        let status_type: String = row.try_get("status_type").map_err(client_err)?;

        Ok(Some(Item {
            key: key.clone(),
            status: TypedValue::from_tagged(&status_type, &status)?,
        }))
    }

    async fn delete_item(&self, table: &str, key: &ItemKey) -> Result<(), IdempotencyError> {
        self.ensure_table(table).await?;

        let sql = format!(
            r#"DELETE FROM "{table}" WHERE attribute = ? AND item_key = ? AND key_type = ?"#
        );
        sqlx::query(&sql)
            .bind(&key.attribute)
            .bind(key.value.to_string())
            .bind(key.value.type_tag())
            .execute(&self.pool)
            .await
            .map_err(client_err)?;

        Ok(())
    }
}
