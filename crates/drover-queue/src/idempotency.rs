//! Idempotency store for at-least-once backends
//!
//! A record's absence means the message was never handled; a terminal
//! record means it already reached an outcome and a redelivery must be
//! suppressed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    #[error("Key-value client error: {0}")]
    Client(String),
    #[error("Invalid number '{0}' in numeric attribute")]
    InvalidNumber(String),
    #[error("Unknown attribute type tag: {0}")]
    UnknownTag(String),
}

/// Attribute value with an explicit type tag (`N` numeric, `S` string)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypedValue {
    Number(i64),
    Text(String),
}

impl TypedValue {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Number(_) => "N",
            Self::Text(_) => "S",
        }
    }

    /// Rebuild a value from its stored tag and raw string form
    pub fn from_tagged(tag: &str, raw: &str) -> Result<Self, IdempotencyError> {
        match tag {
            "N" => raw
                .parse()
                .map(Self::Number)
                .map_err(|_| IdempotencyError::InvalidNumber(raw.to_string())),
            "S" => Ok(Self::Text(raw.to_string())),
            other => Err(IdempotencyError::UnknownTag(other.to_string())),
        }
    }

    /// Numeric reading of the value; text that parses as an integer counts
    pub fn as_number(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for TypedValue {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for TypedValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for TypedValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Primary key of an item: attribute name plus typed value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub attribute: String,
    pub value: TypedValue,
}

/// Stored item: key plus `status` attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub key: ItemKey,
    pub status: TypedValue,
}

/// Opaque key-value service holding idempotency tables
#[async_trait]
pub trait KeyValueClient: Send + Sync + fmt::Debug {
    async fn put_item(&self, table: &str, item: Item) -> Result<(), IdempotencyError>;

    async fn get_item(&self, table: &str, key: &ItemKey) -> Result<Option<Item>, IdempotencyError>;

    async fn delete_item(&self, table: &str, key: &ItemKey) -> Result<(), IdempotencyError>;
}

/// Record read back from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub key: TypedValue,
    pub status: TypedValue,
}

impl IdempotencyRecord {
    /// Whether the message already reached an outcome
    pub fn is_terminal(&self) -> bool {
        match &self.status {
            TypedValue::Number(n) => *n > 0,
            TypedValue::Text(s) => match s.trim().parse::<i64>() {
                Ok(n) => n > 0,
                Err(_) => !s.is_empty(),
            },
        }
    }
}

/// Typed view over one idempotency table
#[derive(Debug, Clone)]
pub struct IdempotencyStore {
    client: Arc<dyn KeyValueClient>,
    table: String,
    attribute: String,
}

impl IdempotencyStore {
    pub fn new(
        client: Arc<dyn KeyValueClient>,
        table: impl Into<String>,
        attribute: impl Into<String>,
    ) -> Self {
        Self {
            client,
            table: table.into(),
            attribute: attribute.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn item_key(&self, key: TypedValue) -> ItemKey {
        ItemKey {
            attribute: self.attribute.clone(),
            value: key,
        }
    }

    /// Look up the record for `key`
    pub async fn get(
        &self,
        key: impl Into<TypedValue>,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        let item_key = self.item_key(key.into());
        let item = self.client.get_item(&self.table, &item_key).await?;

        Ok(item.map(|item| IdempotencyRecord {
            key: item.key.value,
            status: item.status,
        }))
    }

    /// Overwrite the record for `key`
    pub async fn put(
        &self,
        key: impl Into<TypedValue>,
        status: impl Into<TypedValue>,
    ) -> Result<(), IdempotencyError> {
        let item = Item {
            key: self.item_key(key.into()),
            status: status.into(),
        };
        self.client.put_item(&self.table, item).await
    }

    /// Create the record with `delta`, or add `delta` to its current value.
    ///
    /// Text values that do not read as integers are replaced by `delta`.
    pub async fn update(
        &self,
        key: impl Into<TypedValue>,
        delta: i64,
    ) -> Result<TypedValue, IdempotencyError> {
        let key = key.into();
        let current = self.get(key.clone()).await?;

        let next = match current.as_ref().and_then(|r| r.status.as_number()) {
            Some(n) => n.saturating_add(delta),
            None => delta,
        };

        debug!(table = %self.table, key = %key, status = next, "Updating idempotency record");

        self.put(key, next).await?;
        Ok(TypedValue::Number(next))
    }

    /// Remove the record for `key`
    pub async fn delete(&self, key: impl Into<TypedValue>) -> Result<(), IdempotencyError> {
        let item_key = self.item_key(key.into());
        self.client.delete_item(&self.table, &item_key).await
    }
}
