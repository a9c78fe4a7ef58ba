//! Value types exchanged with the relational store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A decoded result row, column name to JSON value
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub rows_affected: u64,
}

impl QueryResult {
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let rows_affected = rows.len() as u64;
        Self {
            rows,
            rows_affected,
        }
    }

    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows: Vec::new(),
            rows_affected,
        }
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }
}

/// Per-call overrides for [`crate::database::ConnectionManager::query`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Overrides `database.retry.max_retries` for this call
    pub retries: Option<u32>,
    /// Single attempt, no retries
    pub no_retry: bool,
    /// Skip replica routing even for read-only statements
    pub force_primary: bool,
}

impl QueryOptions {
    pub fn no_retry() -> Self {
        Self {
            no_retry: true,
            ..Self::default()
        }
    }

    pub fn with_retries(retries: u32) -> Self {
        Self {
            retries: Some(retries),
            ..Self::default()
        }
    }

    pub fn primary() -> Self {
        Self {
            force_primary: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolTarget {
    Primary,
    Replica,
}

impl PoolTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolTarget::Primary => "primary",
            PoolTarget::Replica => "replica",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOperation {
    Insert,
    Update,
    Delete,
    Upsert,
}

impl WriteOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOperation::Insert => crate::constants::operations::INSERT,
            WriteOperation::Update => crate::constants::operations::UPDATE,
            WriteOperation::Delete => crate::constants::operations::DELETE,
            WriteOperation::Upsert => crate::constants::operations::UPSERT,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "insert" => Some(WriteOperation::Insert),
            "update" => Some(WriteOperation::Update),
            "delete" => Some(WriteOperation::Delete),
            "upsert" => Some(WriteOperation::Upsert),
            _ => None,
        }
    }
}

/// Result of a `safe_*` write: either applied now or deferred to the write queue
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Applied(Vec<Row>),
    Queued {
        operation: WriteOperation,
        table: String,
        write_id: Uuid,
    },
}

impl WriteOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, WriteOutcome::Queued { .. })
    }

    pub fn rows(&self) -> &[Row] {
        match self {
            WriteOutcome::Applied(rows) => rows,
            WriteOutcome::Queued { .. } => &[],
        }
    }
}

/// Ordered column/value pairs for the statement builders
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fields(Vec<(String, Value)>);

impl Fields {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Builder-style insert; a repeated column replaces the earlier value in place
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        let value = value.into();
        match self.0.iter_mut().find(|(c, _)| *c == column) {
            Some(slot) => slot.1 = value,
            None => self.0.push((column, value)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(c, v)| (c.as_str(), v))
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(c, _)| c.as_str())
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(c, v)| (c.clone(), v.clone()))
                .collect(),
        )
    }

    /// Rebuild from a JSON object (queued write payloads). Non-objects yield `None`.
    pub fn from_json(value: &Value) -> Option<Self> {
        value.as_object().map(|map| {
            Self(
                map.iter()
                    .map(|(c, v)| (c.clone(), v.clone()))
                    .collect(),
            )
        })
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Fields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fields = Fields::new();
        for (k, v) in iter {
            fields.set(k, v);
        }
        fields
    }
}

/// Pool sizes reported by a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSizes {
    pub primary_size: u32,
    pub primary_idle: u32,
    pub replica_size: Option<u32>,
    pub replica_idle: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub enabled: bool,
}

/// Point-in-time view of the connection manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionPoolStatus {
    pub is_connected: bool,
    pub failure_count: u32,
    pub retry_config: crate::config::RetryConfig,
    pub read_replica: ReplicaStatus,
    pub pools: PoolSizes,
}
