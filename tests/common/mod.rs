//! Scripted storage backend shared by the integration tests.
//!
//! The backend answers `SELECT 1`, echoes INSERTs as a row built from their
//! column list and bind parameters, and fails every statement with a refused
//! connection while it is switched off.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use warden_core::config::{CacheConfig, DatabaseConfig, NamespaceConfig, RetryConfig};
use warden_core::database::{
    DbError, PoolSizes, PoolTarget, QueryResult, SqlBackend, SqlConnector, TransactionConnection,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Executed {
    pub target: Option<PoolTarget>,
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Default)]
struct ScriptState {
    down: AtomicBool,
    executed: Mutex<Vec<Executed>>,
    commits: AtomicUsize,
}

impl ScriptState {
    fn refuse_if_down(&self) -> Result<(), DbError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(DbError::io(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ));
        }
        Ok(())
    }

    fn answer(&self, target: Option<PoolTarget>, sql: &str, params: &[Value]) -> Result<QueryResult, DbError> {
        self.refuse_if_down()?;
        self.executed.lock().push(Executed {
            target,
            sql: sql.to_string(),
            params: params.to_vec(),
        });

        if sql == "SELECT 1" {
            let mut row = Map::new();
            row.insert("?column?".to_string(), Value::from(1));
            return Ok(QueryResult::from_rows(vec![row]));
        }
        if sql.starts_with("INSERT INTO") {
            return Ok(QueryResult::from_rows(vec![echo_row(sql, params)]));
        }
        Ok(QueryResult::affected(0))
    }
}

#[derive(Debug, Default)]
pub struct ScriptedBackend {
    state: Arc<ScriptState>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_down(&self, down: bool) {
        self.state.down.store(down, Ordering::SeqCst);
    }

    pub fn executed(&self) -> Vec<Executed> {
        self.state.executed.lock().clone()
    }

    /// Statements other than health checks
    pub fn writes(&self) -> Vec<Executed> {
        self.executed()
            .into_iter()
            .filter(|e| e.sql != "SELECT 1")
            .collect()
    }

    pub fn commits(&self) -> usize {
        self.state.commits.load(Ordering::SeqCst)
    }
}

/// Maps `INSERT INTO t (a, b) VALUES ($1, $2)` onto its parameters
fn echo_row(sql: &str, params: &[Value]) -> Map<String, Value> {
    let columns = sql
        .find('(')
        .zip(sql.find(')'))
        .map(|(open, close)| &sql[open + 1..close])
        .unwrap_or_default();
    columns
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .zip(params.iter().cloned())
        .map(|(c, v)| (c.to_string(), v))
        .collect()
}

#[async_trait]
impl SqlBackend for ScriptedBackend {
    async fn execute(&self, target: PoolTarget, sql: &str, params: &[Value]) -> Result<QueryResult, DbError> {
        self.state.answer(Some(target), sql, params)
    }

    async fn begin(&self) -> Result<Box<dyn TransactionConnection>, DbError> {
        self.state.refuse_if_down()?;
        Ok(Box::new(ScriptedTransaction {
            state: Arc::clone(&self.state),
        }))
    }

    fn has_replica(&self) -> bool {
        false
    }

    fn pool_sizes(&self) -> PoolSizes {
        PoolSizes::default()
    }

    async fn close(&self) {}
}

struct ScriptedTransaction {
    state: Arc<ScriptState>,
}

#[async_trait]
impl TransactionConnection for ScriptedTransaction {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult, DbError> {
        self.state.answer(None, sql, params)
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct ScriptedConnector(pub Arc<ScriptedBackend>);

#[async_trait]
impl SqlConnector for ScriptedConnector {
    async fn connect(&self, _config: &DatabaseConfig) -> Result<Arc<dyn SqlBackend>, DbError> {
        Ok(Arc::clone(&self.0) as Arc<dyn SqlBackend>)
    }
}

/// Fast retries and a failure threshold of one, so a single exhausted budget
/// marks the database unavailable
pub fn database_config() -> DatabaseConfig {
    DatabaseConfig {
        retry: RetryConfig {
            max_retries: 1,
            base_delay_ms: 1,
            max_delay_ms: 2,
        },
        failure_threshold: 1,
        ..DatabaseConfig::default()
    }
}

pub fn cache_config() -> CacheConfig {
    CacheConfig {
        failure_threshold: 1,
        namespaces: vec![
            NamespaceConfig::new("guild_settings", Duration::from_secs(60), 3),
            NamespaceConfig::new("cooldowns", Duration::from_secs(60), 100),
            NamespaceConfig::new("rate_limits", Duration::from_secs(60), 100),
        ],
        ..CacheConfig::default()
    }
}
