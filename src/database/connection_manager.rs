//! # Connection Manager
//!
//! Pooled PostgreSQL access with bounded retry, read-replica routing,
//! allow-listed statement building, transactions and atomic sequences.
//!
//! Failures are classified by [`classify`]: transient ones are retried with
//! jittered exponential backoff, fatal ones surface on the first attempt. Each
//! exhausted retry budget counts against `failure_threshold`; reaching it marks
//! `"database"` unavailable with the [`DegradationCoordinator`], and the next
//! success marks it healthy again, which replays queued writes.

use crate::config::DatabaseConfig;
use crate::constants::services;
use crate::database::backend::{DbError, PgConnector, SqlBackend, SqlConnector, TransactionConnection};
use crate::database::error_codes::{classify, ErrorClass, PgErrorCode};
use crate::database::retry::RetryPolicy;
use crate::database::sequence::{SequenceRequest, ADVISORY_LOCK_SQL};
use crate::database::statement::{is_read_only, Statement, TableAllowList};
use crate::database::types::{
    ConnectionPoolStatus, Fields, PoolTarget, QueryOptions, QueryResult, ReplicaStatus, Row,
    WriteOperation, WriteOutcome,
};
use crate::degradation::{DegradationCoordinator, QueuedWrite};
use crate::error::{WardenError, WardenResult};
use crate::metrics::{names, MetricsRecorder, TracingMetricsRecorder};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

const COMPONENT: &str = "Database connection manager";

/// Map a backend failure onto the crate error after `attempts` tries
pub(crate) fn storage_error(error: &DbError, attempts: u32) -> WardenError {
    let code = error.code().map(str::to_string);
    match classify(error) {
        ErrorClass::Transient => WardenError::TransientStorage {
            code,
            message: error.message.clone(),
            attempts,
        },
        ErrorClass::Fatal => WardenError::FatalQuery {
            code,
            message: error.message.clone(),
        },
    }
}

/// Statements run on the dedicated connection of [`ConnectionManager::transaction`]
pub struct TransactionScope {
    connection: Box<dyn TransactionConnection>,
    allow_list: Arc<TableAllowList>,
}

impl TransactionScope {
    /// No retry inside a transaction; failures abort it
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> WardenResult<QueryResult> {
        self.connection
            .execute(sql, params)
            .await
            .map_err(|e| storage_error(&e, 1))
    }

    pub async fn insert(&mut self, table: &str, data: &Fields) -> WardenResult<Row> {
        let statement = self.allow_list.build_insert(table, data)?;
        first_row(self.run(&statement).await?, table)
    }

    pub async fn update(&mut self, table: &str, data: &Fields, conditions: &Fields) -> WardenResult<Vec<Row>> {
        let statement = self.allow_list.build_update(table, data, conditions)?;
        Ok(self.run(&statement).await?.rows)
    }

    pub async fn delete(&mut self, table: &str, conditions: &Fields) -> WardenResult<Vec<Row>> {
        let statement = self.allow_list.build_delete(table, conditions)?;
        Ok(self.run(&statement).await?.rows)
    }

    async fn run(&mut self, statement: &Statement) -> WardenResult<QueryResult> {
        self.execute(&statement.sql, &statement.params).await
    }
}

fn first_row(result: QueryResult, table: &str) -> WardenResult<Row> {
    result
        .rows
        .into_iter()
        .next()
        .ok_or_else(|| WardenError::Internal(format!("insert into '{table}' returned no row")))
}

pub struct ConnectionManager {
    config: DatabaseConfig,
    retry: RetryPolicy,
    allow_list: Arc<TableAllowList>,
    connector: Arc<dyn SqlConnector>,
    backend: OnceCell<Arc<dyn SqlBackend>>,
    coordinator: Arc<DegradationCoordinator>,
    consecutive_failures: AtomicU32,
    handlers_registered: AtomicBool,
    closed: AtomicBool,
    metrics: Arc<dyn MetricsRecorder>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("initialized", &self.backend.initialized())
            .field("consecutive_failures", &self.consecutive_failures.load(Ordering::Relaxed))
            .field("retry", &self.retry)
            .finish()
    }
}

impl ConnectionManager {
    /// Uses sqlx Postgres pools
    pub fn new(config: DatabaseConfig, coordinator: Arc<DegradationCoordinator>) -> WardenResult<Self> {
        Self::with_connector(config, coordinator, Arc::new(PgConnector))
    }

    pub fn with_connector(
        config: DatabaseConfig,
        coordinator: Arc<DegradationCoordinator>,
        connector: Arc<dyn SqlConnector>,
    ) -> WardenResult<Self> {
        config.validate()?;
        let allow_list = TableAllowList::new(config.allowed_tables.iter().cloned())?;
        Ok(Self {
            retry: RetryPolicy::from(&config.retry),
            allow_list: Arc::new(allow_list),
            connector,
            backend: OnceCell::new(),
            coordinator,
            consecutive_failures: AtomicU32::new(0),
            handlers_registered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            metrics: Arc::new(TracingMetricsRecorder),
            config,
        })
    }

    pub fn with_metrics_recorder(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn coordinator(&self) -> &Arc<DegradationCoordinator> {
        &self.coordinator
    }

    pub fn is_initialized(&self) -> bool {
        self.backend.initialized()
    }

    /// Open the pools, verify with `SELECT 1`, register the database's fallback,
    /// replay handler and probe, and mark it healthy. Repeated and concurrent
    /// calls share one pool.
    pub async fn initialize(self: &Arc<Self>) -> WardenResult<()> {
        self.backend
            .get_or_try_init(|| async {
                let backend = self.connector.connect(&self.config).await.map_err(|e| {
                    error!(error = %e, "Failed to establish database connection");
                    storage_error(&e, 1)
                })?;
                backend
                    .execute(PoolTarget::Primary, "SELECT 1", &[])
                    .await
                    .map_err(|e| storage_error(&e, 1))?;
                crate::log_database!(
                    info,
                    "INITIALIZED",
                    replica: backend.has_replica(),
                    max_connections: self.config.pool.max_connections
                );
                Ok::<_, WardenError>(backend)
            })
            .await?;

        if self
            .handlers_registered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.register_with_coordinator();
            // writes deferred before the first connection replay now
            if self.coordinator.mark_healthy(services::DATABASE).await.is_none() {
                if let Err(e) = self.coordinator.recover_write_queue().await {
                    warn!(error = %e, "Initial write-queue recovery failed");
                }
            }
        }
        Ok(())
    }

    fn register_with_coordinator(self: &Arc<Self>) {
        let coordinator = &self.coordinator;

        // reads served while the database is down resolve to an empty result set
        coordinator.register_fallback(services::DATABASE, |_key| async { Ok(Value::Array(Vec::new())) });

        let weak: Weak<Self> = Arc::downgrade(self);
        coordinator.register_replay_handler(services::DATABASE, move |entry| {
            let weak = weak.clone();
            async move {
                let manager = weak
                    .upgrade()
                    .ok_or_else(|| WardenError::NotInitialized(COMPONENT.to_string()))?;
                manager.replay(&entry).await
            }
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        coordinator.register_probe(services::DATABASE, move || {
            let weak = weak.clone();
            async move {
                let manager = weak
                    .upgrade()
                    .ok_or_else(|| WardenError::NotInitialized(COMPONENT.to_string()))?;
                manager.probe().await
            }
        });
    }

    fn backend(&self) -> WardenResult<&Arc<dyn SqlBackend>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WardenError::ServiceUnavailable {
                service: services::DATABASE.to_string(),
                reason: "connection manager closed".to_string(),
            });
        }
        self.backend
            .get()
            .ok_or_else(|| WardenError::NotInitialized(COMPONENT.to_string()))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn query(&self, sql: &str, params: &[Value], options: QueryOptions) -> WardenResult<QueryResult> {
        let backend = self.backend()?;
        let attempts = self.retry.attempts(options.retries, options.no_retry);
        let mut target = if is_read_only(sql) && backend.has_replica() && !options.force_primary {
            PoolTarget::Replica
        } else {
            PoolTarget::Primary
        };
        let mut retry: u32 = 0;

        loop {
            let error = match backend.execute(target, sql, params).await {
                Ok(result) => {
                    self.record_success().await;
                    return Ok(result);
                }
                Err(error) => error,
            };

            if classify(&error) == ErrorClass::Fatal {
                crate::log_database!(
                    warn,
                    "QUERY_FAILED",
                    code: error.code(),
                    error: error.message.as_str(),
                    pool: target.as_str()
                );
                return Err(storage_error(&error, retry + 1));
            }

            // the replica fallback does not spend the retry budget
            if target == PoolTarget::Replica {
                warn!(error = %error, "Transient replica failure, retrying on primary");
                target = PoolTarget::Primary;
                continue;
            }

            if retry + 1 >= attempts {
                let failure = storage_error(&error, retry + 1);
                self.record_exhausted_failure(&failure);
                return Err(failure);
            }

            let delay = self.retry.delay_for(retry);
            retry += 1;
            self.metrics
                .increment(names::DB_RETRIES, &[("pool", target.as_str())]);
            debug!(
                attempt = retry,
                max_attempts = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient database error, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    pub async fn get_one(&self, sql: &str, params: &[Value]) -> WardenResult<Option<Row>> {
        let result = self.query(sql, params, QueryOptions::default()).await?;
        Ok(result.rows.into_iter().next())
    }

    pub async fn get_many(&self, sql: &str, params: &[Value]) -> WardenResult<Vec<Row>> {
        Ok(self.query(sql, params, QueryOptions::default()).await?.rows)
    }

    pub fn validate_table(&self, table: &str) -> WardenResult<()> {
        self.allow_list.validate_table(table)
    }

    async fn run(&self, statement: &Statement) -> WardenResult<QueryResult> {
        self.query(&statement.sql, &statement.params, QueryOptions::default())
            .await
    }

    pub async fn insert(&self, table: &str, data: &Fields) -> WardenResult<Row> {
        let statement = self.allow_list.build_insert(table, data)?;
        first_row(self.run(&statement).await?, table)
    }

    /// Refuses an empty condition set
    pub async fn update(&self, table: &str, data: &Fields, conditions: &Fields) -> WardenResult<Vec<Row>> {
        let statement = self.allow_list.build_update(table, data, conditions)?;
        Ok(self.run(&statement).await?.rows)
    }

    /// Refuses an empty condition set
    pub async fn delete(&self, table: &str, conditions: &Fields) -> WardenResult<Vec<Row>> {
        let statement = self.allow_list.build_delete(table, conditions)?;
        Ok(self.run(&statement).await?.rows)
    }

    /// Empty result when the conflict resolves to `DO NOTHING` on an existing row
    pub async fn upsert(&self, table: &str, data: &Fields, conflict_columns: &[String]) -> WardenResult<Option<Row>> {
        let statement = self.allow_list.build_upsert(table, data, conflict_columns)?;
        Ok(self.run(&statement).await?.rows.into_iter().next())
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Run `f` on a dedicated connection: COMMIT when it returns `Ok`, ROLLBACK otherwise
    pub async fn transaction<T, F>(&self, f: F) -> WardenResult<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut TransactionScope) -> BoxFuture<'c, WardenResult<T>>,
    {
        let connection = self.begin().await?;
        let mut scope = TransactionScope {
            connection,
            allow_list: Arc::clone(&self.allow_list),
        };

        match f(&mut scope).await {
            Ok(value) => {
                scope
                    .connection
                    .commit()
                    .await
                    .map_err(|e| storage_error(&e, 1))?;
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback_error) = scope.connection.rollback().await {
                    warn!(error = %rollback_error, "Rollback failed; connection is discarded");
                }
                Err(error)
            }
        }
    }

    async fn begin(&self) -> WardenResult<Box<dyn TransactionConnection>> {
        let backend = self.backend()?;
        let attempts = self.retry.attempts(None, false);
        let mut retry: u32 = 0;
        loop {
            match backend.begin().await {
                Ok(connection) => return Ok(connection),
                Err(error) if classify(&error) == ErrorClass::Transient && retry + 1 < attempts => {
                    let delay = self.retry.delay_for(retry);
                    retry += 1;
                    self.metrics.increment(names::DB_RETRIES, &[("pool", "transaction")]);
                    debug!(attempt = retry, error = %error, "BEGIN failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    let failure = storage_error(&error, retry + 1);
                    if matches!(failure, WardenError::TransientStorage { .. }) {
                        self.record_exhausted_failure(&failure);
                    }
                    return Err(failure);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Sequences
    // ------------------------------------------------------------------

    /// Insert `request.fields` with the next sequence value of the scope.
    /// Races on a brand-new scope surface as unique violations and are retried.
    pub async fn next_sequence(&self, request: &SequenceRequest) -> WardenResult<Row> {
        let statement = request.build(&self.allow_list)?;
        let lock_key = request.lock_key();
        let attempts = self.retry.attempts(None, false);
        let mut retry: u32 = 0;

        loop {
            let statement = statement.clone();
            let claim_key = lock_key.clone();
            let table = request.table.clone();
            let result = self
                .transaction(move |scope| {
                    Box::pin(async move {
                        scope.execute(ADVISORY_LOCK_SQL, &[Value::String(claim_key)]).await?;
                        let result = scope.execute(&statement.sql, &statement.params).await?;
                        first_row(result, &table)
                    })
                })
                .await;

            let retryable = match &result {
                Ok(_) => false,
                Err(WardenError::FatalQuery { code: Some(code), .. }) => PgErrorCode::is_unique_violation(code),
                Err(WardenError::TransientStorage { .. }) => true,
                Err(_) => false,
            };
            if !retryable || retry + 1 >= attempts {
                if result.is_ok() {
                    self.record_success().await;
                }
                return result;
            }

            let delay = self.retry.delay_for(retry);
            retry += 1;
            debug!(
                table = %request.table,
                scope = %lock_key,
                attempt = retry,
                "Sequence claim raced, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    // ------------------------------------------------------------------
    // Degradation-aware writes
    // ------------------------------------------------------------------

    pub async fn safe_insert(&self, table: &str, data: &Fields) -> WardenResult<WriteOutcome> {
        self.allow_list.build_insert(table, data)?;
        let payload = json!({ "table": table, "data": data.to_json() });
        self.safe_write(WriteOperation::Insert, table, payload, || async {
            self.insert(table, data).await.map(|row| vec![row])
        })
        .await
    }

    pub async fn safe_update(&self, table: &str, data: &Fields, conditions: &Fields) -> WardenResult<WriteOutcome> {
        self.allow_list.build_update(table, data, conditions)?;
        let payload = json!({
            "table": table,
            "data": data.to_json(),
            "where": conditions.to_json(),
        });
        self.safe_write(WriteOperation::Update, table, payload, || {
            self.update(table, data, conditions)
        })
        .await
    }

    pub async fn safe_delete(&self, table: &str, conditions: &Fields) -> WardenResult<WriteOutcome> {
        self.allow_list.build_delete(table, conditions)?;
        let payload = json!({ "table": table, "where": conditions.to_json() });
        self.safe_write(WriteOperation::Delete, table, payload, || {
            self.delete(table, conditions)
        })
        .await
    }

    async fn safe_write<F, Fut>(
        &self,
        operation: WriteOperation,
        table: &str,
        payload: Value,
        apply: F,
    ) -> WardenResult<WriteOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = WardenResult<Vec<Row>>>,
    {
        if self.coordinator.is_healthy(services::DATABASE) && self.backend().is_ok() {
            match apply().await {
                Ok(rows) => return Ok(WriteOutcome::Applied(rows)),
                Err(e @ WardenError::TransientStorage { .. }) => {
                    warn!(table = table, operation = operation.as_str(), error = %e, "Write failed transiently, queueing");
                }
                Err(e) => return Err(e),
            }
        }

        let entry = self
            .coordinator
            .queue_write(services::DATABASE, operation.as_str(), payload)
            .await?;
        Ok(WriteOutcome::Queued {
            operation,
            table: table.to_string(),
            write_id: entry.id,
        })
    }

    /// Re-apply one queued database write
    pub async fn replay(&self, entry: &QueuedWrite) -> WardenResult<()> {
        let operation = WriteOperation::parse(&entry.operation_type).ok_or_else(|| {
            WardenError::validation(format!("unknown queued operation '{}'", entry.operation_type))
        })?;
        let payload = &entry.payload;
        let table = payload
            .get("table")
            .and_then(Value::as_str)
            .ok_or_else(|| WardenError::validation("queued write has no table"))?;
        let data = payload.get("data").and_then(Fields::from_json).unwrap_or_default();
        let conditions = payload.get("where").and_then(Fields::from_json).unwrap_or_default();

        match operation {
            WriteOperation::Insert => {
                self.insert(table, &data).await?;
            }
            WriteOperation::Update => {
                self.update(table, &data, &conditions).await?;
            }
            WriteOperation::Delete => {
                self.delete(table, &conditions).await?;
            }
            WriteOperation::Upsert => {
                let conflict: Vec<String> = payload
                    .get("conflict_columns")
                    .and_then(Value::as_array)
                    .map(|cols| cols.iter().filter_map(Value::as_str).map(str::to_string).collect())
                    .unwrap_or_default();
                self.upsert(table, &data, &conflict).await?;
            }
        }
        debug!(write_id = %entry.id, table = table, operation = operation.as_str(), "Replayed queued write");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Health and lifecycle
    // ------------------------------------------------------------------

    /// Single-attempt `SELECT 1` on the primary
    pub async fn probe(&self) -> WardenResult<()> {
        let backend = self.backend()?;
        backend
            .execute(PoolTarget::Primary, "SELECT 1", &[])
            .await
            .map_err(|e| storage_error(&e, 1))?;
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.record_pool_metrics(backend.as_ref());
        Ok(())
    }

    pub fn status(&self) -> ConnectionPoolStatus {
        let backend = self.backend().ok();
        if let Some(backend) = backend {
            self.record_pool_metrics(backend.as_ref());
        }
        ConnectionPoolStatus {
            is_connected: backend.is_some(),
            failure_count: self.consecutive_failures.load(Ordering::SeqCst),
            retry_config: self.config.retry.clone(),
            read_replica: ReplicaStatus {
                enabled: backend.map_or(self.config.read_replica.enabled, |b| b.has_replica()),
            },
            pools: backend.map(|b| b.pool_sizes()).unwrap_or_default(),
        }
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(backend) = self.backend.get() {
            backend.close().await;
            info!("Database pools closed");
        }
    }

    fn record_pool_metrics(&self, backend: &dyn SqlBackend) {
        let sizes = backend.pool_sizes();
        self.metrics
            .gauge(names::DB_POOL_SIZE, sizes.primary_size as f64, &[("pool", "primary")]);
        self.metrics
            .gauge(names::DB_POOL_IDLE, sizes.primary_idle as f64, &[("pool", "primary")]);
        if let (Some(size), Some(idle)) = (sizes.replica_size, sizes.replica_idle) {
            self.metrics.gauge(names::DB_POOL_SIZE, size as f64, &[("pool", "replica")]);
            self.metrics.gauge(names::DB_POOL_IDLE, idle as f64, &[("pool", "replica")]);
        }
    }

    async fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if !self.coordinator.is_healthy(services::DATABASE) {
            self.coordinator.mark_healthy(services::DATABASE).await;
        }
    }

    fn record_exhausted_failure(&self, failure: &WardenError) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.increment(names::DB_FAILURES, &[]);
        if failures >= self.config.failure_threshold {
            crate::log_database!(
                error,
                "UNAVAILABLE",
                consecutive_failures: failures,
                threshold: self.config.failure_threshold,
                error: failure.to_string()
            );
            self.coordinator
                .mark_unavailable(services::DATABASE, failure.to_string());
        } else {
            self.coordinator
                .mark_degraded(services::DATABASE, failure.to_string());
        }
    }
}
