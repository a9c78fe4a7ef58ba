//! Storage backend seam.
//!
//! [`ConnectionManager`](crate::database::ConnectionManager) talks to the
//! relational store only through [`SqlBackend`]; [`PgBackend`] is the sqlx
//! implementation. [`SqlConnector`] opens a backend so tests can substitute a
//! scripted one without a server.

use crate::config::DatabaseConfig;
use crate::database::types::{PoolSizes, PoolTarget, QueryResult, Row};
use crate::database::statement::returns_rows;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArgumentBuffer, PgArguments, PgPool, PgPoolOptions, PgRow, PgTypeInfo};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row as _, Transaction, TypeInfo};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbErrorKind {
    /// Error reported by the server, with its SQLSTATE when present
    Database { code: Option<String> },
    Io(std::io::ErrorKind),
    PoolTimedOut,
    PoolClosed,
    /// Row or column could not be decoded
    Decode,
    Other,
}

/// Backend-level failure, classified later by [`crate::database::error_codes::classify`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct DbError {
    pub kind: DbErrorKind,
    pub message: String,
}

impl DbError {
    pub fn new(kind: DbErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn database(code: Option<&str>, message: impl Into<String>) -> Self {
        Self::new(
            DbErrorKind::Database {
                code: code.map(str::to_string),
            },
            message,
        )
    }

    pub fn io(kind: std::io::ErrorKind, message: impl Into<String>) -> Self {
        Self::new(DbErrorKind::Io(kind), message)
    }

    pub fn code(&self) -> Option<&str> {
        match &self.kind {
            DbErrorKind::Database { code } => code.as_deref(),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for DbError {
    fn from(error: sqlx::Error) -> Self {
        let message = error.to_string();
        let kind = match &error {
            sqlx::Error::Database(db) => DbErrorKind::Database {
                code: db.code().map(|c| c.into_owned()),
            },
            sqlx::Error::Io(io) => DbErrorKind::Io(io.kind()),
            sqlx::Error::PoolTimedOut => DbErrorKind::PoolTimedOut,
            sqlx::Error::PoolClosed => DbErrorKind::PoolClosed,
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::TypeNotFound { .. } => DbErrorKind::Decode,
            _ => DbErrorKind::Other,
        };
        Self { kind, message }
    }
}

/// Pooled access to the relational store
#[async_trait]
pub trait SqlBackend: Send + Sync + fmt::Debug {
    async fn execute(
        &self,
        target: PoolTarget,
        sql: &str,
        params: &[Value],
    ) -> Result<QueryResult, DbError>;

    /// Dedicated connection with an open transaction
    async fn begin(&self) -> Result<Box<dyn TransactionConnection>, DbError>;

    fn has_replica(&self) -> bool;

    fn pool_sizes(&self) -> PoolSizes;

    async fn close(&self);
}

/// A connection holding an open transaction. Dropping it without commit rolls back.
#[async_trait]
pub trait TransactionConnection: Send {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult, DbError>;

    async fn commit(self: Box<Self>) -> Result<(), DbError>;

    async fn rollback(self: Box<Self>) -> Result<(), DbError>;
}

#[async_trait]
pub trait SqlConnector: Send + Sync + fmt::Debug {
    async fn connect(&self, config: &DatabaseConfig) -> Result<Arc<dyn SqlBackend>, DbError>;
}

/// Opens sqlx Postgres pools
#[derive(Debug, Default, Clone, Copy)]
pub struct PgConnector;

impl PgConnector {
    async fn create_pool(config: &DatabaseConfig, url: &str) -> Result<PgPool, DbError> {
        let pool = &config.pool;
        let pool = PgPoolOptions::new()
            .max_connections(pool.max_connections)
            .min_connections(pool.min_connections)
            .acquire_timeout(pool.acquire_timeout())
            .idle_timeout(Some(pool.idle_timeout()))
            .max_lifetime(Some(pool.max_lifetime()))
            .test_before_acquire(true)
            .connect(url)
            .await?;
        Ok(pool)
    }
}

#[async_trait]
impl SqlConnector for PgConnector {
    async fn connect(&self, config: &DatabaseConfig) -> Result<Arc<dyn SqlBackend>, DbError> {
        let primary = Self::create_pool(config, &config.url).await?;
        info!(
            max_connections = config.pool.max_connections,
            "Primary database pool created"
        );

        let replica = match (&config.read_replica.enabled, &config.read_replica.url) {
            (true, Some(url)) => match Self::create_pool(config, url).await {
                Ok(pool) => {
                    info!("Read replica pool created");
                    Some(pool)
                }
                Err(e) => {
                    warn!(error = %e, "Read replica unreachable, routing all reads to primary");
                    None
                }
            },
            _ => None,
        };

        Ok(Arc::new(PgBackend { primary, replica }))
    }
}

#[derive(Clone)]
pub struct PgBackend {
    primary: PgPool,
    replica: Option<PgPool>,
}

impl fmt::Debug for PgBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgBackend")
            .field("primary_pool_size", &self.primary.size())
            .field("replica_pool_size", &self.replica.as_ref().map(|p| p.size()))
            .finish()
    }
}

impl PgBackend {
    pub fn from_pools(primary: PgPool, replica: Option<PgPool>) -> Self {
        Self { primary, replica }
    }

    fn pool(&self, target: PoolTarget) -> &PgPool {
        match (target, &self.replica) {
            (PoolTarget::Replica, Some(replica)) => replica,
            _ => &self.primary,
        }
    }
}

#[async_trait]
impl SqlBackend for PgBackend {
    async fn execute(
        &self,
        target: PoolTarget,
        sql: &str,
        params: &[Value],
    ) -> Result<QueryResult, DbError> {
        let query = bind_all(sqlx::query(sql), params);
        let pool = self.pool(target);
        if returns_rows(sql) {
            let rows = query.fetch_all(pool).await?;
            Ok(QueryResult::from_rows(decode_rows(&rows)?))
        } else {
            let done = query.execute(pool).await?;
            Ok(QueryResult::affected(done.rows_affected()))
        }
    }

    async fn begin(&self) -> Result<Box<dyn TransactionConnection>, DbError> {
        let tx = self.primary.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }

    fn has_replica(&self) -> bool {
        self.replica.is_some()
    }

    fn pool_sizes(&self) -> PoolSizes {
        PoolSizes {
            primary_size: self.primary.size(),
            primary_idle: self.primary.num_idle() as u32,
            replica_size: self.replica.as_ref().map(|p| p.size()),
            replica_idle: self.replica.as_ref().map(|p| p.num_idle() as u32),
        }
    }

    async fn close(&self) {
        self.primary.close().await;
        if let Some(replica) = &self.replica {
            replica.close().await;
        }
    }
}

struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl TransactionConnection for PgTransaction {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult, DbError> {
        let query = bind_all(sqlx::query(sql), params);
        if returns_rows(sql) {
            let rows = query.fetch_all(&mut *self.tx).await?;
            Ok(QueryResult::from_rows(decode_rows(&rows)?))
        } else {
            let done = query.execute(&mut *self.tx).await?;
            Ok(QueryResult::affected(done.rows_affected()))
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// NULL parameter sent with an unspecified type; the server infers it from
/// the column or operator it meets
struct UntypedNull;

impl sqlx::Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }

    fn compatible(_ty: &PgTypeInfo) -> bool {
        true
    }
}

impl sqlx::Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

/// Statements carrying an untyped NULL are not cached: the parameter types the
/// server infers would not match a later call that binds a typed value there
fn bind_all<'q>(
    query: Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
    let mut query = query.persistent(!params.iter().any(Value::is_null));
    for value in params {
        query = match value {
            Value::Null => query.bind(UntypedNull),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64()),
            },
            Value::String(s) => query.bind(s.as_str()),
            Value::Array(_) | Value::Object(_) => query.bind(sqlx::types::Json(value)),
        };
    }
    query
}

/// Column types rows can be decoded from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Json,
    Uuid,
    TimestampTz,
    Timestamp,
    Date,
    Text,
    TextArray,
    Int8Array,
    Bytea,
}

impl ColumnKind {
    fn for_type(type_name: &str) -> Option<Self> {
        let kind = match type_name {
            "BOOL" => Self::Bool,
            "INT2" => Self::Int2,
            "INT4" => Self::Int4,
            "INT8" => Self::Int8,
            "FLOAT4" => Self::Float4,
            "FLOAT8" => Self::Float8,
            "JSON" | "JSONB" => Self::Json,
            "UUID" => Self::Uuid,
            "TIMESTAMPTZ" => Self::TimestampTz,
            "TIMESTAMP" => Self::Timestamp,
            "DATE" => Self::Date,
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" => Self::Text,
            "TEXT[]" | "VARCHAR[]" => Self::TextArray,
            "INT8[]" => Self::Int8Array,
            "BYTEA" => Self::Bytea,
            _ => return None,
        };
        Some(kind)
    }
}

fn unsupported_column(name: &str, type_name: &str) -> DbError {
    DbError::new(
        DbErrorKind::Decode,
        format!("column '{name}' has unsupported type {type_name}; cast it in the query"),
    )
}

fn decode_rows(rows: &[PgRow]) -> Result<Vec<Row>, DbError> {
    rows.iter().map(decode_row).collect()
}

fn decode_row(row: &PgRow) -> Result<Row, DbError> {
    let mut decoded = Row::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let type_name = column.type_info().name();
        let kind = ColumnKind::for_type(type_name)
            .ok_or_else(|| unsupported_column(column.name(), type_name))?;
        let value = match kind {
            ColumnKind::Bool => row.try_get::<Option<bool>, _>(idx)?.map(Value::Bool),
            ColumnKind::Int2 => row.try_get::<Option<i16>, _>(idx)?.map(Value::from),
            ColumnKind::Int4 => row.try_get::<Option<i32>, _>(idx)?.map(Value::from),
            ColumnKind::Int8 => row.try_get::<Option<i64>, _>(idx)?.map(Value::from),
            ColumnKind::Float4 => row.try_get::<Option<f32>, _>(idx)?.map(Value::from),
            ColumnKind::Float8 => row.try_get::<Option<f64>, _>(idx)?.map(Value::from),
            ColumnKind::Json => row.try_get::<Option<Value>, _>(idx)?,
            ColumnKind::Uuid => row
                .try_get::<Option<uuid::Uuid>, _>(idx)?
                .map(|u| Value::String(u.to_string())),
            ColumnKind::TimestampTz => row
                .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)?
                .map(|t| Value::String(t.to_rfc3339())),
            ColumnKind::Timestamp => row
                .try_get::<Option<chrono::NaiveDateTime>, _>(idx)?
                .map(|t| Value::String(t.to_string())),
            ColumnKind::Date => row
                .try_get::<Option<chrono::NaiveDate>, _>(idx)?
                .map(|d| Value::String(d.to_string())),
            ColumnKind::Text => row.try_get::<Option<String>, _>(idx)?.map(Value::String),
            ColumnKind::TextArray => row
                .try_get::<Option<Vec<String>>, _>(idx)?
                .map(Value::from),
            ColumnKind::Int8Array => row.try_get::<Option<Vec<i64>>, _>(idx)?.map(Value::from),
            ColumnKind::Bytea => row
                .try_get::<Option<Vec<u8>>, _>(idx)?
                .map(|bytes| Value::String(hex::encode(bytes))),
        };
        decoded.insert(column.name().to_string(), value.unwrap_or(Value::Null));
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Type;

    #[test]
    fn test_null_binds_without_a_type() {
        assert_eq!(UntypedNull::type_info().oid(), Some(Oid(0)));
        assert!(UntypedNull::compatible(&PgTypeInfo::with_name("INT8")));
    }

    #[test]
    fn test_text_columns_decode_as_strings() {
        for name in ["TEXT", "VARCHAR", "BPCHAR", "NAME"] {
            assert_eq!(ColumnKind::for_type(name), Some(ColumnKind::Text));
        }
        assert_eq!(ColumnKind::for_type("JSONB"), Some(ColumnKind::Json));
    }

    #[test]
    fn test_unsupported_column_is_a_decode_error() {
        assert_eq!(ColumnKind::for_type("NUMERIC"), None);
        assert_eq!(ColumnKind::for_type("INTERVAL"), None);

        let error = unsupported_column("fine_total", "NUMERIC");
        assert_eq!(error.kind, DbErrorKind::Decode);
        assert!(error.message.contains("'fine_total'"));
        assert!(error.message.contains("NUMERIC"));
    }
}
