//! PostgreSQL Error Codes
//!
//! SQLSTATE constants and the transient/fatal classification that drives retry.
//!
//! ## SQLSTATE Format
//!
//! - 5-character codes
//! - First 2 characters: error class
//! - Last 3 characters: specific condition
//!
//! Full list: <https://www.postgresql.org/docs/current/errcodes-appendix.html>

use crate::database::backend::{DbError, DbErrorKind};
use std::io::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PgErrorCode;

impl PgErrorCode {
    // Class 23: Integrity Constraint Violation

    /// Duplicate key. Also raised when two shards race to claim the first
    /// sequence value of a brand-new scope.
    pub const UNIQUE_VIOLATION: &'static str = "23505";
    pub const FOREIGN_KEY_VIOLATION: &'static str = "23503";
    pub const NOT_NULL_VIOLATION: &'static str = "23502";
    pub const CHECK_VIOLATION: &'static str = "23514";

    // Class 40: Transaction Rollback

    /// Should be retried
    pub const SERIALIZATION_FAILURE: &'static str = "40001";
    /// One transaction was rolled back to break the cycle; should be retried
    pub const DEADLOCK_DETECTED: &'static str = "40P01";

    // Class 42: Syntax Error or Access Rule Violation
    pub const SYNTAX_ERROR: &'static str = "42601";
    pub const UNDEFINED_COLUMN: &'static str = "42703";
    pub const UNDEFINED_TABLE: &'static str = "42P01";

    // Class 57: Operator Intervention

    /// Statement timeout or cancel request
    pub const QUERY_CANCELED: &'static str = "57014";
    pub const ADMIN_SHUTDOWN: &'static str = "57P01";
    pub const CANNOT_CONNECT_NOW: &'static str = "57P03";

    #[inline]
    pub fn is_unique_violation(code: &str) -> bool {
        code == Self::UNIQUE_VIOLATION
    }

    /// Class 23
    #[inline]
    pub fn is_integrity_constraint_violation(code: &str) -> bool {
        code.starts_with("23")
    }

    #[inline]
    pub fn is_retryable_transaction_error(code: &str) -> bool {
        code == Self::SERIALIZATION_FAILURE || code == Self::DEADLOCK_DETECTED
    }

    /// Class 08: Connection Exception
    #[inline]
    pub fn is_connection_exception(code: &str) -> bool {
        code.starts_with("08")
    }

    /// Class 53: Insufficient Resources (too many connections, out of memory, disk full)
    #[inline]
    pub fn is_insufficient_resources(code: &str) -> bool {
        code.starts_with("53")
    }

    /// Every SQLSTATE worth retrying
    pub fn is_transient(code: &str) -> bool {
        Self::is_retryable_transaction_error(code)
            || Self::is_connection_exception(code)
            || Self::is_insufficient_resources(code)
            || code == Self::QUERY_CANCELED
            || code == Self::ADMIN_SHUTDOWN
            || code == Self::CANNOT_CONNECT_NOW
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Fatal,
}

const TRANSIENT_MESSAGE_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection closed",
    "broken pipe",
    "timed out",
    "timeout",
    "too many connections",
    "could not serialize",
    "deadlock detected",
    "server closed the connection",
    "terminating connection",
];

/// SQLSTATE first, then IO kind, then message text
pub fn classify(error: &DbError) -> ErrorClass {
    match &error.kind {
        DbErrorKind::Database { code: Some(code) } => {
            if PgErrorCode::is_transient(code) {
                ErrorClass::Transient
            } else {
                ErrorClass::Fatal
            }
        }
        DbErrorKind::Io(kind) => match kind {
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::TimedOut
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::Interrupted => ErrorClass::Transient,
            _ => classify_message(&error.message),
        },
        DbErrorKind::PoolTimedOut => ErrorClass::Transient,
        DbErrorKind::Decode | DbErrorKind::PoolClosed => ErrorClass::Fatal,
        DbErrorKind::Database { code: None } | DbErrorKind::Other => {
            classify_message(&error.message)
        }
    }
}

fn classify_message(message: &str) -> ErrorClass {
    let lowered = message.to_lowercase();
    if TRANSIENT_MESSAGE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}
