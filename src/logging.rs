//! # Structured Logging Module
//!
//! One-time `tracing` setup and the domain macros used across the crate.
//! Every macro event carries `component`, `operation` and an RFC 3339
//! `timestamp`, so shard logs can be merged and filtered by subsystem.

use std::io::IsTerminal;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static TRACING_INITIALIZED: OnceLock<LogFormat> = OnceLock::new();

/// Output shape of the global subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, colored when stdout is a terminal
    Console,
    /// One JSON object per line
    Json,
}

impl LogFormat {
    /// `WARDEN_LOG_FORMAT=json` selects JSON; anything else is console
    pub fn from_env() -> Self {
        match std::env::var("WARDEN_LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Console,
        }
    }
}

pub fn init_console_only() {
    init(LogFormat::Console);
}

pub fn init_structured_logging() {
    init(LogFormat::Json);
}

/// Installs the global subscriber once per process and returns the format
/// that won. A subscriber installed elsewhere (tests, an embedding binary) is
/// left in place.
pub fn init(format: LogFormat) -> LogFormat {
    *TRACING_INITIALIZED.get_or_init(|| {
        let environment = current_environment();
        let filter = EnvFilter::new(default_directive(&environment));

        let installed = match format {
            LogFormat::Console => tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_ansi(std::io::stdout().is_terminal())
                        .with_filter(filter),
                )
                .try_init(),
            LogFormat::Json => tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_ansi(false)
                        .with_filter(filter),
                )
                .try_init(),
        };

        match installed {
            Ok(()) => tracing::info!(
                environment = %environment,
                format = ?format,
                pid = std::process::id(),
                "Logging initialized"
            ),
            Err(_) => tracing::debug!("Existing tracing subscriber kept"),
        }
        format
    })
}

fn current_environment() -> String {
    std::env::var("WARDEN_ENV").unwrap_or_else(|_| "development".to_string())
}

/// `RUST_LOG` when set, otherwise quieter the closer to production
fn default_directive(environment: &str) -> String {
    if let Ok(directive) = std::env::var("RUST_LOG") {
        return directive;
    }
    let level = match environment {
        "production" => "info",
        "test" => "warn",
        _ => "debug",
    };
    format!("{level},sqlx=warn,redis=warn")
}

#[doc(hidden)]
#[macro_export]
macro_rules! __warden_event {
    ($level:ident, $component:literal, $prefix:literal, $operation:expr $(, $key:ident = $value:expr)*) => {
        tracing::$level!(
            component = $component,
            operation = %$operation,
            $($key = ?$value,)*
            timestamp = %chrono::Utc::now().to_rfc3339(),
            "{}_{}", $prefix, $operation
        )
    };
}

/// Log connection manager activity: `log_database!(warn, "RETRY", attempt: 2)`
#[macro_export]
macro_rules! log_database {
    ($level:ident, $operation:expr $(, $key:ident: $value:expr)* $(,)?) => {
        $crate::__warden_event!($level, "database", "DB", $operation $(, $key = $value)*)
    };
}

/// Log cache activity; `namespace` comes first when given
#[macro_export]
macro_rules! log_cache {
    ($level:ident, $operation:expr $(, $key:ident: $value:expr)* $(,)?) => {
        $crate::__warden_event!($level, "cache", "CACHE", $operation $(, $key = $value)*)
    };
}

/// Log health transitions, fallbacks and write-queue activity
#[macro_export]
macro_rules! log_degradation {
    ($level:ident, $operation:expr $(, $key:ident: $value:expr)* $(,)?) => {
        $crate::__warden_event!($level, "degradation", "DEGRADATION", $operation $(, $key = $value)*)
    };
}

#[macro_export]
macro_rules! log_config {
    ($level:ident, $operation:expr $(, $key:ident: $value:expr)* $(,)?) => {
        $crate::__warden_event!($level, "config", "CONFIG", $operation $(, $key = $value)*)
    };
}
