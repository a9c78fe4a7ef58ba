//! Errors raised while loading or validating [`WardenConfig`](super::WardenConfig)

use std::fmt::Display;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// `WARDEN_CONFIG_PATH` points at a file that does not exist
    #[error("Configuration file not found: {}", path.display())]
    ConfigFileNotFound { path: PathBuf },

    #[error("Failed to load configuration from {source_description}: {error}")]
    LoadError { source_description: String, error: String },

    #[error("Missing required configuration field '{field}' ({context})")]
    MissingRequiredField { field: String, context: String },

    #[error("Invalid value '{value}' for field '{field}': {context}")]
    InvalidValue {
        field: String,
        value: String,
        context: String,
    },

    #[error("Failed to apply environment variable '{variable}': {context}")]
    EnvironmentVariableError { variable: String, context: String },
}

impl ConfigurationError {
    pub fn config_file_not_found(path: impl Into<PathBuf>) -> Self {
        Self::ConfigFileNotFound { path: path.into() }
    }

    pub fn load_error(source_description: impl Into<String>, error: impl Display) -> Self {
        Self::LoadError {
            source_description: source_description.into(),
            error: error.to_string(),
        }
    }

    pub fn missing_required_field(field: impl Into<String>, context: impl Into<String>) -> Self {
        Self::MissingRequiredField {
            field: field.into(),
            context: context.into(),
        }
    }

    pub fn invalid_value(field: impl Into<String>, value: impl Into<String>, context: impl Display) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            context: context.to_string(),
        }
    }

    pub fn environment_variable_error(variable: impl Into<String>, context: impl Into<String>) -> Self {
        Self::EnvironmentVariableError {
            variable: variable.into(),
            context: context.into(),
        }
    }

    /// Dotted field path the error refers to, when there is one
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::MissingRequiredField { field, .. } | Self::InvalidValue { field, .. } => Some(field),
            Self::EnvironmentVariableError { variable, .. } => Some(variable),
            Self::ConfigFileNotFound { .. } | Self::LoadError { .. } => None,
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_names_the_path() {
        let error = ConfigurationError::config_file_not_found("/etc/warden.toml");
        assert_eq!(error.to_string(), "Configuration file not found: /etc/warden.toml");
        assert_eq!(error.field(), None);
    }

    #[test]
    fn test_invalid_value_carries_the_field() {
        let error = ConfigurationError::invalid_value(
            "database.retry.max_delay_ms",
            "10",
            "must be >= base_delay_ms",
        );
        assert_eq!(error.field(), Some("database.retry.max_delay_ms"));
        assert!(error
            .to_string()
            .contains("Invalid value '10' for field 'database.retry.max_delay_ms'"));
    }

    #[test]
    fn test_missing_replica_url() {
        let error = ConfigurationError::missing_required_field(
            "database.read_replica.url",
            "read replica enabled",
        );
        assert_eq!(
            error.to_string(),
            "Missing required configuration field 'database.read_replica.url' (read replica enabled)"
        );
    }
}
