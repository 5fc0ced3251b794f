use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Container already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Container already monitored: {0}")]
    AlreadyMonitored(String),

    #[error("Runtime {operation} failed for {container_id}: {reason}")]
    Runtime {
        operation: &'static str,
        container_id: String,
        reason: String,
    },

    #[error("Runtime {operation} timed out for {container_id} after {limit:?}")]
    Timeout {
        operation: &'static str,
        container_id: String,
        limit: Duration,
    },

    #[error("Recovery of {container_id} timed out after {limit:?}")]
    RecoveryTimeout {
        container_id: String,
        limit: Duration,
    },

    #[error("Health check failed for {container_id}: {reason}")]
    HealthCheckFailed {
        container_id: String,
        reason: String,
    },

    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SandboxError {
    pub fn runtime(
        operation: &'static str,
        container_id: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::Runtime {
            operation,
            container_id: container_id.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Timeouts of bounded waits, as opposed to outright refusals.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::RecoveryTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
