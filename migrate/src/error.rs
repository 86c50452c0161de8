//! Migration engine error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a failure reported by an external collaborator should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalErrorKind {
    /// Network blip, rate limit, resource not yet reachable. Safe to retry.
    Transient,
    /// Disk full, source unreachable, credential rejected. Retrying will not help.
    Unrecoverable,
}

/// Error returned by an external collaborator (cloud API, copy executor, ...)
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct ExternalError {
    pub kind: ExternalErrorKind,
    pub message: String,
}

impl ExternalError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ExternalErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self {
            kind: ExternalErrorKind::Unrecoverable,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ExternalErrorKind::Transient
    }
}

/// Errors that can occur while reconciling migrations and worker nodes
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum MigrateError {
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Partial progress failure: {0}")]
    PartialProgress(String),

    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("Unrecoverable external error: {0}")]
    Unrecoverable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MigrateError {
    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            MigrateError::Transient(_) => "transient",
            MigrateError::Validation(_) => "validation",
            MigrateError::PartialProgress(_) => "partial_progress",
            MigrateError::DataIntegrity(_) => "data_integrity",
            MigrateError::Unrecoverable(_) => "unrecoverable",
            MigrateError::NotFound(_) => "not_found",
            MigrateError::AlreadyExists(_) => "already_exists",
            MigrateError::Conflict(_) => "conflict",
            MigrateError::CapacityExhausted(_) => "capacity_exhausted",
            MigrateError::Timeout(_) => "timeout",
            MigrateError::Config(_) => "config",
            MigrateError::Store(_) => "store",
            MigrateError::Internal(_) => "internal",
        }
    }

    /// Whether a reconcile failing with this error should simply be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MigrateError::Transient(_) | MigrateError::Conflict(_) | MigrateError::Timeout(_)
        )
    }
}

impl From<ExternalError> for MigrateError {
    fn from(err: ExternalError) -> Self {
        match err.kind {
            ExternalErrorKind::Transient => MigrateError::Transient(err.message),
            ExternalErrorKind::Unrecoverable => MigrateError::Unrecoverable(err.message),
        }
    }
}

impl From<std::io::Error> for MigrateError {
    fn from(err: std::io::Error) -> Self {
        MigrateError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for MigrateError {
    fn from(err: serde_json::Error) -> Self {
        MigrateError::Store(err.to_string())
    }
}

impl From<serde_yaml::Error> for MigrateError {
    fn from(err: serde_yaml::Error) -> Self {
        MigrateError::Config(err.to_string())
    }
}

impl From<toml::de::Error> for MigrateError {
    fn from(err: toml::de::Error) -> Self {
        MigrateError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MigrateError>;
