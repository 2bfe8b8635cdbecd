//! Application-wide error types.

use std::borrow::Cow;

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Store unavailable: {operation} failed after {attempts} attempts: {message}")]
    StoreUnavailable {
        operation: &'static str,
        attempts: u32,
        message: String,
    },

    #[error("Store connection error: {0}")]
    StoreConnection(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Lock failed: could not acquire {key} after {attempts} attempts")]
    LockFailed { key: String, attempts: u32 },

    #[error("Lease expired: {key} is no longer owned by this holder")]
    LeaseExpired { key: String },

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Task {job_id} was superseded: expected invocation {expected}, found {actual}")]
    Superseded {
        job_id: String,
        expected: String,
        actual: String,
    },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Task {job_id} exceeded max retries ({retry_num})")]
    MaxRetriesExceeded { job_id: String, retry_num: u32 },

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invocation error: {0}")]
    Invocation(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_status(msg: impl Into<String>) -> Self {
        Self::InvalidStatus(msg.into())
    }

    pub fn invocation(msg: impl Into<String>) -> Self {
        Self::Invocation(msg.into())
    }

    /// Whether the store layer should retry the operation that produced this error.
    ///
    /// Only connection-level failures and SQLite lock contention qualify. Domain
    /// errors (`IllegalTransition`, `NotFound`, ...) are never retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::StoreConnection(_) => true,
            Self::Database(err) => is_transient_sqlx(err),
            _ => false,
        }
    }

    /// The code reported to API callers.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::NotFound { .. } => "InvalidParam",
            Self::InvalidStatus(_) | Self::IllegalTransition { .. } => "InvalidStatus",
            _ => "InternalError",
        }
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(Cow::into_owned);
            if matches!(code.as_deref(), Some("5") | Some("6")) {
                return true;
            }
            let msg = db_err.message().to_ascii_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::StoreConnection("reset".into()).is_transient());
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!Error::Database(sqlx::Error::RowNotFound).is_transient());
        assert!(!Error::not_found("task", "a").is_transient());
        assert!(
            !Error::IllegalTransition {
                from: "finished".into(),
                to: "recording".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::validation("bad").error_code(), "InvalidParam");
        assert_eq!(Error::invalid_status("paused").error_code(), "InvalidStatus");
        assert_eq!(Error::not_found("task", "x").error_code(), "InvalidParam");
        assert_eq!(Error::Other("x".into()).error_code(), "InternalError");
    }
}
