//! Error types for report-jobs.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the orchestration core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("GitHub error: {0}")]
    Github(#[from] GithubError),

    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    #[error("Report cache error: {0:#}")]
    Cache(anyhow::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Job queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Invalid cron pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Job {id} has an unreadable payload: {reason}")]
    InvalidPayload { id: Uuid, reason: String },

    #[error("Queue {queue} already has a registered processor")]
    AlreadyRegistered { queue: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Outbound GitHub API errors.
#[derive(Debug, thiserror::Error)]
pub enum GithubError {
    #[error("Request to {endpoint} failed: {reason}")]
    RequestFailed { endpoint: String, reason: String },

    #[error("GitHub returned {status} for {endpoint}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Rate limited by GitHub, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },
}

/// Monitor state machine errors that are not plain API failures.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Unrecognized operation '{operation}' for issue #{issue_number}")]
    UnknownOperation {
        operation: String,
        issue_number: u64,
    },
}

/// Result type alias for the orchestration core.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_error_converts_into_top_level() {
        let err: Error = DatabaseError::Query("claim_next: locked".into()).into();
        assert!(matches!(err, Error::Database(_)));
        assert_eq!(err.to_string(), "Database error: Query failed: claim_next: locked");
    }

    #[test]
    fn queue_error_is_transparent_over_database() {
        let err: QueueError = DatabaseError::Pool("gone".into()).into();
        assert_eq!(err.to_string(), "Connection pool error: gone");
    }

    #[test]
    fn github_status_error_message() {
        let err = GithubError::Status {
            endpoint: "/repos/a/b/issues/1".into(),
            status: 502,
            body: "bad gateway".into(),
        };
        assert_eq!(
            err.to_string(),
            "GitHub returned 502 for /repos/a/b/issues/1: bad gateway"
        );
    }
}
