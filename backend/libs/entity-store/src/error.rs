//! Error types for the entity store.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by metadata compilation, migration and repository calls.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Invalid entity declaration (key field, table or column names)
    #[error("Configuration error for {entity}: {message}")]
    Configuration { entity: String, message: String },

    /// DDL failed; any rebuild transaction has been rolled back
    #[error("Schema migration failed for table {table}: {source}")]
    SchemaMigration {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    /// Database operation failed
    #[error("Database error: {0}")]
    Query(#[from] sqlx::Error),

    /// Caller error: missing key, empty delete predicate, unknown column
    #[error("Validation error: {0}")]
    Validation(String),

    /// Bulk load or bulk update failed; nothing was committed
    #[error("Bulk {operation} on {table} failed: {source}")]
    BulkOperation {
        operation: &'static str,
        table: String,
        #[source]
        source: Box<StoreError>,
    },

    /// Operation exceeded its deadline
    #[error("Operation {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Row value could not be converted to or from a field
    #[error("Value error: {0}")]
    Value(#[from] ValueError),
}

impl StoreError {
    pub(crate) fn configuration(entity: &str, message: impl Into<String>) -> Self {
        Self::Configuration {
            entity: entity.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether a second attempt on a fresh connection can succeed
    ///
    /// Only connectivity failures and timeouts qualify. Database-reported
    /// errors, validation and conversion errors are deterministic.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Query(e) => is_connectivity_error(e),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

pub(crate) fn is_connectivity_error(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

/// Conversion errors between field types and database values.
#[derive(Error, Debug)]
pub enum ValueError {
    #[error("Type mismatch: expected {expected}, found {found}")]
    Mismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Invalid enum discriminant {value} for {target}")]
    InvalidEnum { target: &'static str, value: i32 },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Value out of range: {0}")]
    OutOfRange(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::validation("delete requires at least one predicate");
        assert_eq!(
            err.to_string(),
            "Validation error: delete requires at least one predicate"
        );

        let err = StoreError::configuration("Player", "no key field declared");
        assert_eq!(
            err.to_string(),
            "Configuration error for Player: no key field declared"
        );
    }

    #[test]
    fn test_connectivity_errors_are_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(StoreError::Query(sqlx::Error::Io(io)).is_retryable());
        assert!(StoreError::Query(sqlx::Error::PoolClosed).is_retryable());
        assert!(StoreError::Timeout {
            operation: "find",
            timeout: Duration::from_millis(500),
        }
        .is_retryable());
    }

    #[test]
    fn test_logic_errors_are_not_retryable() {
        assert!(!StoreError::validation("missing key").is_retryable());
        assert!(!StoreError::Query(sqlx::Error::RowNotFound).is_retryable());
        assert!(!StoreError::Value(ValueError::InvalidEnum {
            target: "Role",
            value: 9
        })
        .is_retryable());
    }

    #[test]
    fn test_bulk_error_keeps_cause() {
        let err = StoreError::BulkOperation {
            operation: "insert",
            table: "players".to_string(),
            source: Box::new(StoreError::Query(sqlx::Error::PoolClosed)),
        };
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert!(source.unwrap().contains("Database error"));
    }
}
