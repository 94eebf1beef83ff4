//! Error types for report generation
//!
//! Errors are classified by recoverability:
//! - Retryable: network issues, source timeouts, resource ceilings, write races
//! - NonRetryable: bad scoping/configuration, missing field mappings
//!
//! Per-metric failures are caught by the aggregator and surfaced through the
//! payload's `errors` map; org-level terminal failures are recorded in the
//! scheduler run history. Nothing surfaced outward carries query text.

use thiserror::Error;

use crate::db::DbError;

/// Error types for report generation and scheduling
#[derive(Debug, Error)]
pub enum ReportError {
    // Non-retryable errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No field mapping for metric kind '{0}'")]
    SchemaMismatch(String),

    #[error("Invalid date: {0}")]
    InvalidDate(String),

    // Retryable errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Source query timed out after {0} seconds")]
    SourceTimeout(u64),

    #[error("Source resource ceiling exceeded: {0}")]
    SourceResourceExceeded(String),

    #[error("Source rejected query: {0}")]
    SourceQuery(String),

    #[error("Storage conflict: {0}")]
    StorageConflict(String),

    #[error("Storage error: {0}")]
    Storage(DbError),

    // Absent data is returned as empty by the read surface, never a failure
    #[error("Not found: {0}")]
    NotFound(String),
}

impl ReportError {
    /// Returns true if a whole-generation retry may clear this error.
    ///
    /// Resource-ceiling breaches are fatal for the metric within a pass, but
    /// the pass itself is retried; a struggling source often recovers by the
    /// next fixed-delay attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReportError::Network(_)
                | ReportError::SourceTimeout(_)
                | ReportError::SourceResourceExceeded(_)
                | ReportError::StorageConflict(_)
        )
    }

    /// Generic category label for outward-facing error maps.
    ///
    /// The Display form of source errors is already free of query text; this
    /// collapses further to a stable category for the payload `errors` map.
    pub fn category(&self) -> &'static str {
        match self {
            ReportError::Configuration(_) => "configuration",
            ReportError::SchemaMismatch(_) => "schema_mismatch",
            ReportError::InvalidDate(_) => "invalid_date",
            ReportError::Network(_) => "network",
            ReportError::SourceTimeout(_) => "source_timeout",
            ReportError::SourceResourceExceeded(_) => "source_resource_exceeded",
            ReportError::SourceQuery(_) => "source_query",
            ReportError::StorageConflict(_) => "storage_conflict",
            ReportError::Storage(_) => "storage",
            ReportError::NotFound(_) => "not_found",
        }
    }
}

impl From<DbError> for ReportError {
    fn from(err: DbError) -> Self {
        // A lock held past the busy timeout is a write race, not a broken
        // store; classify it retryable so the scheduler's fixed-delay
        // attempts apply.
        match err {
            DbError::Sqlite(rusqlite::Error::SqliteFailure(e, msg))
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                ReportError::StorageConflict(msg.unwrap_or_else(|| e.to_string()))
            }
            other => ReportError::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_ceilings_are_retryable() {
        assert!(ReportError::SourceTimeout(180).is_retryable());
        assert!(ReportError::SourceResourceExceeded("memory".into()).is_retryable());
        assert!(ReportError::Network("connection reset".into()).is_retryable());
        assert!(ReportError::StorageConflict("busy".into()).is_retryable());
    }

    #[test]
    fn configuration_errors_are_not_retryable() {
        assert!(!ReportError::Configuration("missing org scope".into()).is_retryable());
        assert!(!ReportError::SchemaMismatch("load_status".into()).is_retryable());
        assert!(!ReportError::NotFound("report".into()).is_retryable());
    }

    #[test]
    fn busy_database_maps_to_retryable_conflict() {
        let busy = DbError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        ));
        let err = ReportError::from(busy);
        assert!(matches!(err, ReportError::StorageConflict(_)));
        assert!(err.is_retryable());

        let locked = DbError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
            None,
        ));
        assert!(ReportError::from(locked).is_retryable());

        // Any other sqlite failure stays a plain storage error.
        let corrupt = DbError::Migration("bad baseline".into());
        let err = ReportError::from(corrupt);
        assert!(matches!(err, ReportError::Storage(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn categories_are_stable() {
        assert_eq!(ReportError::SourceTimeout(10).category(), "source_timeout");
        assert_eq!(
            ReportError::SchemaMismatch("x".into()).category(),
            "schema_mismatch"
        );
    }
}
