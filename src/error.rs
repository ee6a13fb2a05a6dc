//! Error types for the indexing service.
//!
//! Structured errors via thiserror. Every variant carries a stable kind tag
//! (see [`ErrorKind`]) so tool-protocol consumers can dispatch on machine
//! readable strings while humans read the rendered message.

use std::path::PathBuf;
use thiserror::Error;

/// Stable, machine-readable tags for the error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigError,
    ParseWarning,
    StoreBusy,
    StoreIo,
    StoreCorrupt,
    QueryError,
    Cancelled,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigError => "config_error",
            Self::ParseWarning => "parse_warning",
            Self::StoreBusy => "store_busy",
            Self::StoreIo => "store_io",
            Self::StoreCorrupt => "store_corrupt",
            Self::QueryError => "query_error",
            Self::Cancelled => "cancelled",
            Self::Fatal => "fatal",
        }
    }
}

/// Errors from the cache backend.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The database stayed locked past the busy-handler deadline.
    #[error("Cache database is busy: {operation} did not complete within the lock deadline")]
    Busy { operation: &'static str },

    #[error("Cache I/O failure at '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Integrity check failed or the file is unreadable as a database.
    #[error("Cache is corrupted: {reason}")]
    Corrupt { reason: String },

    #[error("Cache database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to serialize cache field: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Busy { .. } => ErrorKind::StoreBusy,
            Self::Io { .. } => ErrorKind::StoreIo,
            Self::Corrupt { .. } => ErrorKind::StoreCorrupt,
            // SQLITE_BUSY surfaces through rusqlite when the busy handler
            // gives up; classify it with the transient tag.
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::DatabaseBusy
                    || err.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                ErrorKind::StoreBusy
            }
            Self::Sqlite(_) | Self::Serialize(_) => ErrorKind::StoreIo,
        }
    }
}

/// Errors from query and search operations.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Invalid search pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Unknown tool argument: {reason}")]
    InvalidArgument { reason: String },
}

impl QueryError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::QueryError
    }
}

/// Top-level error type for indexing operations.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Failed to read file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Per-file parser diagnostic. Stored and logged, never fatal to a run.
    #[error("Failed to parse '{path}': {message}")]
    Parse { path: PathBuf, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("Worker process failed: {reason}")]
    Worker { reason: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Fatal: {reason}")]
    Fatal { reason: String },
}

impl IndexError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } => ErrorKind::ConfigError,
            Self::FileRead { .. } => ErrorKind::StoreIo,
            Self::Parse { .. } => ErrorKind::ParseWarning,
            Self::Store(e) => e.kind(),
            Self::Query(e) => e.kind(),
            Self::Worker { .. } => ErrorKind::ParseWarning,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Fatal { .. } => ErrorKind::Fatal,
        }
    }

    /// Get recovery suggestions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::Config { .. } => vec![
                "Check .clangmap/settings.toml against `clangmap init` output",
                "Verify compile_commands.json is valid JSON",
            ],
            Self::Store(StoreError::Busy { .. }) => vec![
                "Another process holds the cache lock; the operation will be retried",
                "If this persists, check for a stale clangmap process",
            ],
            Self::Store(StoreError::Corrupt { .. }) => vec![
                "The cache will be restored from backup or rebuilt automatically",
                "Run 'clangmap index --force' to rebuild from scratch",
            ],
            Self::Worker { .. } => vec![
                "The file is marked failed and indexing continued",
                "Re-run 'clangmap refresh' to retry failed files",
            ],
            _ => vec![],
        }
    }
}

/// Result type alias for index operations.
pub type IndexResult<T> = Result<T, IndexError>;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for query operations.
pub type QueryResult<T> = Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        let e = IndexError::Config {
            reason: "bad".into(),
        };
        assert_eq!(e.kind().as_str(), "config_error");

        let e = IndexError::Store(StoreError::Busy { operation: "flush" });
        assert_eq!(e.kind().as_str(), "store_busy");

        let e = IndexError::Query(QueryError::InvalidPattern {
            pattern: "[".into(),
            reason: "unclosed".into(),
        });
        assert_eq!(e.kind().as_str(), "query_error");

        assert_eq!(IndexError::Cancelled.kind().as_str(), "cancelled");
    }

    #[test]
    fn parse_errors_are_warnings() {
        let e = IndexError::Parse {
            path: PathBuf::from("/p/broken.cpp"),
            message: "expected ';'".into(),
        };
        assert_eq!(e.kind(), ErrorKind::ParseWarning);
        assert!(e.to_string().contains("broken.cpp"));
    }
}
