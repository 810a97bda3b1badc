//! Error types for the resume ledger.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during ledger operations.
///
/// Any of these aborts a download run: progress that can't be recorded
/// would be downloaded again, or worse, trusted without verification.
#[derive(Error, Debug)]
pub enum StateError {
    /// Failed to open or create the database file.
    #[error("Failed to open ledger at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// Another process holds the exclusive lock on this destination.
    #[error(
        "Ledger at {path} is locked by another wabackup-rs process using the same destination"
    )]
    Locked { path: PathBuf },

    /// Failed to run a database migration.
    #[error("Ledger migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    /// A query failed.
    #[error("Ledger query failed: {0}")]
    Query(String),

    /// Failed to spawn a blocking task.
    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    /// The database schema version is newer than supported.
    #[error("Ledger schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },
}

impl StateError {
    /// Create a Query error from a rusqlite error.
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }

    /// Classify an error raised while opening `path`.
    pub fn opening(path: PathBuf, source: rusqlite::Error) -> Self {
        match source.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                Self::Locked { path }
            }
            _ => Self::Open { path, source },
        }
    }
}
