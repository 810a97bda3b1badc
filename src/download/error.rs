use thiserror::Error;

use crate::auth::error::AuthError;
use crate::state::error::StateError;

/// Why one object's transfer stopped.
///
/// Most variants are per-object: the scheduler retries or gives up on that
/// object and the run continues. [`TransferError::is_run_fatal`] marks the
/// ones that stop the whole run.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The server answered a ranged request with bytes from another offset.
    #[error("Server returned data from offset {returned}, requested {requested}")]
    RangeMismatch { requested: u64, returned: u64 },

    #[error("Size mismatch: expected {expected} bytes, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("MD5 mismatch: expected {expected}, computed {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Transient failures that outlasted the network retry budget.
    #[error("Network error: {0}")]
    Network(String),

    /// A non-retryable API answer (404, unusable headers).
    #[error("Backup API error: {0}")]
    Api(String),

    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),

    /// Rejected again right after re-authenticating.
    #[error("Session token rejected after re-authentication")]
    Unauthorized,

    #[error("Re-authentication failed: {0}")]
    Reauth(#[from] AuthError),

    #[error("Could not record progress: {0}")]
    Ledger(#[from] StateError),

    #[error("Cancelled")]
    Cancelled,
}

impl TransferError {
    /// Short stable name used in the run summary.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::RangeMismatch { .. } => "range-mismatch",
            TransferError::SizeMismatch { .. } => "size-mismatch",
            TransferError::HashMismatch { .. } => "hash-mismatch",
            TransferError::Network(_) => "network",
            TransferError::Api(_) => "api",
            TransferError::Disk(_) => "disk",
            TransferError::Unauthorized => "unauthorized",
            TransferError::Reauth(_) => "auth",
            TransferError::Ledger(_) => "ledger",
            TransferError::Cancelled => "cancelled",
        }
    }

    /// Errors that abort the whole run instead of just this object.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            TransferError::Unauthorized | TransferError::Reauth(_) | TransferError::Ledger(_)
        )
    }

    /// Worth another attempt at the object level.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::SizeMismatch { .. }
                | TransferError::HashMismatch { .. }
                | TransferError::Network(_)
        )
    }

    /// The bytes on disk can't be trusted, or the server won't resume
    /// from them; the next attempt starts at zero.
    pub fn discards_progress(&self) -> bool {
        matches!(
            self,
            TransferError::SizeMismatch { .. }
                | TransferError::HashMismatch { .. }
                | TransferError::RangeMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_mismatch_is_final_for_object_only() {
        let e = TransferError::RangeMismatch {
            requested: 50,
            returned: 0,
        };
        assert!(!e.is_retryable());
        assert!(!e.is_run_fatal());
        assert!(e.discards_progress());
        assert_eq!(e.kind(), "range-mismatch");
    }

    #[test]
    fn test_mismatches_retry_from_zero() {
        let size = TransferError::SizeMismatch {
            expected: 100,
            actual: 60,
        };
        let hash = TransferError::HashMismatch {
            expected: "a".into(),
            actual: "b".into(),
        };
        for e in [size, hash] {
            assert!(e.is_retryable());
            assert!(e.discards_progress());
        }
    }

    #[test]
    fn test_network_keeps_progress() {
        let e = TransferError::Network("reset".into());
        assert!(e.is_retryable());
        assert!(!e.discards_progress());
    }

    #[test]
    fn test_run_fatal_errors() {
        assert!(TransferError::Unauthorized.is_run_fatal());
        assert!(TransferError::Reauth(AuthError::InvalidCredentials("x".into())).is_run_fatal());
        assert!(TransferError::Ledger(StateError::Query("disk I/O error".into())).is_run_fatal());
        assert!(!TransferError::Disk(std::io::Error::other("disk full")).is_run_fatal());
        assert!(!TransferError::Cancelled.is_run_fatal());
    }
}
