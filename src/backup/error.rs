use std::time::Duration;

use thiserror::Error;

/// A single backup API request failed.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The bearer token was rejected; the session must be refreshed.
    #[error("Backup API rejected the session token (HTTP 401)")]
    Unauthorized,

    #[error("Backup API is throttling requests (HTTP {status})")]
    Throttled {
        status: u16,
        retry_after: Option<Duration>,
    },

    #[error("Backup API returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed backup API response: {0}")]
    Malformed(String),
}

impl ApiError {
    /// Transport failures, throttling and 5xx are transient. 401 is handled
    /// by re-authentication, not by retrying the same token.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Network(_) | ApiError::Throttled { .. } => true,
            ApiError::Status { status, .. } => *status >= 500,
            ApiError::Unauthorized | ApiError::Malformed(_) => false,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::Malformed(e.to_string())
        } else {
            ApiError::Network(e.to_string())
        }
    }
}
