use thiserror::Error;

/// Failures while exchanging account credentials for a session token.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Google rejected the account/password (or master token). Retrying
    /// with the same credentials cannot succeed.
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Google wants an interactive verification step before it will issue
    /// a token for this device.
    #[error(
        "Google requires a browser challenge before issuing a token.\n\
         Open {url} , complete the verification, then run the command again."
    )]
    ChallengeRequired { url: String },

    #[error("Network error during login: {0}")]
    Network(String),

    /// The login endpoint answered with something we could not interpret.
    #[error("Unexpected login response: {0}")]
    Protocol(String),
}

impl AuthError {
    /// Only transport-level failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::Network(_))
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        AuthError::Network(e.to_string())
    }
}
