//! Google account authentication for the WhatsApp backup API.
//!
//! Two form posts against the Android login service: the account password
//! is exchanged for a long-lived master token, which is then exchanged for
//! a short-lived bearer token scoped to WhatsApp's Drive app-data folder.

pub mod endpoints;
pub mod error;
pub mod responses;
pub mod session;
pub mod signature;

use async_trait::async_trait;
use reqwest::header::{ACCEPT_ENCODING, USER_AGENT};
use reqwest::Client;

use crate::retry::{retry_with_backoff, RetryAction, RetryConfig};

use self::endpoints::{
    Endpoints, AUTH_USER_AGENT, DRIVE_APPDATA_SCOPE, GMS_CLIENT_SIG, WHATSAPP_APP,
    WHATSAPP_CLIENT_SIG,
};
use self::error::AuthError;
use self::responses::AuthResponse;
pub use self::session::{Session, SessionHandle, SharedSession};

/// Anything that can produce a fresh [`Session`].
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self) -> Result<Session, AuthError>;
}

/// What the account proves its identity with.
#[derive(Clone)]
pub enum Secret {
    Password(String),
    /// `aas_et/...` token from an earlier master login; skips step one.
    MasterToken(String),
}

#[derive(Clone)]
pub struct Credentials {
    pub account: String,
    pub secret: Secret,
    /// Android ID of the phone that made the backup (16 hex digits).
    pub device_id: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secret = match self.secret {
            Secret::Password(_) => "<password redacted>",
            Secret::MasterToken(_) => "<master token redacted>",
        };
        f.debug_struct("Credentials")
            .field("account", &self.account)
            .field("secret", &secret)
            .field("device_id", &self.device_id)
            .finish()
    }
}

/// Authenticator speaking the Google Play Services login protocol.
pub struct GoogleAuthenticator {
    client: Client,
    endpoints: Endpoints,
    credentials: Credentials,
    retry: RetryConfig,
}

impl GoogleAuthenticator {
    pub fn new(
        client: Client,
        endpoints: Endpoints,
        credentials: Credentials,
        retry: RetryConfig,
    ) -> Self {
        Self {
            client,
            endpoints,
            credentials,
            retry,
        }
    }

    async fn post_form(&self, form: &[(&str, &str)]) -> Result<AuthResponse, AuthError> {
        let resp = self
            .client
            .post(&self.endpoints.auth)
            .header(USER_AGENT, AUTH_USER_AGENT)
            .header(ACCEPT_ENCODING, "identity")
            .form(form)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if status.is_server_error() {
            return Err(AuthError::Network(format!("login service returned {}", status)));
        }
        // 403 bodies still carry Error=..., so only give up on the status
        // when the body has nothing to say.
        let parsed = AuthResponse::parse(&body);
        if !status.is_success() && parsed.get("Error").is_none() {
            return Err(AuthError::Protocol(format!("login service returned {}", status)));
        }
        Ok(parsed)
    }

    async fn master_login(&self, password: &str) -> Result<String, AuthError> {
        let encrypted = signature::encrypt_password(&self.credentials.account, password)?;
        tracing::debug!(account = %self.credentials.account, "Requesting master token");
        let form = [
            ("accountType", "HOSTED_OR_GOOGLE"),
            ("Email", self.credentials.account.as_str()),
            ("has_permission", "1"),
            ("add_account", "1"),
            ("EncryptedPasswd", encrypted.as_str()),
            ("service", "ac2dm"),
            ("source", "android"),
            ("androidId", self.credentials.device_id.as_str()),
            ("device_country", "us"),
            ("operatorCountry", "us"),
            ("lang", "en"),
            ("sdk_version", "17"),
            ("client_sig", GMS_CLIENT_SIG),
            ("callerSig", GMS_CLIENT_SIG),
            ("droidguard_results", "dummy123"),
        ];
        self.post_form(&form).await?.master_token()
    }

    async fn oauth(&self, master_token: &str) -> Result<Session, AuthError> {
        tracing::debug!("Exchanging master token for a Drive token");
        let form = [
            ("accountType", "HOSTED_OR_GOOGLE"),
            ("Email", self.credentials.account.as_str()),
            ("has_permission", "1"),
            ("EncryptedPasswd", master_token),
            ("service", DRIVE_APPDATA_SCOPE),
            ("source", "android"),
            ("androidId", self.credentials.device_id.as_str()),
            ("app", WHATSAPP_APP),
            ("client_sig", WHATSAPP_CLIENT_SIG),
            ("device_country", "us"),
            ("operatorCountry", "us"),
            ("lang", "en"),
            ("sdk_version", "17"),
        ];
        let (token, expires_at) = self.post_form(&form).await?.oauth_token()?;
        Ok(Session {
            token,
            expires_at,
            account: self.credentials.account.clone(),
            device_id: self.credentials.device_id.clone(),
        })
    }
}

fn classify(e: &AuthError) -> RetryAction {
    if e.is_retryable() {
        RetryAction::Retry
    } else {
        RetryAction::Abort
    }
}

#[async_trait]
impl Authenticator for GoogleAuthenticator {
    async fn authenticate(&self) -> Result<Session, AuthError> {
        let master_token = match &self.credentials.secret {
            Secret::MasterToken(token) => token.clone(),
            Secret::Password(password) => {
                retry_with_backoff(&self.retry, classify, || self.master_login(password)).await?
            }
        };
        let session =
            retry_with_backoff(&self.retry, classify, || self.oauth(&master_token)).await?;
        tracing::info!(account = %session.account, "Authenticated with Google");
        Ok(session)
    }
}
