use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use super::error::AuthError;
use super::Authenticator;

/// Tokens this close to their expiry are refreshed before use rather than
/// waiting for the API to reject them.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Bearer token issued for one account/device pair.
#[derive(Clone)]
pub struct Session {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub account: String,
    pub device_id: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("account", &self.account)
            .field("device_id", &self.device_id)
            .finish()
    }
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_some_and(|exp| exp - Duration::seconds(EXPIRY_MARGIN_SECS) <= now)
    }
}

/// A token handed to one request, tagged with the session generation it
/// came from so a later 401 can tell whether someone already refreshed.
#[derive(Clone)]
pub struct TokenLease {
    pub token: String,
    pub generation: u64,
}

impl std::fmt::Debug for TokenLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenLease")
            .field("token", &"<redacted>")
            .field("generation", &self.generation)
            .finish()
    }
}

struct SessionState {
    session: Session,
    generation: u64,
}

/// Session shared by the manifest fetcher and every download worker.
///
/// Requests take a read lock just long enough to copy the token. A refresh
/// holds the write lock for the whole re-authentication, so every worker
/// that wants a token waits until it completes.
pub struct SessionHandle {
    authenticator: Arc<dyn Authenticator>,
    state: RwLock<SessionState>,
}

pub type SharedSession = Arc<SessionHandle>;

impl SessionHandle {
    /// Authenticate once and wrap the result for sharing.
    pub async fn login(authenticator: Arc<dyn Authenticator>) -> Result<SharedSession, AuthError> {
        let session = authenticator.authenticate().await?;
        tracing::debug!(session = ?session, "Session established");
        Ok(Arc::new(Self {
            authenticator,
            state: RwLock::new(SessionState {
                session,
                generation: 0,
            }),
        }))
    }

    pub async fn account(&self) -> String {
        self.state.read().await.session.account.clone()
    }

    /// Number of re-authentications performed since login.
    pub async fn generation(&self) -> u64 {
        self.state.read().await.generation
    }

    /// Current token, refreshed first if it is known to have expired.
    pub async fn lease(&self) -> Result<TokenLease, AuthError> {
        let stale = {
            let state = self.state.read().await;
            if !state.session.is_expired(Utc::now()) {
                return Ok(TokenLease {
                    token: state.session.token.clone(),
                    generation: state.generation,
                });
            }
            tracing::debug!("Session token expired, refreshing before use");
            state.generation
        };
        self.refresh(stale).await
    }

    /// Replace the token after a request made with generation `stale` was
    /// rejected. Concurrent callers holding the same stale generation share
    /// a single re-authentication.
    pub async fn refresh(&self, stale: u64) -> Result<TokenLease, AuthError> {
        let mut state = self.state.write().await;
        if state.generation != stale {
            tracing::debug!(
                generation = state.generation,
                "Session already refreshed by another request"
            );
            return Ok(TokenLease {
                token: state.session.token.clone(),
                generation: state.generation,
            });
        }

        tracing::info!("Session rejected, re-authenticating...");
        let session = self.authenticator.authenticate().await?;
        state.session = session;
        state.generation += 1;
        tracing::info!("Re-authentication successful");
        Ok(TokenLease {
            token: state.session.token.clone(),
            generation: state.generation,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Issues `token-1`, `token-2`, ... and counts logins. Fails every call
    /// after `fail_after` successes when set.
    pub(crate) struct CountingAuthenticator {
        pub calls: AtomicU32,
        pub fail_after: Option<u32>,
        pub expires_at: Option<DateTime<Utc>>,
    }

    impl CountingAuthenticator {
        pub fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_after: None,
                expires_at: None,
            }
        }

        pub fn failing_after(successes: u32) -> Self {
            Self {
                fail_after: Some(successes),
                ..Self::new()
            }
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Authenticator for CountingAuthenticator {
        async fn authenticate(&self) -> Result<Session, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_after.is_some_and(|limit| n > limit) {
                return Err(AuthError::InvalidCredentials("password changed".into()));
            }
            tokio::task::yield_now().await;
            Ok(Session {
                token: format!("token-{}", n),
                expires_at: self.expires_at,
                account: "user@gmail.com".into(),
                device_id: "0123456789abcdef".into(),
            })
        }
    }

    #[tokio::test]
    async fn login_authenticates_once() {
        let auth = Arc::new(CountingAuthenticator::new());
        let handle = SessionHandle::login(auth.clone()).await.unwrap();
        let lease = handle.lease().await.unwrap();
        assert_eq!(lease.token, "token-1");
        assert_eq!(lease.generation, 0);
        assert_eq!(auth.calls(), 1);
    }

    #[tokio::test]
    async fn refresh_with_current_generation_reauthenticates() {
        let auth = Arc::new(CountingAuthenticator::new());
        let handle = SessionHandle::login(auth.clone()).await.unwrap();
        let lease = handle.refresh(0).await.unwrap();
        assert_eq!(lease.token, "token-2");
        assert_eq!(lease.generation, 1);
        assert_eq!(handle.generation().await, 1);
        assert_eq!(auth.calls(), 2);
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_login() {
        let auth = Arc::new(CountingAuthenticator::new());
        let handle = SessionHandle::login(auth.clone()).await.unwrap();

        let refreshes: Vec<_> = (0..8)
            .map(|_| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.refresh(0).await })
            })
            .collect();
        for r in refreshes {
            let lease = r.await.unwrap().unwrap();
            assert_eq!(lease.token, "token-2");
        }
        assert_eq!(auth.calls(), 2);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_session() {
        let auth = Arc::new(CountingAuthenticator::failing_after(1));
        let handle = SessionHandle::login(auth.clone()).await.unwrap();
        let err = handle.refresh(0).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials(_)));
        assert_eq!(handle.generation().await, 0);
    }

    #[tokio::test]
    async fn expired_session_is_refreshed_on_lease() {
        let auth = Arc::new(CountingAuthenticator {
            expires_at: Some(Utc::now() - Duration::seconds(5)),
            ..CountingAuthenticator::new()
        });
        let handle = SessionHandle::login(auth.clone()).await.unwrap();
        let lease = handle.lease().await.unwrap();
        assert_eq!(lease.token, "token-2");
        assert_eq!(auth.calls(), 2);
    }

    #[test]
    fn expiry_margin_applies() {
        let now = Utc::now();
        let mut session = Session {
            token: "t".into(),
            expires_at: None,
            account: "a".into(),
            device_id: "d".into(),
        };
        assert!(!session.is_expired(now));
        session.expires_at = Some(now + Duration::seconds(30));
        assert!(session.is_expired(now));
        session.expires_at = Some(now + Duration::seconds(3600));
        assert!(!session.is_expired(now));
    }

    #[test]
    fn debug_redacts_token() {
        let session = Session {
            token: "ya29.secret".into(),
            expires_at: None,
            account: "a".into(),
            device_id: "d".into(),
        };
        assert!(!format!("{:?}", session).contains("secret"));
    }
}
