use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};

use super::endpoints::UNLOCK_CAPTCHA_URL;
use super::error::AuthError;

/// Parsed `Key=Value` body returned by the Android login endpoint.
#[derive(Debug, Default)]
pub struct AuthResponse {
    fields: HashMap<String, String>,
}

impl AuthResponse {
    /// One field per line, split on the first `=`. Lines without `=` are ignored.
    pub fn parse(body: &str) -> Self {
        let fields = body
            .lines()
            .filter_map(|line| line.trim().split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self { fields }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Map an `Error=` field onto the auth taxonomy, if present.
    pub fn error(&self) -> Option<AuthError> {
        let error = self.get("Error")?;
        Some(match error {
            "NeedsBrowser" => AuthError::ChallengeRequired {
                url: self.get("Url").unwrap_or(UNLOCK_CAPTCHA_URL).to_string(),
            },
            "BadAuthentication" => AuthError::InvalidCredentials(
                "Google rejected the account or password (an app password may be required)".into(),
            ),
            other => AuthError::InvalidCredentials(other.to_string()),
        })
    }

    /// Master token (`Token=aas_et/...`) from step one of the login.
    pub fn master_token(&self) -> Result<String, AuthError> {
        if let Some(e) = self.error() {
            return Err(e);
        }
        self.get("Token")
            .map(str::to_string)
            .ok_or_else(|| AuthError::Protocol("master login returned no Token".into()))
    }

    /// Bearer token and optional expiry from the OAuth step.
    pub fn oauth_token(&self) -> Result<(String, Option<DateTime<Utc>>), AuthError> {
        if let Some(e) = self.error() {
            return Err(e);
        }
        let token = self
            .get("Auth")
            .ok_or_else(|| AuthError::Protocol("OAuth exchange returned no Auth token".into()))?;
        let expiry = self
            .get("Expiry")
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single());
        Ok((token.to_string(), expiry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_master_token() {
        let resp = AuthResponse::parse("SID=BAD\nLSID=BAD\nToken=aas_et/abc=def\nservices=mail\n");
        assert_eq!(resp.master_token().unwrap(), "aas_et/abc=def");
    }

    #[test]
    fn parses_oauth_token_with_expiry() {
        let resp = AuthResponse::parse("issueAdvice=auto\nExpiry=1700000000\nAuth=ya29.token\n");
        let (token, expiry) = resp.oauth_token().unwrap();
        assert_eq!(token, "ya29.token");
        assert_eq!(expiry.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn oauth_without_expiry() {
        let resp = AuthResponse::parse("Auth=ya29.token");
        let (_, expiry) = resp.oauth_token().unwrap();
        assert!(expiry.is_none());
    }

    #[test]
    fn bad_authentication_is_invalid_credentials() {
        let resp = AuthResponse::parse("Error=BadAuthentication\n");
        assert!(matches!(
            resp.master_token(),
            Err(AuthError::InvalidCredentials(_))
        ));
    }

    #[test]
    fn needs_browser_carries_url() {
        let resp = AuthResponse::parse(
            "Error=NeedsBrowser\nUrl=https://accounts.google.com/signin/continue?sarp=1\n",
        );
        match resp.master_token() {
            Err(AuthError::ChallengeRequired { url }) => {
                assert_eq!(url, "https://accounts.google.com/signin/continue?sarp=1")
            }
            other => panic!("expected challenge, got {:?}", other),
        }
    }

    #[test]
    fn needs_browser_without_url_falls_back_to_unlock_page() {
        let resp = AuthResponse::parse("Error=NeedsBrowser\n");
        match resp.oauth_token() {
            Err(AuthError::ChallengeRequired { url }) => assert_eq!(url, UNLOCK_CAPTCHA_URL),
            other => panic!("expected challenge, got {:?}", other),
        }
    }

    #[test]
    fn missing_token_is_protocol_error() {
        let resp = AuthResponse::parse("<html>oops</html>");
        assert!(matches!(resp.master_token(), Err(AuthError::Protocol(_))));
    }
}
