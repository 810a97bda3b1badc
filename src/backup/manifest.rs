//! Manifest enumeration: every backup the account holds, then every file in
//! each selected backup, validated into [`RemoteObject`]s.

use std::collections::HashSet;
use std::future::Future;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

use super::error::ApiError;
use super::types::{Backup, FileEntry, ObjectKind, RemoteObject};
use super::BackupApi;
use crate::auth::error::AuthError;
use crate::auth::SessionHandle;
use crate::download::paths::relative_path_for_key;
use crate::retry::{retry_with_backoff, RetryAction, RetryConfig};

#[derive(Debug, Error)]
pub enum ManifestError {
    /// The token was rejected again right after a re-authentication.
    #[error("Session expired and was rejected again after re-authenticating")]
    ExpiredSession,

    #[error("Malformed manifest: {0}")]
    Malformed(String),

    #[error("Network error while listing backups: {0}")]
    Network(String),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl From<ApiError> for ManifestError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Unauthorized => ManifestError::ExpiredSession,
            ApiError::Malformed(msg) => ManifestError::Malformed(msg),
            other => ManifestError::Network(other.to_string()),
        }
    }
}

fn classify(e: &ApiError) -> RetryAction {
    if e.is_retryable() {
        RetryAction::Retry
    } else {
        RetryAction::Abort
    }
}

/// Run `op` with the current token; on 401 refresh the session once and try
/// again. A second 401 means the fresh token is no good either.
pub(crate) async fn with_session<T, F, Fut>(
    session: &SessionHandle,
    retry: &RetryConfig,
    op: F,
) -> Result<T, ManifestError>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let lease = session.lease().await?;
    match retry_with_backoff(retry, classify, || op(lease.token.clone())).await {
        Err(ApiError::Unauthorized) => {
            tracing::warn!("Backup API rejected the session token while listing");
            let lease = session.refresh(lease.generation).await?;
            retry_with_backoff(retry, classify, || op(lease.token.clone()))
                .await
                .map_err(ManifestError::from)
        }
        other => other.map_err(ManifestError::from),
    }
}

/// All backups on the account, in API order.
pub async fn list_backups(
    api: &dyn BackupApi,
    session: &SessionHandle,
    retry: &RetryConfig,
) -> Result<Vec<Backup>, ManifestError> {
    let mut backups = Vec::new();
    let mut page_token: Option<String> = None;
    loop {
        let page = with_session(session, retry, |token| {
            let page_token = page_token.clone();
            async move { api.list_backups(&token, page_token.as_deref()).await }
        })
        .await?;
        backups.extend(page.backups);
        match page.next_page_token.filter(|t| !t.is_empty()) {
            Some(next) => page_token = Some(next),
            None => break,
        }
    }
    tracing::debug!(count = backups.len(), "Listed backups");
    Ok(backups)
}

/// Keep backups whose id is in `wanted`; all of them when `wanted` is empty.
/// Unknown ids are an error so a typo doesn't silently download nothing.
pub fn select_backups(backups: Vec<Backup>, wanted: &[String]) -> Result<Vec<Backup>, String> {
    if wanted.is_empty() {
        return Ok(backups);
    }
    for id in wanted {
        if !backups.iter().any(|b| b.id() == id) {
            let available: Vec<&str> = backups.iter().map(Backup::id).collect();
            return Err(format!(
                "Backup '{}' not found. Available backups: {:?}",
                id, available
            ));
        }
    }
    Ok(backups
        .into_iter()
        .filter(|b| wanted.iter().any(|w| w == b.id()))
        .collect())
}

fn validate(entry: FileEntry) -> Result<RemoteObject, ManifestError> {
    let size = entry.size_bytes.ok_or_else(|| {
        ManifestError::Malformed(format!("{} has no usable sizeBytes", entry.name))
    })?;
    let encoded = entry
        .md5_hash
        .as_deref()
        .ok_or_else(|| ManifestError::Malformed(format!("{} has no md5Hash", entry.name)))?;
    let md5: [u8; 16] = BASE64
        .decode(encoded)
        .ok()
        .and_then(|raw| raw.try_into().ok())
        .ok_or_else(|| {
            ManifestError::Malformed(format!("{} has an invalid md5Hash {:?}", entry.name, encoded))
        })?;
    let relative_path = relative_path_for_key(&entry.name).map_err(ManifestError::Malformed)?;
    Ok(RemoteObject {
        kind: ObjectKind::from_key(&entry.name),
        key: entry.name,
        size,
        md5,
        relative_path,
    })
}

/// Every file of the given backups, in API order, without duplicates.
pub async fn fetch_manifest(
    api: &dyn BackupApi,
    session: &SessionHandle,
    retry: &RetryConfig,
    backups: &[Backup],
) -> Result<Vec<RemoteObject>, ManifestError> {
    let mut objects = Vec::new();
    let mut seen = HashSet::new();

    for backup in backups {
        let mut page_token: Option<String> = None;
        let mut pages = 0u32;
        loop {
            let page = with_session(session, retry, |token| {
                let page_token = page_token.clone();
                async move {
                    api.list_files(&token, &backup.name, page_token.as_deref())
                        .await
                }
            })
            .await?;
            pages += 1;

            for entry in page.files {
                let object = validate(entry)?;
                if seen.insert(object.key.clone()) {
                    objects.push(object);
                } else {
                    tracing::debug!(key = %object.key, "Duplicate manifest entry ignored");
                }
            }
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        tracing::debug!(backup = backup.id(), pages, "Listed backup files");
    }

    tracing::info!(objects = objects.len(), "Fetched manifest");
    Ok(objects)
}
