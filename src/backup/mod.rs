//! Client for the backup-restore API that stores WhatsApp's Drive backups.

pub mod error;
pub mod manifest;
pub mod types;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;

use self::error::ApiError;
use self::types::{BackupPage, FilePage};

/// Body of an object fetch. `start_offset` is where the server says the
/// returned bytes begin, which may differ from the offset requested.
pub struct ObjectBody {
    pub start_offset: u64,
    pub stream: BoxStream<'static, Result<Bytes, ApiError>>,
}

/// The three backup API calls the engine needs.
#[async_trait]
pub trait BackupApi: Send + Sync {
    async fn list_backups(
        &self,
        token: &str,
        page_token: Option<&str>,
    ) -> Result<BackupPage, ApiError>;

    async fn list_files(
        &self,
        token: &str,
        backup_name: &str,
        page_token: Option<&str>,
    ) -> Result<FilePage, ApiError>;

    /// Fetch `key` starting at byte `offset` (a ranged request when non-zero).
    async fn fetch_object(&self, token: &str, key: &str, offset: u64)
        -> Result<ObjectBody, ApiError>;
}

pub struct HttpBackupApi {
    client: Client,
    root: String,
}

impl HttpBackupApi {
    pub fn new(client: Client, root: impl Into<String>) -> Self {
        Self {
            client,
            root: root.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        token: &str,
        page_token: Option<&str>,
    ) -> Result<T, ApiError> {
        let mut request = self.client.get(url).bearer_auth(token);
        if let Some(page_token) = page_token {
            request = request.query(&[("pageToken", page_token)]);
        }
        let resp = check_status(request.send().await?, url)?;
        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| ApiError::Malformed(format!("{}: {}", url, e)))
    }
}

/// Object keys are used verbatim as URL paths, except for characters the
/// URL parser would otherwise treat as syntax.
fn escape_key(key: &str) -> String {
    let mut escaped = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '+' => escaped.push_str("%2B"),
            '#' => escaped.push_str("%23"),
            '?' => escaped.push_str("%3F"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn check_status(resp: Response, url: &str) -> Result<Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    tracing::debug!(status = status.as_u16(), url, "Backup API request failed");
    Err(match status {
        StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => ApiError::Throttled {
            status: status.as_u16(),
            retry_after: retry_after(&resp),
        },
        _ => ApiError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        },
    })
}

/// First byte position from `Content-Range: bytes <start>-<end>/<total>`.
fn content_range_start(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

#[async_trait]
impl BackupApi for HttpBackupApi {
    async fn list_backups(
        &self,
        token: &str,
        page_token: Option<&str>,
    ) -> Result<BackupPage, ApiError> {
        let url = format!("{}/clients/wa/backups", self.root);
        self.get_json(&url, token, page_token).await
    }

    async fn list_files(
        &self,
        token: &str,
        backup_name: &str,
        page_token: Option<&str>,
    ) -> Result<FilePage, ApiError> {
        let url = format!("{}/{}/files", self.root, escape_key(backup_name));
        self.get_json(&url, token, page_token).await
    }

    async fn fetch_object(
        &self,
        token: &str,
        key: &str,
        offset: u64,
    ) -> Result<ObjectBody, ApiError> {
        let url = format!("{}/{}?alt=media", self.root, escape_key(key));
        let mut request = self.client.get(&url).bearer_auth(token);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        let resp = check_status(request.send().await?, &url)?;

        let start_offset = if resp.status() == StatusCode::PARTIAL_CONTENT {
            resp.headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(content_range_start)
                .ok_or_else(|| {
                    ApiError::Malformed(format!("{}: 206 without a usable Content-Range", url))
                })?
        } else {
            0
        };
        tracing::debug!(key, offset, start_offset, "Object fetch started");

        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ApiError::Network(e.to_string())))
            .boxed();
        Ok(ObjectBody {
            start_offset,
            stream,
        })
    }
}
