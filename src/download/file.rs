//! Single-object transfer: ranged fetch, append to a `.part` file with
//! incremental MD5, periodic checkpoints, final size/hash check, rename.

use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use md5::{Digest, Md5};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::error::TransferError;
use super::DownloadTask;
use crate::auth::SessionHandle;
use crate::backup::error::ApiError;
use crate::backup::BackupApi;
use crate::retry::{RetryConfig, Throttle};
use crate::state::{LedgerUpdate, ResumeLedger};

const READ_BUF_SIZE: usize = 64 * 1024;

/// Everything a worker shares with the rest of the run.
pub(crate) struct TransferContext<'a> {
    pub api: &'a dyn BackupApi,
    pub session: &'a SessionHandle,
    pub ledger: &'a dyn ResumeLedger,
    pub throttle: &'a Throttle,
    pub retry: &'a RetryConfig,
    pub throttle_pause: Duration,
    pub checkpoint_bytes: u64,
    pub cancel: &'a CancellationToken,
}

/// Local bytes and hash state for one attempt.
struct PartFile {
    file: File,
    hasher: Md5,
    written: u64,
}

fn hex_digest(hasher: &Md5) -> String {
    hex::encode(hasher.clone().finalize())
}

/// Hash the first `len` bytes of `path`. `None` if the file is missing or
/// shorter than `len`.
async fn hash_prefix(path: &Path, len: u64) -> Result<Option<Md5>, TransferError> {
    let mut file = match File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut hasher = Md5::new();
    let mut remaining = len;
    let mut buf = vec![0u8; READ_BUF_SIZE];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            return Ok(None);
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(Some(hasher))
}

/// Open the `.part` file positioned at the task's offset, re-checking the
/// bytes already there against the recorded prefix hash. Anything that
/// doesn't check out restarts the object from zero.
async fn open_part(task: &mut DownloadTask) -> Result<PartFile, TransferError> {
    if task.offset > 0 {
        if let Some(expected) = task.prefix_md5.as_deref() {
            match hash_prefix(&task.part_path, task.offset).await? {
                Some(hasher) if hex_digest(&hasher) == expected => {
                    let mut file = OpenOptions::new()
                        .write(true)
                        .open(&task.part_path)
                        .await?;
                    // Bytes past the checkpoint were never recorded.
                    file.set_len(task.offset).await?;
                    file.seek(SeekFrom::Start(task.offset)).await?;
                    tracing::debug!(key = %task.object.key, offset = task.offset, "Resuming partial download");
                    return Ok(PartFile {
                        file,
                        hasher,
                        written: task.offset,
                    });
                }
                _ => {
                    tracing::warn!(
                        key = %task.object.key,
                        offset = task.offset,
                        "Partial data does not match its checkpoint, restarting from zero"
                    );
                }
            }
        }
    }

    task.offset = 0;
    task.prefix_md5 = None;
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&task.part_path)
        .await?;
    Ok(PartFile {
        file,
        hasher: Md5::new(),
        written: 0,
    })
}

/// Make the bytes written so far durable, then record them.
async fn checkpoint(
    ctx: &TransferContext<'_>,
    task: &mut DownloadTask,
    part: &mut PartFile,
) -> Result<(), TransferError> {
    part.file.flush().await?;
    part.file.sync_data().await?;
    let prefix = hex_digest(&part.hasher);
    ctx.ledger
        .record(
            &task.object,
            &LedgerUpdate::checkpoint(part.written, prefix.clone(), task.attempts),
        )
        .await?;
    task.offset = part.written;
    task.prefix_md5 = Some(prefix);
    Ok(())
}

/// One fetch from `part.written` to the end of the body.
async fn stream_body(
    ctx: &TransferContext<'_>,
    task: &mut DownloadTask,
    part: &mut PartFile,
    token: &str,
) -> Result<(), AttemptError> {
    let body = ctx
        .api
        .fetch_object(token, &task.object.key, part.written)
        .await?;
    if body.start_offset != part.written {
        return Err(TransferError::RangeMismatch {
            requested: part.written,
            returned: body.start_offset,
        }
        .into());
    }

    let mut stream = body.stream;
    let mut since_checkpoint = 0u64;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(TransferError::Cancelled.into()),
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk?;

        part.file
            .write_all(&chunk)
            .await
            .map_err(TransferError::from)?;
        part.hasher.update(&chunk);
        part.written += chunk.len() as u64;
        task.received += chunk.len() as u64;
        since_checkpoint += chunk.len() as u64;

        if part.written > task.object.size {
            return Err(TransferError::SizeMismatch {
                expected: task.object.size,
                actual: part.written,
            }
            .into());
        }
        if since_checkpoint >= ctx.checkpoint_bytes {
            checkpoint(ctx, task, part).await?;
            since_checkpoint = 0;
        }
    }
    Ok(())
}

/// Failure of a single fetch, before deciding whether to try again.
enum AttemptError {
    Api(ApiError),
    Transfer(TransferError),
}

impl From<ApiError> for AttemptError {
    fn from(e: ApiError) -> Self {
        AttemptError::Api(e)
    }
}

impl From<TransferError> for AttemptError {
    fn from(e: TransferError) -> Self {
        AttemptError::Transfer(e)
    }
}

/// Fetch until the body is exhausted, re-fetching from the current offset
/// after transient failures and refreshing the session once per rejection.
async fn receive(
    ctx: &TransferContext<'_>,
    task: &mut DownloadTask,
    part: &mut PartFile,
) -> Result<(), TransferError> {
    let mut failures = 0u32;
    let mut reauthenticated = false;

    while part.written < task.object.size || task.object.size == 0 {
        if ctx.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        ctx.throttle.wait().await;
        let lease = ctx.session.lease().await?;
        let before = part.written;

        let err = match stream_body(ctx, task, part, &lease.token).await {
            Ok(()) => return Ok(()),
            Err(AttemptError::Transfer(e)) => return Err(e),
            Err(AttemptError::Api(e)) => e,
        };

        if part.written > before {
            failures = 0;
            reauthenticated = false;
        }
        match err {
            ApiError::Unauthorized if reauthenticated => return Err(TransferError::Unauthorized),
            ApiError::Unauthorized => {
                tracing::warn!(key = %task.object.key, "Session token rejected mid-transfer");
                ctx.session.refresh(lease.generation).await?;
                reauthenticated = true;
                continue;
            }
            ApiError::Throttled { retry_after, .. } => {
                ctx.throttle
                    .signal(retry_after.unwrap_or(ctx.throttle_pause))
                    .await;
            }
            ref e if e.is_retryable() => {}
            other => return Err(TransferError::Api(other.to_string())),
        }

        failures += 1;
        if failures > ctx.retry.max_retries {
            return Err(TransferError::Network(err.to_string()));
        }
        let delay = ctx.retry.delay_for_retry(failures - 1);
        tracing::warn!(
            key = %task.object.key,
            offset = part.written,
            "Transfer interrupted (attempt {}/{}), retrying in {}ms: {}",
            failures,
            ctx.retry.max_retries + 1,
            delay.as_millis(),
            err
        );
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(TransferError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
    Ok(())
}

/// Drive one object from its current offset to a verified file at
/// `task.local_path`. On failure `task.offset` / `task.prefix_md5` say
/// where the next attempt can pick up.
pub(crate) async fn transfer(
    ctx: &TransferContext<'_>,
    task: &mut DownloadTask,
) -> Result<(), TransferError> {
    if let Some(parent) = task.part_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut part = open_part(task).await?;
    ctx.ledger
        .record(
            &task.object,
            &LedgerUpdate::checkpoint(part.written, hex_digest(&part.hasher), task.attempts),
        )
        .await?;

    let result = receive(ctx, task, &mut part).await;
    part.file.flush().await?;

    if let Err(e) = result {
        if e.discards_progress() {
            discard(task).await;
        } else if !matches!(e, TransferError::Ledger(_)) && part.written > task.offset {
            // Keep whatever arrived before the interruption.
            checkpoint(ctx, task, &mut part).await?;
        }
        return Err(e);
    }
    drop(part.file);

    let expected = task.object.md5_hex();
    if part.written != task.object.size {
        discard(task).await;
        return Err(TransferError::SizeMismatch {
            expected: task.object.size,
            actual: part.written,
        });
    }
    let actual = hex::encode(part.hasher.finalize());
    if actual != expected {
        discard(task).await;
        return Err(TransferError::HashMismatch { expected, actual });
    }

    fs::rename(&task.part_path, &task.local_path).await?;
    task.offset = task.object.size;
    task.prefix_md5 = Some(actual);
    Ok(())
}

async fn discard(task: &mut DownloadTask) {
    task.offset = 0;
    task.prefix_md5 = None;
    if let Err(e) = fs::remove_file(&task.part_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(
                "Could not remove {}: {}",
                task.part_path.display(),
                e
            );
        }
    }
}
