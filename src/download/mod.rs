//! Download engine: classify manifest objects against the resume ledger,
//! then drive every object that isn't already complete through a bounded
//! pool of concurrent transfers fed from a shared queue.

pub mod error;
pub mod file;
pub mod paths;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use self::error::TransferError;
use self::file::TransferContext;
use crate::auth::SessionHandle;
use crate::backup::types::{human_size, RemoteObject};
use crate::backup::BackupApi;
use crate::retry::{RetryConfig, Throttle};
use crate::state::error::StateError;
use crate::state::{
    classify, Classification, EntryStatus, LedgerUpdate, LocalState, ResumeLedger,
};

/// Subset of application config consumed by the download engine.
/// Decoupled from CLI parsing so the engine can be tested independently.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub directory: PathBuf,
    pub concurrency: usize,
    /// Attempts per object before it is reported as failed.
    pub max_attempts: u32,
    /// Backoff for transient network failures within one attempt.
    pub retry: RetryConfig,
    /// Pause applied to every worker after a throttling response that
    /// doesn't say how long to wait.
    pub throttle_pause: Duration,
    pub checkpoint_bytes: u64,
    pub no_progress_bar: bool,
    pub dry_run: bool,
}

/// One object owned by one worker until it reaches a terminal state.
#[derive(Debug)]
pub(crate) struct DownloadTask {
    pub object: RemoteObject,
    pub local_path: PathBuf,
    pub part_path: PathBuf,
    /// Bytes already on disk and recorded.
    pub offset: u64,
    /// Hex MD5 of those bytes.
    pub prefix_md5: Option<String>,
    /// Attempts made in this run.
    pub attempts: u32,
    /// Bytes received from the network in this run.
    pub received: u64,
}

impl DownloadTask {
    fn new(object: RemoteObject, directory: &Path, offset: u64, prefix_md5: Option<String>) -> Self {
        let local_path = paths::local_path(directory, &object.relative_path);
        let part_path = paths::part_path(&local_path);
        Self {
            object,
            local_path,
            part_path,
            offset,
            prefix_md5,
            attempts: 0,
            received: 0,
        }
    }
}

/// A manifest object together with what the ledger says to do with it.
#[derive(Debug, Clone)]
pub struct PlannedObject {
    pub object: RemoteObject,
    pub classification: Classification,
    /// Attempts recorded by the previous run, if any.
    pub previous_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct FailedObject {
    pub key: String,
    pub kind: &'static str,
    pub message: String,
}

/// Outcome of one pass over the manifest.
#[derive(Debug, Default)]
pub struct RunReport {
    pub downloaded: usize,
    pub skipped: usize,
    /// Objects that continued from a recorded checkpoint.
    pub resumed: usize,
    /// Objects handed to the worker pool (or that would be, in a dry run).
    pub queued: usize,
    pub failed: Vec<FailedObject>,
    pub bytes_transferred: u64,
    pub interrupted: bool,
    /// Highest number of objects in progress at the same time.
    pub peak_in_progress: usize,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.interrupted
    }
}

/// Errors that stop the whole run. Ledger state written so far is kept.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Download run aborted: {0}")]
    Aborted(TransferError),

    #[error(transparent)]
    Ledger(#[from] StateError),
}

/// Create a progress bar with a consistent template.
///
/// Returns `ProgressBar::hidden()` when the user passed `--no-progress-bar` or
/// stdout is not a TTY.
fn create_progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}

async fn file_len(path: &Path) -> Option<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Some(meta.len()),
        _ => None,
    }
}

/// Classify every object against the ledger and the files on disk.
pub async fn plan(
    objects: &[RemoteObject],
    ledger: &dyn ResumeLedger,
    directory: &Path,
) -> Result<Vec<PlannedObject>, StateError> {
    let mut planned = Vec::with_capacity(objects.len());
    for object in objects {
        let entry = ledger.lookup(&object.key).await?;
        let local_path = paths::local_path(directory, &object.relative_path);
        let local = LocalState {
            final_len: file_len(&local_path).await,
            part_len: file_len(&paths::part_path(&local_path)).await,
        };
        planned.push(PlannedObject {
            classification: classify(object, entry.as_ref(), local),
            previous_attempts: entry.map_or(0, |e| e.attempts),
            object: object.clone(),
        });
    }
    Ok(planned)
}

fn log_plan(planned: &[PlannedObject]) {
    for p in planned {
        match &p.classification {
            Classification::Skip => {
                tracing::info!("[DRY RUN] Complete: {}", p.object.key)
            }
            Classification::Resume { offset, .. } => tracing::info!(
                "[DRY RUN] Would resume {} at {} of {}",
                p.object.key,
                human_size(*offset),
                human_size(p.object.size)
            ),
            Classification::Fresh => tracing::info!(
                "[DRY RUN] Would download {} ({})",
                p.object.key,
                human_size(p.object.size)
            ),
        }
    }
}

/// Entry point for the download engine.
///
/// Objects already complete are recorded and skipped; the rest are queued
/// and transferred at most `config.concurrency` at a time. An object that
/// fails with a retryable error goes back on the queue until it has used
/// `config.max_attempts`. Run-fatal errors cancel the in-flight transfers,
/// which checkpoint their progress before the error is returned.
pub async fn download_objects(
    api: &dyn BackupApi,
    session: &SessionHandle,
    ledger: &dyn ResumeLedger,
    objects: &[RemoteObject],
    config: &DownloadConfig,
    shutdown_token: CancellationToken,
) -> Result<RunReport, RunError> {
    let started = Instant::now();
    let mut report = RunReport::default();

    let planned = plan(objects, ledger, &config.directory).await?;
    if config.dry_run {
        log_plan(&planned);
    }

    let mut tasks = Vec::new();
    for p in planned {
        match p.classification {
            Classification::Skip => {
                report.skipped += 1;
                if !config.dry_run {
                    ledger
                        .record(&p.object, &LedgerUpdate::done(&p.object, p.previous_attempts))
                        .await?;
                }
            }
            Classification::Resume { offset, prefix_md5 } => {
                report.resumed += 1;
                tasks.push(DownloadTask::new(
                    p.object,
                    &config.directory,
                    offset,
                    Some(prefix_md5),
                ));
            }
            Classification::Fresh => {
                tasks.push(DownloadTask::new(p.object, &config.directory, 0, None));
            }
        }
    }
    report.queued = tasks.len();
    tracing::info!(
        queued = tasks.len(),
        skipped = report.skipped,
        resumed = report.resumed,
        "Planned download"
    );
    if config.dry_run {
        report.elapsed = started.elapsed();
        return Ok(report);
    }

    let run_token = shutdown_token.child_token();
    let throttle = Throttle::new();
    let ctx = TransferContext {
        api,
        session,
        ledger,
        throttle: &throttle,
        retry: &config.retry,
        throttle_pause: config.throttle_pause,
        checkpoint_bytes: config.checkpoint_bytes.max(1),
        cancel: &run_token,
    };
    let pb = create_progress_bar(config.no_progress_bar, tasks.len() as u64);
    let in_progress = AtomicUsize::new(0);
    let peak = AtomicUsize::new(0);

    let (tx, rx) = mpsc::unbounded_channel::<DownloadTask>();
    let mut outstanding = tasks.len();
    for task in tasks {
        // The receiver is alive, so this cannot fail.
        let _ = tx.send(task);
    }
    // Dropping the last sender ends the queue once it drains.
    let mut tx = (outstanding > 0).then_some(tx);

    let queue = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|task| (task, rx))
    });
    let (ctx_ref, in_progress_ref, peak_ref) = (&ctx, &in_progress, &peak);
    let results = queue
        .map(|mut task| async move {
            if ctx_ref.cancel.is_cancelled() {
                return (task, Err(TransferError::Cancelled));
            }
            task.attempts += 1;
            let now = in_progress_ref.fetch_add(1, Ordering::SeqCst) + 1;
            peak_ref.fetch_max(now, Ordering::SeqCst);
            tracing::debug!(
                key = %task.object.key,
                offset = task.offset,
                attempt = task.attempts,
                "Transfer started"
            );
            let result = file::transfer(ctx_ref, &mut task).await;
            in_progress_ref.fetch_sub(1, Ordering::SeqCst);
            (task, result)
        })
        .buffer_unordered(config.concurrency.max(1));
    tokio::pin!(results);

    let mut fatal: Option<TransferError> = None;

    while let Some((mut task, result)) = results.next().await {
        report.bytes_transferred += std::mem::take(&mut task.received);
        let name = task
            .local_path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        pb.set_message(name);

        match result {
            Ok(()) => {
                match ledger
                    .record(&task.object, &LedgerUpdate::done(&task.object, task.attempts))
                    .await
                {
                    Ok(()) => {
                        tracing::debug!(key = %task.object.key, "Downloaded");
                        report.downloaded += 1;
                    }
                    Err(e) => {
                        fatal = fatal.or(Some(TransferError::Ledger(e)));
                        run_token.cancel();
                    }
                }
                pb.inc(1);
            }
            Err(TransferError::Cancelled) => {
                report.interrupted = true;
            }
            Err(e) if e.is_run_fatal() => {
                pb.suspend(|| {
                    tracing::error!("Aborting run: {}: {}", task.object.key, e);
                });
                fatal = fatal.or(Some(e));
                run_token.cancel();
            }
            Err(e) => {
                if e.is_retryable()
                    && task.attempts < config.max_attempts
                    && !run_token.is_cancelled()
                {
                    pb.suspend(|| {
                        tracing::warn!(
                            "Attempt {}/{} for {} failed, requeueing: {}",
                            task.attempts,
                            config.max_attempts,
                            task.object.key,
                            e
                        );
                    });
                    if let Some(sender) = &tx {
                        match sender.send(task) {
                            Ok(()) => continue,
                            Err(mpsc::error::SendError(returned)) => task = returned,
                        }
                    }
                }

                pb.suspend(|| {
                    tracing::error!("Download failed: {}: {}", task.object.key, e);
                });
                let update = LedgerUpdate {
                    bytes_written: task.offset,
                    written_md5: task.prefix_md5.clone(),
                    status: EntryStatus::Failed,
                    attempts: task.attempts,
                    error: Some(format!("{}: {}", e.kind(), e)),
                };
                if let Err(le) = ledger.record(&task.object, &update).await {
                    fatal = fatal.or(Some(TransferError::Ledger(le)));
                    run_token.cancel();
                }
                report.failed.push(FailedObject {
                    key: task.object.key.clone(),
                    kind: e.kind(),
                    message: e.to_string(),
                });
                pb.inc(1);
            }
        }

        outstanding -= 1;
        if outstanding == 0 || run_token.is_cancelled() {
            tx = None;
        }
    }

    pb.finish_and_clear();
    report.peak_in_progress = peak.load(Ordering::SeqCst);
    report.elapsed = started.elapsed();
    if shutdown_token.is_cancelled() {
        report.interrupted = true;
    }

    if let Some(e) = fatal {
        log_summary(&report);
        return Err(RunError::Aborted(e));
    }
    Ok(report)
}

/// Final counts, plus each failed object with its error kind.
pub fn log_summary(report: &RunReport) {
    tracing::info!("── Summary ──");
    tracing::info!(
        "  {} downloaded, {} skipped (already complete), {} failed",
        report.downloaded,
        report.skipped,
        report.failed.len()
    );
    if report.resumed > 0 {
        tracing::info!("  {} resumed from a checkpoint", report.resumed);
    }
    tracing::info!("  transferred: {}", human_size(report.bytes_transferred));
    tracing::info!("  elapsed: {}", format_duration(report.elapsed));
    if report.interrupted {
        tracing::warn!("  Interrupted: partial progress was checkpointed and will resume next run");
    }
    for failed in &report.failed {
        tracing::error!("  failed [{}] {}: {}", failed.kind, failed.key, failed.message);
    }
}

fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
