//! wabackup-rs: download WhatsApp chat backups from Google Drive.
//!
//! Logs in through the Google Play Services login flow, lists the backup's
//! files through WhatsApp's backup API, and downloads them with a bounded
//! pool of workers. Progress is checkpointed to a SQLite ledger in the
//! destination directory so interrupted runs resume where they stopped, and
//! every completed file is re-hashed into an `md5sum -c` compatible listing.

#![warn(clippy::all)]

mod auth;
mod backup;
mod cli;
mod config;
mod download;
mod retry;
mod shutdown;
mod state;
mod types;
mod verify;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use auth::endpoints::Endpoints;
use auth::{GoogleAuthenticator, SharedSession};
use backup::manifest;
use backup::types::{human_size, Backup};
use backup::HttpBackupApi;
use cli::{AuthArgs, Command};
use retry::RetryConfig;
use state::{EntryStatus, ResumeLedger, RunStats, SqliteLedger, LEDGER_FILE_NAME};

/// Logged-in API access shared by the commands that talk to Google.
struct Connection {
    api: HttpBackupApi,
    session: SharedSession,
    retry: RetryConfig,
}

fn build_client() -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()?)
}

async fn connect(auth_args: &AuthArgs) -> anyhow::Result<Connection> {
    let password_provider = || -> Option<String> {
        if !std::io::stdin().is_terminal() {
            return None;
        }
        tokio::task::block_in_place(|| {
            rpassword::prompt_password("Google account password: ").ok()
        })
    };
    let config = config::Config::from_auth_args(auth_args, password_provider)?;
    tracing::debug!(?config, "Resolved configuration");

    let client = build_client()?;
    let endpoints = Endpoints::default();
    let authenticator = GoogleAuthenticator::new(
        client.clone(),
        endpoints.clone(),
        config.credentials,
        config.retry,
    );
    let session = auth::SessionHandle::login(Arc::new(authenticator)).await?;
    tracing::info!(account = %session.account().await, "Logged in");

    Ok(Connection {
        api: HttpBackupApi::new(client, endpoints.backup_root),
        session,
        retry: config.retry,
    })
}

async fn selected_backups(conn: &Connection, wanted: &[String]) -> anyhow::Result<Vec<Backup>> {
    let backups = manifest::list_backups(&conn.api, &conn.session, &conn.retry).await?;
    if backups.is_empty() {
        anyhow::bail!("No WhatsApp backups found for this account");
    }
    manifest::select_backups(backups, wanted).map_err(anyhow::Error::msg)
}

fn optional<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn optional_size(value: Option<u64>) -> String {
    value.map_or_else(|| "-".to_string(), human_size)
}

/// Run the info command.
async fn run_info(args: cli::InfoArgs) -> anyhow::Result<()> {
    let conn = connect(&args.auth).await?;
    for backup in selected_backups(&conn, &args.backups).await? {
        println!("Backup {}", backup.id());
        println!("  Updated:         {}", optional(backup.update_time.as_deref()));
        println!("  Size:            {}", optional_size(backup.size_bytes));
        if let Some(meta) = backup.metadata() {
            println!("  Backup size:     {}", optional_size(meta.backup_size));
            println!("  Chat database:   {}", optional_size(meta.chatdb_size));
            println!("  Media:           {}", optional_size(meta.media_size));
            println!("  Videos:          {}", optional_size(meta.video_size));
            println!("  Messages:        {}", optional(meta.num_of_messages));
            println!("  Media files:     {}", optional(meta.num_of_media_files));
            println!("  Photos:          {}", optional(meta.num_of_photos));
            println!(
                "  App version:     {}",
                optional(meta.version_of_app_when_backup.as_deref())
            );
            println!(
                "  Includes videos: {}",
                optional(meta.include_videos_in_backup)
            );
            println!(
                "  Encrypted:       {}",
                optional(meta.password_protected_backup_enabled)
            );
        }
        println!();
    }
    Ok(())
}

/// Run the list command.
async fn run_list(args: cli::InfoArgs) -> anyhow::Result<()> {
    let conn = connect(&args.auth).await?;
    let backups = selected_backups(&conn, &args.backups).await?;
    let objects = manifest::fetch_manifest(&conn.api, &conn.session, &conn.retry, &backups).await?;

    let mut total = 0u64;
    for object in &objects {
        total += object.size;
        println!(
            "{:>12}  {:<8}  {}",
            human_size(object.size),
            object.kind.as_str(),
            download::paths::listing_path(&object.relative_path)
        );
    }
    println!();
    println!("{} files, {}", objects.len(), human_size(total));
    Ok(())
}

/// Run the download command.
async fn run_download(
    args: cli::DownloadArgs,
    shutdown_token: CancellationToken,
) -> anyhow::Result<()> {
    let conn = connect(&args.auth).await?;
    let download_config = config::download_config(&args, conn.retry);
    tracing::info!(
        concurrency = download_config.concurrency,
        directory = %download_config.directory.display(),
        "Starting wabackup-rs"
    );

    let backups = selected_backups(&conn, &args.backups).await?;
    let objects = manifest::fetch_manifest(&conn.api, &conn.session, &conn.retry, &backups).await?;

    tokio::fs::create_dir_all(&download_config.directory).await?;
    let ledger = SqliteLedger::open(&download_config.directory.join(LEDGER_FILE_NAME)).await?;
    tracing::debug!("Ledger opened at {}", ledger.path().display());

    let run_id = if download_config.dry_run {
        None
    } else {
        Some(ledger.start_run().await?)
    };

    let report = match download::download_objects(
        &conn.api,
        &conn.session,
        &ledger,
        &objects,
        &download_config,
        shutdown_token,
    )
    .await
    {
        Ok(report) => report,
        Err(e) => {
            if let Some(id) = run_id {
                let stats = RunStats {
                    objects_seen: objects.len() as u64,
                    interrupted: true,
                    ..RunStats::default()
                };
                if let Err(le) = ledger.complete_run(id, &stats).await {
                    tracing::warn!("Failed to record run statistics: {}", le);
                }
            }
            return Err(e.into());
        }
    };

    download::log_summary(&report);
    tracing::debug!(
        peak_in_progress = report.peak_in_progress,
        session_refreshes = conn.session.generation().await,
        "Transfer pool finished"
    );
    let Some(run_id) = run_id else {
        tracing::info!("[DRY RUN] {} files would be transferred", report.queued);
        return Ok(());
    };
    ledger
        .complete_run(
            run_id,
            &RunStats {
                objects_seen: objects.len() as u64,
                downloaded: report.downloaded as u64,
                skipped: report.skipped as u64,
                failed: report.failed.len() as u64,
                bytes_transferred: report.bytes_transferred,
                interrupted: report.interrupted,
            },
        )
        .await?;

    if report.interrupted {
        anyhow::bail!("Download interrupted; run the same command again to resume");
    }

    let verification =
        verify::verify_objects(&download_config.directory, &objects, &ledger).await?;
    let listing = verify::write_checksum_listing(&download_config.directory, &verification).await?;
    tracing::info!(
        "Verified {}/{} files, checksums written to {}",
        verification.matched(),
        verification.entries.len(),
        listing.display()
    );

    let mismatched = verification.mismatches().count();
    if !report.is_success() || mismatched > 0 {
        anyhow::bail!(
            "{} downloads failed, {} files failed verification",
            report.failed.len(),
            mismatched
        );
    }
    Ok(())
}

/// Open the ledger of an earlier download, or `None` if there isn't one.
async fn open_existing_ledger(directory: &Path) -> anyhow::Result<Option<SqliteLedger>> {
    let path = directory.join(LEDGER_FILE_NAME);
    if !path.exists() {
        println!("No ledger found at {}", path.display());
        println!("Run a download into this directory first.");
        return Ok(None);
    }
    Ok(Some(SqliteLedger::open(&path).await?))
}

/// Run the status command.
async fn run_status(args: cli::StatusArgs) -> anyhow::Result<()> {
    let directory = config::expand_tilde(&args.directory);
    let Some(ledger) = open_existing_ledger(&directory).await? else {
        return Ok(());
    };
    let summary = ledger.summary().await?;

    println!("Ledger: {}", ledger.path().display());
    println!();
    println!("Files:");
    println!("  Total:       {}", summary.total);
    println!("  Done:        {}", summary.done);
    println!("  In progress: {}", summary.in_progress);
    println!("  Pending:     {}", summary.pending);
    println!("  Failed:      {}", summary.failed);
    println!();

    if let Some(started) = &summary.last_run_started {
        println!(
            "Last run started:   {}",
            started.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(completed) = &summary.last_run_completed {
        println!(
            "Last run completed: {}",
            completed.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    if args.failed && summary.failed > 0 {
        println!();
        println!("Failed files:");
        for entry in ledger.entries_with_status(EntryStatus::Failed).await? {
            println!(
                "  {} ({}, {} attempts, {}) - {}",
                entry.key,
                entry.kind,
                entry.attempts,
                entry.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
                entry.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    Ok(())
}

/// Run the verify command.
async fn run_verify(args: cli::VerifyArgs) -> anyhow::Result<()> {
    let directory: PathBuf = config::expand_tilde(&args.directory);
    let Some(ledger) = open_existing_ledger(&directory).await? else {
        return Ok(());
    };

    let report = verify::verify_ledger(&directory, &ledger).await?;
    println!("Verifying {} downloaded files...", report.entries.len());
    println!();
    for entry in report.mismatches() {
        match &entry.computed {
            None => println!(
                "MISSING:   {} ({})",
                entry.relative_path.display(),
                entry.key
            ),
            Some(actual) => println!(
                "CORRUPTED: {} ({}): expected {}, got {}",
                entry.relative_path.display(),
                entry.key,
                entry.expected,
                actual
            ),
        }
    }
    let listing = verify::write_checksum_listing(&directory, &report).await?;

    let bad = report.entries.len() - report.matched();
    println!();
    println!("Results:");
    println!("  Verified:  {}", report.matched());
    println!("  Failed:    {}", bad);
    println!("  Checksums: {}", listing.display());

    if !report.is_clean() {
        anyhow::bail!(
            "{} files failed verification; they will be downloaded again on the next run",
            bad
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    match cli.command {
        Command::Info(args) => run_info(args).await,
        Command::List(args) => run_list(args).await,
        Command::Download(args) => {
            let shutdown_token = shutdown::install_signal_handler();
            run_download(args, shutdown_token).await
        }
        Command::Status(args) => run_status(args).await,
        Command::Verify(args) => run_verify(args).await,
    }
}
