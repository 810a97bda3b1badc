use clap::{Args, Parser, Subcommand};

use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "wabackup-rs",
    version,
    about = "Download WhatsApp backups from Google Drive"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log level (RUST_LOG overrides)
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show each backup with its size and metadata
    Info(InfoArgs),

    /// List the files of each backup
    List(InfoArgs),

    /// Download backups, resuming where an earlier run stopped
    Download(DownloadArgs),

    /// Show ledger progress for a destination directory
    Status(StatusArgs),

    /// Re-hash downloaded files and rewrite md5sum.txt (no network)
    Verify(VerifyArgs),
}

/// Account and login options shared by the commands that talk to the API.
#[derive(Args, Debug, Clone)]
pub struct AuthArgs {
    /// JSON settings file with `gmail`, `password`, `android_id`
    #[arg(long, default_value = "settings.json")]
    pub settings: String,

    /// Google account email address
    #[arg(long, env = "WA_BACKUP_ACCOUNT")]
    pub account: Option<String>,

    /// Account password (if neither this nor a master token is given, will
    /// prompt). WARNING: passing via --password is visible in process
    /// listings. Prefer the WA_BACKUP_PASSWORD environment variable.
    #[arg(long, env = "WA_BACKUP_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Master token from an earlier login; skips the password exchange
    #[arg(long, env = "WA_BACKUP_MASTER_TOKEN", hide_env_values = true)]
    pub master_token: Option<String>,

    /// Android ID of the phone that made the backup (16 hex digits)
    #[arg(long, env = "WA_BACKUP_DEVICE_ID")]
    pub device_id: Option<String>,

    /// Retries for transient network errors (0-100)
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u32).range(0..=100))]
    pub max_retries: u32,

    /// Base delay in seconds between retries (1-3600)
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub retry_delay: u64,

    /// Upper bound in seconds on the delay between retries (1-3600)
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub retry_max_delay: u64,
}

#[derive(Args, Debug, Clone)]
pub struct InfoArgs {
    #[command(flatten)]
    pub auth: AuthArgs,

    /// Backup ID(s) to include (default: all)
    #[arg(long = "backup")]
    pub backups: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct DownloadArgs {
    #[command(flatten)]
    pub auth: AuthArgs,

    /// Local directory for downloads
    #[arg(short = 'd', long, default_value = ".")]
    pub directory: String,

    /// Backup ID(s) to download (default: all)
    #[arg(long = "backup")]
    pub backups: Vec<String>,

    /// Number of concurrent transfers (1-64)
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u16).range(1..=64))]
    pub concurrency: u16,

    /// Attempts per file before it is reported as failed (1-20)
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..=20))]
    pub max_attempts: u32,

    /// Seconds to pause all transfers when the API throttles without Retry-After
    #[arg(long, default_value_t = 5)]
    pub throttle_pause: u64,

    /// Record progress every N MiB of a file (1-1024)
    #[arg(long, default_value_t = 8, value_parser = clap::value_parser!(u64).range(1..=1024))]
    pub checkpoint_mib: u64,

    /// Disable progress bar
    #[arg(long)]
    pub no_progress_bar: bool,

    /// Print what would be downloaded or resumed without transferring
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// Destination directory of earlier downloads
    #[arg(short = 'd', long, default_value = ".")]
    pub directory: String,

    /// Show each failed file with its last error
    #[arg(long)]
    pub failed: bool,
}

#[derive(Args, Debug, Clone)]
pub struct VerifyArgs {
    /// Destination directory of earlier downloads
    #[arg(short = 'd', long, default_value = ".")]
    pub directory: String,
}
