//! Resume ledger: durable per-object download progress.
//!
//! The ledger lives next to the downloaded files and is the only record of
//! what is complete. It answers three questions:
//! - which manifest objects can be skipped, resumed, or must start over
//! - which objects failed and why (`status --failed`)
//! - which completed objects the verifier should re-hash

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{ResumeLedger, SqliteLedger};
pub use types::{classify, Classification, EntryStatus, LedgerUpdate, LocalState, RunStats};

/// File name of the ledger inside the destination directory.
pub const LEDGER_FILE_NAME: &str = ".wabackup-rs.db";
