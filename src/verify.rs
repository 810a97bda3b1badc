//! Integrity verification: re-hash completed files, downgrade any that no
//! longer match, and write an `md5sum -c` compatible listing.

use std::io;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use thiserror::Error;

use crate::backup::types::RemoteObject;
use crate::download::paths;
use crate::state::error::StateError;
use crate::state::{EntryStatus, ResumeLedger};

/// File name of the checksum listing inside the destination directory.
pub const CHECKSUM_FILE_NAME: &str = "md5sum.txt";

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Ledger(#[from] StateError),

    #[error("Failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationEntry {
    pub key: String,
    pub relative_path: PathBuf,
    /// `None` when the local file is missing or unreadable.
    pub computed: Option<String>,
    pub expected: String,
    pub matches: bool,
}

#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    pub entries: Vec<VerificationEntry>,
}

impl VerificationReport {
    pub fn matched(&self) -> usize {
        self.entries.iter().filter(|e| e.matches).count()
    }

    pub fn mismatches(&self) -> impl Iterator<Item = &VerificationEntry> {
        self.entries.iter().filter(|e| !e.matches)
    }

    pub fn is_clean(&self) -> bool {
        self.entries.iter().all(|e| e.matches)
    }
}

/// Hex MD5 of a whole file, or `None` if it doesn't exist.
pub async fn file_md5(path: &Path) -> io::Result<Option<String>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut hasher = Md5::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(Some(hex::encode(hasher.finalize())))
    })
    .await
    .map_err(io::Error::other)?
}

async fn check(
    directory: &Path,
    ledger: &dyn ResumeLedger,
    key: &str,
    relative_path: &Path,
    expected: &str,
) -> Result<VerificationEntry, VerifyError> {
    let local = paths::local_path(directory, relative_path);
    let computed = match file_md5(&local).await {
        Ok(hash) => hash,
        Err(e) => {
            tracing::warn!("Could not read {}: {}", local.display(), e);
            None
        }
    };
    let matches = computed.as_deref() == Some(expected);

    if !matches {
        let reason = match &computed {
            Some(actual) => format!("verify: md5 {} does not match {}", actual, expected),
            None => "verify: local file missing".to_string(),
        };
        tracing::error!("{}: {}", key, reason);
        ledger.downgrade(key, &reason).await?;
    } else {
        tracing::debug!(key, "Verified");
    }

    Ok(VerificationEntry {
        key: key.to_string(),
        relative_path: relative_path.to_path_buf(),
        computed,
        expected: expected.to_string(),
        matches,
    })
}

/// Verify every manifest object the ledger records as complete, in
/// manifest order. Entries written for different content are left alone;
/// the next download run replaces them.
pub async fn verify_objects(
    directory: &Path,
    objects: &[RemoteObject],
    ledger: &dyn ResumeLedger,
) -> Result<VerificationReport, VerifyError> {
    let mut report = VerificationReport::default();
    for object in objects {
        let Some(entry) = ledger.lookup(&object.key).await? else {
            continue;
        };
        if !entry.is_complete() || !entry.describes(object) {
            continue;
        }
        report.entries.push(
            check(
                directory,
                ledger,
                &object.key,
                &object.relative_path,
                &object.md5_hex(),
            )
            .await?,
        );
    }
    Ok(report)
}

/// Verify every entry the ledger records as done, without contacting the
/// backup API.
pub async fn verify_ledger(
    directory: &Path,
    ledger: &dyn ResumeLedger,
) -> Result<VerificationReport, VerifyError> {
    let mut report = VerificationReport::default();
    for entry in ledger.entries_with_status(EntryStatus::Done).await? {
        report.entries.push(
            check(
                directory,
                ledger,
                &entry.key,
                &entry.relative_path,
                &entry.md5,
            )
            .await?,
        );
    }
    Ok(report)
}

/// Render the listing: one `<md5> *<path>` line per verified file.
pub fn checksum_listing(report: &VerificationReport) -> String {
    let mut out = String::new();
    for entry in report.entries.iter().filter(|e| e.matches) {
        out.push_str(&entry.expected);
        out.push_str(" *");
        out.push_str(&paths::listing_path(&entry.relative_path));
        out.push('\n');
    }
    out
}

/// Write the listing to `<directory>/md5sum.txt` via a temp file and rename.
pub async fn write_checksum_listing(
    directory: &Path,
    report: &VerificationReport,
) -> Result<PathBuf, VerifyError> {
    let path = directory.join(CHECKSUM_FILE_NAME);
    let tmp = directory.join(format!("{}.tmp", CHECKSUM_FILE_NAME));
    let write_err = |source| VerifyError::Write {
        path: path.clone(),
        source,
    };
    tokio::fs::write(&tmp, checksum_listing(report))
        .await
        .map_err(write_err)?;
    tokio::fs::rename(&tmp, &path).await.map_err(write_err)?;
    Ok(path)
}
