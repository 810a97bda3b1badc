//! Types for the resume ledger.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::backup::types::{ObjectKind, RemoteObject};

/// Lifecycle of one object in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Seen in a manifest, nothing written yet (or progress discarded).
    Pending,
    /// A worker owns it; `bytes_written` is the last checkpoint.
    InProgress,
    /// Finished with size and hash matching the manifest.
    Done,
    /// Retries exhausted in some run.
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One row of the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub key: String,
    pub kind: ObjectKind,
    /// Declared size when the entry was written.
    pub size: u64,
    /// Declared MD5 (hex) when the entry was written.
    pub md5: String,
    pub relative_path: PathBuf,
    pub bytes_written: u64,
    /// Hex MD5 of the first `bytes_written` bytes.
    pub written_md5: Option<String>,
    pub status: EntryStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Whether this entry was written for the same object content that the
    /// manifest now declares.
    pub fn describes(&self, object: &RemoteObject) -> bool {
        self.size == object.size && self.md5 == object.md5_hex()
    }

    /// Complete and consistent with its own declared size and hash.
    pub fn is_complete(&self) -> bool {
        self.status == EntryStatus::Done
            && self.bytes_written == self.size
            && self.written_md5.as_deref() == Some(self.md5.as_str())
    }
}

/// What a worker reports to the ledger.
#[derive(Debug, Clone)]
pub struct LedgerUpdate {
    pub bytes_written: u64,
    pub written_md5: Option<String>,
    pub status: EntryStatus,
    pub attempts: u32,
    pub error: Option<String>,
}

impl LedgerUpdate {
    pub fn checkpoint(bytes_written: u64, written_md5: String, attempts: u32) -> Self {
        Self {
            bytes_written,
            written_md5: Some(written_md5),
            status: EntryStatus::InProgress,
            attempts,
            error: None,
        }
    }

    pub fn done(object: &RemoteObject, attempts: u32) -> Self {
        Self {
            bytes_written: object.size,
            written_md5: Some(object.md5_hex()),
            status: EntryStatus::Done,
            attempts,
            error: None,
        }
    }
}

/// What the local filesystem holds for one object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalState {
    /// Length of the finished file, if present.
    pub final_len: Option<u64>,
    /// Length of the `.part` file, if present.
    pub part_len: Option<u64>,
}

/// Scheduling decision for one manifest object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Already complete and hash-matched.
    Skip,
    /// Continue from `offset`; `prefix_md5` is the hex MD5 of the bytes
    /// already on disk up to that offset.
    Resume { offset: u64, prefix_md5: String },
    /// Start from zero.
    Fresh,
}

/// Decide what to do with `object` given its ledger entry and local files.
pub fn classify(
    object: &RemoteObject,
    entry: Option<&LedgerEntry>,
    local: LocalState,
) -> Classification {
    let Some(entry) = entry else {
        return Classification::Fresh;
    };
    if !entry.describes(object) {
        tracing::debug!(key = %object.key, "Manifest changed since last run, starting over");
        return Classification::Fresh;
    }
    if entry.status == EntryStatus::Done {
        if entry.is_complete() && local.final_len == Some(object.size) {
            return Classification::Skip;
        }
        tracing::debug!(key = %object.key, "Completed file missing or altered, starting over");
        return Classification::Fresh;
    }
    match (&entry.written_md5, local.part_len) {
        (Some(prefix), Some(part_len))
            if entry.bytes_written > 0
                && entry.bytes_written <= object.size
                && part_len >= entry.bytes_written =>
        {
            Classification::Resume {
                offset: entry.bytes_written,
                prefix_md5: prefix.clone(),
            }
        }
        _ => Classification::Fresh,
    }
}

/// Ledger overview for the `status` command.
#[derive(Debug, Clone, Default)]
pub struct LedgerSummary {
    pub total: u64,
    pub done: u64,
    pub in_progress: u64,
    pub pending: u64,
    pub failed: u64,
    pub last_run_started: Option<DateTime<Utc>>,
    pub last_run_completed: Option<DateTime<Utc>>,
}

/// Statistics stored when a run completes.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub objects_seen: u64,
    pub downloaded: u64,
    pub skipped: u64,
    pub failed: u64,
    pub bytes_transferred: u64,
    pub interrupted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(size: u64) -> RemoteObject {
        RemoteObject {
            key: "clients/wa/backups/b/files/Media/a.jpg".into(),
            size,
            md5: [0xab; 16],
            kind: ObjectKind::MediaFile,
            relative_path: PathBuf::from("b/files/Media/a.jpg"),
        }
    }

    fn entry(obj: &RemoteObject, status: EntryStatus, written: u64) -> LedgerEntry {
        LedgerEntry {
            key: obj.key.clone(),
            kind: obj.kind,
            size: obj.size,
            md5: obj.md5_hex(),
            relative_path: obj.relative_path.clone(),
            bytes_written: written,
            written_md5: Some(if status == EntryStatus::Done {
                obj.md5_hex()
            } else {
                "prefix".into()
            }),
            status,
            attempts: 1,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            EntryStatus::Pending,
            EntryStatus::InProgress,
            EntryStatus::Done,
            EntryStatus::Failed,
        ] {
            assert_eq!(EntryStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(EntryStatus::from_str("downloaded"), None);
    }

    #[test]
    fn no_entry_is_fresh() {
        assert_eq!(
            classify(&object(10), None, LocalState::default()),
            Classification::Fresh
        );
    }

    #[test]
    fn complete_entry_with_file_is_skipped() {
        let obj = object(10);
        let e = entry(&obj, EntryStatus::Done, 10);
        let local = LocalState {
            final_len: Some(10),
            part_len: None,
        };
        assert_eq!(classify(&obj, Some(&e), local), Classification::Skip);
    }

    #[test]
    fn complete_entry_without_file_is_fresh() {
        let obj = object(10);
        let e = entry(&obj, EntryStatus::Done, 10);
        assert_eq!(
            classify(&obj, Some(&e), LocalState::default()),
            Classification::Fresh
        );
    }

    #[test]
    fn done_entry_with_wrong_byte_count_is_fresh() {
        let obj = object(10);
        let e = entry(&obj, EntryStatus::Done, 9);
        let local = LocalState {
            final_len: Some(10),
            part_len: None,
        };
        assert_eq!(classify(&obj, Some(&e), local), Classification::Fresh);
    }

    #[test]
    fn changed_manifest_is_fresh() {
        let obj = object(10);
        let e = entry(&obj, EntryStatus::Done, 10);
        let mut changed = obj.clone();
        changed.md5 = [0xcd; 16];
        let local = LocalState {
            final_len: Some(10),
            part_len: None,
        };
        assert_eq!(classify(&changed, Some(&e), local), Classification::Fresh);
    }

    #[test]
    fn partial_entry_resumes_at_checkpoint() {
        let obj = object(200);
        let e = entry(&obj, EntryStatus::InProgress, 50);
        let local = LocalState {
            final_len: None,
            part_len: Some(64),
        };
        assert_eq!(
            classify(&obj, Some(&e), local),
            Classification::Resume {
                offset: 50,
                prefix_md5: "prefix".into()
            }
        );
    }

    #[test]
    fn failed_entry_with_progress_resumes() {
        let obj = object(200);
        let e = entry(&obj, EntryStatus::Failed, 120);
        let local = LocalState {
            final_len: None,
            part_len: Some(120),
        };
        assert!(matches!(
            classify(&obj, Some(&e), local),
            Classification::Resume { offset: 120, .. }
        ));
    }

    #[test]
    fn truncated_part_file_is_fresh() {
        let obj = object(200);
        let e = entry(&obj, EntryStatus::InProgress, 50);
        let local = LocalState {
            final_len: None,
            part_len: Some(20),
        };
        assert_eq!(classify(&obj, Some(&e), local), Classification::Fresh);
    }

    #[test]
    fn missing_part_file_is_fresh() {
        let obj = object(200);
        let e = entry(&obj, EntryStatus::InProgress, 50);
        assert_eq!(
            classify(&obj, Some(&e), LocalState::default()),
            Classification::Fresh
        );
    }
}
