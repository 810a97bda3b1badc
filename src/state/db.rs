//! Resume ledger trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::error::StateError;
use super::schema;
use super::types::{EntryStatus, LedgerEntry, LedgerSummary, LedgerUpdate, RunStats};
use crate::backup::types::{ObjectKind, RemoteObject};

/// Durable per-object download progress.
///
/// Object-safe so the scheduler and verifier can share an
/// `Arc<dyn ResumeLedger>`. Every write is a single statement, so a crash
/// leaves either the previous or the new row, never a mix.
#[async_trait]
pub trait ResumeLedger: Send + Sync {
    /// Last known state for `key`.
    async fn lookup(&self, key: &str) -> Result<Option<LedgerEntry>, StateError>;

    /// Insert or replace the entry for `object` with `update`.
    async fn record(&self, object: &RemoteObject, update: &LedgerUpdate)
        -> Result<(), StateError>;

    /// Discard recorded progress for `key` so the next run downloads it
    /// again. Returns false when there was no such entry.
    async fn downgrade(&self, key: &str, reason: &str) -> Result<bool, StateError>;

    /// Entries with `status`, in first-seen order.
    async fn entries_with_status(
        &self,
        status: EntryStatus,
    ) -> Result<Vec<LedgerEntry>, StateError>;

    async fn summary(&self) -> Result<LedgerSummary, StateError>;

    /// Start a new run and return its ID.
    async fn start_run(&self) -> Result<i64, StateError>;

    async fn complete_run(&self, run_id: i64, stats: &RunStats) -> Result<(), StateError>;
}

/// SQLite implementation of the ledger.
pub struct SqliteLedger {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLedger")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

const ENTRY_COLUMNS: &str = "key, kind, size_bytes, md5, relative_path, bytes_written, written_md5, status, attempts, last_error, updated_at";

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let kind: String = row.get(1)?;
    let status: String = row.get(7)?;
    let relative_path: String = row.get(4)?;
    let updated_at: i64 = row.get(10)?;
    Ok(LedgerEntry {
        key: row.get(0)?,
        kind: ObjectKind::parse(&kind).unwrap_or(ObjectKind::Metadata),
        size: row.get::<_, i64>(2)? as u64,
        md5: row.get(3)?,
        relative_path: PathBuf::from(relative_path),
        bytes_written: row.get::<_, i64>(5)? as u64,
        written_md5: row.get(6)?,
        status: EntryStatus::from_str(&status).unwrap_or(EntryStatus::Pending),
        attempts: row.get::<_, i64>(8)? as u32,
        last_error: row.get(9)?,
        updated_at: Utc
            .timestamp_opt(updated_at, 0)
            .single()
            .unwrap_or_default(),
    })
}

impl SqliteLedger {
    /// Open or create the ledger at `path` and take the exclusive lock on it.
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone)
                .map_err(|e| StateError::opening(path_clone.clone(), e))?;

            // Must precede the switch to WAL so no shared-memory index is used.
            conn.pragma_update(None, "locking_mode", "EXCLUSIVE")
                .map_err(|e| StateError::opening(path_clone.clone(), e))?;
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(|e| StateError::opening(path_clone.clone(), e))?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StateError::Migration)?;

            // A write transaction acquires the lock now instead of at the
            // first checkpoint.
            conn.execute_batch("BEGIN EXCLUSIVE; COMMIT;")
                .map_err(|e| StateError::opening(path_clone.clone(), e))?;

            schema::migrate(&conn)?;

            Ok::<_, StateError>(conn)
        })
        .await??;

        tracing::debug!(path = %path.display(), "Ledger opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Open an in-memory ledger (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StateError> {
        self.conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))
    }
}

#[async_trait]
impl ResumeLedger for SqliteLedger {
    async fn lookup(&self, key: &str) -> Result<Option<LedgerEntry>, StateError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM objects WHERE key = ?1", ENTRY_COLUMNS),
            [key],
            row_to_entry,
        )
        .optional()
        .map_err(StateError::query)
    }

    async fn record(
        &self,
        object: &RemoteObject,
        update: &LedgerUpdate,
    ) -> Result<(), StateError> {
        let updated_at = Utc::now().timestamp();
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO objects (key, kind, size_bytes, md5, relative_path, bytes_written, written_md5, status, attempts, last_error, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(key) DO UPDATE SET
                kind = excluded.kind,
                size_bytes = excluded.size_bytes,
                md5 = excluded.md5,
                relative_path = excluded.relative_path,
                bytes_written = excluded.bytes_written,
                written_md5 = excluded.written_md5,
                status = excluded.status,
                attempts = excluded.attempts,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
            rusqlite::params![
                &object.key,
                object.kind.as_str(),
                object.size as i64,
                object.md5_hex(),
                object.relative_path.to_string_lossy(),
                update.bytes_written as i64,
                update.written_md5.as_deref(),
                update.status.as_str(),
                update.attempts as i64,
                update.error.as_deref(),
                updated_at,
            ],
        )
        .map_err(StateError::query)?;
        Ok(())
    }

    async fn downgrade(&self, key: &str, reason: &str) -> Result<bool, StateError> {
        let updated_at = Utc::now().timestamp();
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "UPDATE objects SET status = 'pending', bytes_written = 0, written_md5 = NULL, last_error = ?1, updated_at = ?2 WHERE key = ?3",
                rusqlite::params![reason, updated_at, key],
            )
            .map_err(StateError::query)?;
        Ok(rows > 0)
    }

    async fn entries_with_status(
        &self,
        status: EntryStatus,
    ) -> Result<Vec<LedgerEntry>, StateError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {} FROM objects WHERE status = ?1 ORDER BY rowid",
                ENTRY_COLUMNS
            ))
            .map_err(StateError::query)?;
        let entries = stmt
            .query_map([status.as_str()], row_to_entry)
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;
        Ok(entries)
    }

    async fn summary(&self) -> Result<LedgerSummary, StateError> {
        let conn = self.conn()?;

        let mut summary = LedgerSummary::default();
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM objects GROUP BY status")
            .map_err(StateError::query)?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })
            .map_err(StateError::query)?;
        for count in counts {
            let (status, n) = count.map_err(StateError::query)?;
            summary.total += n;
            match EntryStatus::from_str(&status) {
                Some(EntryStatus::Done) => summary.done += n,
                Some(EntryStatus::InProgress) => summary.in_progress += n,
                Some(EntryStatus::Failed) => summary.failed += n,
                Some(EntryStatus::Pending) | None => summary.pending += n,
            }
        }

        let last_run: Option<(Option<i64>, Option<i64>)> = conn
            .query_row(
                "SELECT started_at, completed_at FROM runs ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StateError::query)?;
        if let Some((started, completed)) = last_run {
            summary.last_run_started = started.and_then(|ts| Utc.timestamp_opt(ts, 0).single());
            summary.last_run_completed =
                completed.and_then(|ts| Utc.timestamp_opt(ts, 0).single());
        }

        Ok(summary)
    }

    async fn start_run(&self) -> Result<i64, StateError> {
        let started_at = Utc::now().timestamp();
        let conn = self.conn()?;
        conn.execute("INSERT INTO runs (started_at) VALUES (?1)", [started_at])
            .map_err(StateError::query)?;
        Ok(conn.last_insert_rowid())
    }

    async fn complete_run(&self, run_id: i64, stats: &RunStats) -> Result<(), StateError> {
        let completed_at = Utc::now().timestamp();
        let conn = self.conn()?;
        conn.execute(
            "UPDATE runs SET completed_at = ?1, objects_seen = ?2, downloaded = ?3, skipped = ?4, failed = ?5, bytes_transferred = ?6, interrupted = ?7 WHERE id = ?8",
            rusqlite::params![
                completed_at,
                stats.objects_seen as i64,
                stats.downloaded as i64,
                stats.skipped as i64,
                stats.failed as i64,
                stats.bytes_transferred as i64,
                stats.interrupted,
                run_id
            ],
        )
        .map_err(StateError::query)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(name: &str, size: u64) -> RemoteObject {
        RemoteObject {
            key: format!("clients/wa/backups/b/files/Media/{}", name),
            size,
            md5: [0x11; 16],
            kind: ObjectKind::MediaFile,
            relative_path: PathBuf::from(format!("b/files/Media/{}", name)),
        }
    }

    #[tokio::test]
    async fn test_lookup_missing() {
        let db = SqliteLedger::open_in_memory().unwrap();
        assert!(db.lookup("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_then_lookup() {
        let db = SqliteLedger::open_in_memory().unwrap();
        let obj = object("a.jpg", 200);
        db.record(&obj, &LedgerUpdate::checkpoint(50, "abc".into(), 1))
            .await
            .unwrap();

        let entry = db.lookup(&obj.key).await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::InProgress);
        assert_eq!(entry.bytes_written, 50);
        assert_eq!(entry.written_md5.as_deref(), Some("abc"));
        assert_eq!(entry.size, 200);
        assert_eq!(entry.md5, obj.md5_hex());
        assert_eq!(entry.kind, ObjectKind::MediaFile);
        assert_eq!(entry.relative_path, obj.relative_path);
        assert!(entry.describes(&obj));
    }

    #[tokio::test]
    async fn test_record_overwrites_whole_entry() {
        let db = SqliteLedger::open_in_memory().unwrap();
        let obj = object("a.jpg", 200);
        db.record(
            &obj,
            &LedgerUpdate {
                bytes_written: 0,
                written_md5: None,
                status: EntryStatus::Failed,
                attempts: 3,
                error: Some("size mismatch".into()),
            },
        )
        .await
        .unwrap();
        db.record(&obj, &LedgerUpdate::done(&obj, 4)).await.unwrap();

        let entry = db.lookup(&obj.key).await.unwrap().unwrap();
        assert!(entry.is_complete());
        assert_eq!(entry.attempts, 4);
        assert!(entry.last_error.is_none());
    }

    #[tokio::test]
    async fn test_downgrade_clears_progress() {
        let db = SqliteLedger::open_in_memory().unwrap();
        let obj = object("a.jpg", 10);
        db.record(&obj, &LedgerUpdate::done(&obj, 1)).await.unwrap();

        assert!(db.downgrade(&obj.key, "hash mismatch").await.unwrap());
        let entry = db.lookup(&obj.key).await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Pending);
        assert_eq!(entry.bytes_written, 0);
        assert!(entry.written_md5.is_none());
        assert_eq!(entry.last_error.as_deref(), Some("hash mismatch"));

        assert!(!db.downgrade("unknown", "x").await.unwrap());
    }

    #[tokio::test]
    async fn test_entries_with_status_in_insertion_order() {
        let db = SqliteLedger::open_in_memory().unwrap();
        for name in ["c.jpg", "a.jpg", "b.jpg"] {
            let obj = object(name, 1);
            db.record(&obj, &LedgerUpdate::done(&obj, 1)).await.unwrap();
        }
        let failed = object("f.jpg", 1);
        db.record(
            &failed,
            &LedgerUpdate {
                bytes_written: 0,
                written_md5: None,
                status: EntryStatus::Failed,
                attempts: 3,
                error: Some("boom".into()),
            },
        )
        .await
        .unwrap();

        let done = db.entries_with_status(EntryStatus::Done).await.unwrap();
        let names: Vec<_> = done
            .iter()
            .map(|e| e.key.rsplit('/').next().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["c.jpg", "a.jpg", "b.jpg"]);

        let failed = db.entries_with_status(EntryStatus::Failed).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_summary_counts_and_runs() {
        let db = SqliteLedger::open_in_memory().unwrap();
        let a = object("a.jpg", 1);
        let b = object("b.jpg", 10);
        db.record(&a, &LedgerUpdate::done(&a, 1)).await.unwrap();
        db.record(&b, &LedgerUpdate::checkpoint(5, "x".into(), 1))
            .await
            .unwrap();

        let run = db.start_run().await.unwrap();
        let summary = db.summary().await.unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.done, 1);
        assert_eq!(summary.in_progress, 1);
        assert!(summary.last_run_started.is_some());
        assert!(summary.last_run_completed.is_none());

        db.complete_run(
            run,
            &RunStats {
                objects_seen: 2,
                downloaded: 1,
                ..RunStats::default()
            },
        )
        .await
        .unwrap();
        assert!(db.summary().await.unwrap().last_run_completed.is_some());
    }

    #[tokio::test]
    async fn test_open_file_and_exclusive_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".wabackup-rs.db");

        let db = SqliteLedger::open(&path).await.unwrap();
        assert_eq!(db.path(), path.as_path());
        let obj = object("a.jpg", 1);
        db.record(&obj, &LedgerUpdate::done(&obj, 1)).await.unwrap();
        drop(db);

        let reopened = SqliteLedger::open(&path).await.unwrap();
        assert!(reopened.lookup(&obj.key).await.unwrap().is_some());
    }
}
