//! Storage backend for ingested records and upstream events.
//!
//! Records are keyed by fingerprint; inserting a record whose fingerprint is
//! already present is a no-op, which makes re-reading a byte range harmless.

use crate::cursor::current_timestamp;
use crate::events::Event;
use crate::record::Record;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task;
use tracing::{debug, warn};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub inserted: u64,
    pub duplicates: u64,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert `records` from `source` in a single transaction. Records whose
    /// fingerprint already exists are counted as duplicates, not errors.
    async fn insert_batch(&self, source: String, records: Vec<Record>) -> Result<InsertOutcome>;

    async fn insert_event(&self, event: Event) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

/// Marks a blocking write as abandoned once the awaiting future is dropped,
/// e.g. by a flush timeout. The write checks the flag before every statement
/// and rolls back instead of committing.
struct AbandonOnDrop(Arc<AtomicBool>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

fn ensure_not_abandoned(abandoned: &AtomicBool) -> Result<()> {
    if abandoned.load(Ordering::Acquire) {
        anyhow::bail!("insert abandoned by caller; transaction rolled back");
    }
    Ok(())
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory {}", parent.display())
                })?;
            }
        }

        let conn = open_connection(&path, busy_timeout)?;
        initialize_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn record_count(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM log_records").await
    }

    pub async fn event_count(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM event_logs").await
    }

    /// Raw payloads stored for `source`, in insertion order.
    pub async fn records_for_source(&self, source: &str) -> Result<Vec<String>> {
        let conn = self.conn.clone();
        let source = source.to_string();
        task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let mut stmt = conn
                .prepare("SELECT raw FROM log_records WHERE source = ?1 ORDER BY id")
                .context("failed to prepare record select statement")?;
            let rows = stmt
                .query_map(params![source], |row| row.get::<_, String>(0))
                .context("failed to query log_records")?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.context("failed to decode log_records row")?);
            }
            Ok::<_, anyhow::Error>(out)
        })
        .await
        .context("record select join error")?
    }

    async fn count(&self, sql: &'static str) -> Result<u64> {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let count: i64 = conn
                .query_row(sql, [], |row| row.get(0))
                .with_context(|| format!("failed to run {sql}"))?;
            Ok::<_, anyhow::Error>(count as u64)
        })
        .await
        .context("count join error")?
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn insert_batch(&self, source: String, records: Vec<Record>) -> Result<InsertOutcome> {
        if records.is_empty() {
            return Ok(InsertOutcome::default());
        }

        let conn = self.conn.clone();
        let abandoned = Arc::new(AtomicBool::new(false));
        let _abandon_guard = AbandonOnDrop(abandoned.clone());
        let outcome = task::spawn_blocking(move || {
            let mut conn = lock(&conn)?;
            ensure_not_abandoned(&abandoned)?;
            let ingested_at = current_timestamp();
            let tx = conn
                .transaction()
                .context("failed to begin insert transaction")?;
            let mut inserted = 0u64;
            {
                let mut stmt = tx
                    .prepare_cached(
                        "
                        INSERT INTO log_records (fingerprint, raw, source, ingested_at)
                        VALUES (?1, ?2, ?3, ?4)
                        ON CONFLICT(fingerprint) DO NOTHING
                        ",
                    )
                    .context("failed to prepare record insert statement")?;
                for record in &records {
                    ensure_not_abandoned(&abandoned)?;
                    inserted += stmt
                        .execute(params![record.fingerprint, record.raw, source, ingested_at])
                        .context("failed to insert log record")?
                        as u64;
                }
            }
            ensure_not_abandoned(&abandoned)?;
            tx.commit().context("failed to commit insert transaction")?;

            Ok::<_, anyhow::Error>(InsertOutcome {
                inserted,
                duplicates: records.len() as u64 - inserted,
            })
        })
        .await
        .context("record insert join error")??;

        debug!(
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            "committed record batch"
        );
        Ok(outcome)
    }

    async fn insert_event(&self, event: Event) -> Result<()> {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            conn.execute(
                "INSERT INTO event_logs (ts, source, key, event, value) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![event.timestamp, event.source, event.key, event.event, event.value],
            )
            .context("failed to insert event")?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .context("event insert join error")?
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<std::sync::MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| anyhow!("sqlite connection mutex poisoned"))
}

fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database {}", path.display()))?;

    conn.busy_timeout(busy_timeout)
        .context("failed to set busy timeout")?;
    let journal_mode: String = conn
        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
        .context("failed to enable WAL mode")?;
    if !journal_mode.eq_ignore_ascii_case("wal") {
        warn!(path = %path.display(), journal_mode, "database did not switch to WAL mode");
    }
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous mode")?;

    Ok(conn)
}

fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS log_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fingerprint TEXT NOT NULL UNIQUE,
            raw TEXT NOT NULL,
            source TEXT NOT NULL,
            ingested_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS event_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts INTEGER NOT NULL,
            source TEXT NOT NULL,
            key TEXT NOT NULL,
            event TEXT NOT NULL,
            value INTEGER NOT NULL
        );
        ",
    )
    .context("failed to create tables")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::RawLine;
    use crate::record::RecordParser;
    use tempfile::TempDir;

    fn records(lines: &[&str]) -> Vec<Record> {
        let parser = RecordParser::new();
        lines
            .iter()
            .map(|line| {
                parser
                    .parse(&RawLine {
                        offset: 0,
                        bytes: line.as_bytes().to_vec(),
                    })
                    .expect("valid")
            })
            .collect()
    }

    #[tokio::test]
    async fn duplicate_fingerprints_are_skipped() {
        let dir = TempDir::new().expect("tempdir");
        let store = SqliteStore::open(dir.path().join("db.sqlite"), DEFAULT_BUSY_TIMEOUT)
            .expect("open");

        let first = store
            .insert_batch("a.log".into(), records(&["{\"n\":1}", "{\"n\":2}"]))
            .await
            .expect("insert");
        assert_eq!(
            first,
            InsertOutcome {
                inserted: 2,
                duplicates: 0
            }
        );

        let second = store
            .insert_batch(
                "a.log".into(),
                records(&["{\"n\":2}", "{ \"n\" : 1 }", "{\"n\":3}"]),
            )
            .await
            .expect("insert");
        assert_eq!(
            second,
            InsertOutcome {
                inserted: 1,
                duplicates: 2
            }
        );
        assert_eq!(store.record_count().await.expect("count"), 3);
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nested").join("db.sqlite");
        {
            let store = SqliteStore::open(&path, DEFAULT_BUSY_TIMEOUT).expect("open");
            store
                .insert_batch("a.log".into(), records(&["{\"n\":1}"]))
                .await
                .expect("insert");
        }
        let store = SqliteStore::open(&path, DEFAULT_BUSY_TIMEOUT).expect("reopen");
        assert_eq!(store.record_count().await.expect("count"), 1);
        assert_eq!(
            store.records_for_source("a.log").await.expect("select"),
            vec!["{\"n\":1}".to_string()]
        );
    }

    #[tokio::test]
    async fn events_are_inserted() {
        let dir = TempDir::new().expect("tempdir");
        let store = SqliteStore::open(dir.path().join("db.sqlite"), DEFAULT_BUSY_TIMEOUT)
            .expect("open");
        store
            .insert_event(Event::new(1_700_000_000, "github", "org/repo", "stars", 42))
            .await
            .expect("insert");
        assert_eq!(store.event_count().await.expect("count"), 1);
    }
}
