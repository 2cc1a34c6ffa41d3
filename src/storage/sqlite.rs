//! Embedded metadata store backed by a single SQLite file.
//!
//! The file is opened in exclusive locking mode so two bridge processes
//! cannot share a store, and WAL journaling keeps half-written updates from
//! surviving a crash.

use super::{from_nanos, to_nanos, CleanupOutcome, Manager, MetricRecord, RecordFields};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const SCHEMA: &str = r#"
PRAGMA journal_mode=WAL;
PRAGMA locking_mode=EXCLUSIVE;
CREATE TABLE IF NOT EXISTS metric_records (
    name               TEXT PRIMARY KEY,
    query              TEXT NOT NULL DEFAULT '',
    last_update        INTEGER NOT NULL DEFAULT 0,
    last_attempt       INTEGER NOT NULL DEFAULT 0,
    last_status        TEXT NOT NULL DEFAULT '',
    counter_start_time INTEGER NOT NULL DEFAULT 0
);
"#;

type SharedConn = Arc<Mutex<Option<Connection>>>;

pub struct SqliteManager {
    conn: SharedConn,
    path: PathBuf,
}

impl SqliteManager {
    /// Opens (or creates) the store file. Defaults to `bridge.db` in the
    /// working directory when no path is configured.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => std::env::current_dir()
                .map_err(|e| BridgeError::Storage(format!("could not get working directory: {e}")))?
                .join("bridge.db"),
        };
        let conn = Connection::open(&path)
            .map_err(|e| BridgeError::Storage(format!("could not open store at {}: {e}", path.display())))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| BridgeError::Storage(format!("could not create schema: {e}")))?;
        debug!("opened SQLite store at {}", path.display());
        Ok(Self { conn: Arc::new(Mutex::new(Some(conn))), path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn with_conn<T>(conn: &SharedConn, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
    let guard = conn.lock().unwrap();
    let conn = guard
        .as_ref()
        .ok_or_else(|| BridgeError::Storage("store is closed".to_string()))?;
    f(conn).map_err(|e| BridgeError::Storage(e.to_string()))
}

fn load_fields(conn: &SharedConn, name: &str) -> Result<Option<RecordFields>> {
    with_conn(conn, |c| {
        c.query_row(
            "SELECT name, query, last_update, last_attempt, last_status, counter_start_time
             FROM metric_records WHERE name = ?1",
            params![name],
            |row| {
                Ok(RecordFields {
                    name: row.get(0)?,
                    query: row.get(1)?,
                    last_update: from_nanos(row.get(2)?),
                    last_attempt: from_nanos(row.get(3)?),
                    last_status: row.get(4)?,
                    counter_start_time: from_nanos(row.get(5)?),
                })
            },
        )
        .optional()
    })
}

fn write_fields(conn: &SharedConn, f: &RecordFields) -> Result<()> {
    with_conn(conn, |c| {
        c.execute(
            "INSERT OR REPLACE INTO metric_records
             (name, query, last_update, last_attempt, last_status, counter_start_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                f.name,
                f.query,
                to_nanos(f.last_update),
                to_nanos(f.last_attempt),
                f.last_status,
                to_nanos(f.counter_start_time),
            ],
        )
        .map(|_| ())
    })
}

#[async_trait]
impl Manager for SqliteManager {
    async fn new_metric_record(&self, name: &str, query: &str) -> Result<Box<dyn MetricRecord>> {
        let mut fields = load_fields(&self.conn, name)?.unwrap_or_else(|| RecordFields::zero(name));
        fields.query = query.to_string();
        Ok(Box::new(SqliteMetricRecord { fields, conn: Arc::clone(&self.conn) }))
    }

    async fn cleanup_records(&self, keep: &[String]) -> Result<CleanupOutcome> {
        let names: Vec<String> = with_conn(&self.conn, |c| {
            let mut stmt = c.prepare("SELECT name FROM metric_records")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect()
        })?;
        let stale: Vec<&String> = names.iter().filter(|n| !keep.contains(n)).collect();
        info!(
            "{} metrics configured, {} stale metric records found in the store",
            keep.len(),
            stale.len()
        );
        for name in &stale {
            info!("deleting obsolete metric record for {name}");
            with_conn(&self.conn, |c| {
                c.execute("DELETE FROM metric_records WHERE name = ?1", params![name])
            })?;
        }
        Ok(CleanupOutcome { records_found: names.len(), records_deleted: stale.len() })
    }

    async fn close(&self) -> Result<()> {
        // Dropping the connection releases the file lock.
        let conn = self.conn.lock().unwrap().take();
        drop(conn);
        Ok(())
    }
}

pub struct SqliteMetricRecord {
    fields: RecordFields,
    conn: SharedConn,
}

#[async_trait]
impl MetricRecord for SqliteMetricRecord {
    fn name(&self) -> &str {
        &self.fields.name
    }

    fn query(&self) -> &str {
        &self.fields.query
    }

    fn last_update(&self) -> DateTime<Utc> {
        self.fields.last_update
    }

    fn last_attempt(&self) -> DateTime<Utc> {
        self.fields.last_attempt
    }

    fn last_status(&self) -> &str {
        &self.fields.last_status
    }

    fn counter_start_time(&self) -> DateTime<Utc> {
        self.fields.counter_start_time
    }

    async fn set_counter_start_time(&mut self, start: DateTime<Utc>) -> Result<()> {
        self.fields.counter_start_time = start;
        write_fields(&self.conn, &self.fields)
    }

    async fn update_error(&mut self, e: &str) -> Result<()> {
        self.fields.apply_error(e);
        write_fields(&self.conn, &self.fields)
    }

    async fn update_success(&mut self, points: usize, msg: &str) -> Result<()> {
        self.fields.apply_success(points, msg);
        write_fields(&self.conn, &self.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(dir: &tempfile::TempDir) -> SqliteManager {
        SqliteManager::open(Some(&dir.path().join("bridge.db"))).unwrap()
    }

    #[tokio::test]
    async fn absent_record_reads_zero_values() {
        let dir = tempdir().unwrap();
        let m = manager(&dir);
        let r = m.new_metric_record("metric1", "avg:foo{*}").await.unwrap();
        assert_eq!(r.name(), "metric1");
        assert_eq!(r.query(), "avg:foo{*}");
        assert_eq!(r.last_update(), DateTime::UNIX_EPOCH);
        assert_eq!(r.counter_start_time(), DateTime::UNIX_EPOCH);
        assert_eq!(r.last_status(), "");
    }

    #[tokio::test]
    async fn new_record_does_not_write_until_updated() {
        let dir = tempdir().unwrap();
        let m = manager(&dir);
        {
            let _r = m.new_metric_record("metric1", "q").await.unwrap();
        }
        let outcome = m.cleanup_records(&[]).await.unwrap();
        assert_eq!(outcome.records_found, 0);
    }

    #[tokio::test]
    async fn status_updates_round_trip() {
        let dir = tempdir().unwrap();
        let m = manager(&dir);

        let mut r = m.new_metric_record("metric1", "q").await.unwrap();
        r.update_success(2, "2 new points found").await.unwrap();
        let first_update = r.last_update();
        assert!(Utc::now() - first_update < chrono::Duration::minutes(1));

        r.update_error("query failed").await.unwrap();

        // Reload from disk through a fresh handle.
        let r2 = m.new_metric_record("metric1", "q").await.unwrap();
        assert_eq!(r2.last_status(), "ERROR: query failed");
        assert_eq!(r2.last_update(), first_update);
    }

    #[tokio::test]
    async fn success_without_points_keeps_last_update() {
        let dir = tempdir().unwrap();
        let m = manager(&dir);
        let mut r = m.new_metric_record("metric1", "q").await.unwrap();
        r.update_success(0, "0 new points found").await.unwrap();
        assert_eq!(r.last_update(), DateTime::UNIX_EPOCH);
        assert!(r.last_status().starts_with("OK:"));
    }

    #[tokio::test]
    async fn counter_start_time_persists_immediately() {
        let dir = tempdir().unwrap();
        let m = manager(&dir);
        let mut r = m.new_metric_record("metric1", "q").await.unwrap();
        let anchor = Utc::now();
        r.set_counter_start_time(anchor).await.unwrap();

        let r2 = m.new_metric_record("metric1", "q").await.unwrap();
        assert_eq!(r2.counter_start_time(), anchor);
    }

    #[tokio::test]
    async fn cleanup_removes_only_stale_records() {
        let dir = tempdir().unwrap();
        let m = manager(&dir);
        for name in ["a", "b", "c"] {
            let mut r = m.new_metric_record(name, "q").await.unwrap();
            r.update_success(1, "1 new point").await.unwrap();
        }

        let keep = vec!["a".to_string()];
        let outcome = m.cleanup_records(&keep).await.unwrap();
        assert_eq!(outcome, CleanupOutcome { records_found: 3, records_deleted: 2 });

        let r = m.new_metric_record("b", "q").await.unwrap();
        assert_eq!(r.last_update(), DateTime::UNIX_EPOCH);
        let r = m.new_metric_record("a", "q").await.unwrap();
        assert!(r.last_update() > DateTime::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn writes_after_close_fail() {
        let dir = tempdir().unwrap();
        let m = manager(&dir);
        let mut r = m.new_metric_record("metric1", "q").await.unwrap();
        m.close().await.unwrap();
        assert!(r.update_success(1, "late").await.is_err());
    }
}
