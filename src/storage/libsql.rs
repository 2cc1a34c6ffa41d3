//! Remote metadata store backed by a hosted libSQL database.
//!
//! One row per metric name, last-writer-wins. Connection settings come from
//! the `LIBSQL_URL` and `LIBSQL_AUTH_TOKEN` environment variables.

use super::{from_nanos, to_nanos, CleanupOutcome, Manager, MetricRecord, RecordFields};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Database};
use std::env;
use std::sync::Arc;
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS metric_records (
    name               TEXT PRIMARY KEY,
    query              TEXT NOT NULL DEFAULT '',
    last_update        INTEGER NOT NULL DEFAULT 0,
    last_attempt       INTEGER NOT NULL DEFAULT 0,
    last_status        TEXT NOT NULL DEFAULT '',
    counter_start_time INTEGER NOT NULL DEFAULT 0
);
"#;

pub struct LibsqlManager {
    db: Arc<Database>,
}

impl LibsqlManager {
    /// Connects to the remote store configured via environment variables and
    /// makes sure the schema exists.
    pub async fn connect_from_env() -> Result<Self> {
        let url = env::var("LIBSQL_URL")
            .map_err(|_| BridgeError::Storage("LIBSQL_URL environment variable not set".to_string()))?;
        let auth_token = env::var("LIBSQL_AUTH_TOKEN").map_err(|_| {
            BridgeError::Storage("LIBSQL_AUTH_TOKEN environment variable not set".to_string())
        })?;

        info!("connecting to remote metadata store at {url}");
        let db = Builder::new_remote(url, auth_token)
            .build()
            .await
            .map_err(|e| BridgeError::Storage(format!("failed to connect to remote store: {e}")))?;

        let manager = Self { db: Arc::new(db) };
        let conn = manager.connection()?;
        conn.execute_batch(SCHEMA)
            .await
            .map_err(|e| BridgeError::Storage(format!("failed to create schema: {e}")))?;
        Ok(manager)
    }

    fn connection(&self) -> Result<Connection> {
        self.db
            .connect()
            .map_err(|e| BridgeError::Storage(format!("failed to get store connection: {e}")))
    }
}

async fn load_fields(conn: &Connection, name: &str) -> Result<Option<RecordFields>> {
    let mut rows = conn
        .query(
            "SELECT name, query, last_update, last_attempt, last_status, counter_start_time
             FROM metric_records WHERE name = ?1",
            libsql::params![name],
        )
        .await
        .map_err(|e| BridgeError::Storage(format!("failed to query record: {e}")))?;

    let Some(row) = rows
        .next()
        .await
        .map_err(|e| BridgeError::Storage(format!("failed to read row: {e}")))?
    else {
        return Ok(None);
    };

    let get_err = |e| BridgeError::Storage(format!("failed to read record column: {e}"));
    Ok(Some(RecordFields {
        name: row.get::<String>(0).map_err(get_err)?,
        query: row.get::<String>(1).map_err(get_err)?,
        last_update: from_nanos(row.get::<i64>(2).map_err(get_err)?),
        last_attempt: from_nanos(row.get::<i64>(3).map_err(get_err)?),
        last_status: row.get::<String>(4).map_err(get_err)?,
        counter_start_time: from_nanos(row.get::<i64>(5).map_err(get_err)?),
    }))
}

async fn write_fields(db: &Database, f: &RecordFields) -> Result<()> {
    let conn = db
        .connect()
        .map_err(|e| BridgeError::Storage(format!("failed to get store connection: {e}")))?;
    conn.execute(
        "INSERT OR REPLACE INTO metric_records
         (name, query, last_update, last_attempt, last_status, counter_start_time)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        libsql::params![
            f.name.as_str(),
            f.query.as_str(),
            to_nanos(f.last_update),
            to_nanos(f.last_attempt),
            f.last_status.as_str(),
            to_nanos(f.counter_start_time),
        ],
    )
    .await
    .map_err(|e| BridgeError::Storage(format!("failed to upsert record: {e}")))?;
    Ok(())
}

#[async_trait]
impl Manager for LibsqlManager {
    async fn new_metric_record(&self, name: &str, query: &str) -> Result<Box<dyn MetricRecord>> {
        let conn = self.connection()?;
        let mut fields = load_fields(&conn, name)
            .await?
            .unwrap_or_else(|| RecordFields::zero(name));
        fields.query = query.to_string();
        Ok(Box::new(LibsqlMetricRecord { fields, db: Arc::clone(&self.db) }))
    }

    async fn cleanup_records(&self, keep: &[String]) -> Result<CleanupOutcome> {
        let conn = self.connection()?;
        let mut rows = conn
            .query("SELECT name FROM metric_records", ())
            .await
            .map_err(|e| BridgeError::Storage(format!("could not list metric records: {e}")))?;

        let mut names = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| BridgeError::Storage(format!("failed to read row: {e}")))?
        {
            let name: String = row
                .get(0)
                .map_err(|e| BridgeError::Storage(format!("failed to read record name: {e}")))?;
            names.push(name);
        }

        let stale: Vec<&String> = names.iter().filter(|n| !keep.contains(n)).collect();
        info!(
            "{} metrics configured, {} stale metric records found in the store",
            keep.len(),
            stale.len()
        );
        for name in &stale {
            info!("deleting obsolete metric record for {name}");
            conn.execute(
                "DELETE FROM metric_records WHERE name = ?1",
                libsql::params![name.as_str()],
            )
            .await
            .map_err(|e| BridgeError::Storage(format!("could not delete metric record {name}: {e}")))?;
        }
        Ok(CleanupOutcome { records_found: names.len(), records_deleted: stale.len() })
    }

    async fn close(&self) -> Result<()> {
        // Remote connections are per-operation; nothing to release.
        Ok(())
    }
}

pub struct LibsqlMetricRecord {
    fields: RecordFields,
    db: Arc<Database>,
}

#[async_trait]
impl MetricRecord for LibsqlMetricRecord {
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
        write_fields(&self.db, &self.fields).await
    }

    async fn update_error(&mut self, e: &str) -> Result<()> {
        self.fields.apply_error(e);
        write_fields(&self.db, &self.fields).await
    }

    async fn update_success(&mut self, points: usize, msg: &str) -> Result<()> {
        self.fields.apply_success(points, msg);
        write_fields(&self.db, &self.fields).await
    }
}
