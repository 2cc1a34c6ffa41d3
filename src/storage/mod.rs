//! Pluggable persistence for per-metric import state.
//!
//! Records are keyed by metric name; each record keeps the last successful
//! write time, the last attempt time, a short status string and the counter
//! window anchor for cumulative metrics. Backends are interchangeable and
//! selected by the `storage_engine` option.

pub mod libsql;
pub mod memory;
pub mod sqlite;

use crate::error::{BridgeError, Result};
use crate::options::BridgeOptions;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info};

/// Storage manager implemented by each backend.
#[async_trait]
pub trait Manager: Send + Sync {
    /// Returns a record handle for a metric, reflecting any previously
    /// persisted state (zero-valued if absent). The query is updated in
    /// memory only; nothing is written until the first status update.
    async fn new_metric_record(&self, name: &str, query: &str) -> Result<Box<dyn MetricRecord>>;

    /// Removes persisted records whose name is not in `keep`.
    async fn cleanup_records(&self, keep: &[String]) -> Result<CleanupOutcome>;

    /// Releases underlying resources; safe to call once.
    async fn close(&self) -> Result<()>;
}

/// Counts reported by a cleanup pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupOutcome {
    pub records_found: usize,
    pub records_deleted: usize,
}

/// Handle to the persisted state of a single metric. Each handle is owned by
/// exactly one metric; no two tasks ever mutate the same record.
#[async_trait]
pub trait MetricRecord: Send + Sync {
    fn name(&self) -> &str;
    fn query(&self) -> &str;
    fn last_update(&self) -> DateTime<Utc>;
    fn last_attempt(&self) -> DateTime<Utc>;
    fn last_status(&self) -> &str;
    fn counter_start_time(&self) -> DateTime<Utc>;

    /// Sets the counter window anchor and persists immediately.
    async fn set_counter_start_time(&mut self, start: DateTime<Utc>) -> Result<()>;

    /// Records a failed update attempt and persists.
    async fn update_error(&mut self, e: &str) -> Result<()>;

    /// Records a successful update attempt and persists. `last_update` only
    /// advances when at least one point was written.
    async fn update_success(&mut self, points: usize, msg: &str) -> Result<()>;
}

/// Instantiates the storage manager selected by the runtime options.
pub async fn load_storage_engine(opts: &BridgeOptions) -> Result<Box<dyn Manager>> {
    match opts.storage_engine.as_str() {
        "sqlite" => Ok(Box::new(sqlite::SqliteManager::open(opts.sqlite_path.as_deref())?)),
        "libsql" => Ok(Box::new(libsql::LibsqlManager::connect_from_env().await?)),
        "memory" => Ok(Box::new(memory::MemoryManager::new())),
        other => Err(BridgeError::Config(format!(
            "unknown storage engine selected: {other}"
        ))),
    }
}

/// The fields shared by every backend's record representation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RecordFields {
    pub name: String,
    pub query: String,
    pub last_update: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,
    pub last_status: String,
    pub counter_start_time: DateTime<Utc>,
}

impl RecordFields {
    pub fn zero(name: &str) -> Self {
        Self {
            name: name.to_string(),
            query: String::new(),
            last_update: DateTime::UNIX_EPOCH,
            last_attempt: DateTime::UNIX_EPOCH,
            last_status: String::new(),
            counter_start_time: DateTime::UNIX_EPOCH,
        }
    }

    pub fn apply_error(&mut self, e: &str) {
        error!("{}: {}", self.name, e);
        self.last_status = format!("ERROR: {e}");
        self.last_attempt = Utc::now();
    }

    pub fn apply_success(&mut self, points: usize, msg: &str) {
        info!("{}: {}", self.name, msg);
        self.last_status = format!("OK: {msg}");
        self.last_attempt = Utc::now();
        if points > 0 {
            self.last_update = Utc::now();
        }
    }
}

/// Timestamps persist as nanoseconds since epoch so the InfluxDB adapter's
/// one-nanosecond window arithmetic survives a round-trip.
pub(crate) fn to_nanos(t: DateTime<Utc>) -> i64 {
    t.timestamp_nanos_opt().unwrap_or(0)
}

pub(crate) fn from_nanos(n: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_record_has_epoch_timestamps() {
        let f = RecordFields::zero("m");
        assert_eq!(f.last_update, DateTime::UNIX_EPOCH);
        assert_eq!(f.counter_start_time, DateTime::UNIX_EPOCH);
        assert!(f.last_status.is_empty());
    }

    #[test]
    fn apply_error_sets_prefix_and_attempt() {
        let mut f = RecordFields::zero("m");
        f.apply_error("source unreachable");
        assert_eq!(f.last_status, "ERROR: source unreachable");
        assert!(Utc::now() - f.last_attempt < chrono::Duration::minutes(1));
        assert_eq!(f.last_update, DateTime::UNIX_EPOCH);
    }

    #[test]
    fn apply_success_advances_last_update_only_with_points() {
        let mut f = RecordFields::zero("m");
        f.apply_success(0, "0 new points");
        assert_eq!(f.last_status, "OK: 0 new points");
        assert_eq!(f.last_update, DateTime::UNIX_EPOCH);

        f.apply_success(3, "3 new points");
        assert!(Utc::now() - f.last_update < chrono::Duration::minutes(1));
    }

    #[test]
    fn nanos_round_trip() {
        let t = Utc::now();
        assert_eq!(from_nanos(to_nanos(t)), t);
        assert_eq!(from_nanos(0), DateTime::UNIX_EPOCH);
    }
}
