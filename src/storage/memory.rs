//! In-memory metadata store for development and testing. Data does not
//! survive the process.

use super::{CleanupOutcome, Manager, MetricRecord, RecordFields};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

type SharedRecords = Arc<Mutex<HashMap<String, RecordFields>>>;

#[derive(Default)]
pub struct MemoryManager {
    records: SharedRecords,
}

impl MemoryManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Manager for MemoryManager {
    async fn new_metric_record(&self, name: &str, query: &str) -> Result<Box<dyn MetricRecord>> {
        let mut fields = self
            .records
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_else(|| RecordFields::zero(name));
        fields.query = query.to_string();
        Ok(Box::new(MemoryMetricRecord { fields, records: Arc::clone(&self.records) }))
    }

    async fn cleanup_records(&self, keep: &[String]) -> Result<CleanupOutcome> {
        let mut records = self.records.lock().unwrap();
        let found = records.len();
        records.retain(|name, _| keep.contains(name));
        let deleted = found - records.len();
        info!("{} metrics configured, {} stale metric records found in the store", keep.len(), deleted);
        Ok(CleanupOutcome { records_found: found, records_deleted: deleted })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct MemoryMetricRecord {
    fields: RecordFields,
    records: SharedRecords,
}

impl MemoryMetricRecord {
    fn write(&self) {
        self.records
            .lock()
            .unwrap()
            .insert(self.fields.name.clone(), self.fields.clone());
    }
}

#[async_trait]
impl MetricRecord for MemoryMetricRecord {
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
        self.write();
        Ok(())
    }

    async fn update_error(&mut self, e: &str) -> Result<()> {
        self.fields.apply_error(e);
        self.write();
        Ok(())
    }

    async fn update_success(&mut self, points: usize, msg: &str) -> Result<()> {
        self.fields.apply_success(points, msg);
        self.write();
        Ok(())
    }
}
