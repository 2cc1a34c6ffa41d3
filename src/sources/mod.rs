//! Source adapters that run a configured query against an external
//! monitoring backend and translate the response into destination points.

pub mod datadog;
pub mod influxdb;

use crate::error::Result;
use crate::storage::MetricRecord;
use crate::types::{MetricDescriptor, TimeSeries};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::info;

/// Injectable clock, the test seam for window arithmetic.
pub type NowFn = fn() -> DateTime<Utc>;

/// Interface implemented by the source metric adapters (Datadog, InfluxDB).
#[async_trait]
pub trait SourceMetric: Send + Sync {
    /// Full metric type under which this metric is written at the
    /// destination.
    fn destination_name(&self) -> String;

    /// The query being imported, for audit and display.
    fn query(&self) -> &str;

    /// Runs the source query for points after `since` and returns the
    /// descriptor plus the series to write. `None` means the source returned
    /// no data for the window, which is not an error.
    async fn fetch_data(
        &self,
        since: DateTime<Utc>,
        record: &mut dyn MetricRecord,
    ) -> Result<Option<(MetricDescriptor, Vec<TimeSeries>)>>;
}

/// Returns the start time for a cumulative metric's query window, moving the
/// persisted anchor forward when it has aged past the reset interval.
///
/// The anchor needs to be reset regularly, since otherwise the source would
/// be queried over a window large enough for aggregation or response
/// truncation to kick in. `epsilon` is the tick that separates the new
/// window from the last written point: one second for Datadog, one
/// nanosecond for raw InfluxDB queries, zero for time-aggregated ones.
pub(crate) async fn counter_start_time(
    name: &str,
    last_point: DateTime<Utc>,
    reset_interval: Duration,
    epsilon: Duration,
    record: &mut dyn MetricRecord,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    if now - record.counter_start_time() > reset_interval {
        let start = if now - last_point <= reset_interval {
            // Common case: anchor just past the last written point, which
            // preserves continuity of data.
            last_point + epsilon
        } else {
            // Rare case: the last point is itself older than the reset
            // interval (new metric, or writes have been failing), so an
            // anchor based on it would immediately need another reset.
            // Half the interval back backfills some data without resetting
            // again right away.
            now - reset_interval / 2
        };
        record.set_counter_start_time(start).await?;
        info!("counter start time for {name} has been reset to {start}");
    }
    Ok(record.counter_start_time())
}
