//! Destination adapter for Google Cloud Monitoring (Stackdriver).

pub mod adapter;
pub mod client;

use crate::error::Result;
use crate::types::{MetricDescriptor, TimeSeries};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use adapter::Adapter;
pub use client::RestMetricClient;

/// The narrow client seam the adapter speaks through. The production
/// implementation is [`RestMetricClient`]; tests substitute a fake.
#[async_trait]
pub trait MetricClient: Send + Sync {
    async fn get_metric_descriptor(
        &self,
        project: &str,
        metric_type: &str,
    ) -> Result<Option<MetricDescriptor>>;

    async fn create_metric_descriptor(&self, project: &str, desc: &MetricDescriptor) -> Result<()>;

    async fn delete_metric_descriptor(&self, project: &str, metric_type: &str) -> Result<()>;

    /// Lists series for a metric type whose points fall inside the window.
    async fn list_time_series(
        &self,
        project: &str,
        metric_type: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimeSeries>>;

    /// Writes a single series. The destination only accepts one point per
    /// series per request.
    async fn create_time_series(&self, project: &str, series: &TimeSeries) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Destination operations used by metric updates.
#[async_trait]
pub trait StackdriverAdapter: Send + Sync {
    /// Timestamp of the latest point for a metric, or `now - lookback` when
    /// the metric has no descriptor or no recent points.
    async fn latest_timestamp(&self, project: &str, metric_type: &str) -> Result<DateTime<Utc>>;

    /// Installs the descriptor (replacing an incompatible one) and writes
    /// each series in its own request.
    async fn create_timeseries(
        &self,
        project: &str,
        metric_type: &str,
        desc: &MetricDescriptor,
        series: &[TimeSeries],
    ) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
