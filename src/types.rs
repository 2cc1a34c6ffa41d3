use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Destination metric kind. Value type is always double in this bridge, so
/// only the kind varies between imported metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKind {
    Gauge,
    Cumulative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Double,
}

/// Schema record for a metric type at the destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDescriptor {
    /// Full metric type, e.g. `custom.googleapis.com/datadog/requests`.
    pub metric_type: String,
    pub metric_kind: MetricKind,
    pub value_type: ValueType,
    pub description: String,
    pub display_name: String,
    pub unit: Option<String>,
}

/// A single double-valued point. `start_time` is only set for cumulative
/// metrics, where it carries the counter window anchor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: DateTime<Utc>,
    pub value: f64,
}

/// Time series data to be written to the destination. The destination only
/// accepts a single point per series per request, so source adapters emit
/// one series per point and the adapter issues one request per series.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    pub metric_type: String,
    pub metric_kind: MetricKind,
    pub value_type: ValueType,
    pub points: Vec<Point>,
}

impl TimeSeries {
    /// Builds a series holding one point, the shape produced by all source
    /// adapters.
    pub fn single_point(
        metric_type: &str,
        kind: MetricKind,
        start_time: Option<DateTime<Utc>>,
        end_time: DateTime<Utc>,
        value: f64,
    ) -> Self {
        Self {
            metric_type: metric_type.to_string(),
            metric_kind: kind,
            value_type: ValueType::Double,
            points: vec![Point { start_time, end_time, value }],
        }
    }

    /// The maximum end time across this series' points.
    pub fn latest_end_time(&self) -> Option<DateTime<Utc>> {
        self.points.iter().map(|p| p.end_time).max()
    }
}
