//! Datadog-based source metric.

use super::{counter_start_time, NowFn, SourceMetric};
use crate::error::{BridgeError, Result};
use crate::storage::MetricRecord;
use crate::types::{MetricDescriptor, MetricKind, TimeSeries, ValueType};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::{debug, info};

const DEFAULT_BASE_URL: &str = "https://api.datadoghq.com";

/// Configuration file parameters for a metric imported from Datadog.
#[derive(Debug, Clone)]
pub struct DatadogConfig {
    pub query: String,
    pub api_key: String,
    pub application_key: String,
    pub cumulative: bool,
}

pub struct DatadogMetric {
    name: String,
    config: DatadogConfig,
    client: reqwest::Client,
    base_url: String,
    min_point_age: Duration,
    counter_reset_interval: Duration,
    now: NowFn,
}

impl DatadogMetric {
    pub fn new(
        name: &str,
        config: DatadogConfig,
        min_point_age: std::time::Duration,
        counter_reset_interval: std::time::Duration,
    ) -> Result<Self> {
        if config.cumulative && !config.query.contains("cumsum") {
            return Err(BridgeError::Config(format!(
                "query for the cumulative metric {name} does not contain the cumsum Datadog function"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            config,
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            min_point_age: Duration::from_std(min_point_age).unwrap_or_else(|_| Duration::minutes(2)),
            counter_reset_interval: Duration::from_std(counter_reset_interval)
                .unwrap_or_else(|_| Duration::minutes(30)),
            now: Utc::now,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    #[cfg(test)]
    pub(crate) fn with_now(mut self, now: NowFn) -> Self {
        self.now = now;
        self
    }

    fn metric_kind(&self) -> MetricKind {
        if self.config.cumulative {
            MetricKind::Cumulative
        } else {
            MetricKind::Gauge
        }
    }

    async fn run_query(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<QueryResponse> {
        let url = format!("{}/api/v1/query", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("DD-API-KEY", &self.config.api_key)
            .header("DD-APPLICATION-KEY", &self.config.application_key)
            .query(&[
                ("from", from.timestamp().to_string()),
                ("to", to.timestamp().to_string()),
                ("query", self.config.query.clone()),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(BridgeError::Source(format!(
                "Datadog query '{}' failed: HTTP {status}: {body}",
                self.config.query
            )));
        }
        Ok(resp.json().await?)
    }

    /// Drops points that are too fresh (still settling on the Datadog side)
    /// or at/before the last written point. For gauge metrics the latter is
    /// a noop since only new points are queried; for cumulative metrics this
    /// is where the already-reported monotone prefix is discarded.
    fn filter_points(
        &self,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
        points: &[RawPoint],
    ) -> Vec<(DateTime<Utc>, f64)> {
        points
            .iter()
            .filter_map(|p| match (p.0, p.1) {
                (Some(ts_ms), Some(value)) => {
                    Some((DateTime::from_timestamp_nanos((ts_ms * 1e6) as i64), value))
                }
                _ => None,
            })
            .filter(|(ts, _)| now - *ts >= self.min_point_age && *ts > since)
            .collect()
    }

    fn metric_descriptor(&self, series: &Series) -> MetricDescriptor {
        let unit = match series.unit.as_deref() {
            Some([Some(num), Some(den)]) => Some(format!("{}/{}", num.short_name, den.short_name)),
            Some(units) => units
                .iter()
                .flatten()
                .next()
                .map(|u| u.short_name.clone()),
            None => None,
        };
        MetricDescriptor {
            metric_type: self.destination_name(),
            metric_kind: self.metric_kind(),
            // The Datadog API does not declare a value type; all points come
            // back as doubles.
            value_type: ValueType::Double,
            description: format!("Datadog query: {}", self.config.query),
            display_name: series
                .display_name
                .clone()
                .unwrap_or_else(|| self.config.query.clone()),
            unit,
        }
    }

    fn convert_time_series(
        &self,
        start: DateTime<Utc>,
        points: &[(DateTime<Utc>, f64)],
    ) -> Vec<TimeSeries> {
        let start_time = self.config.cumulative.then_some(start);
        points
            .iter()
            .map(|(ts, value)| {
                TimeSeries::single_point(
                    &self.destination_name(),
                    self.metric_kind(),
                    start_time,
                    *ts,
                    *value,
                )
            })
            .collect()
    }
}

#[async_trait]
impl SourceMetric for DatadogMetric {
    fn destination_name(&self) -> String {
        format!("custom.googleapis.com/datadog/{}", self.name)
    }

    fn query(&self) -> &str {
        &self.config.query
    }

    async fn fetch_data(
        &self,
        since: DateTime<Utc>,
        record: &mut dyn MetricRecord,
    ) -> Result<Option<(MetricDescriptor, Vec<TimeSeries>)>> {
        let now = (self.now)();
        // Datadog's `from` parameter is inclusive and has one-second
        // granularity, so the window opens one second after the last point.
        let from = if self.config.cumulative {
            counter_start_time(
                &self.name,
                since,
                self.counter_reset_interval,
                Duration::seconds(1),
                record,
                now,
            )
            .await?
        } else {
            since + Duration::seconds(1)
        };
        let to = now - self.min_point_age;

        let resp = self.run_query(from, to).await?;
        if let Some(errors) = resp.errors {
            return Err(BridgeError::Source(format!(
                "Datadog query '{}' failed: {}",
                self.config.query,
                errors.join("; ")
            )));
        }

        if resp.series.is_empty() {
            info!("Datadog query '{}' returned no time series", self.config.query);
            return Ok(None);
        }
        if resp.series.len() > 1 {
            return Err(BridgeError::MultiSeries(resp.series.len()));
        }

        let series = &resp.series[0];
        let points = self.filter_points(since, now, &series.pointlist);
        debug!(
            "got {} points ({} after filtering) in response to the Datadog query '{}'",
            series.pointlist.len(),
            points.len(),
            self.config.query
        );

        Ok(Some((self.metric_descriptor(series), self.convert_time_series(from, &points))))
    }
}

/// A Datadog point is a `[timestamp_ms, value]` pair; either member may be
/// null.
type RawPoint = (Option<f64>, Option<f64>);

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    series: Vec<Series>,
    #[serde(default)]
    errors: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    pointlist: Vec<RawPoint>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    unit: Option<Vec<Option<Unit>>>,
}

#[derive(Debug, Deserialize)]
struct Unit {
    short_name: String,
}
