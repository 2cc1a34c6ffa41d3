//! InfluxDB (v1.x) based source metric.

use super::{counter_start_time, NowFn, SourceMetric};
use crate::error::{BridgeError, Result};
use crate::options::duration_from_parts;
use crate::storage::MetricRecord;
use crate::types::{MetricDescriptor, MetricKind, TimeSeries, ValueType};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;
use tracing::{debug, info};

/// Configuration file parameters for a metric imported from InfluxDB.
#[derive(Debug, Clone)]
pub struct InfluxDbConfig {
    pub query: String,
    pub database: String,
    pub endpoint: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub time_aggregated: bool,
    pub cumulative: bool,
}

impl InfluxDbConfig {
    /// The bucket width declared by the query's `GROUP BY time(...)` clause.
    /// Time-aggregated queries must declare exactly one.
    pub fn query_interval(&self) -> Result<Duration> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| {
            Regex::new(r"(?i)time\(([0-9]+)(ns|ms|u|µ|s|m|h|d|w)\)").unwrap()
        });

        let matches: Vec<_> = re.captures_iter(&self.query).collect();
        if matches.len() != 1 {
            return Err(BridgeError::Config(format!(
                "query '{}' has {} time groupings, expected 1",
                self.query,
                matches.len()
            )));
        }
        let interval = duration_from_parts(&matches[0][1], &matches[0][2])?;
        let interval = Duration::from_std(interval)
            .map_err(|_| BridgeError::Config(format!("query '{}' bucket interval overflows", self.query)))?;
        if interval <= Duration::zero() {
            return Err(BridgeError::Config(format!(
                "query '{}' must declare a positive bucket interval",
                self.query
            )));
        }
        Ok(interval)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.cumulative && !self.query.to_lowercase().contains("cumulative_sum") {
            return Err(BridgeError::Config(format!(
                "query for the cumulative metric {name} does not contain the CUMULATIVE_SUM InfluxQL function"
            )));
        }
        if self.time_aggregated {
            self.query_interval()?;
        }
        Ok(())
    }
}

pub struct InfluxDbMetric {
    name: String,
    config: InfluxDbConfig,
    client: reqwest::Client,
    min_point_age: Duration,
    counter_reset_interval: Duration,
    now: NowFn,
}

impl InfluxDbMetric {
    pub fn new(
        name: &str,
        config: InfluxDbConfig,
        min_point_age: std::time::Duration,
        counter_reset_interval: std::time::Duration,
    ) -> Result<Self> {
        config.validate(name)?;
        Ok(Self {
            name: name.to_string(),
            config,
            client: reqwest::Client::new(),
            min_point_age: Duration::from_std(min_point_age).unwrap_or_else(|_| Duration::minutes(2)),
            counter_reset_interval: Duration::from_std(counter_reset_interval)
                .unwrap_or_else(|_| Duration::minutes(30)),
            now: Utc::now,
        })
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

    /// Wraps the configured query in the time window, inclusive of start.
    fn build_query(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
        format!(
            "SELECT * FROM ({}) WHERE time >= {} AND time < {}",
            self.config.query,
            start.timestamp_nanos_opt().unwrap_or(0),
            end.timestamp_nanos_opt().unwrap_or(0)
        )
    }

    async fn run_query(&self, query: &str) -> Result<QueryResponse> {
        let url = format!("{}/query", self.config.endpoint.trim_end_matches('/'));
        let mut req = self.client.get(&url).query(&[
            ("db", self.config.database.as_str()),
            ("q", query),
            ("epoch", "ns"),
        ]);
        if let Some(username) = &self.config.username {
            req = req.basic_auth(username, self.config.password.as_deref());
        }
        let resp = req.send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(BridgeError::Source(format!(
                "InfluxDB query '{}' failed: HTTP {status}: {body}",
                self.config.query
            )));
        }
        let body: QueryResponse = resp.json().await?;
        if let Some(e) = &body.error {
            return Err(BridgeError::Source(format!(
                "InfluxDB query '{}' failed: {e}",
                self.config.query
            )));
        }
        for result in &body.results {
            if let Some(e) = &result.error {
                return Err(BridgeError::Source(format!(
                    "InfluxDB query '{}' failed: {e}",
                    self.config.query
                )));
            }
        }
        Ok(body)
    }

    fn filter_points(
        &self,
        since: DateTime<Utc>,
        end: DateTime<Utc>,
        points: Vec<(DateTime<Utc>, f64)>,
    ) -> Result<Vec<(DateTime<Utc>, f64)>> {
        if !self.config.time_aggregated && !self.config.cumulative {
            // Raw gauge queries only ever cover new points, and freshness is
            // handled by the end bound.
            return Ok(points);
        }

        let interval =
            if self.config.time_aggregated { Some(self.config.query_interval()?) } else { None };

        let mut filtered = Vec::with_capacity(points.len());
        for (mut ts, value) in points {
            if let Some(interval) = interval {
                // A row at t aggregates the interval [t, t + w), so t + w is
                // its end time; buckets that have not finished accumulating
                // wait for the next sync.
                ts = ts + interval;
                if ts > end {
                    continue;
                }
            }
            // Already-processed points are dropped; cumulative queries must
            // still cover them so the source returns a running sum.
            if ts <= since {
                continue;
            }
            filtered.push((ts, value));
        }
        Ok(filtered)
    }

    fn metric_descriptor(&self) -> MetricDescriptor {
        MetricDescriptor {
            metric_type: self.destination_name(),
            metric_kind: self.metric_kind(),
            // Column types are not declared by the API; points are doubles.
            value_type: ValueType::Double,
            description: format!("InfluxDB query: {}", self.name),
            display_name: self.config.query.clone(),
            unit: None,
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
impl SourceMetric for InfluxDbMetric {
    fn destination_name(&self) -> String {
        format!("custom.googleapis.com/influxdb/{}", self.name)
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

        let start = if self.config.cumulative {
            // Cumulative queries re-cover the whole counter window so the
            // source can return a running sum.
            let epsilon = if self.config.time_aggregated {
                Duration::zero()
            } else {
                Duration::nanoseconds(1)
            };
            counter_start_time(&self.name, since, self.counter_reset_interval, epsilon, record, now)
                .await?
        } else if !self.config.time_aggregated {
            // InfluxQL timestamps are inclusive, so raw gauge windows open a
            // nanosecond after the last point.
            since + Duration::nanoseconds(1)
        } else {
            since
        };
        let end = now - self.min_point_age;

        let resp = self.run_query(&self.build_query(start, end)).await?;
        if resp.results.len() != 1 {
            return Err(BridgeError::Source(format!(
                "InfluxDB query '{}' returned {} query results, expected 1",
                self.config.query,
                resp.results.len()
            )));
        }

        let series = &resp.results[0].series;
        if series.is_empty() {
            info!("InfluxDB query '{}' returned no time series", self.config.query);
            return Ok(None);
        }
        if series.len() > 1 {
            return Err(BridgeError::MultiSeries(series.len()));
        }

        let points = parse_series_points(&series[0])?;
        let count = points.len();
        let points = self.filter_points(since, end, points)?;
        debug!(
            "got {} points ({} after filtering) in response to the InfluxDB query '{}'",
            count,
            points.len(),
            self.config.query
        );

        Ok(Some((self.metric_descriptor(), self.convert_time_series(start, &points))))
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<QueryResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    #[serde(default)]
    series: Vec<Series>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

/// Parses rows from an InfluxDB series into timestamp-value pairs. Rows must
/// have exactly a `time` column (nanosecond epoch) and one value column.
fn parse_series_points(series: &Series) -> Result<Vec<(DateTime<Utc>, f64)>> {
    if series.columns.len() != 2 {
        return Err(BridgeError::Source(format!(
            "series has columns {:?}, expected only 2 columns",
            series.columns
        )));
    }
    if series.columns[0] != "time" {
        return Err(BridgeError::Source(format!(
            "series has first column '{}', expected 'time'",
            series.columns[0]
        )));
    }

    let mut points = Vec::with_capacity(series.values.len());
    for row in &series.values {
        if row.len() != 2 {
            return Err(BridgeError::Source(format!("row {row:?} has {} values, expected 2", row.len())));
        }
        let ts = row[0]
            .as_i64()
            .ok_or_else(|| BridgeError::Source(format!("could not parse '{}' as a nanosecond timestamp", row[0])))?;
        let value = row[1]
            .as_f64()
            .ok_or_else(|| BridgeError::Source(format!("could not parse '{}' as a double", row[1])))?;
        points.push((DateTime::from_timestamp_nanos(ts), value));
    }
    Ok(points)
}
