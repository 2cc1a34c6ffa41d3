//! A metric that is regularly imported from a source into the destination.

use crate::error::Result;
use crate::sources::SourceMetric;
use crate::stackdriver::StackdriverAdapter;
use crate::stats::StatsCollector;
use crate::storage::{Manager, MetricRecord};
use std::time::Instant;
use tracing::debug;

pub struct Metric {
    pub name: String,
    pub source: Box<dyn SourceMetric>,
    /// Destination project this metric is written to.
    pub sd_project: String,
    pub record: Box<dyn MetricRecord>,
}

/// The result of one update step. A failed source or destination call is
/// recorded on the metric record and reported here rather than returned as
/// an error, so one broken metric does not halt the fleet. Only storage
/// failures propagate as hard errors.
#[derive(Debug, Default)]
pub struct UpdateOutcome {
    pub points_written: usize,
    pub error: Option<String>,
}

impl Metric {
    /// Creates a metric bound to its source, destination project and stored
    /// record.
    pub async fn new(
        name: &str,
        source: Box<dyn SourceMetric>,
        sd_project: &str,
        storage: &dyn Manager,
    ) -> Result<Self> {
        let record = storage.new_metric_record(name, source.query()).await?;
        Ok(Self {
            name: name.to_string(),
            source,
            sd_project: sd_project.to_string(),
            record,
        })
    }

    /// Metrics Explorer URL for this metric, linked from the status page.
    pub fn stackdriver_url(&self) -> String {
        let chart = format!(
            "{{\"dataSets\":[{{\"timeSeriesFilter\":{{\"filter\":\"metric.type=\\\"{}\\\" resource.type=\\\"global\\\"\"}}}}]}}",
            self.source.destination_name()
        );
        reqwest::Url::parse_with_params(
            "https://console.cloud.google.com/monitoring/metrics-explorer",
            &[("project", self.sd_project.as_str()), ("xyChart", chart.as_str())],
        )
        .map(|u| u.to_string())
        .unwrap_or_default()
    }

    /// Issues the configured query and imports new points to the
    /// destination.
    pub async fn update(
        &mut self,
        sd: &dyn StackdriverAdapter,
        stats: &StatsCollector,
    ) -> Result<UpdateOutcome> {
        let start = Instant::now();
        let outcome = self.run_update(sd, start).await;
        stats.record_metric_import_latency(&self.name, start.elapsed());
        outcome
    }

    async fn run_update(
        &mut self,
        sd: &dyn StackdriverAdapter,
        start: Instant,
    ) -> Result<UpdateOutcome> {
        let latest = match sd.latest_timestamp(&self.sd_project, &self.source.destination_name()).await
        {
            Ok(latest) => latest,
            Err(e) => {
                let msg = format!("failed to get latest timestamp: {e}");
                self.record.update_error(&msg).await?;
                return Ok(UpdateOutcome { points_written: 0, error: Some(msg) });
            }
        };
        debug!("updating {} from {latest}", self.name);

        let data = match self.source.fetch_data(latest, self.record.as_mut()).await {
            Ok(data) => data,
            Err(e) => {
                let msg = format!("failed to get data: {e}");
                self.record.update_error(&msg).await?;
                return Ok(UpdateOutcome { points_written: 0, error: Some(msg) });
            }
        };

        let points = match data {
            Some((desc, series)) if !series.is_empty() => {
                if let Err(e) = sd
                    .create_timeseries(&self.sd_project, &self.source.destination_name(), &desc, &series)
                    .await
                {
                    let msg = format!("failed to write to Stackdriver: {e}");
                    self.record.update_error(&msg).await?;
                    return Ok(UpdateOutcome { points_written: 0, error: Some(msg) });
                }
                series.len()
            }
            _ => 0,
        };

        self.record
            .update_success(
                points,
                &format!("{points} new points found since {latest} [took {:?}]", start.elapsed()),
            )
            .await?;
        Ok(UpdateOutcome { points_written: points, error: None })
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::error::{BridgeError, Result};
    use crate::sources::SourceMetric;
    use crate::stackdriver::StackdriverAdapter;
    use crate::storage::MetricRecord;
    use crate::types::{MetricDescriptor, MetricKind, TimeSeries, ValueType};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Source fake returning a fixed number of points, optionally failing or
    /// stalling first.
    pub struct FakeSource {
        pub name: String,
        pub points: usize,
        pub fail: bool,
        pub delay: Option<std::time::Duration>,
        pub concurrency: Option<Arc<ConcurrencyProbe>>,
    }

    impl FakeSource {
        pub fn with_points(name: &str, points: usize) -> Self {
            Self {
                name: name.to_string(),
                points,
                fail: false,
                delay: None,
                concurrency: None,
            }
        }

        pub fn failing(name: &str) -> Self {
            Self { fail: true, ..Self::with_points(name, 0) }
        }

        fn descriptor(&self) -> MetricDescriptor {
            MetricDescriptor {
                metric_type: self.destination_name(),
                metric_kind: MetricKind::Gauge,
                value_type: ValueType::Double,
                description: "fake".to_string(),
                display_name: self.name.clone(),
                unit: None,
            }
        }
    }

    /// Tracks the peak number of concurrently running queries.
    #[derive(Default)]
    pub struct ConcurrencyProbe {
        current: AtomicUsize,
        pub peak: AtomicUsize,
    }

    impl ConcurrencyProbe {
        fn enter(&self) {
            let n = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(n, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl SourceMetric for FakeSource {
        fn destination_name(&self) -> String {
            format!("custom.googleapis.com/fake/{}", self.name)
        }

        fn query(&self) -> &str {
            "fake query"
        }

        async fn fetch_data(
            &self,
            since: DateTime<Utc>,
            _record: &mut dyn MetricRecord,
        ) -> Result<Option<(MetricDescriptor, Vec<TimeSeries>)>> {
            if let Some(probe) = &self.concurrency {
                probe.enter();
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(probe) = &self.concurrency {
                probe.exit();
            }
            if self.fail {
                return Err(BridgeError::Source("synthetic failure".to_string()));
            }
            let series = (0..self.points)
                .map(|i| {
                    TimeSeries::single_point(
                        &self.destination_name(),
                        MetricKind::Gauge,
                        None,
                        since + Duration::minutes(i as i64 + 1),
                        i as f64,
                    )
                })
                .collect();
            Ok(Some((self.descriptor(), series)))
        }
    }

    /// Destination fake recording every write.
    #[derive(Default)]
    pub struct FakeAdapter {
        pub latest: Option<DateTime<Utc>>,
        pub fail_latest: bool,
        pub fail_write: bool,
        pub writes: Mutex<Vec<TimeSeries>>,
    }

    #[async_trait]
    impl StackdriverAdapter for FakeAdapter {
        async fn latest_timestamp(
            &self,
            _project: &str,
            _metric_type: &str,
        ) -> Result<DateTime<Utc>> {
            if self.fail_latest {
                return Err(BridgeError::Destination("latest timestamp unavailable".to_string()));
            }
            Ok(self.latest.unwrap_or_else(|| Utc::now() - Duration::hours(1)))
        }

        async fn create_timeseries(
            &self,
            _project: &str,
            _metric_type: &str,
            _desc: &MetricDescriptor,
            series: &[TimeSeries],
        ) -> Result<()> {
            if self.fail_write {
                return Err(BridgeError::Destination("write refused".to_string()));
            }
            self.writes.lock().unwrap().extend_from_slice(series);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }
}
