//! Telemetry about the bridge itself: per-metric import latency, total sync
//! latency and the age of the most stale metric.

use crate::error::{BridgeError, Result};
use crate::stackdriver::StackdriverAdapter;
use crate::types::{MetricDescriptor, MetricKind, TimeSeries, ValueType};
use chrono::Utc;
use metrics::{gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use tracing::warn;

pub const METRIC_IMPORT_LATENCY: &str = "ts_bridge_metric_import_latency_ms";
pub const TOTAL_IMPORT_LATENCY: &str = "ts_bridge_total_import_latency_ms";
pub const OLDEST_METRIC_AGE: &str = "ts_bridge_oldest_metric_age_ms";

/// Distribution buckets for latency measures, in milliseconds.
pub const LATENCY_BUCKETS_MS: [f64; 18] = [
    100.0, 250.0, 500.0, 1000.0, 2000.0, 3000.0, 4000.0, 5000.0, 7500.0, 10000.0, 15000.0,
    20000.0, 40000.0, 60000.0, 90000.0, 120000.0, 300000.0, 600000.0,
];

// Telemetry measures are process-wide, so only a single collector with
// exporters may be active at a time. The flag is held from `new` until the
// collector is dropped.
static COLLECTOR_ACTIVE: AtomicBool = AtomicBool::new(false);

// The prometheus recorder cannot be uninstalled, so it is created once and
// shared by every collector in the process lifetime.
static PROMETHEUS: OnceLock<PrometheusHandle> = OnceLock::new();

fn install_prometheus() -> Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Suffix("latency_ms".to_string()), &LATENCY_BUCKETS_MS)
        .map_err(|e| BridgeError::Config(format!("could not configure latency buckets: {e}")))?
        .install_recorder()
        .map_err(|e| BridgeError::Config(format!("could not install prometheus recorder: {e}")))?;
    Ok(PROMETHEUS.get_or_init(|| handle))
}

/// Rendered prometheus scrape text, when the prometheus exporter has been
/// active at least once this process.
pub fn prometheus_text() -> Option<String> {
    PROMETHEUS.get().map(|h| h.render())
}

#[derive(Debug, Default, Clone, Copy)]
struct Observations {
    total_import_latency_ms: Option<u64>,
    oldest_metric_age_ms: Option<u64>,
}

#[derive(Debug)]
pub struct StatsCollector {
    guard_held: bool,
    stackdriver_project: Option<String>,
    observations: Mutex<Observations>,
}

impl StatsCollector {
    /// Creates the process's stats collector with the configured exporters.
    /// Call [`StatsCollector::close`] when the sync is done; only a single
    /// collector can be active per process.
    pub fn new(project: Option<&str>, exporters: &[String]) -> Result<Self> {
        if COLLECTOR_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BridgeError::Config(
                "another stats collector is already active in this process".to_string(),
            ));
        }

        let mut collector = Self {
            guard_held: true,
            stackdriver_project: None,
            observations: Mutex::new(Observations::default()),
        };

        for exporter in exporters {
            match exporter.as_str() {
                "prometheus" => {
                    install_prometheus()?;
                }
                "stackdriver" => {
                    let project = project.filter(|p| !p.is_empty()).ok_or_else(|| {
                        BridgeError::Config(
                            "stats project is empty: set --stats-sd-project to use the stackdriver exporter"
                                .to_string(),
                        )
                    })?;
                    collector.stackdriver_project = Some(project.to_string());
                }
                other => {
                    return Err(BridgeError::Config(format!("unknown monitoring backend {other}")));
                }
            }
        }
        Ok(collector)
    }

    /// Collector that records measures without exporting them anywhere.
    /// Does not contend for the process-wide exporter guard.
    pub fn without_exporters() -> Self {
        Self {
            guard_held: false,
            stackdriver_project: None,
            observations: Mutex::new(Observations::default()),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests() -> Self {
        Self::without_exporters()
    }

    /// Time spent updating one metric, tagged with its name.
    pub fn record_metric_import_latency(&self, metric_name: &str, elapsed: Duration) {
        histogram!(METRIC_IMPORT_LATENCY, "metric_name" => metric_name.to_string())
            .record(elapsed.as_millis() as f64);
    }

    /// Total time it took to import all metrics.
    pub fn record_total_import_latency(&self, elapsed: Duration) {
        histogram!(TOTAL_IMPORT_LATENCY).record(elapsed.as_millis() as f64);
        self.observations.lock().unwrap().total_import_latency_ms = Some(elapsed.as_millis() as u64);
    }

    /// Time since the least recently updated metric last got new points.
    pub fn record_oldest_metric_age(&self, age: Duration) {
        gauge!(OLDEST_METRIC_AGE).set(age.as_millis() as f64);
        self.observations.lock().unwrap().oldest_metric_age_ms = Some(age.as_millis() as u64);
    }

    /// Flushes buffered observations to the configured exporters and
    /// releases the collector.
    pub async fn close(self, sd: Option<&dyn StackdriverAdapter>) -> Result<()> {
        let Some(project) = self.stackdriver_project.clone() else {
            return Ok(());
        };
        let Some(sd) = sd else {
            warn!("stackdriver stats exporter configured but no destination adapter available");
            return Ok(());
        };

        let observations = *self.observations.lock().unwrap();
        let measures = [
            ("custom.googleapis.com/ts_bridge/total_import_latency",
             "total time it took to import all metrics",
             observations.total_import_latency_ms),
            ("custom.googleapis.com/ts_bridge/oldest_metric_age",
             "oldest time since last successful import across all metrics",
             observations.oldest_metric_age_ms),
        ];

        let now = Utc::now();
        for (metric_type, description, value) in measures {
            let Some(value) = value else { continue };
            let desc = MetricDescriptor {
                metric_type: metric_type.to_string(),
                metric_kind: MetricKind::Gauge,
                value_type: ValueType::Double,
                description: description.to_string(),
                display_name: metric_type.rsplit('/').next().unwrap_or(metric_type).to_string(),
                unit: Some("ms".to_string()),
            };
            let series =
                TimeSeries::single_point(metric_type, MetricKind::Gauge, None, now, value as f64);
            sd.create_timeseries(&project, metric_type, &desc, &[series]).await?;
        }
        Ok(())
    }
}

impl Drop for StatsCollector {
    fn drop(&mut self) {
        if self.guard_held {
            COLLECTOR_ACTIVE.store(false, Ordering::SeqCst);
        }
    }
}
