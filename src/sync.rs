//! The sync engine: fans out over the configured metrics under bounded
//! parallelism and a shared deadline, then aggregates outcomes.

use crate::catalog;
use crate::error::{BridgeError, Result};
use crate::metric::Metric;
use crate::options::BridgeOptions;
use crate::stackdriver::{Adapter, RestMetricClient, StackdriverAdapter};
use crate::stats::StatsCollector;
use crate::storage::{self, Manager};
use chrono::Utc;
use futures::StreamExt;
use std::sync::Mutex;
use std::time::Instant;
use tokio::time::Instant as TokioInstant;
use tracing::{debug, info, warn};

/// Updates all metrics, at most `parallelism` at a time, each bounded by the
/// shared `deadline`. Failed updates are recorded on their metric records;
/// the returned strings aggregate everything that went wrong. No ordering is
/// guaranteed between metrics, and each is attempted at most once.
pub async fn update_all_metrics(
    metrics: &mut [Metric],
    sd: &dyn StackdriverAdapter,
    stats: &StatsCollector,
    parallelism: usize,
    deadline: TokioInstant,
) -> Vec<String> {
    let start = Instant::now();
    let errors: Mutex<Vec<String>> = Mutex::new(Vec::new());

    futures::stream::iter(metrics.iter_mut())
        .for_each_concurrent(parallelism.max(1), |metric| {
            let errors = &errors;
            async move {
                let name = metric.name.clone();

                // Updates that cannot start before the deadline are not
                // attempted; the metric is simply retried on the next sync.
                if TokioInstant::now() >= deadline {
                    let msg = BridgeError::DeadlineExceeded.to_string();
                    if let Err(e) = metric.record.update_error(&msg).await {
                        errors.lock().unwrap().push(format!("{name}: {e}"));
                    }
                    errors.lock().unwrap().push(format!("{name}: {msg}"));
                    return;
                }

                let result = tokio::time::timeout_at(deadline, metric.update(sd, stats)).await;
                match result {
                    Err(_) => {
                        let msg = BridgeError::DeadlineExceeded.to_string();
                        if let Err(e) = metric.record.update_error(&msg).await {
                            errors.lock().unwrap().push(format!("{name}: {e}"));
                        }
                        errors.lock().unwrap().push(format!("{name}: {msg}"));
                    }
                    Ok(Err(e)) => {
                        errors.lock().unwrap().push(format!("{name}: {e}"));
                    }
                    Ok(Ok(outcome)) => {
                        if let Some(e) = outcome.error {
                            errors.lock().unwrap().push(format!("{name}: {e}"));
                        }
                    }
                }
            }
        })
        .await;

    // After all updates terminate, surface how stale the least recently
    // updated metric is.
    let now = Utc::now();
    let oldest_write = metrics.iter().map(|m| m.record.last_update()).min().unwrap_or(now);
    stats.record_total_import_latency(start.elapsed());
    stats.record_oldest_metric_age((now - oldest_write).to_std().unwrap_or_default());

    errors.into_inner().unwrap()
}

/// Runs one full sync: load storage and catalog, update every metric, flush
/// telemetry. Returns an error carrying the aggregated failure string when
/// any metric failed.
pub async fn run_sync(opts: &BridgeOptions) -> Result<()> {
    let storage = storage::load_storage_engine(opts).await?;
    let result = run_sync_with(opts, storage.as_ref()).await;
    if let Err(e) = storage.close().await {
        warn!("could not close the metadata store: {e}");
    }
    result
}

async fn run_sync_with(opts: &BridgeOptions, storage: &dyn Manager) -> Result<()> {
    let catalog = catalog::load_catalog(opts, storage).await?;
    let mut metrics = catalog.metrics;
    info!("updating {} metrics", metrics.len());

    let sd = Adapter::new(Box::new(RestMetricClient::new()), opts.sd_lookback_interval);
    let stats =
        StatsCollector::new(opts.stats_sd_project.as_deref(), &opts.stats_metric_exporters)?;

    let deadline = TokioInstant::now() + opts.update_timeout;
    let errors =
        update_all_metrics(&mut metrics, &sd, &stats, opts.update_parallelism, deadline).await;

    stats.close(Some(&sd)).await?;
    sd.close().await?;

    if errors.is_empty() {
        debug!("sync finished without errors");
        Ok(())
    } else {
        Err(BridgeError::Sync(errors.join("; ")))
    }
}

/// Removes metadata records for metrics that are no longer in the catalog.
pub async fn run_cleanup(opts: &BridgeOptions) -> Result<()> {
    let storage = storage::load_storage_engine(opts).await?;
    let result = async {
        let catalog = catalog::load_catalog(opts, storage.as_ref()).await?;
        let keep: Vec<String> = catalog.metrics.iter().map(|m| m.name.clone()).collect();
        storage.cleanup_records(&keep).await?;
        Ok(())
    }
    .await;
    if let Err(e) = storage.close().await {
        warn!("could not close the metadata store: {e}");
    }
    result
}
