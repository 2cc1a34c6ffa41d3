use super::{MetricClient, StackdriverAdapter};
use crate::error::{BridgeError, Result};
use crate::types::{MetricDescriptor, TimeSeries};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

/// Implements descriptor reconciliation, latest-point discovery and
/// point-at-a-time writes on top of a [`MetricClient`].
pub struct Adapter {
    client: Box<dyn MetricClient>,
    lookback_interval: Duration,
    now: fn() -> DateTime<Utc>,
}

impl Adapter {
    pub fn new(client: Box<dyn MetricClient>, lookback_interval: std::time::Duration) -> Self {
        Self {
            client,
            lookback_interval: Duration::from_std(lookback_interval)
                .unwrap_or_else(|_| Duration::hours(1)),
            now: Utc::now,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_now(mut self, now: fn() -> DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Installs a metric descriptor. An existing descriptor is kept when its
    /// kind and value type match; otherwise it is deleted and recreated,
    /// since descriptors cannot be updated in place and deleting one forces
    /// users to re-bind alerts.
    async fn set_descriptor(
        &self,
        project: &str,
        metric_type: &str,
        desc: &MetricDescriptor,
    ) -> Result<()> {
        let current = self.client.get_metric_descriptor(project, metric_type).await?;

        if let Some(current) = current {
            if current.metric_kind == desc.metric_kind && current.value_type == desc.value_type {
                return Ok(());
            }
            info!(
                "deleting existing metric descriptor for {} ({:?}) which is different from desired ({:?})",
                metric_type, current.metric_kind, desc.metric_kind
            );
            self.client.delete_metric_descriptor(project, metric_type).await?;
        }

        info!("creating a new metric descriptor for {metric_type}");
        self.client.create_metric_descriptor(project, desc).await
    }
}

#[async_trait]
impl StackdriverAdapter for Adapter {
    async fn latest_timestamp(&self, project: &str, metric_type: &str) -> Result<DateTime<Utc>> {
        let now = (self.now)();
        let fallback = now - self.lookback_interval;

        let desc = self.client.get_metric_descriptor(project, metric_type).await?;
        if desc.is_none() {
            debug!("no metric descriptor found for {metric_type}");
            return Ok(fallback);
        }

        let series = self
            .client
            .list_time_series(project, metric_type, fallback, now)
            .await?;
        if series.is_empty() {
            debug!("no timeseries found for {metric_type}");
            return Ok(fallback);
        }
        if series.len() > 1 {
            return Err(BridgeError::MultiSeries(series.len()));
        }

        let latest = series[0].latest_end_time().map_or(fallback, |t| t.max(fallback));
        debug!("latest point found for {metric_type} is {latest}");
        Ok(latest)
    }

    async fn create_timeseries(
        &self,
        project: &str,
        metric_type: &str,
        desc: &MetricDescriptor,
        series: &[TimeSeries],
    ) -> Result<()> {
        self.set_descriptor(project, metric_type, desc).await?;

        for ts in series {
            self.client.create_time_series(project, ts).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.client.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MetricKind, ValueType};
    use std::sync::Mutex;

    const PROJECT: &str = "test-project";
    const METRIC: &str = "custom.googleapis.com/datadog/metric1";

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn descriptor(kind: MetricKind) -> MetricDescriptor {
        MetricDescriptor {
            metric_type: METRIC.to_string(),
            metric_kind: kind,
            value_type: ValueType::Double,
            description: "Datadog query: avg:foo{*}".to_string(),
            display_name: "foo".to_string(),
            unit: None,
        }
    }

    #[derive(Debug, PartialEq)]
    enum Call {
        Get,
        Create,
        Delete,
        List,
        Write(usize),
    }

    #[derive(Default)]
    struct FakeClient {
        descriptor: Mutex<Option<MetricDescriptor>>,
        series: Vec<TimeSeries>,
        calls: Mutex<Vec<Call>>,
    }

    #[async_trait]
    impl MetricClient for FakeClient {
        async fn get_metric_descriptor(
            &self,
            _project: &str,
            _metric_type: &str,
        ) -> Result<Option<MetricDescriptor>> {
            self.calls.lock().unwrap().push(Call::Get);
            Ok(self.descriptor.lock().unwrap().clone())
        }

        async fn create_metric_descriptor(
            &self,
            _project: &str,
            desc: &MetricDescriptor,
        ) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Create);
            *self.descriptor.lock().unwrap() = Some(desc.clone());
            Ok(())
        }

        async fn delete_metric_descriptor(&self, _project: &str, _metric_type: &str) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Delete);
            *self.descriptor.lock().unwrap() = None;
            Ok(())
        }

        async fn list_time_series(
            &self,
            _project: &str,
            _metric_type: &str,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<Vec<TimeSeries>> {
            self.calls.lock().unwrap().push(Call::List);
            Ok(self.series.clone())
        }

        async fn create_time_series(&self, _project: &str, series: &TimeSeries) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Write(series.points.len()));
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn adapter(client: FakeClient) -> (Adapter, std::sync::Arc<FakeClient>) {
        let client = std::sync::Arc::new(client);
        struct Shared(std::sync::Arc<FakeClient>);

        #[async_trait]
        impl MetricClient for Shared {
            async fn get_metric_descriptor(
                &self,
                p: &str,
                m: &str,
            ) -> Result<Option<MetricDescriptor>> {
                self.0.get_metric_descriptor(p, m).await
            }
            async fn create_metric_descriptor(&self, p: &str, d: &MetricDescriptor) -> Result<()> {
                self.0.create_metric_descriptor(p, d).await
            }
            async fn delete_metric_descriptor(&self, p: &str, m: &str) -> Result<()> {
                self.0.delete_metric_descriptor(p, m).await
            }
            async fn list_time_series(
                &self,
                p: &str,
                m: &str,
                s: DateTime<Utc>,
                e: DateTime<Utc>,
            ) -> Result<Vec<TimeSeries>> {
                self.0.list_time_series(p, m, s, e).await
            }
            async fn create_time_series(&self, p: &str, ts: &TimeSeries) -> Result<()> {
                self.0.create_time_series(p, ts).await
            }
            async fn close(&self) -> Result<()> {
                self.0.close().await
            }
        }

        let a = Adapter::new(Box::new(Shared(std::sync::Arc::clone(&client))), std::time::Duration::from_secs(3600))
            .with_now(fixed_now);
        (a, client)
    }

    #[tokio::test]
    async fn latest_timestamp_without_descriptor_is_lookback_ago() {
        let (a, _c) = adapter(FakeClient::default());
        let t = a.latest_timestamp(PROJECT, METRIC).await.unwrap();
        assert_eq!(t, fixed_now() - Duration::hours(1));
    }

    #[tokio::test]
    async fn latest_timestamp_without_points_is_lookback_ago() {
        let client = FakeClient {
            descriptor: Mutex::new(Some(descriptor(MetricKind::Gauge))),
            ..Default::default()
        };
        let (a, _c) = adapter(client);
        let t = a.latest_timestamp(PROJECT, METRIC).await.unwrap();
        assert_eq!(t, fixed_now() - Duration::hours(1));
    }

    #[tokio::test]
    async fn latest_timestamp_returns_max_end_time() {
        let newest = fixed_now() - Duration::minutes(3);
        let series = TimeSeries {
            metric_type: METRIC.to_string(),
            metric_kind: MetricKind::Gauge,
            value_type: ValueType::Double,
            points: vec![
                crate::types::Point { start_time: None, end_time: newest - Duration::minutes(10), value: 1.0 },
                crate::types::Point { start_time: None, end_time: newest, value: 2.0 },
            ],
        };
        let client = FakeClient {
            descriptor: Mutex::new(Some(descriptor(MetricKind::Gauge))),
            series: vec![series],
            ..Default::default()
        };
        let (a, _c) = adapter(client);
        let t = a.latest_timestamp(PROJECT, METRIC).await.unwrap();
        assert_eq!(t, newest);
    }

    #[tokio::test]
    async fn latest_timestamp_rejects_multiple_series() {
        let s = TimeSeries::single_point(METRIC, MetricKind::Gauge, None, fixed_now(), 1.0);
        let client = FakeClient {
            descriptor: Mutex::new(Some(descriptor(MetricKind::Gauge))),
            series: vec![s.clone(), s],
            ..Default::default()
        };
        let (a, _c) = adapter(client);
        let err = a.latest_timestamp(PROJECT, METRIC).await.unwrap_err();
        assert!(matches!(err, BridgeError::MultiSeries(2)));
    }

    #[tokio::test]
    async fn matching_descriptor_is_kept() {
        let client = FakeClient {
            descriptor: Mutex::new(Some(descriptor(MetricKind::Gauge))),
            ..Default::default()
        };
        let (a, c) = adapter(client);
        let series = [TimeSeries::single_point(METRIC, MetricKind::Gauge, None, fixed_now(), 1.0)];
        a.create_timeseries(PROJECT, METRIC, &descriptor(MetricKind::Gauge), &series)
            .await
            .unwrap();

        let calls = c.calls.lock().unwrap();
        assert!(!calls.contains(&Call::Delete));
        assert!(!calls.contains(&Call::Create));
    }

    #[tokio::test]
    async fn incompatible_descriptor_is_deleted_then_created() {
        let client = FakeClient {
            descriptor: Mutex::new(Some(descriptor(MetricKind::Gauge))),
            ..Default::default()
        };
        let (a, c) = adapter(client);
        let anchor = fixed_now() - Duration::minutes(10);
        let series = [TimeSeries::single_point(
            METRIC,
            MetricKind::Cumulative,
            Some(anchor),
            fixed_now(),
            5.0,
        )];
        a.create_timeseries(PROJECT, METRIC, &descriptor(MetricKind::Cumulative), &series)
            .await
            .unwrap();

        let calls = c.calls.lock().unwrap();
        let delete_pos = calls.iter().position(|c| *c == Call::Delete).unwrap();
        let create_pos = calls.iter().position(|c| *c == Call::Create).unwrap();
        let write_pos = calls.iter().position(|c| matches!(c, Call::Write(_))).unwrap();
        assert!(delete_pos < create_pos);
        assert!(create_pos < write_pos);
    }

    #[tokio::test]
    async fn absent_descriptor_is_created_without_delete() {
        let (a, c) = adapter(FakeClient::default());
        let series = [TimeSeries::single_point(METRIC, MetricKind::Gauge, None, fixed_now(), 1.0)];
        a.create_timeseries(PROJECT, METRIC, &descriptor(MetricKind::Gauge), &series)
            .await
            .unwrap();

        let calls = c.calls.lock().unwrap();
        assert!(!calls.contains(&Call::Delete));
        assert!(calls.contains(&Call::Create));
    }

    #[tokio::test]
    async fn each_point_goes_in_its_own_request() {
        let (a, c) = adapter(FakeClient::default());
        let series: Vec<TimeSeries> = (0..3)
            .map(|i| {
                TimeSeries::single_point(
                    METRIC,
                    MetricKind::Gauge,
                    None,
                    fixed_now() - Duration::minutes(i),
                    i as f64,
                )
            })
            .collect();
        a.create_timeseries(PROJECT, METRIC, &descriptor(MetricKind::Gauge), &series)
            .await
            .unwrap();

        let calls = c.calls.lock().unwrap();
        let writes: Vec<_> = calls.iter().filter(|c| matches!(c, Call::Write(_))).collect();
        assert_eq!(writes.len(), 3);
        assert!(writes.iter().all(|c| matches!(c, Call::Write(1))));
    }
}
