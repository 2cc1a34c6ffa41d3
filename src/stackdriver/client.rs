//! REST client for the Cloud Monitoring v3 API.

use super::MetricClient;
use crate::error::{BridgeError, Result};
use crate::types::{MetricDescriptor, MetricKind, Point, TimeSeries, ValueType};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://monitoring.googleapis.com";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

enum Auth {
    /// No Authorization header; used against local test servers.
    None,
    /// Fixed token from the environment.
    Static(String),
    /// Tokens minted by the GCE metadata server, cached until expiry.
    Metadata,
}

pub struct RestMetricClient {
    http: reqwest::Client,
    base_url: String,
    auth: Auth,
    cached_token: Mutex<Option<(String, tokio::time::Instant)>>,
}

impl RestMetricClient {
    pub fn new() -> Self {
        let auth = match std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN") {
            Ok(token) if !token.is_empty() => Auth::Static(token),
            _ => Auth::Metadata,
        };
        Self {
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            auth,
            cached_token: Mutex::new(None),
        }
    }

    /// Client for a non-default endpoint without authentication; used by
    /// tests against local fixture servers.
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth: Auth::None,
            cached_token: Mutex::new(None),
        }
    }

    async fn auth_token(&self) -> Result<Option<String>> {
        match &self.auth {
            Auth::None => Ok(None),
            Auth::Static(token) => Ok(Some(token.clone())),
            Auth::Metadata => {
                let mut cached = self.cached_token.lock().await;
                if let Some((token, expiry)) = cached.as_ref() {
                    if tokio::time::Instant::now() < *expiry {
                        return Ok(Some(token.clone()));
                    }
                }

                #[derive(Deserialize)]
                struct TokenResponse {
                    access_token: String,
                    expires_in: u64,
                }

                let resp = self
                    .http
                    .get(METADATA_TOKEN_URL)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await?
                    .error_for_status()
                    .map_err(|e| {
                        BridgeError::Destination(format!("could not fetch access token: {e}"))
                    })?;
                let token: TokenResponse = resp.json().await?;
                // Refresh a minute before the token actually expires.
                let expiry = tokio::time::Instant::now()
                    + std::time::Duration::from_secs(token.expires_in.saturating_sub(60));
                *cached = Some((token.access_token.clone(), expiry));
                Ok(Some(token.access_token))
            }
        }
    }

    async fn request(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let req = match self.auth_token().await? {
            Some(token) => req.bearer_auth(token),
            None => req,
        };
        Ok(req.send().await?)
    }

    fn descriptor_url(&self, project: &str, metric_type: &str) -> String {
        format!("{}/v3/projects/{}/metricDescriptors/{}", self.base_url, project, metric_type)
    }
}

impl Default for RestMetricClient {
    fn default() -> Self {
        Self::new()
    }
}

async fn error_from_response(context: &str, resp: reqwest::Response) -> BridgeError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    BridgeError::Destination(format!("{context}: HTTP {status}: {body}"))
}

// Wire representation of the v3 REST surface. Kept separate from the
// internal types so the data model stays transport-free.

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDescriptor {
    #[serde(rename = "type")]
    metric_type: String,
    metric_kind: MetricKind,
    value_type: ValueType,
    #[serde(default)]
    description: String,
    #[serde(default)]
    display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unit: Option<String>,
}

impl From<&MetricDescriptor> for WireDescriptor {
    fn from(d: &MetricDescriptor) -> Self {
        Self {
            metric_type: d.metric_type.clone(),
            metric_kind: d.metric_kind,
            value_type: d.value_type,
            description: d.description.clone(),
            display_name: d.display_name.clone(),
            unit: d.unit.clone(),
        }
    }
}

impl From<WireDescriptor> for MetricDescriptor {
    fn from(d: WireDescriptor) -> Self {
        Self {
            metric_type: d.metric_type,
            metric_kind: d.metric_kind,
            value_type: d.value_type,
            description: d.description,
            display_name: d.display_name,
            unit: d.unit,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMetricField {
    #[serde(rename = "type")]
    metric_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireInterval {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_time: Option<String>,
    end_time: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireValue {
    double_value: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct WirePoint {
    interval: WireInterval,
    value: WireValue,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTimeSeries {
    metric: WireMetricField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resource: Option<serde_json::Value>,
    metric_kind: MetricKind,
    value_type: ValueType,
    #[serde(default)]
    points: Vec<WirePoint>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTimeSeriesRequest {
    time_series: Vec<WireTimeSeries>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListTimeSeriesResponse {
    #[serde(default)]
    time_series: Vec<WireTimeSeries>,
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| BridgeError::Destination(format!("could not parse timestamp '{s}': {e}")))
}

fn to_wire_series(ts: &TimeSeries) -> WireTimeSeries {
    WireTimeSeries {
        metric: WireMetricField { metric_type: ts.metric_type.clone() },
        resource: Some(serde_json::json!({ "type": "global" })),
        metric_kind: ts.metric_kind,
        value_type: ts.value_type,
        points: ts
            .points
            .iter()
            .map(|p| WirePoint {
                interval: WireInterval {
                    start_time: p.start_time.map(rfc3339),
                    end_time: rfc3339(p.end_time),
                },
                value: WireValue { double_value: p.value },
            })
            .collect(),
    }
}

fn from_wire_series(ts: WireTimeSeries) -> Result<TimeSeries> {
    let mut points = Vec::with_capacity(ts.points.len());
    for p in ts.points {
        points.push(Point {
            start_time: p.interval.start_time.as_deref().map(parse_rfc3339).transpose()?,
            end_time: parse_rfc3339(&p.interval.end_time)?,
            value: p.value.double_value,
        });
    }
    Ok(TimeSeries {
        metric_type: ts.metric.metric_type,
        metric_kind: ts.metric_kind,
        value_type: ts.value_type,
        points,
    })
}

#[async_trait]
impl MetricClient for RestMetricClient {
    async fn get_metric_descriptor(
        &self,
        project: &str,
        metric_type: &str,
    ) -> Result<Option<MetricDescriptor>> {
        let url = self.descriptor_url(project, metric_type);
        let resp = self.request(self.http.get(&url)).await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(error_from_response("GetMetricDescriptor error", resp).await);
        }
        let desc: WireDescriptor = resp.json().await?;
        Ok(Some(desc.into()))
    }

    async fn create_metric_descriptor(&self, project: &str, desc: &MetricDescriptor) -> Result<()> {
        let url = format!("{}/v3/projects/{}/metricDescriptors", self.base_url, project);
        let resp = self
            .request(self.http.post(&url).json(&WireDescriptor::from(desc)))
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response("CreateMetricDescriptor error", resp).await);
        }
        Ok(())
    }

    async fn delete_metric_descriptor(&self, project: &str, metric_type: &str) -> Result<()> {
        let url = self.descriptor_url(project, metric_type);
        let resp = self.request(self.http.delete(&url)).await?;
        if !resp.status().is_success() {
            return Err(error_from_response("DeleteMetricDescriptor error", resp).await);
        }
        Ok(())
    }

    async fn list_time_series(
        &self,
        project: &str,
        metric_type: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimeSeries>> {
        let url = format!("{}/v3/projects/{}/timeSeries", self.base_url, project);
        let filter = format!("metric.type = \"{metric_type}\"");
        let resp = self
            .request(self.http.get(&url).query(&[
                ("filter", filter.as_str()),
                ("interval.startTime", &rfc3339(start)),
                ("interval.endTime", &rfc3339(end)),
            ]))
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response("ListTimeSeries error", resp).await);
        }
        let body: ListTimeSeriesResponse = resp.json().await?;
        debug!("ListTimeSeries returned {} series for {metric_type}", body.time_series.len());
        body.time_series.into_iter().map(from_wire_series).collect()
    }

    async fn create_time_series(&self, project: &str, series: &TimeSeries) -> Result<()> {
        let url = format!("{}/v3/projects/{}/timeSeries", self.base_url, project);
        let body = CreateTimeSeriesRequest { time_series: vec![to_wire_series(series)] };
        let resp = self.request(self.http.post(&url).json(&body)).await?;
        if !resp.status().is_success() {
            return Err(error_from_response("CreateTimeSeries error", resp).await);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_serializes_to_v3_names() {
        let desc = MetricDescriptor {
            metric_type: "custom.googleapis.com/influxdb/m".to_string(),
            metric_kind: MetricKind::Cumulative,
            value_type: ValueType::Double,
            description: "InfluxDB query: m".to_string(),
            display_name: "q".to_string(),
            unit: Some("req/s".to_string()),
        };
        let v = serde_json::to_value(WireDescriptor::from(&desc)).unwrap();
        assert_eq!(v["type"], "custom.googleapis.com/influxdb/m");
        assert_eq!(v["metricKind"], "CUMULATIVE");
        assert_eq!(v["valueType"], "DOUBLE");
        assert_eq!(v["unit"], "req/s");
    }

    #[test]
    fn series_round_trips_through_wire_form() {
        let end = DateTime::parse_from_rfc3339("2024-03-01T12:00:00.000000001Z")
            .unwrap()
            .with_timezone(&Utc);
        let start = end - chrono::Duration::minutes(30);
        let ts = TimeSeries::single_point(
            "custom.googleapis.com/datadog/m",
            MetricKind::Cumulative,
            Some(start),
            end,
            42.5,
        );
        let wire = to_wire_series(&ts);
        assert_eq!(wire.points.len(), 1);
        let back = from_wire_series(wire).unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn list_response_parses_empty_body() {
        let resp: ListTimeSeriesResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.time_series.is_empty());
    }
}
