//! The metric catalog: parses the YAML configuration document, validates it
//! and instantiates one [`Metric`] per entry.

use crate::env;
use crate::error::{BridgeError, Result};
use crate::metric::Metric;
use crate::options::BridgeOptions;
use crate::sources::datadog::{DatadogConfig, DatadogMetric};
use crate::sources::influxdb::{InfluxDbConfig, InfluxDbMetric};
use crate::sources::SourceMetric;
use crate::storage::Manager;
use regex::Regex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::OnceLock;
use std::time::SystemTime;
use tracing::debug;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    #[serde(default)]
    datadog_metrics: Vec<DatadogMetricEntry>,
    #[serde(default)]
    influxdb_metrics: Vec<InfluxDbMetricEntry>,
    #[serde(default)]
    stackdriver_destinations: Vec<DestinationEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DestinationEntry {
    name: String,
    #[serde(default)]
    project_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DatadogMetricEntry {
    name: String,
    query: String,
    api_key: String,
    application_key: String,
    destination: String,
    #[serde(default)]
    cumulative: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InfluxDbMetricEntry {
    name: String,
    query: String,
    database: String,
    endpoint: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    time_aggregated: bool,
    #[serde(default)]
    cumulative: bool,
    destination: String,
}

/// The loaded catalog: one metric per configured entry, plus the config
/// file's modification time as of this load, shown on the status page.
pub struct Catalog {
    pub metrics: Vec<Metric>,
    pub file_modified: Option<SystemTime>,
}

/// Current modification time of the catalog file. The standalone sync loop
/// compares this between ticks to notice config edits; each sync reparses
/// the file, so an edit takes effect on the tick after it lands.
pub fn config_modified(opts: &BridgeOptions) -> Option<SystemTime> {
    fs::metadata(&opts.metric_config).and_then(|m| m.modified()).ok()
}

fn metric_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9]\w*$").unwrap())
}

/// Reads and validates the configuration file, returning the catalog bound
/// to the given storage manager.
pub async fn load_catalog(opts: &BridgeOptions, storage: &dyn Manager) -> Result<Catalog> {
    let data = fs::read_to_string(&opts.metric_config).map_err(|e| {
        BridgeError::Config(format!(
            "could not read config file {}: {e}",
            opts.metric_config.display()
        ))
    })?;
    let file_modified = config_modified(opts);
    let mut catalog = load_catalog_from_str(&data, opts, storage).await?;
    catalog.file_modified = file_modified;
    Ok(catalog)
}

/// Parses a configuration document and instantiates its metrics.
pub async fn load_catalog_from_str(
    data: &str,
    opts: &BridgeOptions,
    storage: &dyn Manager,
) -> Result<Catalog> {
    let parsed: CatalogFile = serde_yaml::from_str(data)?;

    let destinations = resolve_destinations(&parsed.stackdriver_destinations)?;

    let mut seen_names: HashSet<String> = HashSet::new();
    let mut metrics: Vec<Metric> = Vec::new();

    let mut add_metric = |name: &str,
                          destination: &str,
                          source: Box<dyn SourceMetric>|
     -> Result<(String, String, Box<dyn SourceMetric>)> {
        let project = destinations
            .get(destination)
            .ok_or_else(|| BridgeError::Config(format!("destination '{destination}' not found")))?
            .clone();
        if !metric_name_re().is_match(name) {
            return Err(BridgeError::Config(format!("invalid metric name '{name}'")));
        }
        if !seen_names.insert(name.to_string()) {
            return Err(BridgeError::Config(format!("duplicate metric name '{name}'")));
        }
        Ok((name.to_string(), project, source))
    };

    let mut pending: Vec<(String, String, Box<dyn SourceMetric>)> = Vec::new();

    for m in &parsed.datadog_metrics {
        let source = DatadogMetric::new(
            &m.name,
            DatadogConfig {
                query: m.query.clone(),
                api_key: m.api_key.clone(),
                application_key: m.application_key.clone(),
                cumulative: m.cumulative,
            },
            opts.min_point_age,
            opts.counter_reset_interval,
        )
        .map_err(|e| {
            BridgeError::Config(format!("cannot create Datadog source metric '{}': {e}", m.name))
        })?;
        pending.push(add_metric(&m.name, &m.destination, Box::new(source))?);
    }

    for m in &parsed.influxdb_metrics {
        let source = InfluxDbMetric::new(
            &m.name,
            InfluxDbConfig {
                query: m.query.clone(),
                database: m.database.clone(),
                endpoint: m.endpoint.clone(),
                username: m.username.clone(),
                password: m.password.clone(),
                time_aggregated: m.time_aggregated,
                cumulative: m.cumulative,
            },
            opts.min_point_age,
            opts.counter_reset_interval,
        )
        .map_err(|e| {
            BridgeError::Config(format!("cannot create InfluxDB source metric '{}': {e}", m.name))
        })?;
        pending.push(add_metric(&m.name, &m.destination, Box::new(source))?);
    }

    for (name, project, source) in pending {
        let metric = Metric::new(&name, source, &project, storage)
            .await
            .map_err(|e| BridgeError::Config(format!("cannot create metric '{name}': {e}")))?;
        metrics.push(metric);
    }

    debug!(
        "read {} metrics and {} destinations from the config file",
        metrics.len(),
        destinations.len()
    );
    Ok(Catalog { metrics, file_modified: None })
}

fn resolve_destinations(entries: &[DestinationEntry]) -> Result<HashMap<String, String>> {
    let mut destinations = HashMap::new();
    for d in entries {
        if destinations.contains_key(&d.name) {
            return Err(BridgeError::Config(format!(
                "configuration file contains several destinations named '{}'",
                d.name
            )));
        }
        let project = match d.project_id.clone().filter(|p| !p.is_empty()) {
            Some(p) => p,
            None => env::ambient_project().ok_or_else(|| {
                BridgeError::Config(format!("please provide project_id for destination '{}'", d.name))
            })?,
        };
        destinations.insert(d.name.clone(), project);
    }
    Ok(destinations)
}
