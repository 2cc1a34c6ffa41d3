use crate::error::{BridgeError, Result};
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

/// Runtime options shared by the server, the sync loop and the one-shot
/// commands. Built from CLI flags (with env fallbacks) in `main`.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Path to the metric catalog file.
    pub metric_config: PathBuf,

    /// Storage engine for metric metadata: `sqlite`, `libsql` or `memory`.
    pub storage_engine: String,
    /// Path to the embedded SQLite store; defaults to `$PWD/bridge.db`.
    pub sqlite_path: Option<PathBuf>,

    /// Total deadline for updating all metrics in one sync.
    pub update_timeout: Duration,
    /// Number of metrics updated in parallel, within `[1, 100]`.
    pub update_parallelism: usize,

    /// Source points younger than this are not imported.
    pub min_point_age: Duration,
    /// How far back to search for recent data at the destination.
    pub sd_lookback_interval: Duration,
    /// How often the start time of cumulative metrics is moved forward.
    pub counter_reset_interval: Duration,

    /// Standalone-mode tick interval between syncs.
    pub sync_period: Duration,
    /// Standalone mode runs a metadata cleanup every Nth sync.
    pub sync_cleanup_after: u32,

    pub enable_status_page: bool,
    /// Destination project for the bridge's own telemetry.
    pub stats_sd_project: Option<String>,
    /// Subset of {"stackdriver", "prometheus"}.
    pub stats_metric_exporters: Vec<String>,
}

impl BridgeOptions {
    pub fn validate(&self) -> Result<()> {
        if self.update_parallelism < 1 || self.update_parallelism > 100 {
            return Err(BridgeError::Config(format!(
                "expected update parallelism between 1 and 100; got {}",
                self.update_parallelism
            )));
        }
        // The destination rejects points older than 24 hours, so looking
        // back further than that can never find writable data.
        if self.sd_lookback_interval > Duration::from_secs(24 * 3600) {
            return Err(BridgeError::Config(
                "sd lookback interval must be within the destination's 24h write horizon".to_string(),
            ));
        }
        match self.storage_engine.as_str() {
            "sqlite" | "libsql" | "memory" => {}
            other => {
                return Err(BridgeError::Config(format!(
                    "unknown storage engine selected: {other}"
                )));
            }
        }
        for exporter in &self.stats_metric_exporters {
            if exporter != "stackdriver" && exporter != "prometheus" {
                return Err(BridgeError::Config(format!(
                    "unknown monitoring backend {exporter}"
                )));
            }
        }
        Ok(())
    }
}

fn duration_segment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)([0-9]+)(ns|us|µ|u|ms|s|m|h|d|w)").unwrap())
}

/// Parses durations written the way InfluxQL writes them: `90s`, `5m`,
/// `1h30m`, `10ms`. Units `u`/`µ` mean microseconds; `d` and `w` expand to
/// hours.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let mut total = Duration::ZERO;
    let mut consumed = 0usize;
    for caps in duration_segment_re().captures_iter(s) {
        let whole = caps.get(0).unwrap();
        if whole.start() != consumed {
            break;
        }
        consumed = whole.end();
        total += duration_from_parts(&caps[1], &caps[2])?;
    }
    if consumed != s.len() || consumed == 0 {
        return Err(BridgeError::Config(format!("could not parse duration '{s}'")));
    }
    Ok(total)
}

/// Converts a `(value, unit)` pair using InfluxQL time units into a Duration.
pub fn duration_from_parts(value: &str, unit: &str) -> Result<Duration> {
    let v: u64 = value
        .parse()
        .map_err(|_| BridgeError::Config(format!("could not parse duration value '{value}'")))?;
    let d = match unit {
        "ns" => Duration::from_nanos(v),
        "u" | "µ" | "us" => Duration::from_micros(v),
        "ms" => Duration::from_millis(v),
        "s" => Duration::from_secs(v),
        "m" => Duration::from_secs(v * 60),
        "h" => Duration::from_secs(v * 3600),
        "d" => Duration::from_secs(v * 24 * 3600),
        "w" => Duration::from_secs(v * 7 * 24 * 3600),
        other => {
            return Err(BridgeError::Config(format!("unknown duration unit '{other}'")));
        }
    };
    Ok(d)
}

/// clap value parser for duration flags.
pub fn parse_duration_arg(s: &str) -> std::result::Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_durations() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("10ms").unwrap(), Duration::from_millis(10));
        assert_eq!(parse_duration("250ns").unwrap(), Duration::from_nanos(250));
    }

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
    }

    #[test]
    fn expands_days_and_weeks() {
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(48 * 3600));
        assert_eq!(parse_duration("1w").unwrap(), Duration::from_secs(7 * 24 * 3600));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5 minutes").is_err());
        assert!(parse_duration("m5").is_err());
        assert!(parse_duration("5m banana").is_err());
    }

    fn options() -> BridgeOptions {
        BridgeOptions {
            metric_config: PathBuf::from("metrics.yaml"),
            storage_engine: "sqlite".to_string(),
            sqlite_path: None,
            update_timeout: Duration::from_secs(300),
            update_parallelism: 1,
            min_point_age: Duration::from_secs(120),
            sd_lookback_interval: Duration::from_secs(3600),
            counter_reset_interval: Duration::from_secs(1800),
            sync_period: Duration::from_secs(60),
            sync_cleanup_after: 100,
            enable_status_page: false,
            stats_sd_project: None,
            stats_metric_exporters: vec!["prometheus".to_string()],
        }
    }

    #[test]
    fn validates_parallelism_bounds() {
        let mut opts = options();
        opts.update_parallelism = 0;
        assert!(opts.validate().is_err());
        opts.update_parallelism = 101;
        assert!(opts.validate().is_err());
        opts.update_parallelism = 100;
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn lookback_is_bounded_by_the_write_horizon() {
        let mut opts = options();
        opts.sd_lookback_interval = Duration::from_secs(25 * 3600);
        assert!(opts.validate().is_err());
        opts.sd_lookback_interval = Duration::from_secs(24 * 3600);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn validates_engine_and_exporters() {
        let mut opts = options();
        opts.storage_engine = "boltdb".to_string();
        assert!(opts.validate().is_err());
        opts.storage_engine = "memory".to_string();
        opts.stats_metric_exporters = vec!["graphite".to_string()];
        assert!(opts.validate().is_err());
    }
}
