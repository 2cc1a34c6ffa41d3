use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use ts_bridge::error::Result;
use ts_bridge::options::{parse_duration_arg, BridgeOptions};
use ts_bridge::{catalog, env, logging, server, sync};

#[derive(Parser)]
#[command(name = "ts-bridge")]
#[command(about = "Imports metrics from Datadog and InfluxDB into Google Cloud Monitoring")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(long, env = "DEBUG", action = ArgAction::SetTrue)]
    debug: bool,

    /// Server port
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Metric configuration file path
    #[arg(long, env = "CONFIG_FILE", default_value = "metrics.yaml")]
    metric_config: PathBuf,

    /// Enable the status page at /
    #[arg(long, env = "ENABLE_STATUS_PAGE", action = ArgAction::SetTrue)]
    enable_status_page: bool,

    /// Total timeout for updating all metrics
    #[arg(long, env = "UPDATE_TIMEOUT", default_value = "5m", value_parser = parse_duration_arg)]
    update_timeout: Duration,

    /// Number of metrics to update in parallel (1 to 100)
    #[arg(long, env = "UPDATE_PARALLELISM", default_value_t = 1)]
    update_parallelism: usize,

    /// Minimum age of points to be imported; lets data settle before import
    #[arg(long, env = "MIN_POINT_AGE", default_value = "2m", value_parser = parse_duration_arg)]
    min_point_age: Duration,

    /// How far back to search for recent data at the destination
    #[arg(long, env = "SD_LOOKBACK_INTERVAL", default_value = "1h", value_parser = parse_duration_arg)]
    sd_lookback_interval: Duration,

    /// How often to reset the start time of cumulative metrics, keeping the
    /// source query window small enough to avoid aggregation
    #[arg(long, env = "COUNTER_RESET_INTERVAL", default_value = "30m", value_parser = parse_duration_arg)]
    counter_reset_interval: Duration,

    /// Destination project for the bridge's own metrics
    #[arg(long, env = "STATS_SD_PROJECT")]
    stats_sd_project: Option<String>,

    /// Telemetry exporters to enable: stackdriver, prometheus
    #[arg(long, env = "STATS_METRIC_EXPORTERS", value_delimiter = ',', default_value = "prometheus")]
    stats_metric_exporters: Vec<String>,

    /// How often to sync metrics when running in standalone mode
    #[arg(long, env = "SYNC_PERIOD", default_value = "60s", value_parser = parse_duration_arg)]
    sync_period: Duration,

    /// Run a metadata cleanup after every N sync loops
    #[arg(long, env = "SYNC_CLEANUP_AFTER", default_value_t = 100)]
    sync_cleanup_after: u32,

    /// Storage engine for metric metadata: sqlite, libsql or memory
    #[arg(long, env = "STORAGE_ENGINE", default_value = "sqlite")]
    storage_engine: String,

    /// Path to the embedded SQLite store, e.g. /data/bridge.db
    #[arg(long, env = "SQLITE_PATH")]
    sqlite_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (and the sync loop outside hosted runtimes)
    Serve,
    /// Run a single sync and exit
    Sync,
    /// Remove metadata records for metrics not in the catalog and exit
    Cleanup,
}

impl Cli {
    fn options(&self) -> BridgeOptions {
        BridgeOptions {
            metric_config: self.metric_config.clone(),
            storage_engine: self.storage_engine.clone(),
            sqlite_path: self.sqlite_path.clone(),
            update_timeout: self.update_timeout,
            update_parallelism: self.update_parallelism,
            min_point_age: self.min_point_age,
            sd_lookback_interval: self.sd_lookback_interval,
            counter_reset_interval: self.counter_reset_interval,
            sync_period: self.sync_period,
            sync_cleanup_after: self.sync_cleanup_after,
            enable_status_page: self.enable_status_page,
            stats_sd_project: self.stats_sd_project.clone(),
            stats_metric_exporters: self.stats_metric_exporters.clone(),
        }
    }
}

/// Periodic sync loop for standalone deployments, where no external cron
/// hits /sync. The catalog is re-read on every tick, so config edits take
/// effect on the next sync; mtime changes are surfaced in the log.
async fn sync_loop(options: Arc<BridgeOptions>) {
    let mut ticker = tokio::time::interval(options.sync_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick fires immediately

    let mut last_modified = catalog::config_modified(&options);
    let mut count: u32 = 0;
    loop {
        ticker.tick().await;
        let modified = catalog::config_modified(&options);
        if modified != last_modified {
            info!("metric config changed, the new catalog takes effect this sync");
            last_modified = modified;
        }
        debug!("running sync...");
        if let Err(e) = sync::run_sync(&options).await {
            error!("error running sync: {e}");
        }
        count += 1;
        if count >= options.sync_cleanup_after {
            debug!("running cleanup...");
            if let Err(e) = sync::run_cleanup(&options).await {
                error!("error running cleanup: {e}");
            }
            count = 0;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = logging::init_logging(cli.debug);

    let options = cli.options();
    options.validate()?;
    let options = Arc::new(options);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            if !env::is_hosted() {
                info!("running standalone, starting the sync loop");
                tokio::spawn(sync_loop(Arc::clone(&options)));
            }
            server::start_server(options, cli.port).await?;
        }
        Commands::Sync => run_once(sync::run_sync(&options).await)?,
        Commands::Cleanup => run_once(sync::run_cleanup(&options).await)?,
    }
    Ok(())
}

fn run_once(result: Result<()>) -> anyhow::Result<()> {
    if let Err(e) = &result {
        error!("{e}");
    }
    result.map_err(Into::into)
}
