use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Keeps the background log writer alive; dropping it flushes and stops
/// file logging, so `main` holds it for the process lifetime.
pub struct LogGuard {
    _file_writer: Option<WorkerGuard>,
}

/// Sets up tracing output. The console always gets human-readable lines;
/// when `LOG_DIR` is set, a daily-rotated JSON log is written there as well
/// (opt-in, so one-shot sync and cleanup runs don't scatter log
/// directories). `RUST_LOG` overrides the default filter.
pub fn init_logging(debug: bool) -> LogGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if debug { "info,ts_bridge=debug" } else { "ts_bridge=info" })
    });

    let console = fmt::layer().with_target(false);

    let file = std::env::var("LOG_DIR").ok().filter(|d| !d.is_empty()).map(|dir| {
        // The rolling appender expects the directory to exist already.
        let _ = std::fs::create_dir_all(&dir);
        let appender = tracing_appender::rolling::daily(Path::new(&dir), "ts-bridge.json");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (fmt::layer().json().with_writer(writer), guard)
    });

    match file {
        Some((file_layer, guard)) => {
            tracing_subscriber::registry().with(filter).with(console).with(file_layer).init();
            LogGuard { _file_writer: Some(guard) }
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            LogGuard { _file_writer: None }
        }
    }
}
