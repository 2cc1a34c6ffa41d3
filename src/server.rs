//! HTTP surface: sync and cleanup triggers, health check and the status
//! page.

use crate::catalog;
use crate::env;
use crate::error::Result;
use crate::options::BridgeOptions;
use crate::stats;
use crate::storage;
use crate::sync;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub options: Arc<BridgeOptions>,
}

/// In hosted mode sync and cleanup may only be triggered by the platform
/// cron, which marks its requests with a header.
fn cron_allowed(headers: &HeaderMap) -> bool {
    if !env::is_hosted() {
        return true;
    }
    headers
        .get("x-appengine-cron")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "true")
        .unwrap_or(false)
}

async fn sync_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !cron_allowed(&headers) {
        return (StatusCode::UNAUTHORIZED, "Only cron requests are allowed here").into_response();
    }
    match sync::run_sync(&state.options).await {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(e) => {
            error!("sync failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn cleanup_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !cron_allowed(&headers) {
        return (StatusCode::UNAUTHORIZED, "Only cron requests are allowed here").into_response();
    }
    match sync::run_cleanup(&state.options).await {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(e) => {
            error!("cleanup failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics_handler() -> Response {
    match stats::prometheus_text() {
        Some(text) => (StatusCode::OK, text).into_response(),
        None => (StatusCode::NOT_FOUND, "prometheus exporter is not active").into_response(),
    }
}

async fn index(State(state): State<AppState>) -> Response {
    if !state.options.enable_status_page {
        return (
            StatusCode::NOT_FOUND,
            "Status page is disabled. Please set --enable-status-page to enable it.",
        )
            .into_response();
    }
    match render_status_page(&state.options).await {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            error!("status page failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn render_status_page(options: &BridgeOptions) -> Result<String> {
    let storage = storage::load_storage_engine(options).await?;
    let catalog = catalog::load_catalog(options, storage.as_ref()).await;
    let result = catalog.map(|catalog| {
        let config_modified = catalog
            .file_modified
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string());
        let mut rows = String::new();
        for m in &catalog.metrics {
            rows.push_str(&format!(
                "<tr><td><a href=\"{}\">{}</a></td><td><code>{}</code></td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                m.stackdriver_url(),
                escape(&m.name),
                escape(m.record.query()),
                escape(&m.sd_project),
                m.record.last_update().to_rfc3339(),
                m.record.last_attempt().to_rfc3339(),
                escape(m.record.last_status()),
            ));
        }
        format!(
            "<!DOCTYPE html><html><head><title>ts-bridge</title></head><body>\
             <h1>Time Series Bridge</h1>\
             <p>Config last modified: {config_modified}</p>\
             <table border=\"1\" cellpadding=\"4\">\
             <tr><th>Name</th><th>Query</th><th>Project</th>\
             <th>Last update</th><th>Last attempt</th><th>Status</th></tr>\n{rows}</table>\
             </body></html>"
        )
    });
    storage.close().await?;
    result
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Builds the router with all routes.
pub fn create_server(options: Arc<BridgeOptions>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods([Method::GET]);

    Router::new()
        .route("/", get(index))
        .route("/sync", get(sync_handler))
        .route("/cleanup", get(cleanup_handler))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(AppState { options })
}

/// Starts the HTTP server on the given port.
pub async fn start_server(options: Arc<BridgeOptions>, port: u16) -> Result<()> {
    let app = create_server(options);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!("ts-bridge server listening on port {port}");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn options(enable_status_page: bool) -> BridgeOptions {
        BridgeOptions {
            metric_config: PathBuf::from("does-not-exist.yaml"),
            storage_engine: "memory".to_string(),
            sqlite_path: None,
            update_timeout: Duration::from_secs(300),
            update_parallelism: 1,
            min_point_age: Duration::from_secs(120),
            sd_lookback_interval: Duration::from_secs(3600),
            counter_reset_interval: Duration::from_secs(1800),
            sync_period: Duration::from_secs(60),
            sync_cleanup_after: 100,
            enable_status_page,
            stats_sd_project: None,
            stats_metric_exporters: vec![],
        }
    }

    async fn request(app: Router, path: &str) -> (StatusCode, String) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let resp = reqwest::get(format!("http://{addr}{path}")).await.unwrap();
        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
        (status, resp.text().await.unwrap())
    }

    #[tokio::test]
    async fn health_returns_ok_json() {
        let app = create_server(Arc::new(options(false)));
        let (status, body) = request(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["status"], "ok");
    }

    #[tokio::test]
    async fn status_page_is_gated() {
        let app = create_server(Arc::new(options(false)));
        let (status, _) = request(app, "/").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_page_shows_metrics_and_config_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.yaml");
        std::fs::write(
            &path,
            r#"
datadog_metrics:
  - name: requests
    query: "avg:http.requests{*}"
    api_key: k
    application_key: a
    destination: sd
stackdriver_destinations:
  - name: sd
    project_id: p
"#,
        )
        .unwrap();
        let mut opts = options(true);
        opts.metric_config = path;

        let app = create_server(Arc::new(opts));
        let (status, body) = request(app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Config last modified:"));
        assert!(!body.contains("Config last modified: unknown"));
        assert!(body.contains("requests"));
        assert!(body.contains("avg:http.requests{*}"));
    }

    #[tokio::test]
    async fn sync_with_missing_config_returns_500() {
        let app = create_server(Arc::new(options(false)));
        let (status, body) = request(app, "/sync").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("could not read config file"));
    }

    #[test]
    fn escape_handles_markup() {
        assert_eq!(escape("a<b&c>"), "a&lt;b&amp;c&gt;");
    }
}
