use std::env;

/// Returns the ambient GCP project, if one is configured for this process.
pub fn ambient_project() -> Option<String> {
    env::var("GOOGLE_CLOUD_PROJECT").ok().filter(|p| !p.is_empty())
}

/// True when running under a hosted runtime (App Engine / Cloud Run), where
/// sync and cleanup are triggered by an external cron rather than the
/// internal timer loop.
pub fn is_hosted() -> bool {
    env::var("GAE_ENV").map(|v| !v.is_empty()).unwrap_or(false)
        || env::var("GAE_SERVICE").map(|v| !v.is_empty()).unwrap_or(false)
        || env::var("K_SERVICE").map(|v| !v.is_empty()).unwrap_or(false)
}
