use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML deserialization failed: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("source error: {0}")]
    Source(String),

    #[error("destination error: {0}")]
    Destination(String),

    #[error("query returned {0} time series, expected 1")]
    MultiSeries(usize),

    #[error("sync deadline exceeded")]
    DeadlineExceeded,

    #[error("{0}")]
    Sync(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
