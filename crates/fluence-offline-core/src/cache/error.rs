use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt cache entry: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid manifest URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Install failed: {} asset(s) could not be cached: {}", failed.len(), failed.join(", "))]
    InstallFailed { failed: Vec<String> },
}
