use crate::DocumentType;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReindexerError>;

#[derive(Error, Debug)]
pub enum ReindexerError {
    #[error("No bucket space configured for document type '{0}'")]
    UnknownBucketSpace(DocumentType),

    #[error("Failed to acquire reindexing lock for cluster '{cluster}' within {timeout:?}")]
    LockContention { cluster: String, timeout: Duration },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("{0}")]
    Other(String),
}

impl ReindexerError {
    /// Whether this is the retryable "lock held elsewhere" failure.
    #[must_use]
    pub const fn is_lock_contention(&self) -> bool {
        matches!(self, Self::LockContention { .. })
    }
}

impl From<prometheus::Error> for ReindexerError {
    fn from(err: prometheus::Error) -> Self {
        Self::Metrics(err.to_string())
    }
}
