//! Error types for the fetch, cache and storage boundaries.
//!
//! Scoring (detector and risk) is infallible and has no error type.

use thiserror::Error;

/// Failure fetching one series from the upstream provider.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("malformed upstream payload: {0}")]
    Decode(String),

    #[error("upstream payload missing field `{0}`")]
    MissingField(&'static str),
}

/// Failure reading from or writing to the cache backend.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache payload (de)serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        Self::Backend(e.to_string())
    }
}

/// Failure writing to or querying the time-series store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed store response: {0}")]
    Decode(String),

    #[error("point cannot be encoded: {0}")]
    InvalidPoint(String),
}

/// Any failure while processing a single series in a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}
