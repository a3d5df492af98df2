use std::sync::Arc;

use thiserror::Error;

/// Result type used by fallible operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while synchronizing a datafile.
///
/// Most of these never reach the caller: the sync entry points log them and degrade to "serve
/// cache or nothing". They are surfaced by constructors and by lower-level building blocks.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Neither a project id nor an SDK key was provided (or both were empty).
    #[error("config key requires a non-empty project id or sdk key")]
    InvalidConfigKey,

    /// The configured CDN host cannot be combined into a valid datafile URL.
    #[error("invalid host configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The server answered with a status that is neither 2xx nor 304.
    #[error("unexpected response status {0}")]
    UnexpectedStatus(u16),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Persisted JSON could not be parsed or serialized.
    #[error(transparent)]
    Json(Arc<serde_json::Error>),

    /// A sync worker thread panicked. This should normally never happen.
    #[error("sync thread panicked")]
    SyncThreadPanicked,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}
