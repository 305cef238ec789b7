//! Error types for Scribble

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for Scribble operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Scribble
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (fatal at startup)
    #[error("configuration error: {0}")]
    Config(String),

    /// Persisted state could not be written or read
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// Generation backend failure
    #[error(transparent)]
    Generation(#[from] GenerationError),

    /// Channel error
    #[error("channel error: {0}")]
    Channel(String),

    /// Action execution error
    #[error("action error: {0}")]
    Action(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// A store failed to write its backing file
///
/// Recoverable: the in-memory record set stays authoritative and the next
/// write retries.
#[derive(Debug, Error)]
#[error("failed to persist {}: {source}", path.display())]
pub struct PersistenceError {
    /// File the store attempted to write
    pub path: PathBuf,
    /// Underlying failure
    #[source]
    pub source: std::io::Error,
}

impl PersistenceError {
    /// Wrap an IO error for `path`
    #[must_use]
    pub const fn new(path: PathBuf, source: std::io::Error) -> Self {
        Self { path, source }
    }
}

/// The external generation call failed
#[derive(Debug, Error)]
pub enum GenerationError {
    /// No response within the configured bound
    #[error("generation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Transport failure
    #[error("generation request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend returned something we cannot use
    #[error("generation failed: {0}")]
    Failure(String),
}
