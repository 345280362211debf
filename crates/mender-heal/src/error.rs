//! Resilience engine error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the engine outside its fail-soft paths.
#[derive(Debug, Error)]
pub enum HealError {
    #[error("retry of {key} was cancelled")]
    Cancelled { key: String },

    #[error("unknown health check: {0}")]
    UnknownCheck(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest error: {0}")]
    Manifest(String),
}

impl HealError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        HealError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type HealResult<T> = Result<T, HealError>;
