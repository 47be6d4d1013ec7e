//! Cache error taxonomy.
//!
//! None of these may reach an end user. Callers in the request pipeline
//! downgrade every variant except `ContextUnavailable` to "serve uncached".

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    /// Key derivation was asked for the current page outside a request scope.
    #[error("no request context is active and no explicit page was given")]
    ContextUnavailable,

    /// None of the candidate storage roots exists.
    #[error("no page cache storage root is available")]
    StorageUnavailable,

    /// A stored entry could not be split or decoded.
    #[error("corrupt cache entry at {}: {reason}", path.display())]
    CorruptEntry { path: PathBuf, reason: String },

    /// The filesystem rejected a write.
    #[error("failed to write cache entry at {}: {source}", path.display())]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode cache entry: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid cache pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

impl CacheError {
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptEntry {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn write_failure(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::WriteFailure {
            path: path.into(),
            source,
        }
    }

    /// Whether this error only means "cache disabled" and deserves no warning.
    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::StorageUnavailable)
    }
}
