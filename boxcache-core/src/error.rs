//! Error taxonomy for the sample cache.
//!
//! `NotFound` is the expected outcome at track boundaries. Everything else
//! aborts the read session: an adapter that breaks its contract or a cache
//! whose invariants no longer hold cannot be recovered locally.

use thiserror::Error;

use crate::sample::SampleKey;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Sample not found: {key}")]
    NotFound { key: SampleKey },
    #[error("Adapter contract violation: {0}")]
    AdapterContract(String),
    #[error("Inconsistent cache state: {0}")]
    InconsistentState(String),
    #[error("Track adapter is read-only")]
    ReadOnly,
    #[error("No such track: {0}")]
    UnknownTrack(usize),
    #[error("Unsupported container: {0}")]
    UnsupportedContainer(String),
    #[error("Malformed container: {0}")]
    Malformed(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    pub fn not_found(key: impl Into<SampleKey>) -> Self {
        CacheError::NotFound { key: key.into() }
    }

    /// Whether the error must terminate the read session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CacheError::AdapterContract(_) | CacheError::InconsistentState(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
