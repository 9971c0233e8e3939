use std::time::Duration;

use thiserror::Error;

/// An error produced by the cache, or by a fetch operation running on its behalf.
///
/// The error is cheap to clone so that a single failure can be handed verbatim
/// to every caller waiting on the same in-flight fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The supplied configuration is unusable, such as a zero capacity or TTL.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// The caller-supplied fetch operation failed.
    ///
    /// The attached string contains the failure reported by the operation.
    #[error("fetch failed: {0}")]
    Fetch(String),
    /// A fetch attempt did not settle within the configured time limit.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// An unexpected error inside the cache itself, e.g. a panicked fetch task.
    ///
    /// This variant is never stored as an entry, only surfaced to waiters.
    #[error("internal error")]
    InternalError,
}

/// The contents of a cache lookup or population: either `Ok(T)`, or the error
/// explaining why the value could not be produced.
pub type CacheContents<T = ()> = Result<T, CacheError>;
