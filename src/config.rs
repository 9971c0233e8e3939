use std::time::Duration;

use serde::Deserialize;

use crate::{CacheContents, CacheError};

/// Configuration for a [`Cache`](crate::Cache).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// The maximum number of entries the cache holds.
    ///
    /// Inserting past this capacity evicts the oldest-inserted entry first.
    ///
    /// Defaults to `100`.
    pub capacity: usize,

    /// The TTL applied to entries stored without an explicit one.
    ///
    /// Defaults to `60s`.
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            default_ttl: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    pub(crate) fn validate(&self) -> CacheContents {
        if self.capacity == 0 {
            return Err(CacheError::InvalidConfiguration(
                "capacity must be at least 1".into(),
            ));
        }
        if self.default_ttl.is_zero() {
            return Err(CacheError::InvalidConfiguration(
                "default_ttl must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Options for [`fetch_with_retry`](crate::fetch_with_retry).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    /// How often to invoke the fetch operation before giving up.
    ///
    /// Defaults to `3`.
    pub max_attempts: usize,

    /// How long to wait between attempts.
    ///
    /// Defaults to `1s`.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// The time limit applied to each individual attempt.
    ///
    /// An attempt exceeding the limit fails with
    /// [`CacheError::Timeout`](crate::CacheError::Timeout). `None` leaves
    /// attempts unbounded.
    ///
    /// Defaults to `5s`.
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            timeout: Some(Duration::from_secs(5)),
        }
    }
}
