//! An in-memory, TTL-bounded key/value cache with coalesced asynchronous population.
//!
//! The central type is [`Cache`]: a bounded map whose entries expire after a
//! per-entry TTL, and which evicts the oldest-inserted entry when inserting past
//! capacity. Missing entries can be populated through [`Cache::get_or_fetch`],
//! which deduplicates concurrent population requests so that only one fetch runs
//! per key at a time, with all requesters observing the same outcome.
//!
//! A small retry layer ([`fetch_with_retry`]) can be put in front of the
//! population step, either standalone or pre-composed via
//! [`Cache::get_or_fetch_with`].

#![warn(missing_docs)]

mod cache;
mod config;
mod error;
mod fetch;

pub use cache::*;
pub use config::*;
pub use error::*;
pub use fetch::*;

#[cfg(test)]
pub(crate) use tokio::time;

#[cfg(not(test))]
pub(crate) use std::time;

/// Sets up the test environment.
///
/// Initializes logs: the logger only captures logs from this crate, and all
/// console output is captured by the test runner.
#[cfg(test)]
pub(crate) fn setup() {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt::fmt;

    fmt()
        .with_env_filter(EnvFilter::new("fetchcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}
