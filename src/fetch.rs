use std::future::Future;

use tokio::time;

use crate::{CacheContents, CacheError, FetchOptions};

/// Runs `fetch_op` until it succeeds or the configured attempts are exhausted.
///
/// Each attempt is bounded by [`FetchOptions::timeout`] if one is set; an
/// attempt exceeding the limit counts as failed with [`CacheError::Timeout`].
/// Between attempts the loop sleeps for [`FetchOptions::retry_delay`]. The
/// error of the final attempt is returned verbatim.
pub async fn fetch_with_retry<G, F, T>(options: &FetchOptions, mut fetch_op: G) -> CacheContents<T>
where
    G: FnMut() -> F,
    F: Future<Output = CacheContents<T>>,
{
    if options.max_attempts == 0 {
        return Err(CacheError::InvalidConfiguration(
            "max_attempts must be at least 1".into(),
        ));
    }

    let mut attempts = 0;
    loop {
        attempts += 1;

        let result = match options.timeout {
            Some(limit) => match time::timeout(limit, fetch_op()).await {
                Ok(result) => result,
                Err(_) => Err(CacheError::Timeout(limit)),
            },
            None => fetch_op().await,
        };

        match result {
            Ok(value) => break Ok(value),
            Err(error) if attempts >= options.max_attempts => break Err(error),
            Err(error) => {
                tracing::debug!(attempt = attempts, %error, "fetch attempt failed, retrying");
            }
        }

        time::sleep(options.retry_delay).await;
    }
}
