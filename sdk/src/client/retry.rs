//! Bounded exponential backoff for chain calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::config::ChainClientConfig;
use super::error::ChainError;

/// Runs `op` until it succeeds, fails permanently, or exhausts the retry budget.
///
/// Transient errors are retried with the configured backoff. Once
/// `max_retries` retries have failed the error is surfaced as
/// [`ChainError::Disconnected`] for `height`.
///
/// # Errors
///
/// Returns the first non-transient error, or `Disconnected` after the ceiling.
pub async fn with_retry<T, F, Fut>(
    config: &ChainClientConfig,
    height: u64,
    mut op: F,
) -> Result<T, ChainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChainError>>,
{
    let mut retries = 0u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                if retries >= config.max_retries {
                    return Err(ChainError::Disconnected {
                        height,
                        attempts: retries.saturating_add(1),
                        last_error: e.to_string(),
                    });
                }

                let wait = match &e {
                    ChainError::RateLimited {
                        retry_after: Some(secs),
                    } => Duration::from_secs(*secs).min(config.max_backoff),
                    _ => config.backoff(retries),
                };
                retries += 1;
                warn!(
                    height,
                    retry = retries,
                    wait_ms = wait.as_millis() as u64,
                    "chain call failed: {}",
                    e
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}
