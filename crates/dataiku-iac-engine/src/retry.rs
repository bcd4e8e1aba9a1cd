//! Retry of live-system calls with exponential backoff
//!
//! Transient errors are retried up to `max_attempts` (first try included);
//! permanent errors are returned immediately.

use dataiku_iac_config::RetrySettings;
use dataiku_iac_state::ClientError;
use std::future::Future;
use tokio::time::sleep;

/// Run `operation` until it succeeds, fails permanently, or runs out of attempts
///
/// `attempts` is incremented before every try, so it stays accurate even
/// when the caller drops this future (e.g. on timeout).
pub async fn with_retry<T, F, Fut>(
    settings: &RetrySettings,
    attempts: &mut u32,
    mut operation: F,
) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let max_attempts = settings.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        *attempts += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < max_attempts => {
                let delay = settings.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err.message(),
                    "Transient error, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
