//! Exponential backoff for the HTTP transport
//!
//! A request is tried up to `max_attempts` times in total. After failed
//! attempt `n` (zero-based) the caller sleeps exactly `base_delay * 2^n`
//! before trying again, provided the error passes the retry predicate.

use crate::mcp::error::{McpError, Result};
use std::future::Future;
use std::time::Duration;

/// Attempt budget and base delay for one retried operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Total attempts, including the first one
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Backoff {
    pub fn new(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Pause after failed attempt `attempt`; saturates instead of overflowing
    pub fn delay(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(2_u32.saturating_pow(exponent))
    }
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or the attempt budget is spent
///
/// The last error is returned unchanged. A budget of zero still makes one
/// attempt.
pub async fn retry<T, F, Fut, P>(backoff: &Backoff, should_retry: P, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&McpError) -> bool,
{
    let attempts = backoff.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!("Request succeeded on attempt {}/{}", attempt + 1, attempts);
                }
                return Ok(value);
            }
            Err(e) if attempt + 1 < attempts && should_retry(&e) => {
                let delay = backoff.delay(attempt);
                tracing::warn!(
                    "Request failed (attempt {}/{}), retrying in {:?}: {}",
                    attempt + 1,
                    attempts,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// HTTP statuses worth another attempt: 408, 429 and 5xx other than
/// 501 and 505
pub fn should_retry_status(status: u16) -> bool {
    match status {
        408 | 429 => true,
        501 | 505 => false,
        500..=599 => true,
        _ => false,
    }
}
