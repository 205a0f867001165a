//! Bounded retry with randomized backoff for registry I/O.
//!
//! Transient registry failures (gateway errors, timeouts) are retried by the
//! container backend beneath the build core; everything else bubbles up
//! immediately.

use crate::error::{Result, StratumError};
use once_cell::sync::Lazy;
use rand::Rng;
use std::future::Future;
use std::ops::RangeInclusive;
use std::time::Duration;
use tracing::warn;

/// Error message fragments considered transient.
static RETRYABLE_ERROR_PATTERNS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "TLS handshake timeout",
        "i/o timeout",
        "connection reset by peer",
        "temporary failure",
        "502 Bad Gateway",
        "503 Service Unavailable",
        "504 Gateway Time-out",
    ]
});

/// Retry policy: attempt count and the jittered delay range between
/// attempts, in seconds.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub operation: &'static str,
    pub max_attempts: u32,
    pub delay_secs: RangeInclusive<u64>,
}

/// Policy for image pulls.
pub fn pull_retry() -> RetryConfig {
    RetryConfig { operation: "pull", max_attempts: 5, delay_secs: 15..=30 }
}

/// Policy for image pushes.
pub fn push_retry() -> RetryConfig {
    RetryConfig { operation: "push", max_attempts: 10, delay_secs: 15..=30 }
}

/// Whether an error message matches a known transient condition.
pub fn is_retryable_message(message: &str) -> bool {
    RETRYABLE_ERROR_PATTERNS.iter().any(|pattern| message.contains(pattern))
}

/// Run `op` until it succeeds, fails non-transiently, or exhausts the
/// configured attempts. Each retry sleeps a random delay drawn from the
/// policy's range.
pub async fn with_retry<T, F, Fut>(cfg: &RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let message = err.to_string();
                if attempt >= cfg.max_attempts || !is_retryable_message(&message) {
                    return Err(err);
                }

                let delay = {
                    let mut rng = rand::thread_rng();
                    rng.gen_range(cfg.delay_secs.clone())
                };
                warn!(
                    operation = cfg.operation,
                    attempt,
                    max_attempts = cfg.max_attempts,
                    delay_secs = delay,
                    "transient error, retrying: {}",
                    message
                );
                tokio::time::sleep(Duration::from_secs(delay)).await;
                attempt += 1;
            }
        }
    }
}

/// Helper for backends wrapping raw error strings.
pub fn backend_error(reason: impl Into<String>) -> StratumError {
    StratumError::Backend { reason: reason.into() }
}
