//! Bounded retries for transport calls.
//!
//! Defaults: the first retry waits up to 500ms, each later one doubles, and
//! no wait exceeds 8s. Each wait is then shortened by a random factor of up
//! to 25%. The caller chooses the attempt count (at least one).
//!
//! Every [`TransportError`] is retried. A server-supplied `Retry-After` (or
//! `Retry-After-Ms`) delay replaces the computed backoff when it is in range.

use std::future::Future;
use std::time::Duration;

use reqwest::header::HeaderMap;

use crate::TransportError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial backoff delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum backoff delay.
    pub max_delay: Duration,
    /// Jitter factor for down-jitter (0.25 = up to 25% reduction).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter_factor: 0.25,
        }
    }
}

impl RetryConfig {
    /// No waiting between attempts.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_factor: 0.0,
        }
    }
}

/// Server-requested delays at or above this are ignored in favor of backoff.
const MAX_SERVER_DELAY: Duration = Duration::from_secs(60);

fn header_text<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name)?.to_str().ok().map(str::trim)
}

/// Server-requested delay from `retry-after-ms` (fractional milliseconds)
/// or `retry-after` (whole seconds), the former taking precedence.
///
/// Only delays strictly between zero and one minute are honored.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let in_range = |d: &Duration| !d.is_zero() && *d < MAX_SERVER_DELAY;

    let from_millis = header_text(headers, "retry-after-ms")
        .and_then(|text| text.parse::<f64>().ok())
        .filter(|ms| ms.is_finite() && *ms > 0.0)
        .map(|ms| Duration::from_secs_f64(ms / 1000.0))
        .filter(in_range);

    from_millis.or_else(|| {
        header_text(headers, "retry-after")
            .and_then(|text| text.parse::<u64>().ok())
            .map(Duration::from_secs)
            .filter(in_range)
    })
}

/// Delay before the retry following `backoff_step` (0 before the first retry).
///
/// A server-provided `retry_after` wins over the computed backoff.
#[must_use]
pub fn calculate_retry_delay(
    backoff_step: u32,
    config: &RetryConfig,
    retry_after: Option<Duration>,
) -> Duration {
    if let Some(delay) = retry_after {
        return delay;
    }

    let exponent = i32::try_from(backoff_step).unwrap_or(i32::MAX).min(30);
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(config.max_delay.as_secs_f64());

    let jitter = 1.0 - rand::random::<f64>() * config.jitter_factor;
    Duration::from_secs_f64(capped * jitter)
}

/// Run `attempt` until it succeeds or `max_attempts` attempts have failed.
///
/// `attempt` receives the zero-based attempt number. The last error is
/// returned once attempts are exhausted.
pub async fn with_retries<T, F, Fut>(
    max_attempts: u32,
    config: &RetryConfig,
    mut attempt: F,
) -> Result<T, TransportError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut number = 0;
    loop {
        match attempt(number).await {
            Ok(value) => return Ok(value),
            Err(err) if number + 1 < max_attempts => {
                let delay = calculate_retry_delay(number, config, err.retry_after());
                tracing::debug!(
                    error = %err,
                    attempt = number + 1,
                    max_attempts,
                    delay_ms = delay.as_millis(),
                    "Retrying request after transport error"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                number += 1;
            }
            Err(err) => {
                tracing::warn!(error = %err, attempts = number + 1, "Request failed");
                return Err(err);
            }
        }
    }
}
