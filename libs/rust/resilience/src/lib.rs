//! Retry with exponential backoff and jitter for remote collaborators
//! (content gateway, participant registry).
use std::future::Future;
use std::time::Duration;

use once_cell::sync::Lazy;
use opentelemetry::{global, metrics::Counter, KeyValue};
use rand::{thread_rng, Rng};
use tracing::{debug, warn};

static RETRY_ATTEMPTS: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter("fedagg-resilience")
        .u64_counter("fedagg_retry_attempts_total")
        .with_description("Total attempts executed by retry_async, first attempts included")
        .build()
});

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt. Zero means a single attempt.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}

impl Default for RetryConfig {
    fn default() -> Self { Self { max_retries: 2, base_delay: Duration::from_millis(200), max_delay: Duration::from_secs(2), jitter: 0.25 } }
}

impl RetryConfig {
    /// Backoff before retry number `attempt + 1`, before jitter.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exp = self.base_delay.mul_f64(2f64.powi(attempt.min(30) as i32));
        std::cmp::min(exp, self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 { return delay; }
        let jitter_ms = (delay.as_millis() as f64 * self.jitter.min(1.0)) as i64;
        let offset: i64 = thread_rng().gen_range(-jitter_ms..=jitter_ms);
        Duration::from_millis((delay.as_millis() as i64 + offset).max(0) as u64)
    }
}

/// Runs `op` until it succeeds, the error is not retryable, or retries are exhausted.
/// The last error is returned unchanged.
pub async fn retry_async<F, Fut, T, E, P>(cfg: &RetryConfig, label: &'static str, mut op: F, retryable: P) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        RETRY_ATTEMPTS.add(1, &[KeyValue::new("op", label)]);
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if !retryable(&e) => return Err(e),
            Err(e) if attempt >= cfg.max_retries => {
                warn!(op = label, attempts = attempt + 1, error = %e, "retries exhausted");
                return Err(e);
            }
            Err(e) => {
                let delay = cfg.jittered(cfg.backoff(attempt));
                debug!(op = label, attempt, ?delay, error = %e, "retrying");
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}
