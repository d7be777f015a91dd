use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{Quota, RateLimiter};
use rand::Rng;

use super::error::ExchangeError;

/// HTTP statuses treated as transient unless overridden
pub const DEFAULT_TRANSIENT_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

type DirectRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Retry/backoff policy for REST calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub transient_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            transient_statuses: DEFAULT_TRANSIENT_STATUSES.to_vec(),
        }
    }
}

/// Gate every REST call through a shared requests-per-second ceiling and a
/// bounded retry loop with randomized exponential backoff
///
/// Cloneable; all clones share the same limiter.
#[derive(Clone)]
pub struct RestGate {
    limiter: Arc<DirectRateLimiter>,
    policy: RetryPolicy,
}

impl RestGate {
    pub fn new(requests_per_sec: u32, policy: RetryPolicy) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(requests_per_sec.max(1)).unwrap());
        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
            policy,
        }
    }

    /// Run `call` until it succeeds, fails terminally, or attempts run out
    pub async fn run<T, F, Fut>(&self, what: &str, call: F) -> Result<T, ExchangeError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let mut last_err = None;
        for attempt in 1..=self.policy.max_attempts {
            self.limiter.until_ready().await;

            match call().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let retryable = e.is_retryable(&self.policy.transient_statuses);
                    if !retryable || attempt == self.policy.max_attempts {
                        if retryable {
                            tracing::warn!(
                                "{} failed after {} attempts: {}",
                                what,
                                attempt,
                                e
                            );
                        }
                        return Err(e);
                    }
                    let delay = backoff_with_jitter(attempt);
                    tracing::warn!(
                        "{} failed ({}), retrying in {:?} (attempt {}/{})",
                        what,
                        e,
                        delay,
                        attempt,
                        self.policy.max_attempts
                    );
                    last_err = Some(e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
        // Unreachable: the loop always returns; kept for the compiler
        Err(last_err.unwrap_or(ExchangeError::Malformed("retry loop exhausted".to_string())))
    }
}

/// Exponential backoff (2^attempt seconds, capped) with up to 500ms of jitter
fn backoff_with_jitter(attempt: u32) -> std::time::Duration {
    let base_secs = 2u64.saturating_pow(attempt).min(30);
    let jitter_ms = rand::thread_rng().gen_range(0..500);
    std::time::Duration::from_millis(base_secs * 1000 + jitter_ms)
}
