use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

pub const DEFAULT_MAX_RETRIES: u32 = 20;

/// Truncated exponential backoff: `min(2^attempt * unit + jitter, max)`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    unit: Duration,
    jitter: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(1),
            Duration::from_millis(1000),
            Duration::from_secs(64),
        )
    }
}

impl Backoff {
    pub fn new(unit: Duration, jitter: Duration, max: Duration) -> Self {
        Self { unit, jitter, max }
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let unit_ms = self.unit.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let jitter_ms = self.jitter.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(32);
        let exp = unit_ms.saturating_mul(1u64 << shift);
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rng.gen_range(0..jitter_ms)
        };
        Duration::from_millis(exp.saturating_add(jitter).min(max_ms))
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or has failed `max_retries + 1` times. A server supplied retry hint
    /// raises the computed delay but never above the cap.
    pub async fn execute<T, E, F, Fut, R>(
        &self,
        max_retries: u32,
        is_retryable: R,
        mut operation: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> RetryDecision,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let decision = is_retryable(&err);
            if !decision.retry {
                return Err(err);
            }
            if attempt >= max_retries {
                warn!(attempts = attempt + 1, error = %err, "giving up after retries");
                return Err(err);
            }
            let mut delay = self.delay(attempt);
            if let Some(hint) = decision.retry_after {
                delay = delay.max(hint).min(self.max);
            }
            debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Outcome of classifying a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub retry_after: Option<Duration>,
}

impl RetryDecision {
    pub const STOP: Self = Self {
        retry: false,
        retry_after: None,
    };

    pub fn retry() -> Self {
        Self {
            retry: true,
            retry_after: None,
        }
    }

    pub fn retry_after(hint: Option<Duration>) -> Self {
        Self {
            retry: true,
            retry_after: hint,
        }
    }
}

impl From<bool> for RetryDecision {
    fn from(retry: bool) -> Self {
        if retry { Self::retry() } else { Self::STOP }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_grow_and_are_capped() {
        let backoff = Backoff::default();
        let mut rng = StdRng::seed_from_u64(7);
        let mut previous = Duration::ZERO;
        for attempt in 0..=20 {
            let delay = backoff.delay_with_rng(attempt, &mut rng);
            assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
            assert!(delay <= Duration::from_secs(64));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(64));
    }

    #[test]
    fn jitter_stays_within_one_second() {
        let backoff = Backoff::default();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let delay = backoff.delay_with_rng(2, &mut rng);
            assert!(delay >= Duration::from_secs(4));
            assert!(delay < Duration::from_secs(5));
        }
    }

    #[test]
    fn jitter_is_resampled_per_attempt() {
        let backoff = Backoff::default();
        let mut rng = StdRng::seed_from_u64(3);
        let samples: Vec<_> = (0..8).map(|_| backoff.delay_with_rng(0, &mut rng)).collect();
        assert!(samples.windows(2).any(|w| w[0] != w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), String> = Backoff::default()
            .execute(3, |_| RetryDecision::retry(), || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("rate limited".to_string())
                }
            })
            .await;

        assert_eq!(result.unwrap_err(), "rate limited");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_between_attempts() {
        let start = tokio::time::Instant::now();
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = Backoff::default()
            .execute(5, |_| RetryDecision::retry(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(format!("attempt {n} failed"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        // 1s + 2s of exponential delay, plus jitter below 1s each.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = Backoff::default()
            .execute(20, |_| RetryDecision::STOP, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("not found".to_string()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_hint_extends_delay() {
        let start = tokio::time::Instant::now();
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = Backoff::default()
            .execute(
                1,
                |_| RetryDecision::retry_after(Some(Duration::from_secs(30))),
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move { if n == 0 { Err("busy".to_string()) } else { Ok(()) } }
                },
            )
            .await;

        assert!(result.is_ok());
        assert!(start.elapsed() >= Duration::from_secs(30));
    }
}
