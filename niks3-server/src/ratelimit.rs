//! Adaptive rate limiter for S3 requests.
//!
//! A single process-wide, mutex-guarded token bucket that starts disabled
//! and turns itself on the first time S3 throttles a request, then
//! multiplicatively backs off on further throttles and recovers gradually
//! on sustained success. There is no off-the-shelf crate for this: the
//! `governor` crate (used elsewhere for fixed-quota limiting) pins its
//! quota at construction and has no API to rescale it at runtime, so the
//! bucket itself is hand-rolled here in the same spirit as the rest of
//! this crate's hand-rolled concurrency primitives.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Minimum rate once enabled, in requests/second.
pub const RATE_MIN: f64 = 5.0;
/// Maximum rate, in requests/second.
pub const RATE_MAX: f64 = 500.0;
/// Multiplicative backoff applied to `current_rate` on a throttle.
const BACKOFF_FACTOR: f64 = 0.7;
/// Multiplicative recovery applied to `current_rate` on sustained success.
const RECOVERY_FACTOR: f64 = 1.1;
/// Number of consecutive successes before a recovery step is taken.
const RECOVERY_AFTER: u32 = 10;

#[derive(Debug)]
struct Bucket {
    enabled: bool,
    current_rate: f64,
    success_count: u32,
    tokens: f64,
    last_refill: Instant,
}

/// A shared, adaptive rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<Bucket>>,
}

impl RateLimiter {
    /// Creates a new rate limiter. If `initial_rate` is positive, the
    /// limiter starts enabled at that rate (clamped to `[RATE_MIN,
    /// RATE_MAX]`); if zero, it starts disabled and activates on the
    /// first throttle.
    pub fn new(initial_rate: f64) -> Self {
        let enabled = initial_rate > 0.0;
        let current_rate = if enabled {
            initial_rate.clamp(RATE_MIN, RATE_MAX)
        } else {
            RATE_MIN
        };

        Self {
            inner: Arc::new(Mutex::new(Bucket {
                enabled,
                current_rate,
                success_count: 0,
                tokens: current_rate,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Blocks until a token is available, unless the limiter is disabled
    /// (in which case it returns immediately).
    pub async fn wait(&self) {
        loop {
            let sleep_for = {
                let mut bucket = self.inner.lock().await;

                if !bucket.enabled {
                    return;
                }

                bucket.refill();

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }

                Duration::from_secs_f64((1.0 - bucket.tokens) / bucket.current_rate)
            };

            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Records a successful S3 call. After `RECOVERY_AFTER` consecutive
    /// successes, scales `current_rate` up by `RECOVERY_FACTOR`.
    pub async fn record_success(&self) {
        let mut bucket = self.inner.lock().await;

        if !bucket.enabled {
            return;
        }

        bucket.success_count += 1;

        if bucket.success_count >= RECOVERY_AFTER {
            bucket.success_count = 0;
            bucket.current_rate = (bucket.current_rate * RECOVERY_FACTOR).min(RATE_MAX);
            bucket.refill();
            bucket.tokens = bucket.tokens.min(bucket.current_rate);
        }
    }

    /// Records an S3 throttle response. Enables the limiter at `RATE_MIN`
    /// if it was disabled; otherwise scales `current_rate` down by
    /// `BACKOFF_FACTOR`.
    pub async fn record_throttle(&self) {
        let mut bucket = self.inner.lock().await;

        bucket.success_count = 0;

        if !bucket.enabled {
            bucket.enabled = true;
            bucket.current_rate = RATE_MIN;
            bucket.tokens = RATE_MIN;
            bucket.last_refill = Instant::now();
        } else {
            bucket.current_rate = (bucket.current_rate * BACKOFF_FACTOR).max(RATE_MIN);
            bucket.refill();
            bucket.tokens = bucket.tokens.min(bucket.current_rate);
        }
    }

    /// Returns whether the limiter is currently enabled.
    pub async fn is_enabled(&self) -> bool {
        self.inner.lock().await.enabled
    }

    /// Returns the current rate, in requests/second.
    pub async fn current_rate(&self) -> f64 {
        self.inner.lock().await.current_rate
    }
}

impl Bucket {
    /// Refills the bucket based on elapsed time since the last refill,
    /// capping at `current_rate` tokens (one second's worth of burst).
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.current_rate).min(self.current_rate);
        self.last_refill = now;
    }
}

/// S3 error codes that indicate the request was throttled.
const THROTTLE_CODES: &[&str] = &[
    "SlowDown",
    "SlowDownRead",
    "SlowDownWrite",
    "Throttling",
    "ThrottlingException",
    "RequestThrottled",
    "RequestLimitExceeded",
];

/// Classifies an AWS SDK error (by its `code()`/HTTP status, when
/// available in its display form) as a throttle or not.
pub fn is_throttling_error(display: &str) -> bool {
    THROTTLE_CODES.iter().any(|code| display.contains(code)) || display.contains("429")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_disabled_when_zero() {
        let limiter = RateLimiter::new(0.0);
        assert_eq!(futures::executor::block_on(limiter.is_enabled()), false);
    }

    #[test]
    fn test_starts_enabled_when_positive() {
        let limiter = RateLimiter::new(50.0);
        assert!(futures::executor::block_on(limiter.is_enabled()));
        assert_eq!(futures::executor::block_on(limiter.current_rate()), 50.0);
    }

    #[test]
    fn test_clamps_initial_rate() {
        let limiter = RateLimiter::new(10_000.0);
        assert_eq!(futures::executor::block_on(limiter.current_rate()), RATE_MAX);
    }

    #[tokio::test]
    async fn test_throttle_enables_at_rate_min() {
        let limiter = RateLimiter::new(0.0);
        limiter.record_throttle().await;

        assert!(limiter.is_enabled().await);
        assert_eq!(limiter.current_rate().await, RATE_MIN);
    }

    #[tokio::test]
    async fn test_recovery_after_threshold() {
        let limiter = RateLimiter::new(RATE_MIN);

        for _ in 0..RECOVERY_AFTER {
            limiter.record_success().await;
        }

        assert!(limiter.current_rate().await > RATE_MIN);
    }

    #[tokio::test]
    async fn test_rate_stays_within_bounds() {
        let limiter = RateLimiter::new(0.0);

        for _ in 0..100 {
            limiter.record_throttle().await;
        }

        let rate = limiter.current_rate().await;
        assert!(rate >= RATE_MIN && rate <= RATE_MAX);

        for _ in 0..1000 {
            limiter.record_success().await;
        }

        let rate = limiter.current_rate().await;
        assert!(rate >= RATE_MIN && rate <= RATE_MAX);
    }

    #[test]
    fn test_throttle_classifier() {
        assert!(is_throttling_error("SlowDown: please reduce your request rate"));
        assert!(is_throttling_error("ThrottlingException"));
        assert!(is_throttling_error("status: 429"));
        assert!(!is_throttling_error("NoSuchKey"));
    }
}
