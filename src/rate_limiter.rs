//! Per-site request pacing using a token bucket
//!
//! Each site gets its own [`RequestLimiter`]; every fetch attempt (including
//! retries) takes one token before it is sent. The bucket is lock-free:
//! tokens are tracked in millionths of a request so fractional refill rates
//! like 30 requests/minute stay exact.

use crate::config::RateLimitConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Fixed-point scale: one request = `UNIT` internal tokens
const UNIT: u64 = 1_000_000;

/// Token bucket shared by all workers fetching from one site
///
/// - Tokens refill continuously at `requests_per_minute / 60` per second
/// - Bucket capacity is `burst` requests, and the bucket starts full
/// - [`acquire`](Self::acquire) waits until a whole token is available
#[derive(Clone, Debug)]
pub struct RequestLimiter {
    /// Refill rate in internal units per second
    units_per_sec: u64,
    /// Bucket capacity in internal units
    capacity: u64,
    /// Available tokens in internal units
    tokens: Arc<AtomicU64>,
    /// Last refill timestamp (nanoseconds since arbitrary epoch)
    last_refill: Arc<AtomicU64>,
}

impl RequestLimiter {
    /// Create a limiter from a site's rate-limit settings
    ///
    /// # Examples
    ///
    /// ```
    /// use harvest_dl::config::RateLimitConfig;
    /// use harvest_dl::rate_limiter::RequestLimiter;
    ///
    /// let limiter = RequestLimiter::new(&RateLimitConfig {
    ///     requests_per_minute: 30,
    ///     burst: 2,
    /// });
    /// assert_eq!(limiter.requests_per_minute(), 30);
    /// ```
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        let rpm = u64::from(config.requests_per_minute.max(1));
        let capacity = u64::from(config.burst.max(1)) * UNIT;
        Self {
            units_per_sec: rpm * UNIT / 60,
            capacity,
            tokens: Arc::new(AtomicU64::new(capacity)),
            last_refill: Arc::new(AtomicU64::new(Self::now_nanos())),
        }
    }

    /// Configured rate in requests per minute
    pub fn requests_per_minute(&self) -> u64 {
        self.units_per_sec * 60 / UNIT
    }

    /// Wait until one request may be sent, then consume its token
    pub async fn acquire(&self) {
        loop {
            self.refill_tokens();

            let current = self.tokens.load(Ordering::SeqCst);
            if current >= UNIT {
                if self
                    .tokens
                    .compare_exchange(current, current - UNIT, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return;
                }
                // Lost the race to another worker, re-check immediately
                continue;
            }

            let missing = UNIT - current;
            let wait_ms = missing.saturating_mul(1000) / self.units_per_sec.max(1);
            tracing::trace!(wait_ms, "Rate limit token unavailable, waiting");
            tokio::time::sleep(Duration::from_millis(wait_ms.clamp(5, 1000))).await;
        }
    }

    /// Try to take a token without waiting
    pub fn try_acquire(&self) -> bool {
        self.refill_tokens();
        let current = self.tokens.load(Ordering::SeqCst);
        current >= UNIT
            && self
                .tokens
                .compare_exchange(current, current - UNIT, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    fn refill_tokens(&self) {
        let now = Self::now_nanos();
        let last = self.last_refill.load(Ordering::SeqCst);
        let elapsed_nanos = now.saturating_sub(last);

        let to_add = (u128::from(self.units_per_sec) * u128::from(elapsed_nanos) / 1_000_000_000)
            .min(u128::from(u64::MAX)) as u64;

        if to_add > 0
            && self
                .last_refill
                .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            let _ = self
                .tokens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                    Some(t.saturating_add(to_add).min(self.capacity))
                });
        }
    }

    /// Monotonic time in nanoseconds, epoch fixed at first use
    fn now_nanos() -> u64 {
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as u64
    }
}
