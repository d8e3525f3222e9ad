//! Global admission control built on a single `governor` token bucket.
//!
//! One bucket is shared by every request served by a pipeline; there is no
//! per-client keying. The bucket is a direct (non-keyed) GCRA limiter whose
//! burst is the configured capacity and whose replenish period is derived from
//! `refill_per_second`.
use std::{num::NonZeroU32, time::Duration};

use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
};

use crate::config::models::RateLimitConfig;

/// Replenish horizon used when refill is disabled. A full bucket takes this
/// long to come back, which outlives any process.
const NO_REFILL_HORIZON: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Shared token bucket. Wrap it in an `Arc` and hand it to the pipeline builder.
pub struct TokenBucket<C: Clock = DefaultClock> {
    // `None` when the capacity is zero: every request is denied
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<C::Instant>>>,
    capacity: u32,
    refill_per_second: f64,
}

impl TokenBucket {
    /// Create a full bucket on the system clock.
    ///
    /// A `refill_per_second` of zero yields a bucket that admits exactly
    /// `capacity` requests over its lifetime.
    pub fn new(capacity: u32, refill_per_second: f64) -> Self {
        Self::with_clock(capacity, refill_per_second, DefaultClock::default())
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.capacity, config.refill_per_second)
    }
}

impl<C: Clock> TokenBucket<C> {
    /// Create a full bucket reading time from `clock`.
    pub fn with_clock(capacity: u32, refill_per_second: f64, clock: C) -> Self {
        let refill_per_second = if refill_per_second.is_finite() {
            refill_per_second.max(0.0)
        } else {
            0.0
        };

        tracing::info!(
            "Creating token bucket: capacity={}, refill_per_second={}",
            capacity,
            refill_per_second
        );

        let limiter = NonZeroU32::new(capacity)
            .and_then(|burst| quota(burst, refill_per_second))
            .map(|quota| RateLimiter::direct_with_clock(quota, clock));

        Self {
            limiter,
            capacity,
            refill_per_second,
        }
    }

    /// Try to take one token. Returns `false` when the bucket is empty.
    pub fn allow(&self) -> bool {
        self.limiter
            .as_ref()
            .is_some_and(|limiter| limiter.check().is_ok())
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_per_second(&self) -> f64 {
        self.refill_per_second
    }
}

impl<C: Clock> std::fmt::Debug for TokenBucket<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("refill_per_second", &self.refill_per_second)
            .finish()
    }
}

/// GCRA quota admitting a burst of `burst` cells, then one cell per
/// `1 / refill_per_second` seconds.
fn quota(burst: NonZeroU32, refill_per_second: f64) -> Option<Quota> {
    // the whole burst must replenish within the horizon to stay in range
    let longest = NO_REFILL_HORIZON / burst.get();
    let period = if refill_per_second > 0.0 {
        Duration::try_from_secs_f64(1.0 / refill_per_second)
            .map_or(longest, |period| period.min(longest))
    } else {
        longest
    };

    Quota::with_period(period.max(Duration::from_nanos(1))).map(|quota| quota.allow_burst(burst))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use governor::clock::FakeRelativeClock;

    use super::*;

    fn fake_bucket(
        capacity: u32,
        refill_per_second: f64,
    ) -> (TokenBucket<FakeRelativeClock>, FakeRelativeClock) {
        let clock = FakeRelativeClock::default();
        let bucket = TokenBucket::with_clock(capacity, refill_per_second, clock.clone());
        (bucket, clock)
    }

    #[test]
    fn burst_of_capacity_then_reject_without_refill() {
        let (bucket, clock) = fake_bucket(5, 0.0);

        for _ in 0..5 {
            assert!(bucket.allow());
        }
        assert!(!bucket.allow());

        clock.advance(Duration::from_secs(3600));
        assert!(!bucket.allow());
    }

    #[test]
    fn refill_admits_after_one_interval() {
        let (bucket, clock) = fake_bucket(3, 2.0);

        for _ in 0..3 {
            assert!(bucket.allow());
        }
        assert!(!bucket.allow());

        // one token every 500ms
        clock.advance(Duration::from_millis(500));
        assert!(bucket.allow());
        assert!(!bucket.allow());
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let (bucket, clock) = fake_bucket(2, 100.0);

        assert!(bucket.allow());
        clock.advance(Duration::from_secs(60));
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(!bucket.allow());
    }

    #[test]
    fn zero_capacity_denies_everything() {
        let (bucket, clock) = fake_bucket(0, 10.0);
        assert!(!bucket.allow());

        clock.advance(Duration::from_secs(60));
        assert!(!bucket.allow());
    }

    #[test]
    fn negative_or_nan_refill_is_treated_as_zero() {
        assert_eq!(TokenBucket::new(1, -4.0).refill_per_second(), 0.0);
        assert_eq!(TokenBucket::new(1, f64::NAN).refill_per_second(), 0.0);
    }

    #[test]
    fn tiny_refill_rate_falls_back_to_horizon() {
        let (bucket, clock) = fake_bucket(1, 1e-300);
        assert!(bucket.allow());

        clock.advance(Duration::from_secs(3600));
        assert!(!bucket.allow());
    }

    #[test]
    fn concurrent_admissions_never_exceed_capacity() {
        let (bucket, _clock) = fake_bucket(100, 0.0);
        let bucket = Arc::new(bucket);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bucket = bucket.clone();
                std::thread::spawn(move || (0..50).filter(|_| bucket.allow()).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
        assert!(!bucket.allow());
    }

    #[test]
    fn default_configuration_admits_large_burst() {
        let bucket = TokenBucket::from_config(&RateLimitConfig::default());
        assert_eq!(bucket.capacity(), 100_000);
        for _ in 0..1000 {
            assert!(bucket.allow());
        }
    }
}
