use serde::{Deserialize, Serialize};

use crate::{Duration, Nanos};

const UNIT_SCALE: u128 = 1_000_000_000;

/// A single leaky bucket: units drain at `rate` units/second, the bucket
/// holds at most `capacity` units.
///
/// Levels are tracked in unit-nanoseconds (units scaled by 1e9) so draining
/// never loses fractional units to integer division. All operations take an
/// explicit `now`; the bucket has no clock of its own.
#[derive(Debug, Clone)]
pub struct LeakyBucket {
    rate: u64,
    capacity: u64,
    level: u128,
    reserved: u128,
    last_update: Nanos,
}

impl LeakyBucket {
    /// `rate` in units/second. A zero rate or capacity is clamped to 1.
    pub fn new(rate: u64, capacity: u64, now: Nanos) -> Self {
        Self {
            rate: rate.max(1),
            capacity: capacity.max(1),
            level: 0,
            reserved: 0,
            last_update: now,
        }
    }

    /// Capacity derived as `rate × window`, the moving-total a sliding
    /// window of that length may not exceed.
    pub fn from_rate_and_window(rate: u64, window: Duration, now: Nanos) -> Self {
        let capacity = (rate as u128 * window.as_nanos() as u128 / UNIT_SCALE) as u64;
        Self::new(rate, capacity, now)
    }

    #[inline]
    pub fn rate(&self) -> u64 {
        self.rate
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bucket level in whole units after draining up to `now`, including
    /// reserved units.
    #[inline]
    pub fn level_units(&self, now: Nanos) -> u64 {
        ((self.projected_level(now) + self.reserved) / UNIT_SCALE) as u64
    }

    fn projected_level(&self, now: Nanos) -> u128 {
        let elapsed = now.saturating_sub(self.last_update);
        let leaked = self.rate as u128 * elapsed.0 as u128;
        self.level.saturating_sub(leaked)
    }

    /// Drains the bucket up to `now`. Time never moves backwards here; an
    /// earlier `now` is ignored.
    pub fn update(&mut self, now: Nanos) {
        if now <= self.last_update {
            return;
        }
        self.level = self.projected_level(now);
        self.last_update = now;
    }

    /// Adds `amount` units. Callers are expected to have consulted
    /// `would_exceed` first; submitting over capacity is allowed and simply
    /// lengthens the drain.
    pub fn submit(&mut self, amount: u64, now: Nanos) {
        self.update(now);
        self.level = self.level.saturating_add(amount as u128 * UNIT_SCALE);
    }

    /// True if the bucket is at or over capacity at `now`, counting
    /// reserved units.
    pub fn would_exceed(&self, now: Nanos) -> bool {
        self.projected_level(now) + self.reserved >= self.capacity as u128 * UNIT_SCALE
    }

    /// Time until a submission is admissible again: zero when under
    /// capacity, otherwise the full drain time of the current level,
    /// rounded up to the next nanosecond.
    pub fn time_to_submit(&self, now: Nanos) -> Nanos {
        let level = self.projected_level(now) + self.reserved;
        if level < self.capacity as u128 * UNIT_SCALE {
            return Nanos::ZERO;
        }
        Nanos(level.div_ceil(self.rate as u128) as u64)
    }

    /// Reserves `amount` units: they consume capacity immediately and stay
    /// consumed until submitted or cancelled.
    pub fn reserve(&mut self, amount: u64, now: Nanos) {
        self.update(now);
        self.reserved = self.reserved.saturating_add(amount as u128 * UNIT_SCALE);
    }

    /// Converts `amount` previously reserved units into submitted units.
    pub fn submit_reserved(&mut self, amount: u64, now: Nanos) {
        let scaled = (amount as u128 * UNIT_SCALE).min(self.reserved);
        self.reserved -= scaled;
        self.update(now);
        self.level = self.level.saturating_add(scaled);
    }

    /// Refunds `amount` previously reserved units.
    pub fn cancel_reserved(&mut self, amount: u64) {
        let scaled = (amount as u128 * UNIT_SCALE).min(self.reserved);
        self.reserved -= scaled;
    }
}

/// Peak + sustained dual-bucket limiter configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Sustained limit in units/second.
    pub sustained_rate: u64,
    /// Window over which the sustained average is enforced.
    pub sustained_window: Duration,
    /// Peak limit in units/second.
    pub peak_rate: u64,
    /// Window over which the peak average is enforced.
    pub peak_window: Duration,
}

/// Enforces both a peak and a sustained rate: submitted units land in two
/// independent leaky buckets and a submission is admissible only while
/// neither bucket is at capacity.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    peak: LeakyBucket,
    sustained: LeakyBucket,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig, now: Nanos) -> Self {
        Self {
            peak: LeakyBucket::from_rate_and_window(config.peak_rate, config.peak_window, now),
            sustained: LeakyBucket::from_rate_and_window(
                config.sustained_rate,
                config.sustained_window,
                now,
            ),
        }
    }

    pub fn submit(&mut self, amount: u64, now: Nanos) {
        self.peak.submit(amount, now);
        self.sustained.submit(amount, now);
    }

    pub fn would_exceed(&self, now: Nanos) -> bool {
        self.peak.would_exceed(now) || self.sustained.would_exceed(now)
    }

    /// Max of the two per-bucket wait times.
    pub fn time_to_submit(&self, now: Nanos) -> Nanos {
        self.peak.time_to_submit(now).max(self.sustained.time_to_submit(now))
    }

    pub fn reserve(&mut self, amount: u64, now: Nanos) {
        self.peak.reserve(amount, now);
        self.sustained.reserve(amount, now);
    }

    pub fn submit_reserved(&mut self, amount: u64, now: Nanos) {
        self.peak.submit_reserved(amount, now);
        self.sustained.submit_reserved(amount, now);
    }

    pub fn cancel_reserved(&mut self, amount: u64) {
        self.peak.cancel_reserved(amount);
        self.sustained.cancel_reserved(amount);
    }

    pub fn peak(&self) -> &LeakyBucket {
        &self.peak
    }

    pub fn sustained(&self) -> &LeakyBucket {
        &self.sustained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_at(now: Nanos) -> RateLimiter {
        RateLimiter::new(
            RateLimiterConfig {
                sustained_rate: 1024,
                sustained_window: Duration::from_secs_f64(0.5),
                peak_rate: 2048,
                peak_window: Duration::from_secs_f64(0.0625),
            },
            now,
        )
    }

    #[test]
    fn capacities_follow_rate_times_window() {
        let limiter = limiter_at(Nanos::ZERO);
        assert_eq!(limiter.peak().capacity(), 128);
        assert_eq!(limiter.sustained().capacity(), 512);
    }

    #[test]
    fn peak_bucket_backoff() {
        let t0 = Nanos::ZERO;
        let mut limiter = limiter_at(t0);

        assert!(!limiter.would_exceed(t0));
        limiter.submit(128, t0);

        assert_eq!(limiter.peak().level_units(t0), 128);
        assert!(limiter.would_exceed(t0));

        // 128 units at 2048/s drain in exactly 1/16 s.
        let wait = limiter.time_to_submit(t0);
        assert_eq!(wait, Nanos(62_500_000));

        let t1 = t0 + wait;
        assert!(!limiter.would_exceed(t1));
        assert_eq!(limiter.time_to_submit(t1), Nanos::ZERO);
    }

    #[test]
    fn sustained_bucket_caps_bursts() {
        let t0 = Nanos::ZERO;
        let mut limiter = limiter_at(t0);

        // Four peak-sized bursts, spaced to clear the peak bucket, still
        // leave the sustained bucket holding units.
        let mut now = t0;
        for _ in 0..4 {
            assert!(!limiter.would_exceed(now));
            limiter.submit(128, now);
            now = now + limiter.peak().time_to_submit(now);
        }
        // Peak is clear, sustained still holds 512 - drained units.
        assert!(limiter.sustained().level_units(now) > 0);
    }

    #[test]
    fn drain_is_exact_under_fractional_steps() {
        let t0 = Nanos::ZERO;
        let mut bucket = LeakyBucket::new(3, 10, t0);
        bucket.submit(10, t0);

        // 10 units at 3/s drain in ceil(10e9/3) ns, not a nanosecond less.
        let wait = bucket.time_to_submit(t0);
        assert_eq!(wait, Nanos(3_333_333_334));
        assert!(bucket.would_exceed(t0));
        assert_eq!(bucket.level_units(t0 + wait), 0);
        assert_eq!(bucket.time_to_submit(t0 + wait), Nanos::ZERO);
    }

    #[test]
    fn reserved_units_consume_capacity() {
        let t0 = Nanos::ZERO;
        let mut bucket = LeakyBucket::new(1000, 100, t0);

        bucket.reserve(100, t0);
        assert!(bucket.would_exceed(t0));

        bucket.cancel_reserved(50);
        assert!(!bucket.would_exceed(t0));

        bucket.submit_reserved(50, t0);
        assert_eq!(bucket.level_units(t0), 50);
        assert!(!bucket.would_exceed(t0));
    }

    #[test]
    fn gated_submissions_respect_average_rate() {
        // Submit 16-unit chunks whenever admissible over one second of
        // simulated time; the admitted average must not exceed the
        // sustained rate plus one chunk of slack.
        let mut limiter = limiter_at(Nanos::ZERO);
        let mut submitted = 0u64;
        let step = Nanos::from_micros(100);
        let mut now = Nanos::ZERO;
        while now < Nanos::from_secs(1) {
            if !limiter.would_exceed(now) {
                limiter.submit(16, now);
                submitted += 16;
            }
            now += step;
        }
        assert!(submitted <= 1024 + 512 + 16, "submitted {submitted}");
    }
}
