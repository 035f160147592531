//! Token-bucket bandwidth limiter
//!
//! The limiter is cooperative: senders call [`BandwidthLimiter::acquire`]
//! before each write and the call sleeps until enough allowance has
//! accumulated. Nothing is preempted.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    /// Bytes per second, 0 = unlimited
    rate: u64,
    /// Available allowance; negative while a large request is being paid off
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    /// The bucket holds at most one second of allowance
    fn capacity(&self) -> f64 {
        self.rate as f64
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.capacity());
        self.last_refill = now;
    }
}

/// Shared byte-rate limiter
#[derive(Debug)]
pub struct BandwidthLimiter {
    bucket: Mutex<Bucket>,
}

impl BandwidthLimiter {
    /// Create a limiter for `bytes_per_sec` (0 disables limiting).
    ///
    /// The bucket starts full so the first second of data is not delayed.
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                rate: bytes_per_sec,
                tokens: bytes_per_sec as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// A limiter that never waits
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Current rate in bytes/sec (0 = unlimited)
    pub fn rate(&self) -> u64 {
        self.bucket.lock().rate
    }

    /// Change the rate. Accumulated allowance is clamped to the new capacity.
    pub fn set_rate(&self, bytes_per_sec: u64) {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        bucket.rate = bytes_per_sec;
        bucket.tokens = bucket.tokens.min(bucket.capacity());
    }

    /// Wait until `bytes` may be written.
    ///
    /// Requests larger than the bucket are allowed; the bucket goes into
    /// debt and the caller sleeps until the debt is paid off.
    pub async fn acquire(&self, bytes: usize) {
        let wait = {
            let mut bucket = self.bucket.lock();
            if bucket.rate == 0 {
                return;
            }
            bucket.refill(Instant::now());
            bucket.tokens -= bytes as f64;
            if bucket.tokens >= 0.0 {
                Duration::ZERO
            } else {
                Duration::from_secs_f64(-bucket.tokens / bucket.rate as f64)
            }
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

impl Default for BandwidthLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_never_waits() {
        let limiter = BandwidthLimiter::unlimited();
        let start = Instant::now();
        limiter.acquire(10_000_000).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_burst_is_free() {
        let limiter = BandwidthLimiter::new(1000);
        let start = Instant::now();
        limiter.acquire(1000).await;
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_is_enforced() {
        let limiter = BandwidthLimiter::new(1000);
        let start = Instant::now();

        // 1000 from the full bucket, then 2000 more at 1000 B/s
        for _ in 0..6 {
            limiter.acquire(500).await;
        }

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1990), "elapsed {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(2100), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_rate_to_unlimited() {
        let limiter = BandwidthLimiter::new(10);
        limiter.set_rate(0);
        let start = Instant::now();
        limiter.acquire(1_000_000).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.rate(), 0);
    }
}
