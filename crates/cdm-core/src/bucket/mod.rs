//! Token-bucket rate limiting.
//!
//! A [`ByteBucket`] refills at `byte_rate` bytes per second of wall-clock time.
//! Chunks never ask one bucket directly: they go through a [`ByteBucketTee`]
//! that charges the download's, the server's and the global bucket together.
//! [`BucketPool`] owns the global bucket and the per-server buckets.

mod pool;
mod tee;

pub use pool::BucketPool;
pub use tee::ByteBucketTee;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// Burst factor for per-download buckets.
pub const DOWNLOAD_BURST: f64 = 1.2;
/// Burst factor for the global and per-server buckets.
pub const SHARED_BURST: f64 = 1.0;

static NEXT_BUCKET_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub(crate) struct BucketState {
    /// Bytes per second; `<= 0` means unlimited.
    byte_rate: i64,
    burst: f64,
    available: f64,
    last_fill: Instant,
    consumed: u64,
}

impl BucketState {
    fn unlimited(&self) -> bool {
        self.byte_rate <= 0
    }

    fn capacity(&self) -> f64 {
        self.byte_rate as f64 * self.burst
    }

    /// Add tokens for the time elapsed since the last fill, capped at capacity.
    fn refill(&mut self, now: Instant) {
        if self.unlimited() {
            self.last_fill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_fill).as_secs_f64();
        if elapsed > 0.0 {
            self.available = (self.available + elapsed * self.byte_rate as f64).min(self.capacity());
            self.last_fill = now;
        }
    }

    pub(crate) fn grantable(&mut self, requested: u64, now: Instant) -> u64 {
        self.refill(now);
        if self.unlimited() {
            return requested;
        }
        requested.min(self.available.max(0.0).floor() as u64)
    }

    pub(crate) fn charge(&mut self, amount: u64) {
        if !self.unlimited() {
            self.available -= amount as f64;
        }
        self.consumed += amount;
    }
}

/// Shared token bucket.
#[derive(Debug)]
pub struct ByteBucket {
    id: u64,
    name: String,
    state: Mutex<BucketState>,
}

impl ByteBucket {
    /// New bucket holding one second worth of tokens.
    pub fn new(byte_rate: i64, burst: f64, name: impl Into<String>) -> Self {
        Self::new_at(byte_rate, burst, name, Instant::now())
    }

    pub fn new_at(byte_rate: i64, burst: f64, name: impl Into<String>, now: Instant) -> Self {
        let byte_rate = crate::config::normalize_rate(byte_rate);
        Self {
            id: NEXT_BUCKET_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            state: Mutex::new(BucketState {
                byte_rate,
                burst: burst.max(1.0),
                available: byte_rate.max(0) as f64,
                last_fill: now,
                consumed: 0,
            }),
        }
    }

    pub fn unlimited(name: impl Into<String>) -> Self {
        Self::new(-1, SHARED_BURST, name)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn byte_rate(&self) -> i64 {
        self.lock().byte_rate
    }

    /// Change the rate. Tokens are reset to one second worth at the new rate.
    pub fn set_byte_rate(&self, byte_rate: i64) {
        let byte_rate = crate::config::normalize_rate(byte_rate);
        let mut st = self.lock();
        if st.byte_rate == byte_rate {
            return;
        }
        st.byte_rate = byte_rate;
        st.available = byte_rate.max(0) as f64;
        st.last_fill = Instant::now();
        tracing::debug!(bucket = %self.name, byte_rate, "bucket rate changed");
    }

    /// Drop accumulated tokens; refilling starts again from now.
    pub fn clear(&self) {
        let mut st = self.lock();
        st.available = 0.0;
        st.last_fill = Instant::now();
    }

    pub fn request_bytes(&self, requested: u64) -> u64 {
        self.request_bytes_at(requested, Instant::now())
    }

    /// Grant up to `requested` bytes at time `now`.
    pub fn request_bytes_at(&self, requested: u64, now: Instant) -> u64 {
        let mut st = self.lock();
        let granted = st.grantable(requested, now);
        st.charge(granted);
        granted
    }

    /// Total bytes this bucket has granted over its lifetime.
    pub fn consumed(&self) -> u64 {
        self.lock().consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unlimited_grants_everything() {
        let b = ByteBucket::new(-1, SHARED_BURST, "t");
        assert_eq!(b.request_bytes(10_000_000), 10_000_000);
        assert_eq!(b.consumed(), 10_000_000);
    }

    #[test]
    fn zero_rate_is_unlimited() {
        let b = ByteBucket::new(0, SHARED_BURST, "t");
        assert_eq!(b.byte_rate(), -1);
        assert_eq!(b.request_bytes(4096), 4096);
    }

    #[test]
    fn limited_bucket_caps_grant_within_window() {
        let t0 = Instant::now();
        let b = ByteBucket::new_at(1000, SHARED_BURST, "t", t0);
        assert_eq!(b.request_bytes_at(600, t0), 600);
        assert_eq!(b.request_bytes_at(600, t0), 400);
        assert_eq!(b.request_bytes_at(600, t0), 0);
    }

    #[test]
    fn refill_follows_elapsed_time() {
        let t0 = Instant::now();
        let b = ByteBucket::new_at(1000, SHARED_BURST, "t", t0);
        assert_eq!(b.request_bytes_at(1000, t0), 1000);
        let half = t0 + Duration::from_millis(500);
        assert_eq!(b.request_bytes_at(1000, half), 500);
        // Long idle periods never exceed the burst capacity.
        let later = half + Duration::from_secs(60);
        assert_eq!(b.request_bytes_at(5000, later), 1000);
    }

    #[test]
    fn burst_allows_slightly_more_after_idle() {
        let t0 = Instant::now();
        let b = ByteBucket::new_at(1000, DOWNLOAD_BURST, "t", t0);
        assert_eq!(b.request_bytes_at(5000, t0 + Duration::from_secs(10)), 1200);
    }

    #[test]
    fn clear_drops_tokens() {
        let t0 = Instant::now();
        let b = ByteBucket::new_at(1000, SHARED_BURST, "t", t0);
        b.clear();
        assert_eq!(b.request_bytes_at(100, t0), 0);
    }

    #[test]
    fn two_requests_in_same_window_share_capacity() {
        let t0 = Instant::now();
        let b = ByteBucket::new_at(1000, SHARED_BURST, "t", t0);
        let a = b.request_bytes_at(1000, t0);
        let c = b.request_bytes_at(1000, t0);
        assert!(a + c <= 1000);
    }
}
