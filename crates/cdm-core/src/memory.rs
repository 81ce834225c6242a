//! Process-wide accounting of bytes held in chunk pipelines.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Floor for a chunk's byte request while under pressure.
pub const MIN_PRESSURE_REQUEST: u64 = 256;

/// Counts bytes accepted from the network but not yet on disk. Cloning shares the counter.
#[derive(Debug, Clone)]
pub struct MemoryReporter {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    pending: AtomicU64,
    limit: u64,
}

impl MemoryReporter {
    pub fn new(limit: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: AtomicU64::new(0),
                limit: limit.max(1),
            }),
        }
    }

    pub fn add(&self, bytes: u64) {
        self.inner.pending.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sub(&self, bytes: u64) {
        let _ = self
            .inner
            .pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| {
                Some(p.saturating_sub(bytes))
            });
    }

    pub fn pending_bytes(&self) -> u64 {
        self.inner.pending.load(Ordering::Relaxed)
    }

    /// 0 while pending bytes are within the limit, otherwise `1 + pending / limit`.
    pub fn pressure(&self) -> u64 {
        let pending = self.pending_bytes();
        if pending <= self.inner.limit {
            0
        } else {
            1 + pending / self.inner.limit
        }
    }

    /// Shrink a byte request according to the current pressure.
    pub fn scale_request(&self, requested: u64) -> u64 {
        let pressure = self.pressure();
        if pressure == 0 {
            return requested;
        }
        let scaled = requested.min(MIN_PRESSURE_REQUEST).max(requested / pressure);
        tracing::debug!(
            pending = self.pending_bytes(),
            pressure,
            requested,
            scaled,
            "memory pressure"
        );
        scaled
    }
}

impl Default for MemoryReporter {
    fn default() -> Self {
        Self::new(32 * 1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_pressure_below_limit() {
        let m = MemoryReporter::new(1000);
        m.add(1000);
        assert_eq!(m.pressure(), 0);
        assert_eq!(m.scale_request(5000), 5000);
    }

    #[test]
    fn pressure_scales_requests_with_floor() {
        let m = MemoryReporter::new(1000);
        m.add(3500);
        assert_eq!(m.pressure(), 4);
        assert_eq!(m.scale_request(4000), 1000);
        assert_eq!(m.scale_request(400), 256);
        assert_eq!(m.scale_request(100), 100);
    }

    #[test]
    fn sub_saturates_and_clones_share() {
        let m = MemoryReporter::new(10);
        let m2 = m.clone();
        m.add(5);
        m2.sub(50);
        assert_eq!(m.pending_bytes(), 0);
    }
}
