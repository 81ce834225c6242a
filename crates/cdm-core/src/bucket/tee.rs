use std::sync::Arc;
use std::time::Instant;

use super::ByteBucket;

/// Composite admission over several buckets: a grant is the minimum any
/// component can give, and every component is charged the same amount.
#[derive(Debug, Clone)]
pub struct ByteBucketTee {
    /// Sorted by bucket id, deduplicated. Locks are always taken in this order.
    buckets: Vec<Arc<ByteBucket>>,
}

impl ByteBucketTee {
    pub fn new(buckets: impl IntoIterator<Item = Arc<ByteBucket>>) -> Self {
        let mut buckets: Vec<Arc<ByteBucket>> = buckets.into_iter().collect();
        buckets.sort_by_key(|b| b.id());
        buckets.dedup_by_key(|b| b.id());
        Self { buckets }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn request_bytes(&self, requested: u64) -> u64 {
        self.request_bytes_at(requested, Instant::now())
    }

    /// Grant up to `requested` bytes across all components at once.
    pub fn request_bytes_at(&self, requested: u64, now: Instant) -> u64 {
        let mut guards: Vec<_> = self.buckets.iter().map(|b| b.lock()).collect();
        let granted = guards
            .iter_mut()
            .fold(requested, |acc, st| acc.min(st.grantable(acc, now)));
        for st in guards.iter_mut() {
            st.charge(granted);
        }
        granted
    }
}
