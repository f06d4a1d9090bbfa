//! Observability counters shared by a segment group and its maintenance loop.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counter sink for a segment group.
///
/// All counters are plain atomics so the sink can be shared by reference
/// between the group, its readers, and the maintenance loop without
/// additional locking.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Net object count of the bucket, when count monitoring is on.
    pub object_count: AtomicI64,
    /// Number of segments currently in the group.
    pub segment_count: AtomicU64,
    /// Total bytes across all segment files.
    pub segment_total_bytes: AtomicU64,
    /// Completed compaction passes.
    pub compactions: AtomicU64,
    /// Completed cleanup passes.
    pub cleanups: AtomicU64,
}

impl Metrics {
    /// Creates a sink with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the current net object count.
    pub fn observe_object_count(&self, count: i64) {
        self.object_count.store(count, Ordering::Relaxed);
    }

    /// Records the current segment count and total on-disk size.
    pub fn observe_segments(&self, count: u64, total_bytes: u64) {
        self.segment_count.store(count, Ordering::Relaxed);
        self.segment_total_bytes.store(total_bytes, Ordering::Relaxed);
    }

    /// Counts a completed compaction pass.
    pub fn inc_compactions(&self) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a completed cleanup pass.
    pub fn inc_cleanups(&self) {
        self.cleanups.fetch_add(1, Ordering::Relaxed);
    }
}
