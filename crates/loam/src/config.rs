//! Configuration for segment groups.

use crate::segment::Strategy;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for a [`crate::group::SegmentGroup`].
///
/// All fields are fixed at construction; the status flag is the only
/// state that can be toggled on a live group.
#[derive(Debug, Clone)]
pub struct SegmentGroupConfig {
    /// Directory containing the segment files.
    pub dir: PathBuf,

    /// Read semantics selector.
    pub strategy: Strategy,

    /// Legacy compatibility: sort map values on read when the on-disk
    /// form may be unsorted.
    pub map_requires_sorting: bool,

    /// Publish the group's net object count to metrics.
    pub monitor_count: bool,

    /// Open segments via memory mapping instead of buffered I/O.
    pub mmap_contents: bool,

    /// Preserve deletion markers through compaction and cleanup.
    pub keep_tombstones: bool,

    /// Enable bloom filters on segments.
    pub use_bloom_filter: bool,

    /// Compute net-addition deltas when a segment is opened.
    pub calc_count_net_additions: bool,

    /// Allow a final compaction pass on pairs that exceed the size bound.
    pub force_compaction: bool,

    /// Upper bound on a compaction output's combined input size, in
    /// bytes. Zero means unbounded.
    pub max_segment_size: u64,

    /// Minimum cadence for cleanup passes. Zero means cleanup is
    /// eligible on every maintenance tick.
    pub cleanup_interval: Duration,
}

impl SegmentGroupConfig {
    /// Creates a configuration with defaults for the given directory and
    /// strategy.
    pub fn new(dir: impl AsRef<Path>, strategy: Strategy) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            strategy,
            map_requires_sorting: false,
            monitor_count: false,
            mmap_contents: false,
            keep_tombstones: false,
            use_bloom_filter: true,
            calc_count_net_additions: false,
            force_compaction: false,
            max_segment_size: 0,
            cleanup_interval: Duration::ZERO,
        }
    }

    /// Sets the compaction size bound.
    pub fn with_max_segment_size(mut self, max_segment_size: u64) -> Self {
        self.max_segment_size = max_segment_size;
        self
    }

    /// Sets the minimum cadence for cleanup passes.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Enables count monitoring together with net-addition calculation.
    pub fn with_monitor_count(mut self) -> Self {
        self.monitor_count = true;
        self.calc_count_net_additions = true;
        self
    }
}
