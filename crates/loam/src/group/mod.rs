//! The segment group: ordered stack of on-disk segments for one bucket.
//!
//! The stack is monotone in recency (index `i` is older than `i + 1`).
//! Readers take the maintenance lock shared for the full duration of a
//! lookup; `append`, shutdown, and the publication moments of compaction
//! and cleanup take it exclusively, always for O(1) work. A separate
//! flush-vs-compact mutex serializes the narrow windows in which an
//! incoming flush and a finishing compaction both want to mutate the
//! directory.

pub mod layout;
mod recovery;

use crate::config::SegmentGroupConfig;
use crate::error::{LsmError, Result};
use crate::lifecycle::cleanup::SegmentCleaner;
use crate::lifecycle::cycle::{AbortFlag, CycleCallbackCtrl, CycleManager};
use crate::memwatch::AllocChecker;
use crate::metrics::Metrics;
use crate::segment::{
    BitmapLayer, ExistsOnLower, Segment, SegmentOpenOptions, SegmentValue, Strategy,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};
use tracing::debug;

/// Externally visible state of a segment group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    /// Reads and writes are served.
    #[default]
    ReadWrite,
    /// Reads are served; maintenance and writes are paused.
    ReadOnly,
}

/// Readers that wait longer than this for the maintenance lock are
/// logged at debug level. Observability only.
const READ_LOCK_WARN_THRESHOLD: Duration = Duration::from_millis(100);

/// The ordered stack of immutable segments for a single bucket, plus
/// the machinery that maintains it.
///
/// Created by [`SegmentGroup::open`], which runs the crash-recovery
/// directory scan; mutated only by [`SegmentGroup::append`], compaction
/// publication, and cleanup publication; destroyed by
/// [`SegmentGroup::shutdown`].
pub struct SegmentGroup {
    inner: Arc<GroupInner>,
    cycle_ctrl: CycleCallbackCtrl,
}

impl std::fmt::Debug for SegmentGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentGroup").finish_non_exhaustive()
    }
}

pub(crate) struct GroupInner {
    /// `None` once the group has shut down, so a late flush fails
    /// loudly instead of touching a dead stack.
    pub(crate) segments: RwLock<Option<Vec<Arc<Segment>>>>,
    pub(crate) dir: PathBuf,
    pub(crate) strategy: Strategy,
    pub(crate) flush_vs_compact: Mutex<()>,
    status: Mutex<Status>,
    pub(crate) map_requires_sorting: bool,
    pub(crate) monitor_count: bool,
    pub(crate) mmap_contents: bool,
    pub(crate) keep_tombstones: bool,
    pub(crate) use_bloom_filter: bool,
    pub(crate) calc_count_net_additions: bool,
    pub(crate) compact_leftover_segments: bool,
    pub(crate) max_segment_size: u64,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) alloc_checker: Arc<dyn AllocChecker>,
    pub(crate) cleaner: SegmentCleaner,
    pub(crate) timings: Mutex<MaintenanceTimings>,
}

pub(crate) struct MaintenanceTimings {
    pub(crate) last_compaction: Instant,
    pub(crate) last_cleanup: Instant,
}

impl SegmentGroup {
    /// Recovers the segment sequence from `cfg.dir` and registers the
    /// group's maintenance callback with the cycle manager.
    pub fn open(
        cfg: SegmentGroupConfig,
        metrics: Arc<Metrics>,
        alloc_checker: Arc<dyn AllocChecker>,
        cycle: &CycleManager,
    ) -> Result<Self> {
        let segments = recovery::recover_segments(&cfg)?;
        let now = Instant::now();

        let inner = Arc::new(GroupInner {
            segments: RwLock::new(Some(segments)),
            dir: cfg.dir.clone(),
            strategy: cfg.strategy,
            flush_vs_compact: Mutex::new(()),
            status: Mutex::new(Status::ReadWrite),
            map_requires_sorting: cfg.map_requires_sorting,
            monitor_count: cfg.monitor_count,
            mmap_contents: cfg.mmap_contents,
            keep_tombstones: cfg.keep_tombstones,
            use_bloom_filter: cfg.use_bloom_filter,
            calc_count_net_additions: cfg.calc_count_net_additions,
            compact_leftover_segments: cfg.force_compaction,
            max_segment_size: cfg.max_segment_size,
            metrics,
            alloc_checker,
            cleaner: SegmentCleaner::new(cfg.cleanup_interval),
            timings: Mutex::new(MaintenanceTimings {
                last_compaction: now,
                last_cleanup: now,
            }),
        });

        if inner.monitor_count {
            inner.metrics.observe_object_count(inner.count());
        }

        let id = format!("segmentgroup/maintenance/{}", cfg.dir.display());
        let weak = Arc::downgrade(&inner);
        let cycle_ctrl = cycle.register(
            id,
            Box::new(move |abort| match weak.upgrade() {
                Some(inner) => inner.maintenance_tick(abort),
                None => false,
            }),
        );

        Ok(Self { inner, cycle_ctrl })
    }

    /// Returns the directory the group is bound to.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Returns the group's read strategy.
    pub fn strategy(&self) -> Strategy {
        self.inner.strategy
    }

    /// Looks up a key under the replace strategy, newest segment first.
    ///
    /// Returns `None` both when the key never existed and when its most
    /// recent record is a tombstone; use [`SegmentGroup::get_err_deleted`]
    /// to tell the two apart.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let guard = self.inner.segments_shared();
        let segments = guard.as_deref().ok_or(LsmError::ShutDown)?;
        Ok(replace_lookup(segments, key))
    }

    /// As [`SegmentGroup::get`], but surfaces `LsmError::Deleted` when
    /// the newest record is a tombstone and `LsmError::NotFound` when no
    /// segment holds the key.
    pub fn get_err_deleted(&self, key: &[u8]) -> Result<Vec<u8>> {
        let guard = self.inner.segments_shared();
        let segments = guard.as_deref().ok_or(LsmError::ShutDown)?;

        for segment in segments.iter().rev() {
            match segment.get(key) {
                Ok(value) => return Ok(value),
                Err(LsmError::NotFound) => continue,
                Err(LsmError::Deleted) => return Err(LsmError::Deleted),
                Err(err) => panic!("unsupported error in segment group get: {err}"),
            }
        }

        Err(LsmError::NotFound)
    }

    /// Looks up a key through the secondary index at `pos`, newest
    /// segment first. The value is written into `buf`; the stable
    /// primary key is returned.
    pub fn get_by_secondary(
        &self,
        pos: usize,
        key: &[u8],
        buf: &mut Vec<u8>,
    ) -> Result<Option<Vec<u8>>> {
        let guard = self.inner.segments_shared();
        let segments = guard.as_deref().ok_or(LsmError::ShutDown)?;

        for segment in segments.iter().rev() {
            match segment.get_by_secondary(pos, key, buf) {
                Ok(primary) => return Ok(Some(primary)),
                Err(LsmError::NotFound) => continue,
                Err(LsmError::Deleted) => return Ok(None),
                Err(err @ LsmError::SecondaryIndexOutOfRange(_)) => return Err(err),
                Err(err) => panic!("unsupported error in segment group get: {err}"),
            }
        }

        Ok(None)
    }

    /// Concatenates the values stored for a key across all segments,
    /// oldest first.
    pub fn get_collection(&self, key: &[u8]) -> Result<Vec<SegmentValue>> {
        let guard = self.inner.segments_shared();
        let segments = guard.as_deref().ok_or(LsmError::ShutDown)?;

        let mut out: Vec<SegmentValue> = Vec::new();
        for segment in segments {
            match segment.get_collection(key) {
                Ok(values) => out.extend(values),
                Err(LsmError::NotFound) => continue,
                Err(err) => return Err(err),
            }
        }

        if self.inner.strategy == Strategy::MapCollection && self.inner.map_requires_sorting {
            // disk state written before map sorting was guaranteed
            out.sort_by(|a, b| {
                crate::segment::format::map_pair_key(&a.value)
                    .cmp(&crate::segment::format::map_pair_key(&b.value))
            });
        }

        Ok(out)
    }

    /// As [`SegmentGroup::get_collection`], but returns the per-layer
    /// values alongside the segments that produced them. Inverted
    /// segments are included even when they hold nothing for the key,
    /// since callers need their tombstones.
    pub fn get_collection_and_segments(
        &self,
        key: &[u8],
    ) -> Result<(Vec<Vec<SegmentValue>>, Vec<Arc<Segment>>)> {
        let guard = self.inner.segments_shared();
        let segments = guard.as_deref().ok_or(LsmError::ShutDown)?;

        let mut out = Vec::new();
        let mut used = Vec::new();
        for segment in segments {
            match segment.get_collection(key) {
                Ok(values) => {
                    out.push(values);
                    used.push(segment.clone());
                }
                Err(LsmError::NotFound) => {
                    if segment.strategy() == Strategy::Inverted {
                        out.push(Vec::new());
                        used.push(segment.clone());
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Ok((out, used))
    }

    /// Returns one bitmap layer per segment holding the key, oldest
    /// first, for the caller to merge.
    pub fn roaring_set_get(&self, key: &[u8]) -> Result<Vec<BitmapLayer>> {
        let guard = self.inner.segments_shared();
        let segments = guard.as_deref().ok_or(LsmError::ShutDown)?;

        let mut out = Vec::new();
        for segment in segments {
            match segment.roaring_set_get(key) {
                Ok(layer) => out.push(layer),
                Err(LsmError::NotFound) => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(out)
    }

    /// Opens the segment file at `path` and pushes it as the newest
    /// element. Called by the flusher once the file is fully written and
    /// its WAL removed.
    pub fn append(&self, path: impl AsRef<Path>) -> Result<()> {
        self.inner.append(path.as_ref())
    }

    /// Pushes an already-open segment as the newest element.
    pub fn append_initialized(&self, segment: Segment) -> Result<()> {
        let mut guard = self.inner.segments_exclusive();
        let segments = guard.as_mut().ok_or(LsmError::ShutDown)?;
        segments.push(Arc::new(segment));
        Ok(())
    }

    /// Sums `count_net_additions` across the stack. Zero after shutdown.
    pub fn count(&self) -> i64 {
        self.inner.count()
    }

    /// Number of segments in the stack. Zero after shutdown.
    pub fn len(&self) -> usize {
        let guard = self.inner.segments_shared();
        guard.as_deref().map(<[_]>::len).unwrap_or(0)
    }

    /// True when the stack holds no segments.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Toggles the read-only flag.
    pub fn update_status(&self, status: Status) {
        let mut guard = self
            .inner
            .status
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        *guard = status;
    }

    /// True when the group is read-only.
    pub fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    /// Runs one maintenance invocation: per-segment observability, then
    /// compaction or cleanup per the fairness policy. Returns true when
    /// work was done. Normally driven by the cycle manager.
    pub fn maintenance_tick(&self, abort: &AbortFlag) -> bool {
        self.inner.maintenance_tick(abort)
    }

    /// Shuts the group down: unregisters the maintenance callback
    /// (bounded by `deadline`), then closes every segment and releases
    /// the sequence.
    ///
    /// The callback must be unregistered before the write lock is taken:
    /// a maintenance pass holding the read lock while staging I/O would
    /// otherwise deadlock against shutdown. A deadline expiring during
    /// unregistration yields `LsmError::ShutdownTimedOut`.
    pub fn shutdown(&self, deadline: Duration) -> Result<()> {
        self.cycle_ctrl.unregister(deadline)?;

        let mut guard = self.inner.segments_exclusive();
        let Some(mut segments) = guard.take() else {
            return Ok(());
        };

        while !segments.is_empty() {
            if let Err(err) = segments[0].close() {
                // keep the unclosed remainder owned; the closed prefix is
                // already gone
                *guard = Some(segments);
                return Err(err);
            }
            segments.remove(0);
        }

        Ok(())
    }
}

impl GroupInner {
    pub(crate) fn segments_shared(
        &self,
    ) -> RwLockReadGuard<'_, Option<Vec<Arc<Segment>>>> {
        let before = Instant::now();
        let guard = self.segments.read().unwrap_or_else(|err| err.into_inner());
        if before.elapsed() > READ_LOCK_WARN_THRESHOLD {
            debug!(
                "waited {:?} to obtain the maintenance lock for a segment group read",
                before.elapsed()
            );
        }
        guard
    }

    pub(crate) fn segments_exclusive(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, Option<Vec<Arc<Segment>>>> {
        self.segments.write().unwrap_or_else(|err| err.into_inner())
    }

    pub(crate) fn open_options(&self) -> SegmentOpenOptions {
        SegmentOpenOptions {
            mmap_contents: self.mmap_contents,
            use_bloom_filter: self.use_bloom_filter,
            calc_count_net_additions: self.calc_count_net_additions,
        }
    }

    fn append(&self, path: &Path) -> Result<()> {
        // Same acquisition order as compaction publication.
        let _flush_guard = self
            .flush_vs_compact
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        let mut guard = self.segments_exclusive();
        let segments = guard.as_mut().ok_or(LsmError::ShutDown)?;

        let exists = self
            .calc_count_net_additions
            .then(|| make_exists_on_lower(segments.clone()));
        let segment = Segment::open(path, &self.open_options(), exists)?;
        segments.push(Arc::new(segment));

        if self.monitor_count {
            let count = segments.iter().map(|s| Segment::count_net_additions(s)).sum();
            self.metrics.observe_object_count(count);
        }

        Ok(())
    }

    pub(crate) fn count(&self) -> i64 {
        let guard = self.segments_shared();
        guard
            .as_deref()
            .map(|segments| segments.iter().map(|s| Segment::count_net_additions(s)).sum())
            .unwrap_or(0)
    }

    pub(crate) fn is_read_only(&self) -> bool {
        let guard = self.status.lock().unwrap_or_else(|err| err.into_inner());
        *guard == Status::ReadOnly
    }
}

/// Replace-strategy walk, newest segment first. The first segment
/// holding the key decides: a value wins, a tombstone masks everything
/// older. Unknown segment errors violate the group's contract and abort
/// the program rather than let a read return the wrong layer.
fn replace_lookup(segments: &[Arc<Segment>], key: &[u8]) -> Option<Vec<u8>> {
    for segment in segments.iter().rev() {
        match segment.get(key) {
            Ok(value) => return Some(value),
            Err(LsmError::NotFound) => continue,
            Err(LsmError::Deleted) => return None,
            Err(err) => panic!("unsupported error in segment group get: {err}"),
        }
    }

    None
}

/// Builds the `exists_on_lower` capability for a segment about to sit
/// on top of `lower`. The snapshot is frozen: the closure owns clones of
/// the handles and never reaches back into the group, so there is no
/// lock re-entry and no ownership cycle.
pub(crate) fn make_exists_on_lower(lower: Vec<Arc<Segment>>) -> ExistsOnLower {
    Box::new(move |key| {
        for segment in lower.iter().rev() {
            match segment.get(key) {
                Ok(_) => return Ok(true),
                Err(LsmError::NotFound) => continue,
                Err(LsmError::Deleted) => return Ok(false),
                Err(err) => return Err(err),
            }
        }
        Ok(false)
    })
}
