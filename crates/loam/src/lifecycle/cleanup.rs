//! Cleanup: rewriting a single segment to drop entries that newer
//! segments have tombstoned or shadowed.
//!
//! Cleanup applies to replace-strategy groups. A per-segment marker
//! (the id of the newest segment at the last completed pass) keeps the
//! cleaner from rescanning a segment until something newer has appeared
//! above it. The scan honors the cycle manager's abort flag between
//! keys; an aborted pass leaves the original segment untouched. A crash
//! after the rewrite started leaves a single-id `segment-<id>.db.tmp`,
//! which the recovery scan deletes.

use crate::error::{LsmError, Result};
use crate::group::layout::{self, fsync_dir};
use crate::group::{make_exists_on_lower, GroupInner};
use crate::lifecycle::cycle::AbortFlag;
use crate::segment::format::RecordPayload;
use crate::segment::{Segment, SegmentWriter, Strategy};
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Default)]
struct CleanerState {
    /// Segment id -> id of the newest segment at the last completed
    /// pass over it. In-memory only; a restart merely costs one
    /// redundant scan per segment.
    markers: HashMap<String, String>,
    last_run: Option<Instant>,
}

/// Bookkeeping for the cleanup side of the maintenance loop.
pub(crate) struct SegmentCleaner {
    interval: Duration,
    state: Mutex<CleanerState>,
}

impl SegmentCleaner {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(CleanerState::default()),
        }
    }

    /// Rate gate: true at most once per configured interval.
    fn due(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(last_run) = state.last_run {
            if last_run.elapsed() < self.interval {
                return false;
            }
        }
        state.last_run = Some(Instant::now());
        true
    }

    fn marker(&self, segment_id: &str) -> Option<String> {
        let state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        state.markers.get(segment_id).cloned()
    }

    fn set_marker(&self, segment_id: String, newest_id: String) {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        state.markers.insert(segment_id, newest_id);
    }
}

struct CleanupCandidate {
    index: usize,
    segment: Arc<Segment>,
    segment_id: String,
    /// Segments newer than the candidate; they decide shadowing.
    above: Vec<Arc<Segment>>,
    /// Frozen snapshot below the candidate for `exists_on_lower`.
    lower: Vec<Arc<Segment>>,
    newest_id: String,
}

impl GroupInner {
    /// Rewrites one segment whose entries may have been shadowed since
    /// its last pass. Returns false when nothing is due.
    pub(crate) fn cleanup_once(&self, abort: &AbortFlag) -> Result<bool> {
        if self.is_read_only() {
            return Ok(false);
        }
        if self.strategy != Strategy::Replace {
            return Ok(false);
        }
        if !self.cleaner.due() {
            return Ok(false);
        }

        // A candidate that turns out to need no rewrite is marked and
        // the next one is tried within the same pass.
        while let Some(candidate) = self.select_cleanup_candidate() {
            if self.cleanup_segment(candidate, abort)? {
                return Ok(true);
            }
            if abort.load(Ordering::Relaxed) {
                break;
            }
        }
        Ok(false)
    }

    /// Rewrites one candidate. Returns false when the segment had
    /// nothing to drop (the marker is advanced) or the pass aborted.
    fn cleanup_segment(&self, candidate: CleanupCandidate, abort: &AbortFlag) -> Result<bool> {
        let purge_tombstones = candidate.index == 0 && !self.keep_tombstones;

        // Scan without holding any lock; the snapshot handles stay valid
        // through their Arcs even if the stack changes meanwhile.
        let mut kept = Vec::new();
        let mut dropped = 0usize;
        for entry in candidate.segment.entries()? {
            if abort.load(Ordering::Relaxed) {
                debug!(
                    "cleanup of {:?} cancelled, original left untouched",
                    candidate.segment.path()
                );
                return Ok(false);
            }

            if shadowed_by_newer(&candidate.above, &entry.key)? {
                dropped += 1;
                continue;
            }
            if purge_tombstones {
                if let RecordPayload::Replace { tombstone: true, .. } = entry.payload {
                    dropped += 1;
                    continue;
                }
            }
            kept.push(entry);
        }

        if dropped == 0 {
            self.cleaner
                .set_marker(candidate.segment_id, candidate.newest_id);
            return Ok(false);
        }

        let tmp_path = self
            .dir
            .join(layout::cleanup_tmp_file_name(&candidate.segment_id));
        let mut writer = SegmentWriter::create(
            &tmp_path,
            self.strategy,
            candidate.segment.secondary_count(),
            self.use_bloom_filter,
        )?;
        for entry in kept {
            writer.push(&entry.key, entry.secondaries, &entry.payload)?;
        }
        writer.finish()?;

        let exists = self
            .calc_count_net_additions
            .then(|| make_exists_on_lower(candidate.lower.clone()));
        let mut new_segment = Segment::open(&tmp_path, &self.open_options(), exists)?;

        // Publication mirrors compaction: O(1) under the write lock.
        {
            let mut guard = self.segments_exclusive();
            let Some(segments) = guard.as_mut() else {
                drop(guard);
                let _ = fs::remove_file(&tmp_path);
                return Ok(false);
            };
            let intact = segments
                .get(candidate.index)
                .is_some_and(|s| Arc::ptr_eq(s, &candidate.segment));
            if !intact {
                drop(guard);
                let _ = fs::remove_file(&tmp_path);
                warn!(
                    "segment stack changed under a pending cleanup in {:?}, discarding output",
                    self.dir
                );
                return Ok(false);
            }

            candidate.segment.close()?;
            new_segment.publish(candidate.segment.path())?;
            segments[candidate.index] = Arc::new(new_segment);
            fsync_dir(&self.dir)?;

            if self.monitor_count {
                let count = segments.iter().map(|s| Segment::count_net_additions(s)).sum();
                self.metrics.observe_object_count(count);
            }
        }

        self.cleaner
            .set_marker(candidate.segment_id, candidate.newest_id);
        self.metrics.inc_cleanups();
        Ok(true)
    }

    /// Picks the oldest segment that has not been cleaned since the
    /// current newest segment appeared. The newest segment itself is
    /// never a candidate: nothing can shadow it.
    fn select_cleanup_candidate(&self) -> Option<CleanupCandidate> {
        let guard = self.segments_shared();
        let segments = guard.as_deref()?;
        if segments.len() < 2 {
            return None;
        }

        let newest_id = layout::segment_id_from_path(segments.last()?.path())?;
        for (index, segment) in segments[..segments.len() - 1].iter().enumerate() {
            let Some(segment_id) = layout::segment_id_from_path(segment.path()) else {
                continue;
            };
            if self.cleaner.marker(&segment_id).as_deref() == Some(newest_id.as_str()) {
                continue;
            }
            return Some(CleanupCandidate {
                index,
                segment: segment.clone(),
                segment_id,
                above: segments[index + 1..].to_vec(),
                lower: segments[..index].to_vec(),
                newest_id,
            });
        }

        None
    }
}

/// True when any newer segment holds the key, as a value or a
/// tombstone; either makes the older entry unreachable.
fn shadowed_by_newer(above: &[Arc<Segment>], key: &[u8]) -> Result<bool> {
    for segment in above.iter().rev() {
        match segment.get(key) {
            Ok(_) => return Ok(true),
            Err(LsmError::NotFound) => continue,
            Err(LsmError::Deleted) => return Ok(true),
            Err(err) => return Err(err),
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentGroupConfig;
    use crate::group::SegmentGroup;
    use crate::lifecycle::cycle::CycleManager;
    use crate::memwatch::UnlimitedChecker;
    use crate::metrics::Metrics;
    use std::path::Path;
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;

    fn test_cycle() -> CycleManager {
        CycleManager::new(Duration::from_secs(3600))
    }

    fn write_replace(dir: &Path, file_name: &str, entries: &[(&[u8], Option<&[u8]>)]) {
        let mut writer =
            SegmentWriter::create(dir.join(file_name), Strategy::Replace, 0, true).unwrap();
        for (key, value) in entries {
            match value {
                Some(value) => writer.push_replace(key, value).unwrap(),
                None => writer.push_tombstone(key).unwrap(),
            }
        }
        writer.finish().unwrap();
    }

    fn open_group(dir: &Path, cycle: &CycleManager) -> SegmentGroup {
        // an unbounded stack would compact instead; a tiny bound forces
        // the tick into cleanup
        let cfg =
            SegmentGroupConfig::new(dir, Strategy::Replace).with_max_segment_size(1);
        SegmentGroup::open(
            cfg,
            Arc::new(Metrics::new()),
            Arc::new(UnlimitedChecker),
            cycle,
        )
        .unwrap()
    }

    #[test]
    fn test_cleanup_drops_shadowed_entries() {
        let temp_dir = TempDir::new().unwrap();
        write_replace(
            temp_dir.path(),
            "segment-01.db",
            &[(b"a", Some(b"old")), (b"b", Some(b"keep"))],
        );
        write_replace(temp_dir.path(), "segment-02.db", &[(b"a", Some(b"new"))]);

        let cycle = test_cycle();
        let group = open_group(temp_dir.path(), &cycle);

        assert!(group.maintenance_tick(&cycle.abort_flag()));

        // the stack still answers identically
        assert_eq!(group.len(), 2);
        assert_eq!(group.get(b"a").unwrap(), Some(b"new".to_vec()));
        assert_eq!(group.get(b"b").unwrap(), Some(b"keep".to_vec()));

        // but the rewritten bottom segment no longer carries the
        // shadowed entry
        let bottom = Segment::open(
            temp_dir.path().join("segment-01.db"),
            &crate::segment::SegmentOpenOptions {
                mmap_contents: false,
                use_bloom_filter: false,
                calc_count_net_additions: false,
            },
            None,
        )
        .unwrap();
        assert_eq!(bottom.num_keys(), 1);
        cycle.stop();
    }

    #[test]
    fn test_cleanup_purges_bottom_tombstones() {
        let temp_dir = TempDir::new().unwrap();
        write_replace(
            temp_dir.path(),
            "segment-01.db",
            &[(b"dead", None), (b"live", Some(b"v"))],
        );
        write_replace(temp_dir.path(), "segment-02.db", &[(b"other", Some(b"x"))]);

        let cycle = test_cycle();
        let group = open_group(temp_dir.path(), &cycle);

        assert!(group.maintenance_tick(&cycle.abort_flag()));
        assert!(matches!(
            group.get_err_deleted(b"dead"),
            Err(LsmError::NotFound)
        ));
        assert_eq!(group.get(b"live").unwrap(), Some(b"v".to_vec()));
        cycle.stop();
    }

    #[test]
    fn test_cleanup_is_idle_until_new_segments_appear() {
        let temp_dir = TempDir::new().unwrap();
        write_replace(temp_dir.path(), "segment-01.db", &[(b"a", Some(b"old"))]);
        write_replace(temp_dir.path(), "segment-02.db", &[(b"a", Some(b"new"))]);

        let cycle = test_cycle();
        let group = open_group(temp_dir.path(), &cycle);
        let abort = cycle.abort_flag();

        assert!(group.maintenance_tick(&abort));
        // everything is clean and marked now
        assert!(!group.maintenance_tick(&abort));

        // a newer segment shadows the middle one again
        write_replace(temp_dir.path(), "segment-03.db", &[(b"a", Some(b"newest"))]);
        group.append(temp_dir.path().join("segment-03.db")).unwrap();
        assert!(group.maintenance_tick(&abort));
        assert_eq!(group.get(b"a").unwrap(), Some(b"newest".to_vec()));
        cycle.stop();
    }

    #[test]
    fn test_abort_leaves_original_untouched() {
        let temp_dir = TempDir::new().unwrap();
        write_replace(temp_dir.path(), "segment-01.db", &[(b"a", Some(b"old"))]);
        write_replace(temp_dir.path(), "segment-02.db", &[(b"a", Some(b"new"))]);

        let cycle = test_cycle();
        let group = open_group(temp_dir.path(), &cycle);

        let abort: AbortFlag = Arc::new(AtomicBool::new(true));
        assert!(!group.maintenance_tick(&abort));

        let bottom = Segment::open(
            temp_dir.path().join("segment-01.db"),
            &crate::segment::SegmentOpenOptions {
                mmap_contents: false,
                use_bloom_filter: false,
                calc_count_net_additions: false,
            },
            None,
        )
        .unwrap();
        assert_eq!(bottom.num_keys(), 1);
        assert_eq!(bottom.get(b"a").unwrap(), b"old");
        cycle.stop();
    }

    #[test]
    fn test_cleanup_interval_gates_passes() {
        let temp_dir = TempDir::new().unwrap();
        write_replace(temp_dir.path(), "segment-01.db", &[(b"a", Some(b"old"))]);
        write_replace(temp_dir.path(), "segment-02.db", &[(b"a", Some(b"new"))]);

        let cycle = test_cycle();
        let cfg = SegmentGroupConfig::new(temp_dir.path(), Strategy::Replace)
            .with_max_segment_size(1)
            .with_cleanup_interval(Duration::from_secs(3600));
        let group = SegmentGroup::open(
            cfg,
            Arc::new(Metrics::new()),
            Arc::new(UnlimitedChecker),
            &cycle,
        )
        .unwrap();
        let abort = cycle.abort_flag();

        // first call consumes the interval budget
        assert!(group.maintenance_tick(&abort));
        // immediately afterwards the gate holds even though segment-02
        // is itself never cleaned
        assert!(!group.maintenance_tick(&abort));
        cycle.stop();
    }

    #[test]
    fn test_collection_groups_skip_cleanup() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::create(
            temp_dir.path().join("segment-01.db"),
            Strategy::SetCollection,
            0,
            true,
        )
        .unwrap();
        writer
            .push(
                b"k",
                vec![],
                &RecordPayload::Collection(vec![crate::segment::SegmentValue {
                    value: b"v".to_vec(),
                    tombstone: false,
                }]),
            )
            .unwrap();
        writer.finish().unwrap();

        let cycle = test_cycle();
        let cfg = SegmentGroupConfig::new(temp_dir.path(), Strategy::SetCollection)
            .with_max_segment_size(1);
        let group = SegmentGroup::open(
            cfg,
            Arc::new(Metrics::new()),
            Arc::new(UnlimitedChecker),
            &cycle,
        )
        .unwrap();

        assert!(!group.maintenance_tick(&cycle.abort_flag()));
        cycle.stop();
    }
}
