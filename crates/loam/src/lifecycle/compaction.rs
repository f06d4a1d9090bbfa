//! Compaction: merging two adjacent segments into one.
//!
//! The expensive merge runs without holding any lock and writes its
//! output to `segment-<left>_<right>.db.tmp`. Publication then takes the
//! flush-vs-compact mutex and the maintenance write lock only around the
//! rename, the slot splice, and the directory fsync, so readers observe
//! either both inputs or the single output, never anything in between.

use crate::error::{LsmError, Result};
use crate::group::layout::{self, fsync_dir};
use crate::group::{make_exists_on_lower, GroupInner};
use crate::segment::format::{map_pair_key, RecordPayload};
use crate::segment::{Segment, SegmentWriter, Strategy};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

struct CompactionCandidate {
    left_index: usize,
    left: Arc<Segment>,
    right: Arc<Segment>,
    /// Frozen snapshot of the segments strictly below the pair, for the
    /// output's `exists_on_lower` capability.
    lower: Vec<Arc<Segment>>,
}

impl GroupInner {
    /// Compacts one eligible adjacent pair. Returns false when nothing
    /// is eligible, the group is read-only, or the memory oracle defers
    /// the pass.
    pub(crate) fn compact_once(&self) -> Result<bool> {
        if self.is_read_only() {
            return Ok(false);
        }
        let Some(candidate) = self.select_compaction_pair() else {
            return Ok(false);
        };

        let estimate = candidate.left.size_bytes() + candidate.right.size_bytes();
        if !self.alloc_checker.can_allocate(estimate) {
            debug!(
                "deferring compaction in {:?}: oracle refused {} bytes",
                self.dir, estimate
            );
            return Ok(false);
        }

        let left_id = segment_id_of(&candidate.left)?;
        let right_id = segment_id_of(&candidate.right)?;
        let tmp_path = self
            .dir
            .join(layout::compaction_tmp_file_name(&left_id, &right_id));
        let right_path = self.dir.join(layout::segment_file_name(&right_id));

        // Tombstones are only provably garbage when nothing older can
        // still hold the key.
        let purge_tombstones = candidate.left_index == 0 && !self.keep_tombstones;
        write_merged(
            &tmp_path,
            &candidate.left,
            &candidate.right,
            self.strategy,
            self.use_bloom_filter,
            purge_tombstones,
        )?;

        let exists = self
            .calc_count_net_additions
            .then(|| make_exists_on_lower(candidate.lower.clone()));
        let mut new_segment = Segment::open(&tmp_path, &self.open_options(), exists)?;

        // Publication.
        let marked = {
            let _flush_guard = self
                .flush_vs_compact
                .lock()
                .unwrap_or_else(|err| err.into_inner());
            let mut guard = self.segments_exclusive();
            let Some(segments) = guard.as_mut() else {
                drop(guard);
                let _ = fs::remove_file(&tmp_path);
                return Ok(false);
            };

            let pair_intact = segments
                .get(candidate.left_index)
                .is_some_and(|s| Arc::ptr_eq(s, &candidate.left))
                && segments
                    .get(candidate.left_index + 1)
                    .is_some_and(|s| Arc::ptr_eq(s, &candidate.right));
            if !pair_intact {
                drop(guard);
                let _ = fs::remove_file(&tmp_path);
                warn!(
                    "segment stack changed under a pending compaction in {:?}, discarding output",
                    self.dir
                );
                return Ok(false);
            }

            candidate.right.close()?;
            candidate.left.close()?;
            // The left input must disappear before the rename: recovery
            // reads a lone right file next to a .tmp as "compaction
            // completed logically", whereas left + merged right with no
            // .tmp would be indistinguishable from two live segments.
            let marked = layout::delete_marker_path(candidate.left.path());
            fs::rename(candidate.left.path(), &marked)?;
            new_segment.publish(&right_path)?;
            segments.splice(
                candidate.left_index..=candidate.left_index + 1,
                [Arc::new(new_segment)],
            );
            fsync_dir(&self.dir)?;

            if self.monitor_count {
                let count = segments.iter().map(|s| Segment::count_net_additions(s)).sum();
                self.metrics.observe_object_count(count);
            }

            marked
        };

        // The marker alone is enough for recovery to finish the job, so
        // the actual removal happens outside the locks and may fail.
        if let Err(err) = fs::remove_file(&marked) {
            warn!("failed to remove delete-marked segment {:?}: {}", marked, err);
        }

        self.metrics.inc_compactions();
        Ok(true)
    }

    /// Picks the oldest adjacent pair whose combined size fits the
    /// bound. When nothing fits and leftover compaction is enabled, the
    /// smallest pair is taken anyway so the stack cannot end with a
    /// permanently unpairable tail.
    fn select_compaction_pair(&self) -> Option<CompactionCandidate> {
        let guard = self.segments_shared();
        let segments = guard.as_deref()?;
        if segments.len() < 2 {
            return None;
        }

        let combined =
            |i: usize| segments[i].size_bytes() + segments[i + 1].size_bytes();

        let mut chosen = (0..segments.len() - 1)
            .find(|&i| self.max_segment_size == 0 || combined(i) <= self.max_segment_size);
        if chosen.is_none() && self.compact_leftover_segments {
            chosen = (0..segments.len() - 1).min_by_key(|&i| combined(i));
        }

        let left_index = chosen?;
        Some(CompactionCandidate {
            left_index,
            left: segments[left_index].clone(),
            right: segments[left_index + 1].clone(),
            lower: segments[..left_index].to_vec(),
        })
    }
}

fn segment_id_of(segment: &Segment) -> Result<String> {
    layout::segment_id_from_path(segment.path()).ok_or_else(|| {
        LsmError::CompactionError(format!(
            "segment path {:?} does not follow the naming scheme",
            segment.path()
        ))
    })
}

/// Merges `left` (older) and `right` (newer) into a new segment file at
/// `tmp_path`.
fn write_merged(
    tmp_path: &Path,
    left: &Segment,
    right: &Segment,
    strategy: Strategy,
    use_bloom: bool,
    purge_tombstones: bool,
) -> Result<()> {
    let secondary_count = left.secondary_count().max(right.secondary_count());

    let mut merged: BTreeMap<Vec<u8>, (Vec<Option<Vec<u8>>>, RecordPayload)> = BTreeMap::new();
    for entry in left.entries()? {
        merged.insert(entry.key, (entry.secondaries, entry.payload));
    }
    for entry in right.entries()? {
        match merged.entry(entry.key) {
            Entry::Vacant(slot) => {
                slot.insert((entry.secondaries, entry.payload));
            }
            Entry::Occupied(mut slot) => {
                let (secondaries, payload) = slot.get_mut();
                merge_payload(payload, entry.payload, strategy)?;
                *secondaries = entry.secondaries;
            }
        }
    }

    let mut writer = SegmentWriter::create(tmp_path, strategy, secondary_count, use_bloom)?;
    for (key, (mut secondaries, payload)) in merged {
        let Some(payload) = finalize_payload(payload, purge_tombstones) else {
            continue;
        };
        secondaries.resize(secondary_count as usize, None);
        writer.push(&key, secondaries, &payload)?;
    }
    writer.finish()?;

    Ok(())
}

/// Folds the newer payload into the older one.
fn merge_payload(
    older: &mut RecordPayload,
    newer: RecordPayload,
    strategy: Strategy,
) -> Result<()> {
    match (older, newer) {
        (old @ RecordPayload::Replace { .. }, new @ RecordPayload::Replace { .. }) => {
            // newest occurrence wins outright
            *old = new;
        }
        (RecordPayload::Collection(old_values), RecordPayload::Collection(new_values)) => {
            for value in new_values {
                match strategy {
                    Strategy::SetCollection => {
                        old_values.retain(|old| old.value != value.value);
                    }
                    Strategy::MapCollection | Strategy::Inverted => {
                        let key = map_pair_key(&value.value).map(<[u8]>::to_vec);
                        old_values.retain(|old| map_pair_key(&old.value) != key.as_deref());
                    }
                    _ => {}
                }
                old_values.push(value);
            }
        }
        (RecordPayload::RoaringSet(old_layer), RecordPayload::RoaringSet(new_layer)) => {
            old_layer.additions =
                (&old_layer.additions - &new_layer.deletions) | &new_layer.additions;
            old_layer.deletions = &old_layer.deletions | &new_layer.deletions;
        }
        _ => {
            return Err(LsmError::CompactionError(
                "mismatched payload kinds for one key".into(),
            ))
        }
    }
    Ok(())
}

/// Applies tombstone purging; `None` drops the key from the output.
fn finalize_payload(payload: RecordPayload, purge_tombstones: bool) -> Option<RecordPayload> {
    match payload {
        RecordPayload::Replace { tombstone, value } => {
            if tombstone && purge_tombstones {
                None
            } else {
                Some(RecordPayload::Replace { value, tombstone })
            }
        }
        RecordPayload::Collection(mut values) => {
            if purge_tombstones {
                values.retain(|value| !value.tombstone);
            }
            if values.is_empty() {
                None
            } else {
                Some(RecordPayload::Collection(values))
            }
        }
        RecordPayload::RoaringSet(mut layer) => {
            if purge_tombstones {
                layer.deletions.clear();
            }
            if layer.additions.is_empty() && layer.deletions.is_empty() {
                None
            } else {
                Some(RecordPayload::RoaringSet(layer))
            }
        }
    }
}
