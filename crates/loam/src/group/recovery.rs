//! Startup directory scan materializing the segment sequence.
//!
//! The scan runs exactly once, at group construction, and makes two
//! passes over the directory. Pass 1 resolves compaction artifacts
//! (`segment-<A>_<B>.db.tmp`) before anything else is opened, so pass 2
//! never races a pending rename and never opens a segment that is about
//! to be replaced. Pass 2 mounts regular segments, deleting any `.db`
//! whose WAL sibling still exists: a segment only counts as durable once
//! its WAL has been removed, so such a file is a partial flush that WAL
//! replay will reconstruct.

use crate::config::SegmentGroupConfig;
use crate::error::{LsmError, Result};
use crate::group::layout;
use crate::group::make_exists_on_lower;
use crate::segment::{ExistsOnLower, Segment, SegmentOpenOptions};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Scans `cfg.dir` and returns the recovered sequence, oldest first.
pub(crate) fn recover_segments(cfg: &SegmentGroupConfig) -> Result<Vec<Arc<Segment>>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(&cfg.dir)? {
        let entry = entry?;
        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(name) => warn!("skipping non-UTF-8 file name {:?} in segment directory", name),
        }
    }
    names.sort();

    let full_opts = SegmentOpenOptions {
        mmap_contents: cfg.mmap_contents,
        use_bloom_filter: cfg.use_bloom_filter,
        calc_count_net_additions: cfg.calc_count_net_additions,
    };
    // Segments opened only to be erased need neither bloom filters nor
    // net-addition recalculation.
    let drop_opts = SegmentOpenOptions {
        mmap_contents: cfg.mmap_contents,
        use_bloom_filter: false,
        calc_count_net_additions: false,
    };

    let mut segments: Vec<Arc<Segment>> = Vec::new();
    let mut recovered_from_compaction: HashSet<String> = HashSet::new();

    // Pass 1: compaction artifacts.
    for name in &names {
        let Some(stem) = name.strip_suffix(&format!(".{}", layout::TMP_EXTENSION)) else {
            continue;
        };
        if !stem.ends_with(&format!(".{}", layout::SEGMENT_EXTENSION)) {
            // another kind of transient file, not ours to resolve
            continue;
        }

        let tmp_path = cfg.dir.join(name);
        let Some(ids) = layout::joint_segment_ids(stem) else {
            warn!("ignored unrecognized temporary segment file {}", name);
            continue;
        };

        if ids.len() == 1 {
            // cleanup rewrite that never finished; the original is intact
            fs::remove_file(&tmp_path)?;
            continue;
        }
        if ids.len() != 2 {
            warn!(
                "ignored partially written compacted segment {} produced before the two-id naming scheme",
                name
            );
            continue;
        }

        let left_name = layout::segment_file_name(&ids[0]);
        let right_name = layout::segment_file_name(&ids[1]);
        let left_path = cfg.dir.join(&left_name);
        let right_path = cfg.dir.join(&right_name);

        let left_found = file_exists(&left_path)?;
        let right_found = file_exists(&right_path)?;

        if left_found && right_found {
            // compaction finished writing but never removed its inputs;
            // the tmp is a stale duplicate
            fs::remove_file(&tmp_path)?;
            continue;
        }

        if left_found && !right_found {
            return Err(LsmError::RecoveryFailed(format!(
                "missing right segment {right_name}"
            )));
        }

        if !left_found && right_found {
            // The compaction already completed logically; the published
            // right file belongs to the prior generation and is about to
            // be replaced by the rename below.
            let leftover = Segment::open(&right_path, &drop_opts, None)?;
            leftover.close()?;
            leftover.drop_immediately()?;
            layout::fsync_dir(&cfg.dir)?;
        }

        fs::rename(&tmp_path, &right_path)?;
        let segment = Segment::open(&right_path, &full_opts, exists_for(cfg, &segments))?;
        segments.push(Arc::new(segment));
        recovered_from_compaction.insert(right_name);
    }

    // Pass 2: regular segments.
    for name in &names {
        let path = cfg.dir.join(name);

        if name.ends_with(&format!(".{}", layout::DELETE_MARKER_EXTENSION)) {
            // marked for deletion but never removed; failing again only
            // costs the disk space it should have freed
            if let Err(err) = fs::remove_file(&path) {
                error!(
                    "failed to delete file {} already marked for deletion: {}",
                    name, err
                );
            }
            continue;
        }

        let Some(bare) = name.strip_suffix(&format!(".{}", layout::SEGMENT_EXTENSION)) else {
            // commit logs, WALs, and other siblings
            continue;
        };
        if recovered_from_compaction.contains(name) {
            continue;
        }

        let wal_name = format!("{bare}.{}", layout::WAL_EXTENSION);
        if file_exists(&cfg.dir.join(&wal_name))? {
            fs::remove_file(&path)?;
            info!(
                "discarded partially written segment {}: active WAL {} found, a recovery from the WAL will follow",
                name, wal_name
            );
            continue;
        }

        let segment = Segment::open(&path, &full_opts, exists_for(cfg, &segments))?;
        segments.push(Arc::new(segment));
    }

    // Recency must not depend on which pass materialized a segment: a
    // compaction output recovered in pass 1 can be newer than an
    // untouched segment mounted in pass 2.
    segments.sort_by_key(|segment| {
        segment
            .path()
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default()
    });

    Ok(segments)
}

fn exists_for(cfg: &SegmentGroupConfig, lower: &[Arc<Segment>]) -> Option<ExistsOnLower> {
    cfg.calc_count_net_additions
        .then(|| make_exists_on_lower(lower.to_vec()))
}

fn file_exists(path: &Path) -> Result<bool> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}
