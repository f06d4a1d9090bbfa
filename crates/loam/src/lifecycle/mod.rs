//! Maintenance machinery: cycle scheduling, compaction, and cleanup.
//!
//! The cycle manager invokes [`crate::group::SegmentGroup::maintenance_tick`]
//! periodically. Each tick emits observability counters, then runs
//! compaction or cleanup. Compaction normally has precedence; cleanup is
//! forced ahead of it when it has been starved for twelve hours while
//! compactions kept happening, which keeps cleanup live under constant
//! write pressure. Both passes are best-effort: errors are logged and
//! never surfaced to the manager.

pub mod cycle;

pub(crate) mod cleanup;
mod compaction;

pub use cycle::{AbortFlag, CycleCallback, CycleCallbackCtrl, CycleManager};

use crate::group::GroupInner;
use crate::segment::Segment;
use std::time::{Duration, Instant};
use tracing::{error, trace};

/// Cleanup is forced ahead of compaction when it has not run for this
/// long while compactions kept being called.
const FORCE_CLEANUP_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

impl GroupInner {
    /// One maintenance invocation. Returns true when work was done.
    pub(crate) fn maintenance_tick(&self, abort: &AbortFlag) -> bool {
        self.monitor_segments();

        let compact = || {
            {
                let mut timings = self.timings.lock().unwrap_or_else(|err| err.into_inner());
                timings.last_compaction = Instant::now();
            }
            match self.compact_once() {
                Ok(true) => true,
                Ok(false) => {
                    trace!("no segments eligible for compaction in {:?}", self.dir);
                    false
                }
                Err(err) => {
                    error!("compaction failed in {:?}: {}", self.dir, err);
                    false
                }
            }
        };

        let cleanup = || {
            {
                let mut timings = self.timings.lock().unwrap_or_else(|err| err.into_inner());
                timings.last_cleanup = Instant::now();
            }
            match self.cleanup_once(abort) {
                Ok(cleaned) => cleaned,
                Err(err) => {
                    error!("cleanup failed in {:?}: {}", self.dir, err);
                    false
                }
            }
        };

        // If the first choice did work the second is skipped; otherwise
        // it runs as well.
        let force_cleanup = {
            let timings = self.timings.lock().unwrap_or_else(|err| err.into_inner());
            timings.last_cleanup.elapsed() > FORCE_CLEANUP_INTERVAL
                && timings.last_cleanup < timings.last_compaction
        };

        if force_cleanup {
            cleanup() || compact()
        } else {
            compact() || cleanup()
        }
    }

    fn monitor_segments(&self) {
        let guard = self.segments_shared();
        if let Some(segments) = guard.as_deref() {
            let total_bytes = segments.iter().map(|s| Segment::size_bytes(s)).sum();
            self.metrics
                .observe_segments(segments.len() as u64, total_bytes);
        }
    }
}
