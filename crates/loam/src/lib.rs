//! Loam - LSM key-value segment storage engine.
//!
//! This crate provides the on-disk segment group at the heart of an
//! LSM-tree bucket: the ordered stack of immutable segment files, the
//! crash-recovery directory scan that materializes it, the layered read
//! path over it, and the background maintenance loop that compacts and
//! cleans segments over time.
//!
//! # Components
//!
//! - [`Segment`] / [`SegmentWriter`]: immutable indexed on-disk tables
//!   and the streaming writer that produces them
//! - [`SegmentGroup`]: the ordered stack, its reader path, append,
//!   status, and shutdown
//! - [`CycleManager`]: cooperative scheduler driving maintenance ticks
//!
//! # Example
//!
//! ```rust,ignore
//! use loam::{CycleManager, Metrics, SegmentGroup, SegmentGroupConfig, Strategy, UnlimitedChecker};
//!
//! let cycle = CycleManager::new(Duration::from_secs(1));
//! let cfg = SegmentGroupConfig::new("/data/bucket", Strategy::Replace);
//! let group = SegmentGroup::open(cfg, Arc::new(Metrics::new()), Arc::new(UnlimitedChecker), &cycle)?;
//!
//! // the flusher hands over finished segment files
//! group.append("/data/bucket/segment-0007.db")?;
//!
//! // readers see the newest layer win
//! let value = group.get(b"key")?;
//!
//! group.shutdown(Duration::from_secs(10))?;
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod group;
pub mod lifecycle;
pub mod memwatch;
pub mod metrics;
pub mod segment;

pub use config::SegmentGroupConfig;
pub use error::{LsmError, Result};
pub use group::{SegmentGroup, Status};
pub use lifecycle::{AbortFlag, CycleManager};
pub use memwatch::{AllocChecker, FixedBudgetChecker, UnlimitedChecker};
pub use metrics::Metrics;
pub use segment::{
    BitmapLayer, RecordPayload, Segment, SegmentValue, SegmentWriter, Strategy,
};
