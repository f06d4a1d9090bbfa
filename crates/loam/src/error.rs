//! Error and Result types for Loam segment operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for Loam operations.
pub type Result<T> = std::result::Result<T, LsmError>;

/// The error type for segment and segment-group operations.
///
/// `NotFound` and `Deleted` are sentinels exchanged between a segment and
/// its group: they drive the layered read path and are never fatal on
/// their own. Every other variant terminates the containing operation.
#[derive(Debug, Error)]
pub enum LsmError {
    /// Invalid magic bytes in a segment file header.
    #[error("Invalid magic bytes: expected LSEG, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported segment file format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// File checksum does not match the expected value.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// The key is not present in the segment.
    #[error("key not found")]
    NotFound,

    /// The key is present as a tombstone.
    #[error("key deleted")]
    Deleted,

    /// The operation is not valid for the segment's strategy.
    #[error("Strategy mismatch: segment uses {actual}, operation requires {expected}")]
    StrategyMismatch {
        /// Strategy the operation requires.
        expected: &'static str,
        /// Strategy the segment was written with.
        actual: &'static str,
    },

    /// Segment file contents are inconsistent with its index.
    #[error("Segment corrupted: {0}")]
    Corruption(String),

    /// Keys must be handed to the segment writer in ascending order.
    #[error("Keys must be written in ascending order")]
    UnsortedKeys,

    /// A record carried the wrong number of secondary keys.
    #[error("Expected {expected} secondary keys, got {got}")]
    SecondaryKeyCount {
        /// Secondary index count the segment was created with.
        expected: u8,
        /// Number of secondary keys supplied.
        got: usize,
    },

    /// The requested secondary index position does not exist.
    #[error("Secondary index position {0} out of range")]
    SecondaryIndexOutOfRange(usize),

    /// The segment has been closed; no further reads are possible.
    #[error("Segment is closed")]
    SegmentClosed,

    /// The group has been shut down and its segment sequence released.
    #[error("Segment group has been shut down")]
    ShutDown,

    /// On-disk state left behind by a crash cannot be resolved.
    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    /// Error while merging or rewriting segments.
    #[error("Compaction error: {0}")]
    CompactionError(String),

    /// Shutdown could not stop the maintenance callback before the deadline.
    #[error("Shutdown timed out: long-running compaction in progress")]
    ShutdownTimedOut,

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
