//! On-disk naming scheme for segment files.
//!
//! | Pattern | Meaning |
//! |---|---|
//! | `segment-<id>.db` | Published segment. |
//! | `segment-<id>.wal` | Uncommitted flush; the sibling `.db` is not durable. |
//! | `segment-<A>_<B>.db.tmp` | In-progress compaction output for inputs A (older) and B (newer). |
//! | `segment-<id>.db.tmp` | In-progress cleanup rewrite. |
//! | `<name>.deleted` | File pending deletion; removed at recovery or after publication. |
//!
//! Ids are opaque strings produced by the flusher. They must not contain
//! underscores (the separator of a compaction artifact name) and must
//! order lexicographically in flush order.

use crate::error::Result;
use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Common prefix of every segment-related file name.
pub const SEGMENT_PREFIX: &str = "segment-";

/// Extension of a published segment.
pub const SEGMENT_EXTENSION: &str = "db";

/// Extension of a write-ahead log sibling.
pub const WAL_EXTENSION: &str = "wal";

/// Extension of an in-progress compaction or cleanup output.
pub const TMP_EXTENSION: &str = "tmp";

/// Extension marking a file as pending deletion.
pub const DELETE_MARKER_EXTENSION: &str = "deleted";

/// Builds the published file name `segment-<id>.db`.
pub fn segment_file_name(id: &str) -> String {
    format!("{SEGMENT_PREFIX}{id}.{SEGMENT_EXTENSION}")
}

/// Builds the WAL sibling name `segment-<id>.wal`.
pub fn wal_file_name(id: &str) -> String {
    format!("{SEGMENT_PREFIX}{id}.{WAL_EXTENSION}")
}

/// Builds the compaction output name `segment-<left>_<right>.db.tmp`.
pub fn compaction_tmp_file_name(left: &str, right: &str) -> String {
    format!("{SEGMENT_PREFIX}{left}_{right}.{SEGMENT_EXTENSION}.{TMP_EXTENSION}")
}

/// Builds the cleanup rewrite name `segment-<id>.db.tmp`.
pub fn cleanup_tmp_file_name(id: &str) -> String {
    format!("{SEGMENT_PREFIX}{id}.{SEGMENT_EXTENSION}.{TMP_EXTENSION}")
}

/// Extracts the id from a published file name (`segment-<id>.db`).
pub fn segment_id(file_name: &str) -> Option<&str> {
    file_name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(&format!(".{SEGMENT_EXTENSION}"))
}

/// Extracts the id from a published segment path.
pub fn segment_id_from_path(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(segment_id)
        .map(str::to_owned)
}

/// Splits the ids out of a compacted stem (`segment-<A>_<B>.db`).
///
/// A single id means the file is a cleanup leftover; two ids identify a
/// compaction artifact. Anything else is a pre-versioned artifact.
pub fn joint_segment_ids(file_name: &str) -> Option<Vec<String>> {
    let ids = segment_id(file_name)?;
    Some(ids.split('_').map(str::to_owned).collect())
}

/// Path of the delete marker for `path` (`<path>.deleted`).
pub fn delete_marker_path(path: &Path) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_owned();
    os.push(".");
    os.push(DELETE_MARKER_EXTENSION);
    PathBuf::from(os)
}

/// Fsyncs a directory so renames and removals inside it are durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}
