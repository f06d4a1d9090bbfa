//! Immutable on-disk segments and their file format.
//!
//! A segment is an indexed, immutable table produced by a completed
//! flush or compaction. The handle supports point lookups by primary
//! key, lookups through secondary indexes, collection reads, and
//! roaring-set reads. `NotFound` and `Deleted` are surfaced as
//! dedicated error variants so the segment group can layer results
//! across the stack.

pub mod bloom;
pub mod format;
pub mod writer;

pub use bloom::BloomFilter;
pub use format::{BitmapLayer, RecordPayload, SegmentValue, Strategy};
pub use writer::SegmentWriter;

use crate::error::{LsmError, Result};
use crate::segment::format::{
    IndexEntry, SegmentFooter, SegmentHeader, FOOTER_SIZE,
};
use memmap2::Mmap;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Predicate reporting whether any strictly older segment contains a
/// key.
///
/// Built by the group from a frozen snapshot of the segments below the
/// one being opened; used once to compute `count_net_additions` and
/// dropped afterwards, so a segment never owns a path back into the
/// group.
pub type ExistsOnLower = Box<dyn Fn(&[u8]) -> Result<bool> + Send + Sync>;

/// Options controlling how a segment is opened.
#[derive(Debug, Clone, Copy)]
pub struct SegmentOpenOptions {
    /// Map the file contents instead of issuing buffered reads.
    pub mmap_contents: bool,
    /// Load the bloom filter when the file carries one.
    pub use_bloom_filter: bool,
    /// Compute the net-addition delta at open time (replace strategy
    /// only; requires an `exists_on_lower` predicate).
    pub calc_count_net_additions: bool,
}

/// How the segment's payload bytes are accessed.
enum Contents {
    /// Memory-mapped file contents.
    Mmap(Mmap),
    /// Buffered mode; reads open a fresh handle per payload. The stored
    /// handle pins the file open until `close`.
    Buffered(#[allow(dead_code)] File),
}

struct EntryMeta {
    offset: u64,
    len: u64,
    secondaries: Vec<Option<Vec<u8>>>,
}

/// A full record scanned out of a segment, used when merging.
pub(crate) struct SegmentEntry {
    pub key: Vec<u8>,
    pub secondaries: Vec<Option<Vec<u8>>>,
    pub payload: RecordPayload,
}

/// Opaque, immutable handle to one on-disk segment.
pub struct Segment {
    path: PathBuf,
    strategy: Strategy,
    secondary_count: u8,
    index: BTreeMap<Vec<u8>, EntryMeta>,
    secondary_maps: Vec<BTreeMap<Vec<u8>, Vec<u8>>>,
    bloom: Option<BloomFilter>,
    count_net_additions: i64,
    size_bytes: u64,
    contents: RwLock<Option<Contents>>,
}

impl Segment {
    /// Opens a segment file, validating magic, version, and file CRC,
    /// and loading the key index into memory.
    ///
    /// `exists_on_lower` is consulted once per key to compute the
    /// net-addition delta when `calc_count_net_additions` is set; it is
    /// not retained.
    pub fn open(
        path: impl AsRef<Path>,
        opts: &SegmentOpenOptions,
        exists_on_lower: Option<ExistsOnLower>,
    ) -> Result<Segment> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let size_bytes = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let header = SegmentHeader::read_from(&mut reader)?;

        reader.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let footer = SegmentFooter::read_from(&mut reader)?;

        let calculated_crc = writer::file_crc(&path, size_bytes - FOOTER_SIZE as u64)?;
        if calculated_crc != footer.file_crc32 {
            return Err(LsmError::ChecksumMismatch {
                expected: footer.file_crc32,
                actual: calculated_crc,
            });
        }

        // Key index
        reader.seek(SeekFrom::Start(footer.index_offset))?;
        let mut index = BTreeMap::new();
        let mut secondary_maps =
            vec![BTreeMap::new(); header.secondary_count as usize];
        for _ in 0..footer.entry_count {
            let entry = IndexEntry::read_from(&mut reader, header.secondary_count)?;
            for (pos, secondary) in entry.secondaries.iter().enumerate() {
                if let Some(sec_key) = secondary {
                    secondary_maps[pos].insert(sec_key.clone(), entry.key.clone());
                }
            }
            index.insert(
                entry.key,
                EntryMeta {
                    offset: entry.offset,
                    len: entry.len,
                    secondaries: entry.secondaries,
                },
            );
        }

        // Bloom filter
        let bloom = if opts.use_bloom_filter && footer.bloom_offset != 0 {
            reader.seek(SeekFrom::Start(footer.bloom_offset))?;
            Some(BloomFilter::read_from(&mut reader)?)
        } else {
            None
        };

        let contents = if opts.mmap_contents {
            let file = File::open(&path)?;
            let mmap = unsafe { Mmap::map(&file)? };
            Contents::Mmap(mmap)
        } else {
            Contents::Buffered(File::open(&path)?)
        };

        let mut segment = Segment {
            path,
            strategy: header.strategy,
            secondary_count: header.secondary_count,
            index,
            secondary_maps,
            bloom,
            count_net_additions: 0,
            size_bytes,
            contents: RwLock::new(Some(contents)),
        };

        if opts.calc_count_net_additions && header.strategy == Strategy::Replace {
            if let Some(exists) = exists_on_lower {
                segment.count_net_additions = segment.compute_net_additions(&exists)?;
            }
        }

        Ok(segment)
    }

    /// Net change this segment contributes to the bucket's object
    /// count: additions of previously unseen keys minus tombstones of
    /// keys that exist in older segments.
    fn compute_net_additions(&self, exists_on_lower: &ExistsOnLower) -> Result<i64> {
        let mut net = 0i64;
        for (key, meta) in &self.index {
            match self.read_payload(meta)? {
                RecordPayload::Replace { tombstone, .. } => {
                    if tombstone {
                        if exists_on_lower(key)? {
                            net -= 1;
                        }
                    } else if !exists_on_lower(key)? {
                        net += 1;
                    }
                }
                _ => {
                    return Err(LsmError::Corruption(
                        "replace segment holds non-replace payload".into(),
                    ))
                }
            }
        }
        Ok(net)
    }

    /// Returns the segment's file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the strategy the segment was written with.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Returns the signed object-count delta this segment contributes.
    pub fn count_net_additions(&self) -> i64 {
        self.count_net_additions
    }

    /// Returns the number of keys in the segment.
    pub fn num_keys(&self) -> usize {
        self.index.len()
    }

    /// Returns the number of secondary index positions per record.
    pub(crate) fn secondary_count(&self) -> u8 {
        self.secondary_count
    }

    /// Returns the on-disk size of the segment file in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Looks up a replace-strategy value by primary key.
    ///
    /// # Errors
    ///
    /// `LsmError::NotFound` when the key is absent,
    /// `LsmError::Deleted` when the newest record for the key is a
    /// tombstone. Any other error is fatal to the read.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.require_strategy(Strategy::Replace)?;

        if let Some(bloom) = &self.bloom {
            if !bloom.maybe_contains(key) {
                return Err(LsmError::NotFound);
            }
        }

        let meta = self.index.get(key).ok_or(LsmError::NotFound)?;
        match self.read_payload(meta)? {
            RecordPayload::Replace { value, tombstone } => {
                if tombstone {
                    Err(LsmError::Deleted)
                } else {
                    Ok(value)
                }
            }
            _ => Err(LsmError::Corruption(
                "replace segment holds non-replace payload".into(),
            )),
        }
    }

    /// Looks up a value through the secondary index at `pos`.
    ///
    /// The value bytes are written into `buf` (which is cleared first)
    /// so callers can reuse one allocation across segments; the stable
    /// primary key is returned.
    pub fn get_by_secondary(
        &self,
        pos: usize,
        key: &[u8],
        buf: &mut Vec<u8>,
    ) -> Result<Vec<u8>> {
        self.require_strategy(Strategy::Replace)?;
        let map = self
            .secondary_maps
            .get(pos)
            .ok_or(LsmError::SecondaryIndexOutOfRange(pos))?;

        let primary = map.get(key).ok_or(LsmError::NotFound)?;
        let value = self.get(primary)?;
        buf.clear();
        buf.extend_from_slice(&value);
        Ok(primary.clone())
    }

    /// Returns the values stored for a key, in insertion order.
    pub fn get_collection(&self, key: &[u8]) -> Result<Vec<SegmentValue>> {
        if !self.strategy.is_collection() {
            return Err(LsmError::StrategyMismatch {
                expected: "collection",
                actual: self.strategy.as_str(),
            });
        }

        if let Some(bloom) = &self.bloom {
            if !bloom.maybe_contains(key) {
                return Err(LsmError::NotFound);
            }
        }

        let meta = self.index.get(key).ok_or(LsmError::NotFound)?;
        match self.read_payload(meta)? {
            RecordPayload::Collection(values) => Ok(values),
            _ => Err(LsmError::Corruption(
                "collection segment holds non-collection payload".into(),
            )),
        }
    }

    /// Returns this segment's bitmap layer for a key.
    pub fn roaring_set_get(&self, key: &[u8]) -> Result<BitmapLayer> {
        self.require_strategy(Strategy::RoaringSet)?;

        if let Some(bloom) = &self.bloom {
            if !bloom.maybe_contains(key) {
                return Err(LsmError::NotFound);
            }
        }

        let meta = self.index.get(key).ok_or(LsmError::NotFound)?;
        match self.read_payload(meta)? {
            RecordPayload::RoaringSet(layer) => Ok(layer),
            _ => Err(LsmError::Corruption(
                "roaring segment holds non-roaring payload".into(),
            )),
        }
    }

    /// Scans every record in key order. Used for merges and rewrites.
    pub(crate) fn entries(&self) -> Result<Vec<SegmentEntry>> {
        let mut out = Vec::with_capacity(self.index.len());
        for (key, meta) in &self.index {
            out.push(SegmentEntry {
                key: key.clone(),
                secondaries: meta.secondaries.clone(),
                payload: self.read_payload(meta)?,
            });
        }
        Ok(out)
    }

    /// Releases the file descriptor or memory mapping. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut guard = self
            .contents
            .write()
            .unwrap_or_else(|err| err.into_inner());
        *guard = None;
        Ok(())
    }

    /// Closes the segment and removes its file.
    pub fn drop_immediately(&self) -> Result<()> {
        self.close()?;
        fs::remove_file(&self.path)?;
        Ok(())
    }

    /// Renames the just-written file to its published location. Only
    /// valid before the segment is shared.
    pub(crate) fn publish(&mut self, dest: &Path) -> Result<()> {
        fs::rename(&self.path, dest)?;
        self.path = dest.to_path_buf();
        Ok(())
    }

    fn require_strategy(&self, expected: Strategy) -> Result<()> {
        if self.strategy != expected {
            return Err(LsmError::StrategyMismatch {
                expected: expected.as_str(),
                actual: self.strategy.as_str(),
            });
        }
        Ok(())
    }

    fn read_payload(&self, meta: &EntryMeta) -> Result<RecordPayload> {
        let guard = self
            .contents
            .read()
            .unwrap_or_else(|err| err.into_inner());
        let contents = guard.as_ref().ok_or(LsmError::SegmentClosed)?;

        match contents {
            Contents::Mmap(mmap) => {
                let start = meta.offset as usize;
                let end = start + meta.len as usize;
                let bytes = mmap.get(start..end).ok_or_else(|| {
                    LsmError::Corruption("payload range outside mapped file".into())
                })?;
                RecordPayload::decode(self.strategy, bytes)
            }
            Contents::Buffered(_) => {
                let mut file = File::open(&self.path)?;
                file.seek(SeekFrom::Start(meta.offset))?;
                let mut bytes = vec![0u8; meta.len as usize];
                file.read_exact(&mut bytes)?;
                RecordPayload::decode(self.strategy, &bytes)
            }
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("path", &self.path)
            .field("strategy", &self.strategy)
            .field("num_keys", &self.index.len())
            .field("count_net_additions", &self.count_net_additions)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::format::encode_map_pair;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    fn open_opts(mmap: bool) -> SegmentOpenOptions {
        SegmentOpenOptions {
            mmap_contents: mmap,
            use_bloom_filter: true,
            calc_count_net_additions: false,
        }
    }

    fn write_replace_segment(path: &Path, entries: &[(&[u8], Option<&[u8]>)]) {
        let mut writer = SegmentWriter::create(path, Strategy::Replace, 0, true).unwrap();
        for (key, value) in entries {
            match value {
                Some(value) => writer.push_replace(key, value).unwrap(),
                None => writer.push_tombstone(key).unwrap(),
            }
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_get_found_deleted_missing() {
        for mmap in [false, true] {
            let temp_dir = TempDir::new().unwrap();
            let path = temp_dir.path().join("segment-01.db");
            write_replace_segment(&path, &[(b"alive", Some(b"v1")), (b"dead", None)]);

            let segment = Segment::open(&path, &open_opts(mmap), None).unwrap();
            assert_eq!(segment.get(b"alive").unwrap(), b"v1");
            assert!(matches!(segment.get(b"dead"), Err(LsmError::Deleted)));
            assert!(matches!(segment.get(b"gone"), Err(LsmError::NotFound)));
        }
    }

    #[test]
    fn test_secondary_lookup_returns_primary_key() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("segment-01.db");
        let mut writer = SegmentWriter::create(&path, Strategy::Replace, 1, true).unwrap();
        writer
            .push(
                b"doc-1",
                vec![Some(b"uuid-a".to_vec())],
                &RecordPayload::Replace {
                    value: b"payload".to_vec(),
                    tombstone: false,
                },
            )
            .unwrap();
        writer.finish().unwrap();

        let segment = Segment::open(&path, &open_opts(false), None).unwrap();
        let mut buf = Vec::new();
        let primary = segment.get_by_secondary(0, b"uuid-a", &mut buf).unwrap();
        assert_eq!(primary, b"doc-1");
        assert_eq!(buf, b"payload");

        assert!(matches!(
            segment.get_by_secondary(0, b"uuid-z", &mut buf),
            Err(LsmError::NotFound)
        ));
        assert!(matches!(
            segment.get_by_secondary(5, b"uuid-a", &mut buf),
            Err(LsmError::SecondaryIndexOutOfRange(5))
        ));
    }

    #[test]
    fn test_collection_preserves_insertion_order() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("segment-01.db");
        let mut writer = SegmentWriter::create(&path, Strategy::SetCollection, 0, true).unwrap();
        writer
            .push(
                b"k",
                vec![],
                &RecordPayload::Collection(vec![
                    SegmentValue {
                        value: b"first".to_vec(),
                        tombstone: false,
                    },
                    SegmentValue {
                        value: b"second".to_vec(),
                        tombstone: false,
                    },
                ]),
            )
            .unwrap();
        writer.finish().unwrap();

        let segment = Segment::open(&path, &open_opts(false), None).unwrap();
        let values = segment.get_collection(b"k").unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].value, b"first");
        assert_eq!(values[1].value, b"second");
    }

    #[test]
    fn test_roaring_layer_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("segment-01.db");
        let mut layer = BitmapLayer::default();
        layer.additions.insert(42);
        layer.deletions.insert(7);

        let mut writer = SegmentWriter::create(&path, Strategy::RoaringSet, 0, true).unwrap();
        writer
            .push(b"prop", vec![], &RecordPayload::RoaringSet(layer.clone()))
            .unwrap();
        writer.finish().unwrap();

        let segment = Segment::open(&path, &open_opts(false), None).unwrap();
        let restored = segment.roaring_set_get(b"prop").unwrap();
        assert!(restored.additions.contains(42));
        assert!(restored.deletions.contains(7));
    }

    #[test]
    fn test_net_additions_against_lower_segments() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("segment-02.db");
        // fresh key, update of an existing key, tombstone of an existing
        // key, tombstone of an unseen key
        write_replace_segment(
            &path,
            &[
                (b"existing", Some(b"v2")),
                (b"fresh", Some(b"v1")),
                (b"gone-below", None),
                (b"never-there", None),
            ],
        );

        let exists: ExistsOnLower = Box::new(|key: &[u8]| {
            Ok(key == b"existing" || key == b"gone-below")
        });
        let opts = SegmentOpenOptions {
            mmap_contents: false,
            use_bloom_filter: true,
            calc_count_net_additions: true,
        };
        let segment = Segment::open(&path, &opts, Some(exists)).unwrap();

        // +1 fresh, 0 existing, -1 gone-below, 0 never-there
        assert_eq!(segment.count_net_additions(), 0);
    }

    #[test]
    fn test_corrupted_file_fails_open() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("segment-01.db");
        write_replace_segment(&path, &[(b"k", Some(b"value"))]);

        // Flip a byte in the data section.
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(20)).unwrap();
        file.write_all(&[0xFF]).unwrap();
        file.sync_all().unwrap();

        let err = Segment::open(&path, &open_opts(false), None).unwrap_err();
        assert!(matches!(err, LsmError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_reads_after_close_fail() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("segment-01.db");
        write_replace_segment(&path, &[(b"k", Some(b"v"))]);

        let segment = Segment::open(&path, &open_opts(true), None).unwrap();
        segment.close().unwrap();
        assert!(matches!(segment.get(b"k"), Err(LsmError::SegmentClosed)));
        // close is idempotent
        segment.close().unwrap();
    }

    #[test]
    fn test_drop_immediately_removes_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("segment-01.db");
        write_replace_segment(&path, &[(b"k", Some(b"v"))]);

        let segment = Segment::open(&path, &open_opts(false), None).unwrap();
        segment.drop_immediately().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_map_pairs_survive_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("segment-01.db");
        let mut writer = SegmentWriter::create(&path, Strategy::MapCollection, 0, true).unwrap();
        writer
            .push(
                b"obj",
                vec![],
                &RecordPayload::Collection(vec![SegmentValue {
                    value: encode_map_pair(b"lat", b"52.52"),
                    tombstone: false,
                }]),
            )
            .unwrap();
        writer.finish().unwrap();

        let segment = Segment::open(&path, &open_opts(false), None).unwrap();
        let values = segment.get_collection(b"obj").unwrap();
        assert_eq!(
            crate::segment::format::map_pair_key(&values[0].value),
            Some(&b"lat"[..])
        );
    }
}
