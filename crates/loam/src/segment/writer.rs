//! Streaming writer producing segment files.
//!
//! Used by the flusher to materialize a memtable and by compaction and
//! cleanup to produce merged or rewritten outputs. Keys must be pushed
//! in strictly ascending order; `finish` writes the key index, the
//! optional bloom filter, and the footer, then fsyncs the file.

use crate::error::{LsmError, Result};
use crate::segment::bloom::BloomFilter;
use crate::segment::format::{
    IndexEntry, RecordPayload, SegmentFooter, SegmentHeader, Strategy, HEADER_SIZE,
};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Writer for a single segment file.
pub struct SegmentWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    position: u64,
    strategy: Strategy,
    secondary_count: u8,
    use_bloom: bool,
    entries: Vec<IndexEntry>,
}

impl SegmentWriter {
    /// Creates a writer for the given path and writes the file header.
    ///
    /// An existing file at `path` is truncated.
    pub fn create(
        path: impl AsRef<Path>,
        strategy: Strategy,
        secondary_count: u8,
        use_bloom: bool,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);

        let header = SegmentHeader::new(strategy, secondary_count);
        header.write_to(&mut writer)?;

        Ok(Self {
            writer,
            path,
            position: HEADER_SIZE as u64,
            strategy,
            secondary_count,
            use_bloom,
            entries: Vec::new(),
        })
    }

    /// Returns the strategy the writer encodes.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Appends a record.
    ///
    /// # Errors
    ///
    /// Returns `LsmError::UnsortedKeys` when `key` is not strictly
    /// greater than the previously pushed key, and
    /// `LsmError::StrategyMismatch` when the payload variant does not
    /// match the writer's strategy.
    pub fn push(
        &mut self,
        key: &[u8],
        secondaries: Vec<Option<Vec<u8>>>,
        payload: &RecordPayload,
    ) -> Result<()> {
        if !payload.matches_strategy(self.strategy) {
            return Err(LsmError::StrategyMismatch {
                expected: self.strategy.as_str(),
                actual: payload_family(payload),
            });
        }
        if let Some(last) = self.entries.last() {
            if key <= last.key.as_slice() {
                return Err(LsmError::UnsortedKeys);
            }
        }
        if secondaries.len() != self.secondary_count as usize {
            return Err(LsmError::SecondaryKeyCount {
                expected: self.secondary_count,
                got: secondaries.len(),
            });
        }

        let mut buf = Vec::new();
        payload.encode(&mut buf)?;
        self.writer.write_all(&buf)?;

        self.entries.push(IndexEntry {
            key: key.to_vec(),
            offset: self.position,
            len: buf.len() as u64,
            secondaries,
        });
        self.position += buf.len() as u64;

        Ok(())
    }

    /// Appends a replace-strategy value.
    pub fn push_replace(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.push(
            key,
            vec![None; self.secondary_count as usize],
            &RecordPayload::Replace {
                value: value.to_vec(),
                tombstone: false,
            },
        )
    }

    /// Appends a replace-strategy tombstone.
    pub fn push_tombstone(&mut self, key: &[u8]) -> Result<()> {
        self.push(
            key,
            vec![None; self.secondary_count as usize],
            &RecordPayload::Replace {
                value: Vec::new(),
                tombstone: true,
            },
        )
    }

    /// Writes the key index, bloom filter, and footer, then flushes and
    /// fsyncs the file. Returns the file's path.
    pub fn finish(mut self) -> Result<PathBuf> {
        let data_size = self.position - HEADER_SIZE as u64;

        // Key index
        let index_offset = self.position;
        let mut index_buf = Vec::new();
        for entry in &self.entries {
            entry.write_to(&mut index_buf)?;
        }
        self.writer.write_all(&index_buf)?;
        self.position += index_buf.len() as u64;

        // Bloom filter
        let bloom_offset = if self.use_bloom {
            let offset = self.position;
            let mut bloom = BloomFilter::new(self.entries.len());
            for entry in &self.entries {
                bloom.insert(&entry.key);
            }
            let mut bloom_buf = Vec::new();
            bloom.write_to(&mut bloom_buf)?;
            self.writer.write_all(&bloom_buf)?;
            self.position += bloom_buf.len() as u64;
            offset
        } else {
            0
        };

        // The CRC covers everything written so far, so flush and re-read
        // the file the way the reader will see it.
        self.writer.flush()?;
        let file_crc32 = file_crc(&self.path, self.position)?;

        let footer = SegmentFooter {
            index_offset,
            index_size: index_buf.len() as u32,
            bloom_offset,
            data_size,
            entry_count: self.entries.len() as u64,
            file_crc32,
        };
        footer.write_to(&mut self.writer)?;

        self.writer.flush()?;
        let file = self
            .writer
            .into_inner()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        file.sync_all()?;

        Ok(self.path)
    }
}

/// Calculates the CRC32 of the first `size` bytes of the file at `path`.
pub(crate) fn file_crc(path: &Path, size: u64) -> Result<u32> {
    let mut file = File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buffer = [0u8; 8192];
    let mut remaining = size;

    while remaining > 0 {
        let to_read = remaining.min(buffer.len() as u64) as usize;
        let n = file.read(&mut buffer[..to_read])?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        remaining -= n as u64;
    }

    Ok(hasher.finalize())
}

fn payload_family(payload: &RecordPayload) -> &'static str {
    match payload {
        RecordPayload::Replace { .. } => "replace",
        RecordPayload::Collection(_) => "collection",
        RecordPayload::RoaringSet(_) => "roaringset",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rejects_unsorted_keys() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("segment-01.db");
        let mut writer = SegmentWriter::create(&path, Strategy::Replace, 0, false).unwrap();

        writer.push_replace(b"b", b"1").unwrap();
        let err = writer.push_replace(b"a", b"2").unwrap_err();
        assert!(matches!(err, LsmError::UnsortedKeys));

        let err = writer.push_replace(b"b", b"3").unwrap_err();
        assert!(matches!(err, LsmError::UnsortedKeys));
    }

    #[test]
    fn test_rejects_payload_of_wrong_strategy() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("segment-01.db");
        let mut writer = SegmentWriter::create(&path, Strategy::SetCollection, 0, false).unwrap();

        let err = writer
            .push(
                b"a",
                vec![],
                &RecordPayload::Replace {
                    value: b"v".to_vec(),
                    tombstone: false,
                },
            )
            .unwrap_err();
        assert!(matches!(err, LsmError::StrategyMismatch { .. }));
    }

    #[test]
    fn test_rejects_wrong_secondary_arity() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("segment-01.db");
        let mut writer = SegmentWriter::create(&path, Strategy::Replace, 2, false).unwrap();

        let err = writer
            .push(
                b"a",
                vec![None],
                &RecordPayload::Replace {
                    value: b"v".to_vec(),
                    tombstone: false,
                },
            )
            .unwrap_err();
        assert!(matches!(err, LsmError::SecondaryKeyCount { .. }));
    }

    #[test]
    fn test_empty_segment_is_valid() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("segment-01.db");
        let writer = SegmentWriter::create(&path, Strategy::Replace, 0, true).unwrap();
        let finished = writer.finish().unwrap();
        assert!(finished.exists());
    }
}
