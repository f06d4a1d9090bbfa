//! Segment file format: header, footer, key index, and record payloads.
//!
//! A segment file with the `.db` extension has the following layout:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Header (16 bytes)                                           │
//! │  - Magic: "LSEG" (4 bytes)                                   │
//! │  - Version: u16 (2 bytes) = 1                                │
//! │  - Strategy: u8 (1 byte)                                     │
//! │  - Secondary index count: u8 (1 byte)                        │
//! │  - Reserved: 8 bytes                                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Data section (record payloads, back to back)                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Key index (entries sorted by key)                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Bloom filter (optional)                                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Footer (48 bytes)                                           │
//! │  - Offsets, sizes, entry count, CRC, reverse magic           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The file CRC32 covers everything before the footer and is verified
//! when a segment is opened.

use crate::error::{LsmError, Result};
use roaring::RoaringTreemap;
use std::io::{Read, Write};

/// Magic bytes for a segment file header: "LSEG".
pub const SEGMENT_MAGIC: [u8; 4] = *b"LSEG";

/// Reverse magic bytes for the segment footer: "GESL".
pub const SEGMENT_MAGIC_REVERSE: [u8; 4] = *b"GESL";

/// Current segment file format version.
pub const SEGMENT_VERSION: u16 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// Footer size in bytes.
pub const FOOTER_SIZE: usize = 48;

/// Read semantics of a segment group and its segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Strategy {
    /// The newest segment holding a key wins; tombstones mask older
    /// values.
    #[default]
    Replace = 0,
    /// Values are key/value pairs concatenated across segments in
    /// chronological order.
    MapCollection = 1,
    /// Opaque values concatenated across segments in chronological
    /// order.
    SetCollection = 2,
    /// Per-segment bitmap layers merged by the caller.
    RoaringSet = 3,
    /// Map-like postings that must be surfaced even when a segment only
    /// holds tombstones for a key.
    Inverted = 4,
}

impl Strategy {
    /// Creates a Strategy from a u8 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Replace),
            1 => Some(Self::MapCollection),
            2 => Some(Self::SetCollection),
            3 => Some(Self::RoaringSet),
            4 => Some(Self::Inverted),
            _ => None,
        }
    }

    /// Returns the strategy's stable name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::MapCollection => "mapcollection",
            Self::SetCollection => "setcollection",
            Self::RoaringSet => "roaringset",
            Self::Inverted => "inverted",
        }
    }

    /// Returns true for the strategies whose reads concatenate values
    /// across segments.
    pub fn is_collection(self) -> bool {
        matches!(
            self,
            Self::MapCollection | Self::SetCollection | Self::Inverted
        )
    }
}

/// Segment file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Format version.
    pub version: u16,
    /// Strategy the segment was written with.
    pub strategy: Strategy,
    /// Number of secondary indexes carried per record.
    pub secondary_count: u8,
}

impl SegmentHeader {
    /// Creates a header for the current format version.
    pub fn new(strategy: Strategy, secondary_count: u8) -> Self {
        Self {
            version: SEGMENT_VERSION,
            strategy,
            secondary_count,
        }
    }

    /// Writes the header using little-endian byte order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&SEGMENT_MAGIC)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&[self.strategy as u8, self.secondary_count])?;
        writer.write_all(&[0u8; 8])?;
        Ok(())
    }

    /// Reads and validates a header.
    ///
    /// # Errors
    ///
    /// Returns `LsmError::InvalidMagic` or `LsmError::UnsupportedVersion`
    /// when the file was not written by this format.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;

        let magic: [u8; 4] = buf[0..4].try_into().unwrap();
        if magic != SEGMENT_MAGIC {
            return Err(LsmError::InvalidMagic(magic));
        }

        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version != SEGMENT_VERSION {
            return Err(LsmError::UnsupportedVersion(version));
        }

        let strategy = Strategy::from_u8(buf[6])
            .ok_or_else(|| LsmError::Corruption(format!("unknown strategy tag {}", buf[6])))?;
        let secondary_count = buf[7];

        Ok(Self {
            version,
            strategy,
            secondary_count,
        })
    }
}

/// Segment file footer (48 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentFooter {
    /// Offset to the key index from file start.
    pub index_offset: u64,
    /// Size of the key index in bytes.
    pub index_size: u32,
    /// Offset to the bloom filter, or 0 when the file carries none.
    pub bloom_offset: u64,
    /// Size of the data section in bytes.
    pub data_size: u64,
    /// Number of keys in the segment.
    pub entry_count: u64,
    /// CRC32 checksum of the entire file excluding the footer.
    pub file_crc32: u32,
}

impl SegmentFooter {
    /// Writes the footer using little-endian byte order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.index_offset.to_le_bytes())?;
        writer.write_all(&self.index_size.to_le_bytes())?;
        writer.write_all(&self.bloom_offset.to_le_bytes())?;
        writer.write_all(&self.data_size.to_le_bytes())?;
        writer.write_all(&self.entry_count.to_le_bytes())?;
        writer.write_all(&self.file_crc32.to_le_bytes())?;
        writer.write_all(&SEGMENT_MAGIC_REVERSE)?;
        writer.write_all(&[0u8; 4])?;
        Ok(())
    }

    /// Reads and validates a footer.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; FOOTER_SIZE];
        reader.read_exact(&mut buf)?;

        let index_offset = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let index_size = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let bloom_offset = u64::from_le_bytes(buf[12..20].try_into().unwrap());
        let data_size = u64::from_le_bytes(buf[20..28].try_into().unwrap());
        let entry_count = u64::from_le_bytes(buf[28..36].try_into().unwrap());
        let file_crc32 = u32::from_le_bytes(buf[36..40].try_into().unwrap());

        let magic_reverse: [u8; 4] = buf[40..44].try_into().unwrap();
        if magic_reverse != SEGMENT_MAGIC_REVERSE {
            return Err(LsmError::InvalidMagic(magic_reverse));
        }

        Ok(Self {
            index_offset,
            index_size,
            bloom_offset,
            data_size,
            entry_count,
            file_crc32,
        })
    }
}

/// Key index entry: key, payload location, and secondary keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Primary key.
    pub key: Vec<u8>,
    /// Offset of the record payload from file start.
    pub offset: u64,
    /// Length of the record payload in bytes.
    pub len: u64,
    /// Secondary keys, one slot per secondary index position.
    pub secondaries: Vec<Option<Vec<u8>>>,
}

impl IndexEntry {
    /// Writes the entry.
    ///
    /// Format:
    /// - key_len: u32 + key bytes
    /// - offset: u64
    /// - len: u64
    /// - per secondary position: present: u8, then key_len: u32 + key bytes
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&(self.key.len() as u32).to_le_bytes())?;
        writer.write_all(&self.key)?;
        writer.write_all(&self.offset.to_le_bytes())?;
        writer.write_all(&self.len.to_le_bytes())?;
        for secondary in &self.secondaries {
            match secondary {
                Some(key) => {
                    writer.write_all(&[1u8])?;
                    writer.write_all(&(key.len() as u32).to_le_bytes())?;
                    writer.write_all(key)?;
                }
                None => writer.write_all(&[0u8])?,
            }
        }
        Ok(())
    }

    /// Reads an entry with the given number of secondary positions.
    pub fn read_from<R: Read>(reader: &mut R, secondary_count: u8) -> Result<Self> {
        let mut buf4 = [0u8; 4];
        let mut buf8 = [0u8; 8];

        reader.read_exact(&mut buf4)?;
        let key_len = u32::from_le_bytes(buf4) as usize;
        let mut key = vec![0u8; key_len];
        reader.read_exact(&mut key)?;

        reader.read_exact(&mut buf8)?;
        let offset = u64::from_le_bytes(buf8);
        reader.read_exact(&mut buf8)?;
        let len = u64::from_le_bytes(buf8);

        let mut secondaries = Vec::with_capacity(secondary_count as usize);
        let mut flag = [0u8; 1];
        for _ in 0..secondary_count {
            reader.read_exact(&mut flag)?;
            if flag[0] == 0 {
                secondaries.push(None);
            } else {
                reader.read_exact(&mut buf4)?;
                let sec_len = u32::from_le_bytes(buf4) as usize;
                let mut sec = vec![0u8; sec_len];
                reader.read_exact(&mut sec)?;
                secondaries.push(Some(sec));
            }
        }

        Ok(Self {
            key,
            offset,
            len,
            secondaries,
        })
    }
}

/// One value of a collection record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentValue {
    /// Opaque value bytes. For map and inverted strategies this is an
    /// encoded map pair.
    pub value: Vec<u8>,
    /// True when the value is a deletion marker.
    pub tombstone: bool,
}

/// One roaring-set layer: additions and deletions of a single segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BitmapLayer {
    /// Ids added by this layer.
    pub additions: RoaringTreemap,
    /// Ids deleted by this layer.
    pub deletions: RoaringTreemap,
}

/// Decoded record payload, variant per strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordPayload {
    /// Replace strategy: a single value or a tombstone.
    Replace {
        /// Value bytes; empty for a tombstone.
        value: Vec<u8>,
        /// True when the key is deleted.
        tombstone: bool,
    },
    /// Collection strategies: values in insertion order.
    Collection(Vec<SegmentValue>),
    /// Roaring-set strategy: one bitmap layer.
    RoaringSet(BitmapLayer),
}

impl RecordPayload {
    /// Returns the strategy family this payload belongs to.
    pub fn matches_strategy(&self, strategy: Strategy) -> bool {
        match self {
            Self::Replace { .. } => strategy == Strategy::Replace,
            Self::Collection(_) => strategy.is_collection(),
            Self::RoaringSet(_) => strategy == Strategy::RoaringSet,
        }
    }

    /// Encodes the payload into `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Replace { value, tombstone } => {
                buf.push(u8::from(*tombstone));
                buf.extend_from_slice(value);
            }
            Self::Collection(values) => {
                buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
                for value in values {
                    buf.push(u8::from(value.tombstone));
                    buf.extend_from_slice(&(value.value.len() as u32).to_le_bytes());
                    buf.extend_from_slice(&value.value);
                }
            }
            Self::RoaringSet(layer) => {
                let mut additions = Vec::new();
                layer.additions.serialize_into(&mut additions)?;
                let mut deletions = Vec::new();
                layer.deletions.serialize_into(&mut deletions)?;
                buf.extend_from_slice(&(additions.len() as u32).to_le_bytes());
                buf.extend_from_slice(&additions);
                buf.extend_from_slice(&(deletions.len() as u32).to_le_bytes());
                buf.extend_from_slice(&deletions);
            }
        }
        Ok(())
    }

    /// Decodes a payload of the given strategy from `bytes`.
    pub fn decode(strategy: Strategy, bytes: &[u8]) -> Result<Self> {
        match strategy {
            Strategy::Replace => {
                let (&flags, value) = bytes
                    .split_first()
                    .ok_or_else(|| LsmError::Corruption("empty replace payload".into()))?;
                Ok(Self::Replace {
                    value: value.to_vec(),
                    tombstone: flags != 0,
                })
            }
            Strategy::MapCollection | Strategy::SetCollection | Strategy::Inverted => {
                let mut cursor = bytes;
                let count = read_u32(&mut cursor)? as usize;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    let (&flags, rest) = cursor
                        .split_first()
                        .ok_or_else(|| LsmError::Corruption("truncated collection value".into()))?;
                    cursor = rest;
                    let len = read_u32(&mut cursor)? as usize;
                    if cursor.len() < len {
                        return Err(LsmError::Corruption("truncated collection value".into()));
                    }
                    let (value, rest) = cursor.split_at(len);
                    cursor = rest;
                    values.push(SegmentValue {
                        value: value.to_vec(),
                        tombstone: flags != 0,
                    });
                }
                Ok(Self::Collection(values))
            }
            Strategy::RoaringSet => {
                let mut cursor = bytes;
                let add_len = read_u32(&mut cursor)? as usize;
                if cursor.len() < add_len {
                    return Err(LsmError::Corruption("truncated additions bitmap".into()));
                }
                let (add_bytes, rest) = cursor.split_at(add_len);
                cursor = rest;
                let del_len = read_u32(&mut cursor)? as usize;
                if cursor.len() < del_len {
                    return Err(LsmError::Corruption("truncated deletions bitmap".into()));
                }
                let (del_bytes, _) = cursor.split_at(del_len);

                let additions = RoaringTreemap::deserialize_from(add_bytes)?;
                let deletions = RoaringTreemap::deserialize_from(del_bytes)?;
                Ok(Self::RoaringSet(BitmapLayer {
                    additions,
                    deletions,
                }))
            }
        }
    }
}

fn read_u32(cursor: &mut &[u8]) -> Result<u32> {
    if cursor.len() < 4 {
        return Err(LsmError::Corruption("truncated length prefix".into()));
    }
    let (head, rest) = cursor.split_at(4);
    *cursor = rest;
    Ok(u32::from_le_bytes(head.try_into().unwrap()))
}

/// Encodes a map pair as stored in map and inverted collection values.
pub fn encode_map_pair(map_key: &[u8], map_value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + map_key.len() + map_value.len());
    out.extend_from_slice(&(map_key.len() as u32).to_le_bytes());
    out.extend_from_slice(map_key);
    out.extend_from_slice(map_value);
    out
}

/// Extracts the map key from an encoded map pair, or `None` when the
/// bytes are too short to hold one.
pub fn map_pair_key(value: &[u8]) -> Option<&[u8]> {
    if value.len() < 4 {
        return None;
    }
    let key_len = u32::from_le_bytes(value[0..4].try_into().unwrap()) as usize;
    value.get(4..4 + key_len)
}
