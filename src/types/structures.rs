// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Persistent data structures of the bag format.
//!
//! These mirror what is stored on disk: one [`ConnectionInfo`] per logical
//! channel, one [`ChunkInfo`] per chunk in the trailer, a transient
//! [`ChunkHeader`] per chunk record, and one [`IndexEntry`] per message.

use std::collections::BTreeMap;

use crate::core::{BagError, Result, Time};

/// The record-header key/value map.
///
/// Ordered so that two maps with the same entries serialize to the same
/// bytes, which the connection-identity rule relies on.
pub type FieldMap = BTreeMap<String, Vec<u8>>;

/// Compression applied to chunk bodies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CompressionType {
    /// No compression.
    #[default]
    Uncompressed,
    /// bzip2.
    Bz2,
    /// LZ4 frame format.
    Lz4,
}

impl CompressionType {
    /// The ASCII tag stored in chunk headers.
    pub fn tag(&self) -> &'static str {
        match self {
            CompressionType::Uncompressed => "none",
            CompressionType::Bz2 => "bz2",
            CompressionType::Lz4 => "lz4",
        }
    }

    /// Parse a compression tag.
    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "none" => Ok(CompressionType::Uncompressed),
            "bz2" => Ok(CompressionType::Bz2),
            "lz4" => Ok(CompressionType::Lz4),
            other => Err(BagError::format(format!(
                "unknown compression type: {other}"
            ))),
        }
    }
}

/// Description of one logical channel recorded in a bag.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Dense connection id, unique within one bag.
    pub id: u32,
    /// Topic name.
    pub topic: String,
    /// Message type name, e.g. `std_msgs/String`.
    pub datatype: String,
    /// MD5 sum of the message schema.
    pub md5sum: String,
    /// Full text of the message definition.
    pub msg_def: String,
    /// The full connection header, with the topic name inserted.
    pub header: FieldMap,
}

/// Summary of one physical chunk, persisted in the trailer.
#[derive(Debug, Clone)]
pub struct ChunkInfo {
    /// Earliest timestamp of a message in the chunk.
    pub start_time: Time,
    /// Latest timestamp of a message in the chunk.
    pub end_time: Time,
    /// Absolute byte offset of the chunk record in the bag file.
    pub pos: u64,
    /// Message count per connection stored in the chunk.
    pub connection_counts: BTreeMap<u32, u32>,
}

impl ChunkInfo {
    /// Total messages in the chunk across all connections.
    pub fn message_count(&self) -> u64 {
        self.connection_counts.values().map(|&c| c as u64).sum()
    }
}

/// Header of one chunk record on disk. Transient.
#[derive(Debug, Clone)]
pub struct ChunkHeader {
    /// Compression of the chunk body.
    pub compression: CompressionType,
    /// Size of the chunk body as stored (after compression/encryption).
    pub compressed_size: u32,
    /// Size of the chunk body once decompressed.
    pub uncompressed_size: u32,
}

/// Locator for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexEntry {
    /// Timestamp of the message.
    pub time: Time,
    /// Absolute byte offset of the chunk record containing the message.
    /// For version-1.02 bags this is the absolute message record offset.
    pub chunk_pos: u64,
    /// Byte offset of the message record within the uncompressed chunk body.
    pub offset: u32,
}

/// Insert an entry into a time-ordered index, placing equal times after the
/// existing ones so ties keep insertion order.
pub fn insert_index_entry(index: &mut Vec<IndexEntry>, entry: IndexEntry) {
    if index.last().is_none_or(|last| last.time <= entry.time) {
        index.push(entry);
        return;
    }
    let pos = index.partition_point(|e| e.time <= entry.time);
    index.insert(pos, entry);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sec: u32, offset: u32) -> IndexEntry {
        IndexEntry {
            time: Time::new(sec, 0),
            chunk_pos: 0,
            offset,
        }
    }

    #[test]
    fn test_compression_tags_round_trip() {
        for c in [
            CompressionType::Uncompressed,
            CompressionType::Bz2,
            CompressionType::Lz4,
        ] {
            assert_eq!(CompressionType::from_tag(c.tag()).unwrap(), c);
        }
        assert!(CompressionType::from_tag("zstd").is_err());
    }

    #[test]
    fn test_insert_keeps_time_order() {
        let mut index = Vec::new();
        insert_index_entry(&mut index, entry(5, 0));
        insert_index_entry(&mut index, entry(1, 1));
        insert_index_entry(&mut index, entry(3, 2));
        let times: Vec<u32> = index.iter().map(|e| e.time.sec).collect();
        assert_eq!(times, vec![1, 3, 5]);
    }

    #[test]
    fn test_insert_ties_keep_insertion_order() {
        let mut index = Vec::new();
        insert_index_entry(&mut index, entry(2, 0));
        insert_index_entry(&mut index, entry(2, 1));
        insert_index_entry(&mut index, entry(1, 2));
        insert_index_entry(&mut index, entry(2, 3));
        let offsets: Vec<u32> = index.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![2, 0, 1, 3]);
    }
}
