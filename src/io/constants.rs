// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! On-disk constants of the bag format.

/// Leading bytes of the version line.
pub const MAGIC_PREFIX: &str = "#ROSBAG V";

/// Version line written for new bags.
pub const VERSION_LINE: &str = "#ROSBAG V2.0\n";

/// Numeric version of the current format (major * 100 + minor).
pub const VERSION_200: u32 = 200;

/// Numeric version of the legacy read-only format.
pub const VERSION_102: u32 = 102;

/// Total on-disk length of the file header record, length prefixes
/// included. The record is padded with spaces and rewritten in place when
/// the bag closes.
pub const FILE_HEADER_LENGTH: u32 = 4096;

/// Index data record version emitted for each chunk.
pub const INDEX_VERSION: u32 = 1;

/// Chunk info record version.
pub const CHUNK_INFO_VERSION: u32 = 1;

/// Default threshold for rolling the outgoing chunk (768KB).
pub const DEFAULT_CHUNK_THRESHOLD: u32 = 768 * 1024;

// Record op codes.

/// Message definition record (legacy 1.02 only).
pub const OP_MSG_DEF: u8 = 0x01;
/// Message data record.
pub const OP_MSG_DATA: u8 = 0x02;
/// File header record.
pub const OP_FILE_HEADER: u8 = 0x03;
/// Chunk record.
pub const OP_CHUNK: u8 = 0x04;
/// Index data record (per-topic ver 0 in 1.02, per-connection ver 1 in 2.0).
pub const OP_INDEX_DATA: u8 = 0x05;
/// Chunk info record.
pub const OP_CHUNK_INFO: u8 = 0x06;
/// Connection record.
pub const OP_CONNECTION: u8 = 0x07;

// Record header field names.

pub const OP_FIELD_NAME: &str = "op";
pub const TOPIC_FIELD_NAME: &str = "topic";
pub const CONNECTION_FIELD_NAME: &str = "conn";
pub const TIME_FIELD_NAME: &str = "time";
pub const INDEX_POS_FIELD_NAME: &str = "index_pos";
pub const CONNECTION_COUNT_FIELD_NAME: &str = "conn_count";
pub const CHUNK_COUNT_FIELD_NAME: &str = "chunk_count";
pub const COMPRESSION_FIELD_NAME: &str = "compression";
pub const SIZE_FIELD_NAME: &str = "size";
pub const CHUNK_POS_FIELD_NAME: &str = "chunk_pos";
pub const START_TIME_FIELD_NAME: &str = "start_time";
pub const END_TIME_FIELD_NAME: &str = "end_time";
pub const VER_FIELD_NAME: &str = "ver";
pub const COUNT_FIELD_NAME: &str = "count";
pub const ENCRYPTOR_FIELD_NAME: &str = "encryptor";

// Connection data field names.

pub const TYPE_FIELD_NAME: &str = "type";
pub const MD5_FIELD_NAME: &str = "md5sum";
pub const DEFINITION_FIELD_NAME: &str = "message_definition";
pub const CALLERID_FIELD_NAME: &str = "callerid";
pub const LATCHING_FIELD_NAME: &str = "latching";
