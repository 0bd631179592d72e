// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Core data structures of the bag engine.
//!
//! This module contains the reusable [`Buffer`] staging area and the
//! persistent structures of the format: connections, chunk summaries and
//! index entries.

pub mod buffer;
pub mod structures;

pub use buffer::Buffer;
pub use structures::{
    insert_index_entry, ChunkHeader, ChunkInfo, CompressionType, ConnectionInfo, FieldMap,
    IndexEntry,
};
