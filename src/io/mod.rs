// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! I/O layer of the bag engine.
//!
//! This module provides the on-disk building blocks:
//! - [`constants`] — op codes, field names and format constants
//! - [`record`] — the shared record frame and its key/value header codec
//! - [`stream`] — incremental compression streams for chunk bodies
//! - [`chunked_file`] — the file handle mixing plain and compressed regions

pub mod chunked_file;
pub mod constants;
pub mod record;
pub mod stream;

pub use chunked_file::ChunkedFile;
pub use stream::{ReadStream, WriteStream};
