// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! # Robobag
//!
//! A ROS1 bag storage engine: a self-describing, append-oriented, chunked,
//! optionally-compressed and optionally-encrypted single-file container
//! for timestamped messages on named topics.
//!
//! The library provides three modes of operation on one file type:
//! - **[`Bag`]** in [`BagMode::Write`] — record messages into a new bag
//! - **[`Bag`]** in [`BagMode::Read`] — time-indexed random access reading
//! - **[`Bag`]** in [`BagMode::Append`] — extend an existing bag
//!
//! ## Example: Writing
//!
//! ```rust,no_run
//! # fn main() -> robobag::Result<()> {
//! use robobag::{Bag, BagMode, CompressionType, Time};
//! use robobag::msg::RawMessage;
//!
//! let mut bag = Bag::new();
//! bag.set_compression(CompressionType::Bz2);
//! bag.open("session.bag", BagMode::Write)?;
//! bag.write("/odom", Time::new(100, 0), &RawMessage::new(vec![0u8; 64]))?;
//! bag.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Example: Reading in time order
//!
//! ```rust,no_run
//! # fn main() -> robobag::Result<()> {
//! use robobag::{Bag, BagMode, Query, View};
//!
//! let mut bag = Bag::new();
//! bag.open("session.bag", BagMode::Read)?;
//! let mut view = View::new();
//! view.add_query(&bag, Query::topics(["/odom"]));
//! for message in &view {
//!     println!("{} {}", message.time(), message.topic());
//! }
//! # Ok(())
//! # }
//! ```

// Core types
pub mod core;

pub use crate::core::{BagError, Result, Time, TIME_MAX, TIME_MIN};

// Data structures
pub mod types;

pub use types::{Buffer, ChunkHeader, ChunkInfo, CompressionType, ConnectionInfo, FieldMap, IndexEntry};

// On-disk building blocks
pub mod io;

pub use io::ChunkedFile;

// Chunk and connection-record encryption
pub mod encrypt;

pub use encrypt::{create_encryptor, register_encryptor, AesGcmEncryptor, Encryptor};

// The engine and its query layer
pub mod bag;

pub use bag::view::{MessageInstance, Query, View, ViewIterator};
pub use bag::{Bag, BagMode};

// Message trait consumed by the engine
pub mod msg;

pub use msg::RosMessage;
