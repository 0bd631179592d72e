// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Error types for the bag storage engine.
//!
//! Four error kinds cover every failure mode of the engine:
//! - [`BagError::Bag`] — invariant violations (write after close, bad mode)
//! - [`BagError::Io`] — underlying file read/write failures and short writes
//! - [`BagError::Format`] — malformed records, bad magic, unknown versions
//! - [`BagError::Unindexed`] — the file ends before its index trailer

use thiserror::Error;

/// Errors that can occur while reading, writing or appending a bag file.
#[derive(Debug, Error)]
pub enum BagError {
    /// Generic invariant violation, e.g. writing to a closed bag.
    #[error("bag error: {0}")]
    Bag(String),

    /// Underlying file I/O failed or wrote fewer bytes than requested.
    #[error("bag I/O error: {0}")]
    Io(String),

    /// The on-disk content does not match the bag format.
    #[error("bag format error: {0}")]
    Format(String),

    /// The file has no index trailer (interrupted write or truncation).
    /// Recoverable by an external reindex tool.
    #[error("bag is unindexed: {0}")]
    Unindexed(String),
}

impl BagError {
    /// Create a generic bag error.
    pub fn bag(message: impl Into<String>) -> Self {
        BagError::Bag(message.into())
    }

    /// Create an I/O error.
    pub fn io(message: impl Into<String>) -> Self {
        BagError::Io(message.into())
    }

    /// Create a format error.
    pub fn format(message: impl Into<String>) -> Self {
        BagError::Format(message.into())
    }

    /// Create an unindexed error.
    pub fn unindexed(message: impl Into<String>) -> Self {
        BagError::Unindexed(message.into())
    }
}

impl From<std::io::Error> for BagError {
    fn from(err: std::io::Error) -> Self {
        BagError::Io(err.to_string())
    }
}

/// Result type for all bag operations.
pub type Result<T> = std::result::Result<T, BagError>;
