// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Message trait consumed by the engine.
//!
//! The engine never looks inside a payload: it needs the type descriptors
//! for connection records and the serialized bytes for message records.
//! Serialization itself lives with the message types, outside this crate.

use crate::core::Result;

/// A message type that can be stored in and loaded from a bag.
pub trait RosMessage: Sized {
    /// Message type name, e.g. `std_msgs/String`.
    fn datatype() -> &'static str;

    /// MD5 sum of the message schema. `"*"` matches any schema.
    fn md5sum() -> &'static str;

    /// Full text of the message definition.
    fn definition() -> &'static str;

    /// Length of the serialized form in bytes.
    fn serialized_length(&self) -> u32;

    /// Append the serialized form to `out`. Must write exactly
    /// [`RosMessage::serialized_length`] bytes.
    fn serialize(&self, out: &mut Vec<u8>) -> Result<()>;

    /// Reconstruct a message from its serialized form.
    fn deserialize(data: &[u8]) -> Result<Self>;
}

/// An uninterpreted payload: the serialized bytes pass through unchanged.
///
/// Useful for copying messages between bags without knowing their schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// The serialized message bytes.
    pub data: Vec<u8>,
}

impl RawMessage {
    /// Wrap serialized bytes.
    pub fn new(data: Vec<u8>) -> Self {
        RawMessage { data }
    }
}

impl RosMessage for RawMessage {
    fn datatype() -> &'static str {
        "*"
    }

    fn md5sum() -> &'static str {
        "*"
    }

    fn definition() -> &'static str {
        ""
    }

    fn serialized_length(&self) -> u32 {
        self.data.len() as u32
    }

    fn serialize(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.data);
        Ok(())
    }

    fn deserialize(data: &[u8]) -> Result<Self> {
        Ok(RawMessage {
            data: data.to_vec(),
        })
    }
}
