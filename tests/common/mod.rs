// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Common utilities for integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;

use robobag::{BagError, Result, RosMessage};

// ============================================================================
// Temporary files
// ============================================================================

/// Get a temporary directory for test files.
fn temp_dir(prefix: &str) -> PathBuf {
    // Use a combination of process ID and a random element to avoid
    // collisions when tests run in parallel.
    let random = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .subsec_nanos();
    std::env::temp_dir().join(format!("robobag_{}_{}_{}", prefix, std::process::id(), random))
}

/// Create a temporary bag file path and a cleanup guard for the directory.
/// The guard ensures the temporary directory is removed when the test
/// completes.
pub fn temp_bag_path(name: &str) -> (PathBuf, CleanupGuard) {
    let dir = temp_dir(name);
    fs::create_dir_all(&dir).ok();
    let path = dir.join(format!("{}.bag", name));
    let guard = CleanupGuard(dir);
    (path, guard)
}

/// Cleanup guard for test temporary files.
#[derive(Debug)]
pub struct CleanupGuard(PathBuf);

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

// ============================================================================
// Test message types
// ============================================================================

/// Message definition for std_msgs/String.
pub const STD_MSGS_STRING_DEF: &str = "string data";

/// Message definition for std_msgs/Int32.
pub const STD_MSGS_INT32_DEF: &str = "int32 data";

/// A `std_msgs/String`-shaped message: a length-prefixed UTF-8 string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringMsg {
    pub data: String,
}

impl StringMsg {
    pub fn new(data: impl Into<String>) -> Self {
        StringMsg { data: data.into() }
    }
}

impl RosMessage for StringMsg {
    fn datatype() -> &'static str {
        "std_msgs/String"
    }

    fn md5sum() -> &'static str {
        "992ce8a1687cec8c8bd883ec73ca41d1"
    }

    fn definition() -> &'static str {
        STD_MSGS_STRING_DEF
    }

    fn serialized_length(&self) -> u32 {
        4 + self.data.len() as u32
    }

    fn serialize(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(self.data.as_bytes());
        Ok(())
    }

    fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(BagError::format("string message too short"));
        }
        let len = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        if data.len() < 4 + len {
            return Err(BagError::format("string message truncated"));
        }
        let text = std::str::from_utf8(&data[4..4 + len])
            .map_err(|_| BagError::format("string message is not valid UTF-8"))?;
        Ok(StringMsg::new(text))
    }
}

/// A `std_msgs/Int32`-shaped message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Int32Msg {
    pub data: i32,
}

impl Int32Msg {
    pub fn new(data: i32) -> Self {
        Int32Msg { data }
    }
}

impl RosMessage for Int32Msg {
    fn datatype() -> &'static str {
        "std_msgs/Int32"
    }

    fn md5sum() -> &'static str {
        "da5909fbe378aeaf85e547e830cc1bb7"
    }

    fn definition() -> &'static str {
        STD_MSGS_INT32_DEF
    }

    fn serialized_length(&self) -> u32 {
        4
    }

    fn serialize(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.data.to_le_bytes());
        Ok(())
    }

    fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() != 4 {
            return Err(BagError::format("int32 message has the wrong size"));
        }
        Ok(Int32Msg::new(i32::from_le_bytes(data.try_into().unwrap())))
    }
}

// ============================================================================
// Deterministic payloads
// ============================================================================

/// Small deterministic generator so tests can vary payloads and times
/// without pulling in a random number crate.
pub struct TestRng(u32);

impl TestRng {
    pub fn new(seed: u32) -> Self {
        TestRng(seed)
    }

    pub fn next_u32(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        self.0
    }

    pub fn bytes(&mut self, len: usize) -> Vec<u8> {
        (0..len).map(|_| (self.next_u32() >> 24) as u8).collect()
    }
}
