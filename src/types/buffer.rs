// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Reusable byte staging area.
//!
//! A [`Buffer`] is a contiguous byte region with an explicit size. Growing
//! allocates; shrinking only changes the size and keeps the capacity, so a
//! buffer reused across records and chunks settles at its high-water mark
//! instead of reallocating every cycle.

/// A growable byte region with explicit size.
#[derive(Debug, Default)]
pub struct Buffer {
    bytes: Vec<u8>,
}

impl Buffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Buffer { bytes: Vec::new() }
    }

    /// Create an empty buffer with the given capacity pre-allocated.
    pub fn with_capacity(capacity: usize) -> Self {
        Buffer {
            bytes: Vec::with_capacity(capacity),
        }
    }

    /// Current size in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// True if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Allocated capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.bytes.capacity()
    }

    /// The buffer contents.
    pub fn data(&self) -> &[u8] {
        &self.bytes
    }

    /// The buffer contents, mutable.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Resize to `size` bytes. Growth zero-fills; shrinking keeps capacity.
    pub fn set_size(&mut self, size: usize) {
        self.bytes.resize(size, 0);
    }

    /// Reset size to zero, keeping capacity.
    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    /// Append bytes at the end.
    pub fn append(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// Replace the contents.
    pub fn assign(&mut self, data: &[u8]) {
        self.bytes.clear();
        self.bytes.extend_from_slice(data);
    }

    /// Direct access to the backing vector for staging serialized records.
    pub(crate) fn inner_mut(&mut self) -> &mut Vec<u8> {
        &mut self.bytes
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_size_grows_and_zero_fills() {
        let mut buf = Buffer::new();
        buf.set_size(16);
        assert_eq!(buf.size(), 16);
        assert!(buf.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_shrink_keeps_capacity() {
        let mut buf = Buffer::new();
        buf.set_size(4096);
        let cap = buf.capacity();
        buf.set_size(8);
        assert_eq!(buf.size(), 8);
        assert_eq!(buf.capacity(), cap);
        buf.clear();
        assert_eq!(buf.capacity(), cap);
    }

    #[test]
    fn test_append_and_assign() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.append(b"def");
        assert_eq!(buf.data(), b"abcdef");
        buf.assign(b"xyz");
        assert_eq!(buf.data(), b"xyz");
    }
}
