// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! File layer mixing plain and compressed regions.
//!
//! A [`ChunkedFile`] owns a buffered file handle, the logical offset, the
//! active read and write streams and the "unused" region: bytes a
//! compressed decoder pulled from the file but never delivered. Swapping
//! streams hands that region to the next stream, which must consume it
//! before issuing its own file reads; seeking discards it, since it is
//! read-ahead of a position the caller is abandoning.
//!
//! Record headers are read and written a few bytes at a time, so the
//! handle buffers both directions ([`BufFile`]) instead of hitting the OS
//! per field.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::core::{BagError, Result};
use crate::io::stream::{ReadStream, WriteStream, READ_BLOCK_SIZE};
use crate::types::CompressionType;

/// Buffer size of [`BufFile`], each direction.
const FILE_BUFFER_SIZE: usize = 8 * 1024;

/// Reads and writes files containing interleaved compressed and
/// uncompressed regions.
pub struct ChunkedFile {
    filename: PathBuf,
    file: Option<BufFile>,
    /// Current position in the file.
    offset: u64,
    /// Logical bytes fed to the current compressed write stream.
    compressed_in: u64,
    /// Extra data read ahead by a compressed stream.
    unused: Vec<u8>,
    read_stream: ReadStream,
    write_stream: WriteStream,
}

impl Default for ChunkedFile {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedFile {
    /// Create a closed chunked file.
    pub fn new() -> Self {
        ChunkedFile {
            filename: PathBuf::new(),
            file: None,
            offset: 0,
            compressed_in: 0,
            unused: Vec::new(),
            read_stream: ReadStream::Uncompressed,
            write_stream: WriteStream::Uncompressed,
        }
    }

    /// Open `path` for writing, truncating any existing file.
    pub fn open_write(&mut self, path: &Path) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| BagError::io(format!("failed to open {} for writing: {e}", path.display())))?;
        self.attach(path, file);
        Ok(())
    }

    /// Open `path` for reading.
    pub fn open_read(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path)
            .map_err(|e| BagError::io(format!("failed to open {} for reading: {e}", path.display())))?;
        self.attach(path, file);
        Ok(())
    }

    /// Open `path` for reading and writing, preserving existing content.
    pub fn open_read_write(&mut self, path: &Path) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                BagError::io(format!(
                    "failed to open {} for appending: {e}",
                    path.display()
                ))
            })?;
        self.attach(path, file);
        Ok(())
    }

    fn attach(&mut self, path: &Path, file: File) {
        self.filename = path.to_path_buf();
        self.file = Some(BufFile::new(file));
        self.offset = 0;
        self.compressed_in = 0;
        self.unused.clear();
        self.read_stream = ReadStream::Uncompressed;
        self.write_stream = WriteStream::Uncompressed;
    }

    /// Close the file, finalizing any active write stream.
    pub fn close(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        self.set_write_mode(CompressionType::Uncompressed)?;
        if let Some(mut file) = self.file.take() {
            file.sync_all()
                .map_err(|e| BagError::io(format!("failed to sync file: {e}")))?;
        }
        self.unused.clear();
        Ok(())
    }

    /// Path of the currently open file.
    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// True if the file is open.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Current offset from the beginning of the file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Logical bytes written to the current compressed write stream.
    pub fn compressed_bytes_in(&self) -> u64 {
        self.compressed_in
    }

    fn file_mut(&mut self) -> Result<&mut BufFile> {
        self.file
            .as_mut()
            .ok_or_else(|| BagError::bag("file is not open"))
    }

    /// Size of the file on disk. A lower bound while buffered writes are
    /// pending.
    pub fn file_size(&self) -> Result<u64> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| BagError::bag("file is not open"))?;
        file.len()
            .map_err(|e| BagError::io(format!("failed to stat file: {e}")))
    }

    // -----------------------------------------------------------------------
    // Stream selection
    // -----------------------------------------------------------------------

    /// Switch the write stream. Finalizes the previous compressed stream,
    /// flushing its tail to the file.
    pub fn set_write_mode(&mut self, compression: CompressionType) -> Result<()> {
        if self.write_stream.compression_type() == compression {
            return Ok(());
        }
        let mut tail = Vec::new();
        self.write_stream.finish(&mut tail)?;
        if !tail.is_empty() {
            self.write_raw(&tail)?;
        }
        self.write_stream = WriteStream::new(compression);
        self.compressed_in = 0;
        Ok(())
    }

    /// Switch the read stream. Unconsumed read-ahead of the previous stream
    /// becomes the unused region for the next one.
    pub fn set_read_mode(&mut self, compression: CompressionType) {
        if self.read_stream.compression_type() == compression {
            return;
        }
        let mut leftover = self.read_stream.take_leftover();
        if !leftover.is_empty() {
            leftover.extend_from_slice(&self.unused);
            self.unused = leftover;
        }
        self.read_stream = ReadStream::new(compression);
    }

    // -----------------------------------------------------------------------
    // Writing
    // -----------------------------------------------------------------------

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let file = self.file_mut()?;
        file.write_all(data)
            .map_err(|e| BagError::io(format!("error writing to file: {e}")))?;
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Write through the active write stream. The offset advances by the
    /// bytes that actually reached the file, which for a compressor is
    /// fewer than `data.len()`.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        match self.write_stream {
            WriteStream::Uncompressed => self.write_raw(data),
            _ => {
                let mut produced = Vec::new();
                self.write_stream.write(data, &mut produced)?;
                self.compressed_in += data.len() as u64;
                if produced.is_empty() {
                    Ok(())
                } else {
                    self.write_raw(&produced)
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    fn read_raw(&mut self, out: &mut [u8]) -> Result<usize> {
        let file = self.file_mut()?;
        let filled = file
            .read(out)
            .map_err(|e| BagError::io(format!("error reading from file: {e}")))?;
        self.offset += filled as u64;
        Ok(filled)
    }

    /// Read exactly `out.len()` logical bytes through the active read
    /// stream.
    pub fn read(&mut self, out: &mut [u8]) -> Result<()> {
        match self.read_stream {
            ReadStream::Uncompressed => self.read_plain(out),
            _ => self.read_decompressed(out),
        }
    }

    /// Uncompressed read: unused bytes from a previous compressed stream
    /// are consumed before touching the file.
    fn read_plain(&mut self, out: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        if !self.unused.is_empty() {
            let n = out.len().min(self.unused.len());
            out[..n].copy_from_slice(&self.unused[..n]);
            self.unused.drain(..n);
            filled = n;
        }
        if filled < out.len() {
            let want = out.len() - filled;
            let got = self.read_raw(&mut out[filled..])?;
            if got != want {
                return Err(BagError::io(format!(
                    "error reading from file: wanted {want} bytes, read {got} bytes"
                )));
            }
        }
        Ok(())
    }

    fn read_decompressed(&mut self, out: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            let n = self.read_stream.read(&mut out[filled..])?;
            filled += n;
            if n == 0 {
                if self.read_stream.finished() {
                    return Err(BagError::io(format!(
                        "compressed stream ended early: wanted {} bytes, got {filled}",
                        out.len()
                    )));
                }
                // Decoder starved: feed it from the unused region first,
                // then from the file.
                if !self.unused.is_empty() {
                    let take = self.unused.len().min(READ_BLOCK_SIZE);
                    let block: Vec<u8> = self.unused.drain(..take).collect();
                    self.read_stream.feed(&block);
                    continue;
                }
                let mut block = [0u8; READ_BLOCK_SIZE];
                let got = self.read_raw(&mut block)?;
                if got == 0 {
                    return Err(BagError::io(format!(
                        "compressed stream ended early: wanted {} bytes, got {filled}",
                        out.len()
                    )));
                }
                self.read_stream.feed(&block[..got]);
            }
        }
        Ok(())
    }

    /// Read a line terminated by `\n` through the plain stream.
    pub fn getline(&mut self) -> Result<String> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.read_plain(&mut byte)?;
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
            if line.len() > 256 {
                return Err(BagError::format("missing line terminator"));
            }
        }
        String::from_utf8(line).map_err(|_| BagError::format("line is not valid UTF-8"))
    }

    // -----------------------------------------------------------------------
    // Positioning
    // -----------------------------------------------------------------------

    /// Seek to a position. Finalizes any active write stream and discards
    /// unused read-ahead.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<()> {
        self.set_write_mode(CompressionType::Uncompressed)?;
        self.set_read_mode(CompressionType::Uncompressed);
        self.unused.clear();
        let file = self.file_mut()?;
        let offset = file
            .seek(pos)
            .map_err(|e| BagError::io(format!("seek failed: {e}")))?;
        self.offset = offset;
        Ok(())
    }

    /// Truncate the file to `length` bytes.
    pub fn truncate(&mut self, length: u64) -> Result<()> {
        let file = self.file_mut()?;
        file.set_len(length)
            .map_err(|e| BagError::io(format!("truncate failed: {e}")))?;
        if self.offset > length {
            self.seek(SeekFrom::Start(length))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Buffered handle
// ---------------------------------------------------------------------------

/// A stdio-style buffered file handle.
///
/// One buffer per direction, at most one non-empty at a time: a read
/// flushes pending writes first, a write rewinds unconsumed read-ahead
/// first, and seeks do both, so the physical cursor always matches the
/// logical position before it moves. This is the discipline `FILE*` gives
/// C callers for free.
struct BufFile {
    file: File,
    /// Written bytes not yet handed to the OS.
    write_buf: Vec<u8>,
    /// Read-ahead pulled from the OS.
    read_buf: Vec<u8>,
    read_pos: usize,
}

impl BufFile {
    fn new(file: File) -> Self {
        BufFile {
            file,
            write_buf: Vec::with_capacity(FILE_BUFFER_SIZE),
            read_buf: Vec::new(),
            read_pos: 0,
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.write_buf.is_empty() {
            self.file.write_all(&self.write_buf)?;
            self.write_buf.clear();
        }
        Ok(())
    }

    /// Move the physical cursor back over unconsumed read-ahead so it
    /// matches the logical position.
    fn rewind_read_ahead(&mut self) -> std::io::Result<()> {
        let pending = self.read_buf.len() - self.read_pos;
        if pending > 0 {
            self.file.seek(SeekFrom::Current(-(pending as i64)))?;
        }
        self.read_buf.clear();
        self.read_pos = 0;
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.rewind_read_ahead()?;
        if self.write_buf.len() + data.len() > FILE_BUFFER_SIZE {
            self.flush()?;
        }
        if data.len() > FILE_BUFFER_SIZE {
            self.file.write_all(data)
        } else {
            self.write_buf.extend_from_slice(data);
            Ok(())
        }
    }

    /// Fill as much of `out` as possible; short only at end of file.
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        self.flush()?;
        let mut filled = 0;
        while filled < out.len() {
            if self.read_pos < self.read_buf.len() {
                let n = (out.len() - filled).min(self.read_buf.len() - self.read_pos);
                out[filled..filled + n]
                    .copy_from_slice(&self.read_buf[self.read_pos..self.read_pos + n]);
                self.read_pos += n;
                filled += n;
                continue;
            }
            // Large requests bypass the buffer once it is drained.
            if out.len() - filled >= FILE_BUFFER_SIZE {
                let got = self.file.read(&mut out[filled..])?;
                if got == 0 {
                    break;
                }
                filled += got;
                continue;
            }
            self.read_buf.resize(FILE_BUFFER_SIZE, 0);
            let got = self.file.read(&mut self.read_buf)?;
            self.read_buf.truncate(got);
            self.read_pos = 0;
            if got == 0 {
                break;
            }
        }
        Ok(filled)
    }

    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.flush()?;
        self.rewind_read_ahead()?;
        self.file.seek(pos)
    }

    fn set_len(&mut self, length: u64) -> std::io::Result<()> {
        self.flush()?;
        self.rewind_read_ahead()?;
        self.file.set_len(length)
    }

    /// Size on disk, not counting unflushed writes.
    fn len(&self) -> std::io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn sync_all(&mut self) -> std::io::Result<()> {
        self.flush()?;
        self.file.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        let random = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .subsec_nanos();
        std::env::temp_dir().join(format!(
            "robobag_chunked_file_{}_{}_{}",
            std::process::id(),
            random,
            name
        ))
    }

    #[test]
    fn test_plain_write_read_seek() {
        let path = temp_path("plain");
        let mut file = ChunkedFile::new();
        file.open_write(&path).unwrap();
        file.write(b"hello world").unwrap();
        assert_eq!(file.offset(), 11);

        file.seek(SeekFrom::Start(6)).unwrap();
        let mut out = [0u8; 5];
        file.read(&mut out).unwrap();
        assert_eq!(&out, b"world");

        file.close().unwrap();
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_compressed_write_then_plain_tail() {
        // A compressed region followed by a plain region; reading the
        // compressed part through the stream must hand its read-ahead to
        // the plain read that follows.
        let path = temp_path("mixed");
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();

        let mut file = ChunkedFile::new();
        file.open_write(&path).unwrap();
        file.set_write_mode(CompressionType::Bz2).unwrap();
        file.write(&payload).unwrap();
        assert_eq!(file.compressed_bytes_in(), payload.len() as u64);
        file.set_write_mode(CompressionType::Uncompressed).unwrap();
        let compressed_len = file.offset();
        assert!(compressed_len < payload.len() as u64);
        file.write(b"PLAIN-TAIL").unwrap();
        file.close().unwrap();

        let mut file = ChunkedFile::new();
        file.open_read(&path).unwrap();
        file.set_read_mode(CompressionType::Bz2);
        let mut restored = vec![0u8; payload.len()];
        file.read(&mut restored).unwrap();
        assert_eq!(restored, payload);

        // The decoder over-read into the plain tail; switching back must
        // not lose those bytes.
        file.set_read_mode(CompressionType::Uncompressed);
        let mut tail = [0u8; 10];
        file.read(&mut tail).unwrap();
        assert_eq!(&tail, b"PLAIN-TAIL");

        file.close().unwrap();
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_lz4_region_round_trip() {
        let path = temp_path("lz4");
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 13) as u8).collect();

        let mut file = ChunkedFile::new();
        file.open_write(&path).unwrap();
        file.set_write_mode(CompressionType::Lz4).unwrap();
        file.write(&payload).unwrap();
        file.set_write_mode(CompressionType::Uncompressed).unwrap();
        file.write(b"END").unwrap();
        file.close().unwrap();

        let mut file = ChunkedFile::new();
        file.open_read(&path).unwrap();
        file.set_read_mode(CompressionType::Lz4);
        let mut restored = vec![0u8; payload.len()];
        file.read(&mut restored).unwrap();
        assert_eq!(restored, payload);
        file.set_read_mode(CompressionType::Uncompressed);
        let mut tail = [0u8; 3];
        file.read(&mut tail).unwrap();
        assert_eq!(&tail, b"END");

        file.close().unwrap();
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_seek_discards_unused() {
        let path = temp_path("seek");
        let mut file = ChunkedFile::new();
        file.open_write(&path).unwrap();
        file.set_write_mode(CompressionType::Bz2).unwrap();
        file.write(b"some compressed bytes").unwrap();
        file.set_write_mode(CompressionType::Uncompressed).unwrap();
        file.write(b"0123456789").unwrap();
        let plain_start = file.offset() - 10;
        file.close().unwrap();

        let mut file = ChunkedFile::new();
        file.open_read(&path).unwrap();
        file.set_read_mode(CompressionType::Bz2);
        let mut out = [0u8; 21];
        file.read(&mut out).unwrap();
        // Abandon the read-ahead and jump straight to the plain region.
        file.seek(SeekFrom::Start(plain_start)).unwrap();
        let mut tail = [0u8; 10];
        file.read(&mut tail).unwrap();
        assert_eq!(&tail, b"0123456789");

        file.close().unwrap();
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_truncate_and_getline() {
        let path = temp_path("trunc");
        let mut file = ChunkedFile::new();
        file.open_write(&path).unwrap();
        file.write(b"first line\nsecond line\n").unwrap();
        file.truncate(11).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(file.getline().unwrap(), "first line");
        let mut one = [0u8; 1];
        assert!(file.read(&mut one).is_err());
        file.close().unwrap();
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_relative_seek_sees_buffered_writes() {
        // Small writes stay in the write buffer; a relative seek must
        // account for them before the cursor moves.
        let path = temp_path("relseek");
        let mut file = ChunkedFile::new();
        file.open_write(&path).unwrap();
        for chunk in [b"0123".as_slice(), b"45", b"6789"] {
            file.write(chunk).unwrap();
        }
        assert_eq!(file.offset(), 10);
        file.seek(SeekFrom::Current(-4)).unwrap();
        assert_eq!(file.offset(), 6);
        let mut tail = [0u8; 4];
        file.read(&mut tail).unwrap();
        assert_eq!(&tail, b"6789");
        file.close().unwrap();
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_interleaved_small_records_round_trip() {
        // Many tiny writes and reads, the record-header access pattern.
        let path = temp_path("interleave");
        let mut file = ChunkedFile::new();
        file.open_write(&path).unwrap();
        for i in 0..500u32 {
            file.write(&i.to_le_bytes()).unwrap();
        }
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut word = [0u8; 4];
        for i in 0..500u32 {
            file.read(&mut word).unwrap();
            assert_eq!(u32::from_le_bytes(word), i);
        }
        file.close().unwrap();
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_read_past_end_fails() {
        let path = temp_path("eof");
        let mut file = ChunkedFile::new();
        file.open_write(&path).unwrap();
        file.write(b"abc").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut out = [0u8; 10];
        assert!(file.read(&mut out).is_err());
        file.close().unwrap();
        let _ = fs::remove_file(&path);
    }
}
