// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Compression streams for chunk bodies.
//!
//! The bag format stores chunk bodies either raw or compressed with bzip2
//! or LZ4. Both compressed variants are incremental state machines rather
//! than `Read`/`Write` wrappers: the encoders hand each run of produced
//! bytes back to the [`ChunkedFile`](crate::io::chunked_file::ChunkedFile)
//! so the file offset advances by the bytes actually written, and the
//! decoders buffer their input explicitly so the exact unconsumed tail can
//! be handed back as the file's "unused" region when streams are swapped.
//! Losing that tail silently corrupts whatever is read next.
//!
//! LZ4 data is carried in the LZ4 frame format: magic, FLG/BD descriptor
//! with xxh32 header checksum, independent blocks of at most 64KB, and a
//! zero end mark. Optional block and content checksums are accepted on
//! read and skipped.

use bzip2::{Action, Compress, Compression, Decompress, Status};
use xxhash_rust::xxh32::xxh32;

use crate::core::{BagError, Result};
use crate::types::CompressionType;

/// LZ4 frame magic number.
const LZ4_MAGIC: u32 = 0x184D_2204;

/// FLG byte written by the encoder: version 01, independent blocks,
/// no checksums, no content size, no dictionary.
const LZ4_FLG: u8 = 0x60;

/// BD byte written by the encoder: 64KB maximum block size.
const LZ4_BD: u8 = 0x40;

/// Uncompressed payload of one encoded LZ4 block.
const LZ4_BLOCK_SIZE: usize = 64 * 1024;

/// High bit of a block size word marks a stored (uncompressed) block.
const LZ4_UNCOMPRESSED_FLAG: u32 = 0x8000_0000;

/// bzip2 work factor, matching the reference encoder default.
const BZ2_WORK_FACTOR: u32 = 30;

/// How much file data a read stream pulls per refill.
pub const READ_BLOCK_SIZE: usize = 4096;

// ---------------------------------------------------------------------------
// Write streams
// ---------------------------------------------------------------------------

/// An incremental compressor for one chunk body.
///
/// `write` consumes logical bytes and appends whatever compressed bytes are
/// ready to `out`; `finish` flushes the tail. The uncompressed variant is
/// handled by the file layer directly and never constructed here.
pub enum WriteStream {
    /// Pass-through; the file layer writes without staging.
    Uncompressed,
    /// bzip2 state machine.
    Bz2(Bz2Encoder),
    /// LZ4 frame encoder.
    Lz4(Lz4Encoder),
}

impl WriteStream {
    /// Build the write stream for a compression tag.
    pub fn new(compression: CompressionType) -> Self {
        match compression {
            CompressionType::Uncompressed => WriteStream::Uncompressed,
            CompressionType::Bz2 => WriteStream::Bz2(Bz2Encoder::new()),
            CompressionType::Lz4 => WriteStream::Lz4(Lz4Encoder::new()),
        }
    }

    /// The tag this stream compresses to.
    pub fn compression_type(&self) -> CompressionType {
        match self {
            WriteStream::Uncompressed => CompressionType::Uncompressed,
            WriteStream::Bz2(_) => CompressionType::Bz2,
            WriteStream::Lz4(_) => CompressionType::Lz4,
        }
    }

    /// Consume `data`, appending any produced compressed bytes to `out`.
    pub fn write(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        match self {
            WriteStream::Uncompressed => {
                out.extend_from_slice(data);
                Ok(())
            }
            WriteStream::Bz2(enc) => enc.write(data, out),
            WriteStream::Lz4(enc) => enc.write(data, out),
        }
    }

    /// Finalize the stream, appending the trailing compressed bytes to `out`.
    pub fn finish(&mut self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            WriteStream::Uncompressed => Ok(()),
            WriteStream::Bz2(enc) => enc.finish(out),
            WriteStream::Lz4(enc) => enc.finish(out),
        }
    }
}

/// Incremental bzip2 encoder.
pub struct Bz2Encoder {
    compress: Compress,
    finished: bool,
}

impl Bz2Encoder {
    fn new() -> Self {
        Bz2Encoder {
            compress: Compress::new(Compression::best(), BZ2_WORK_FACTOR),
            finished: false,
        }
    }

    fn write(&mut self, mut data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let mut scratch = [0u8; READ_BLOCK_SIZE];
        while !data.is_empty() {
            let before_in = self.compress.total_in();
            let before_out = self.compress.total_out();
            self.compress
                .compress(data, &mut scratch, Action::Run)
                .map_err(|e| BagError::bag(format!("bzip2 compression failed: {e}")))?;
            let consumed = (self.compress.total_in() - before_in) as usize;
            let produced = (self.compress.total_out() - before_out) as usize;
            out.extend_from_slice(&scratch[..produced]);
            data = &data[consumed..];
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        let mut scratch = [0u8; READ_BLOCK_SIZE];
        loop {
            let before_out = self.compress.total_out();
            let status = self
                .compress
                .compress(&[], &mut scratch, Action::Finish)
                .map_err(|e| BagError::bag(format!("bzip2 compression failed: {e}")))?;
            let produced = (self.compress.total_out() - before_out) as usize;
            out.extend_from_slice(&scratch[..produced]);
            if status == Status::StreamEnd {
                break;
            }
        }
        self.finished = true;
        Ok(())
    }
}

/// Incremental LZ4 frame encoder with 64KB independent blocks.
pub struct Lz4Encoder {
    pending: Vec<u8>,
    header_written: bool,
    finished: bool,
}

impl Lz4Encoder {
    fn new() -> Self {
        Lz4Encoder {
            pending: Vec::new(),
            header_written: false,
            finished: false,
        }
    }

    fn write_frame_header(out: &mut Vec<u8>) {
        out.extend_from_slice(&LZ4_MAGIC.to_le_bytes());
        out.push(LZ4_FLG);
        out.push(LZ4_BD);
        out.push((xxh32(&[LZ4_FLG, LZ4_BD], 0) >> 8) as u8);
    }

    fn write_block(block: &[u8], out: &mut Vec<u8>) {
        let compressed = lz4_flex::block::compress(block);
        if compressed.len() < block.len() {
            out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
            out.extend_from_slice(&compressed);
        } else {
            // Incompressible; store raw.
            out.extend_from_slice(&(block.len() as u32 | LZ4_UNCOMPRESSED_FLAG).to_le_bytes());
            out.extend_from_slice(block);
        }
    }

    fn write(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        if !self.header_written {
            Self::write_frame_header(out);
            self.header_written = true;
        }
        self.pending.extend_from_slice(data);
        while self.pending.len() >= LZ4_BLOCK_SIZE {
            let rest = self.pending.split_off(LZ4_BLOCK_SIZE);
            Self::write_block(&self.pending, out);
            self.pending = rest;
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if !self.header_written {
            Self::write_frame_header(out);
            self.header_written = true;
        }
        if !self.pending.is_empty() {
            Self::write_block(&self.pending, out);
            self.pending.clear();
        }
        out.extend_from_slice(&0u32.to_le_bytes());
        self.finished = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Read streams
// ---------------------------------------------------------------------------

/// An incremental decompressor for logical reads from the file.
///
/// The file layer feeds raw file bytes in with [`ReadStream::feed`] and
/// drains decoded bytes with [`ReadStream::read`]; whatever input the
/// decoder holds but has not consumed is recovered with
/// [`ReadStream::take_leftover`] when the stream is swapped out.
pub enum ReadStream {
    /// Pass-through; the file layer reads without staging.
    Uncompressed,
    /// bzip2 state machine.
    Bz2(Bz2Decoder),
    /// LZ4 frame decoder.
    Lz4(Lz4Decoder),
}

impl ReadStream {
    /// Build the read stream for a compression tag.
    pub fn new(compression: CompressionType) -> Self {
        match compression {
            CompressionType::Uncompressed => ReadStream::Uncompressed,
            CompressionType::Bz2 => ReadStream::Bz2(Bz2Decoder::new()),
            CompressionType::Lz4 => ReadStream::Lz4(Lz4Decoder::new()),
        }
    }

    /// The tag this stream decompresses from.
    pub fn compression_type(&self) -> CompressionType {
        match self {
            ReadStream::Uncompressed => CompressionType::Uncompressed,
            ReadStream::Bz2(_) => CompressionType::Bz2,
            ReadStream::Lz4(_) => CompressionType::Lz4,
        }
    }

    /// Hand raw file bytes to the decoder.
    pub fn feed(&mut self, input: &[u8]) {
        match self {
            ReadStream::Uncompressed => unreachable!("uncompressed reads bypass the stream"),
            ReadStream::Bz2(dec) => dec.feed(input),
            ReadStream::Lz4(dec) => dec.feed(input),
        }
    }

    /// Decode into `out`, returning the number of bytes produced. Zero
    /// means the decoder needs more input (or the stream has ended).
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        match self {
            ReadStream::Uncompressed => unreachable!("uncompressed reads bypass the stream"),
            ReadStream::Bz2(dec) => dec.read(out),
            ReadStream::Lz4(dec) => dec.read(out),
        }
    }

    /// True once the underlying compressed stream has ended.
    pub fn finished(&self) -> bool {
        match self {
            ReadStream::Uncompressed => false,
            ReadStream::Bz2(dec) => dec.done,
            ReadStream::Lz4(dec) => matches!(dec.state, Lz4State::Done),
        }
    }

    /// Input bytes the decoder pulled but never consumed, in file order.
    ///
    /// If the caller consumed the stream exactly, the trailing end-of-stream
    /// bookkeeping is drained from the buffered input first, so the leftover
    /// starts at the first byte past the compressed region. A stream
    /// abandoned mid-way leaves whatever the decoder happened to hold; the
    /// caller is expected to seek, which discards it.
    pub fn take_leftover(&mut self) -> Vec<u8> {
        match self {
            ReadStream::Uncompressed => Vec::new(),
            ReadStream::Bz2(dec) => {
                dec.drain_stream_end();
                dec.take_leftover()
            }
            ReadStream::Lz4(dec) => {
                dec.drain_stream_end();
                dec.take_leftover()
            }
        }
    }
}

/// Incremental bzip2 decoder with explicit input buffering.
pub struct Bz2Decoder {
    decompress: Decompress,
    in_buf: Vec<u8>,
    in_pos: usize,
    done: bool,
}

impl Bz2Decoder {
    fn new() -> Self {
        Bz2Decoder {
            decompress: Decompress::new(false),
            in_buf: Vec::new(),
            in_pos: 0,
            done: false,
        }
    }

    fn feed(&mut self, input: &[u8]) {
        self.in_buf.drain(..self.in_pos);
        self.in_pos = 0;
        self.in_buf.extend_from_slice(input);
    }

    fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.done || out.is_empty() {
            return Ok(0);
        }
        let before_in = self.decompress.total_in();
        let before_out = self.decompress.total_out();
        let status = self
            .decompress
            .decompress(&self.in_buf[self.in_pos..], out)
            .map_err(|e| BagError::format(format!("bzip2 decompression failed: {e}")))?;
        self.in_pos += (self.decompress.total_in() - before_in) as usize;
        if status == Status::StreamEnd {
            self.done = true;
        }
        Ok((self.decompress.total_out() - before_out) as usize)
    }

    /// Consume the stream trailer if the caller read the stream exactly.
    /// Stops as soon as further input would produce output.
    fn drain_stream_end(&mut self) {
        let mut scratch = [0u8; 64];
        while !self.done && self.in_pos < self.in_buf.len() {
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status = match self.decompress.decompress(&self.in_buf[self.in_pos..], &mut scratch)
            {
                Ok(status) => status,
                Err(_) => break,
            };
            self.in_pos += (self.decompress.total_in() - before_in) as usize;
            if status == Status::StreamEnd {
                self.done = true;
            }
            if self.decompress.total_out() > before_out || self.decompress.total_in() == before_in {
                break;
            }
        }
    }

    fn take_leftover(&mut self) -> Vec<u8> {
        let leftover = self.in_buf[self.in_pos..].to_vec();
        self.in_buf.clear();
        self.in_pos = 0;
        leftover
    }
}

/// Decode state of the LZ4 frame parser.
enum Lz4State {
    /// Waiting for the frame descriptor.
    Header,
    /// Waiting for the next block size word.
    BlockSize,
    /// Waiting for a block body (and its checksum, if present).
    BlockData { stored: bool, len: usize },
    /// Waiting for the content checksum after the end mark.
    ContentChecksum,
    /// End mark consumed.
    Done,
}

/// Incremental LZ4 frame decoder with explicit input buffering.
///
/// Requires independent blocks (what the encoder emits); block-linked
/// frames are rejected. Block and content checksums are skipped.
pub struct Lz4Decoder {
    state: Lz4State,
    in_buf: Vec<u8>,
    in_pos: usize,
    out_buf: Vec<u8>,
    out_pos: usize,
    block_checksums: bool,
    content_checksum: bool,
    max_block_size: usize,
}

impl Lz4Decoder {
    fn new() -> Self {
        Lz4Decoder {
            state: Lz4State::Header,
            in_buf: Vec::new(),
            in_pos: 0,
            out_buf: Vec::new(),
            out_pos: 0,
            block_checksums: false,
            content_checksum: false,
            max_block_size: LZ4_BLOCK_SIZE,
        }
    }

    fn feed(&mut self, input: &[u8]) {
        self.in_buf.drain(..self.in_pos);
        self.in_pos = 0;
        self.in_buf.extend_from_slice(input);
    }

    fn available(&self) -> usize {
        self.in_buf.len() - self.in_pos
    }

    fn take(&mut self, n: usize) -> &[u8] {
        let start = self.in_pos;
        self.in_pos += n;
        &self.in_buf[start..start + n]
    }

    /// Try to advance the state machine once. Returns false if more input
    /// is needed.
    fn step(&mut self) -> Result<bool> {
        match self.state {
            Lz4State::Header => {
                if self.available() < 6 {
                    return Ok(false);
                }
                let at = self.in_pos;
                let flg = self.in_buf[at + 4];
                // Descriptor length depends on the flag bits.
                let mut descriptor_len = 2usize;
                if flg & 0x08 != 0 {
                    descriptor_len += 8; // content size
                }
                if flg & 0x01 != 0 {
                    descriptor_len += 4; // dictionary id
                }
                if self.available() < 4 + descriptor_len + 1 {
                    return Ok(false);
                }
                let magic = u32::from_le_bytes(self.in_buf[at..at + 4].try_into().unwrap());
                if magic != LZ4_MAGIC {
                    return Err(BagError::format(format!(
                        "bad lz4 frame magic 0x{magic:08x}"
                    )));
                }
                if (flg >> 6) & 0x03 != 0x01 {
                    return Err(BagError::format("unsupported lz4 frame version"));
                }
                if flg & 0x20 == 0 {
                    return Err(BagError::format(
                        "lz4 frames with linked blocks are not supported",
                    ));
                }
                let bd = self.in_buf[at + 5];
                let bs_code = (bd >> 4) & 0x07;
                if !(4..=7).contains(&bs_code) {
                    return Err(BagError::format(format!(
                        "invalid lz4 block size code {bs_code}"
                    )));
                }
                let descriptor = &self.in_buf[at + 4..at + 4 + descriptor_len];
                let hc = self.in_buf[at + 4 + descriptor_len];
                if (xxh32(descriptor, 0) >> 8) as u8 != hc {
                    return Err(BagError::format("lz4 frame header checksum mismatch"));
                }
                self.block_checksums = flg & 0x10 != 0;
                self.content_checksum = flg & 0x04 != 0;
                self.max_block_size = 1usize << (bs_code * 2 + 8);
                self.in_pos = at + 4 + descriptor_len + 1;
                self.state = Lz4State::BlockSize;
                Ok(true)
            }
            Lz4State::BlockSize => {
                if self.available() < 4 {
                    return Ok(false);
                }
                let word = u32::from_le_bytes(self.take(4).try_into().unwrap());
                if word == 0 {
                    if self.content_checksum {
                        self.state = Lz4State::ContentChecksum;
                    } else {
                        self.state = Lz4State::Done;
                    }
                    return Ok(true);
                }
                let stored = word & LZ4_UNCOMPRESSED_FLAG != 0;
                let len = (word & !LZ4_UNCOMPRESSED_FLAG) as usize;
                if len > self.max_block_size.max(lz4_compress_bound(self.max_block_size)) {
                    return Err(BagError::format(format!("lz4 block too large: {len}")));
                }
                self.state = Lz4State::BlockData { stored, len };
                Ok(true)
            }
            Lz4State::BlockData { stored, len } => {
                let needed = len + if self.block_checksums { 4 } else { 0 };
                if self.available() < needed {
                    return Ok(false);
                }
                let start = self.in_pos;
                let block = &self.in_buf[start..start + len];
                if stored {
                    self.out_buf.extend_from_slice(block);
                } else {
                    let mut scratch = vec![0u8; self.max_block_size];
                    let n = lz4_flex::block::decompress_into(block, &mut scratch)
                        .map_err(|e| BagError::format(format!("lz4 block decode failed: {e}")))?;
                    self.out_buf.extend_from_slice(&scratch[..n]);
                }
                self.in_pos = start + needed;
                self.state = Lz4State::BlockSize;
                Ok(true)
            }
            Lz4State::ContentChecksum => {
                if self.available() < 4 {
                    return Ok(false);
                }
                self.take(4);
                self.state = Lz4State::Done;
                Ok(true)
            }
            Lz4State::Done => Ok(false),
        }
    }

    fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        loop {
            if self.out_pos < self.out_buf.len() {
                let n = out.len().min(self.out_buf.len() - self.out_pos);
                out[..n].copy_from_slice(&self.out_buf[self.out_pos..self.out_pos + n]);
                self.out_pos += n;
                if self.out_pos == self.out_buf.len() {
                    self.out_buf.clear();
                    self.out_pos = 0;
                }
                return Ok(n);
            }
            if !self.step()? {
                return Ok(0);
            }
        }
    }

    /// Consume the end mark (and content checksum) if the caller read the
    /// stream exactly. Never decodes further blocks.
    fn drain_stream_end(&mut self) {
        if self.out_pos < self.out_buf.len() {
            return;
        }
        if let Lz4State::BlockSize = self.state {
            if self.available() >= 4 {
                let at = self.in_pos;
                let word = u32::from_le_bytes(self.in_buf[at..at + 4].try_into().unwrap());
                if word == 0 {
                    self.in_pos += 4;
                    self.state = if self.content_checksum {
                        Lz4State::ContentChecksum
                    } else {
                        Lz4State::Done
                    };
                }
            }
        }
        if let Lz4State::ContentChecksum = self.state {
            if self.available() >= 4 {
                self.in_pos += 4;
                self.state = Lz4State::Done;
            }
        }
    }

    fn take_leftover(&mut self) -> Vec<u8> {
        let leftover = self.in_buf[self.in_pos..].to_vec();
        self.in_buf.clear();
        self.in_pos = 0;
        leftover
    }
}

/// Worst-case compressed size of an LZ4 block.
fn lz4_compress_bound(len: usize) -> usize {
    len + len / 255 + 16
}

// ---------------------------------------------------------------------------
// One-shot helpers
// ---------------------------------------------------------------------------

/// Compress a whole chunk body in memory. Used when an encryptor must see
/// the compressed bytes before they reach the file.
pub fn compress_chunk(compression: CompressionType, src: &[u8]) -> Result<Vec<u8>> {
    match compression {
        CompressionType::Uncompressed => Ok(src.to_vec()),
        _ => {
            let mut stream = WriteStream::new(compression);
            let mut out = Vec::with_capacity(src.len() / 2 + 64);
            stream.write(src, &mut out)?;
            stream.finish(&mut out)?;
            Ok(out)
        }
    }
}

/// One-shot inflate of a whole chunk body into `dst`.
///
/// The uncompressed variant requires `dst.len() >= src.len()` and copies;
/// the compressed variants must produce exactly `dst.len()` bytes.
pub fn decompress_chunk(compression: CompressionType, dst: &mut [u8], src: &[u8]) -> Result<()> {
    match compression {
        CompressionType::Uncompressed => {
            if dst.len() < src.len() {
                return Err(BagError::bag("destination not large enough"));
            }
            dst[..src.len()].copy_from_slice(src);
            Ok(())
        }
        _ => {
            let mut stream = ReadStream::new(compression);
            stream.feed(src);
            let mut filled = 0usize;
            while filled < dst.len() {
                let n = stream.read(&mut dst[filled..])?;
                if n == 0 {
                    return Err(BagError::format(format!(
                        "chunk decompressed to {filled} bytes, expected {}",
                        dst.len()
                    )));
                }
                filled += n;
            }
            // Anything further means the stored uncompressed size was wrong.
            let mut probe = [0u8; 1];
            if stream.read(&mut probe)? != 0 {
                return Err(BagError::format(
                    "chunk decompressed past its declared size",
                ));
            }
            Ok(())
        }
    }
}
