// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! The bag engine.
//!
//! A [`Bag`] is a single-file container for timestamped messages on named
//! topics. It can be opened in three modes:
//! - [`BagMode::Write`] — create a new bag
//! - [`BagMode::Read`] — random-access reading via [`View`](crate::bag::view::View)
//! - [`BagMode::Append`] — extend an existing bag
//!
//! # File layout (version 2.0)
//!
//! ```text
//! #ROSBAG V2.0\n
//! <file header record>          ; fixed 4096 bytes, patched at close
//! <chunk record> * N            ; compressed body + per-connection index records
//! <connection record> * C       ; trailer
//! <chunk info record> * N       ; trailer
//! ```
//!
//! Messages accumulate in an in-memory outgoing chunk; when it grows past
//! the chunk threshold the chunk is compressed into the file and its
//! summary retained. Closing the bag writes the connection and chunk-info
//! trailer and patches the file header with the trailer position, which is
//! what makes the file self-describing.
//!
//! # Example
//!
//! ```no_run
//! # fn main() -> robobag::Result<()> {
//! use robobag::{Bag, BagMode, CompressionType, Time};
//! use robobag::msg::RawMessage;
//!
//! let mut bag = Bag::new();
//! bag.set_compression(CompressionType::Lz4);
//! bag.open("out.bag", BagMode::Write)?;
//! bag.write("/chatter", Time::new(10, 0), &RawMessage::new(vec![1, 2, 3]))?;
//! bag.close()?;
//! # Ok(())
//! # }
//! ```

pub mod view;

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::core::{BagError, Result, Time, TIME_MIN};
use crate::encrypt::{create_encryptor, Encryptor};
use crate::io::chunked_file::ChunkedFile;
use crate::io::constants::*;
use crate::io::record;
use crate::io::stream;
use crate::msg::RosMessage;
use crate::types::{
    insert_index_entry, Buffer, ChunkHeader, ChunkInfo, CompressionType, ConnectionInfo, FieldMap,
    IndexEntry,
};

/// The possible modes to open a bag in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BagMode {
    /// Create a new bag file, truncating any existing one.
    Write,
    /// Open an existing bag for reading.
    Read,
    /// Open an existing bag and extend it.
    Append,
}

/// Where a decompressed chunk body is being served from.
enum ChunkSource {
    /// The chunk is still open; its body is the outgoing buffer.
    Outgoing,
    /// The chunk was read from the file into the decompress cache.
    Cached,
}

/// The bag storage engine.
pub struct Bag {
    mode: BagMode,
    file: RefCell<ChunkedFile>,
    path: PathBuf,
    version: u32,
    compression: CompressionType,
    chunk_threshold: u32,
    /// Incremented on every write; internal sequence number.
    bag_revision: u32,

    file_header_pos: u64,
    index_data_pos: u64,
    /// Connection and chunk counts read from the file header, consumed
    /// while the trailer is ingested.
    pending_connection_count: u32,
    pending_chunk_count: u32,

    // Current chunk.
    chunk_open: bool,
    curr_chunk_info: ChunkInfo,
    curr_chunk_data_pos: u64,
    curr_chunk_compression: CompressionType,

    topic_connection_ids: HashMap<String, u32>,
    header_connection_ids: HashMap<FieldMap, u32>,
    connections: BTreeMap<u32, ConnectionInfo>,

    chunks: Vec<ChunkInfo>,

    connection_indexes: BTreeMap<u32, Vec<IndexEntry>>,
    curr_chunk_connection_indexes: BTreeMap<u32, Vec<IndexEntry>>,

    /// Reusable staging for record headers.
    header_buffer: Buffer,
    /// Reusable staging for record bodies.
    record_buffer: Buffer,
    /// The chunk being assembled.
    outgoing_chunk_buffer: Buffer,

    /// Compressed chunk staging for reads.
    chunk_buffer: RefCell<Buffer>,
    /// Decompressed chunk cache, one slot.
    decompress_buffer: RefCell<Buffer>,
    /// Position of the chunk held in `decompress_buffer`.
    decompressed_chunk: Cell<Option<u64>>,

    encryptor: Option<Box<dyn Encryptor>>,
    encryptor_name: String,
    encryptor_param: String,
}

impl Default for Bag {
    fn default() -> Self {
        Self::new()
    }
}

impl Bag {
    /// Create a closed bag.
    pub fn new() -> Self {
        Bag {
            mode: BagMode::Read,
            file: RefCell::new(ChunkedFile::new()),
            path: PathBuf::new(),
            version: VERSION_200,
            compression: CompressionType::Uncompressed,
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            bag_revision: 0,
            file_header_pos: 0,
            index_data_pos: 0,
            pending_connection_count: 0,
            pending_chunk_count: 0,
            chunk_open: false,
            curr_chunk_info: ChunkInfo {
                start_time: Time::default(),
                end_time: Time::default(),
                pos: 0,
                connection_counts: BTreeMap::new(),
            },
            curr_chunk_data_pos: 0,
            curr_chunk_compression: CompressionType::Uncompressed,
            topic_connection_ids: HashMap::new(),
            header_connection_ids: HashMap::new(),
            connections: BTreeMap::new(),
            chunks: Vec::new(),
            connection_indexes: BTreeMap::new(),
            curr_chunk_connection_indexes: BTreeMap::new(),
            header_buffer: Buffer::new(),
            record_buffer: Buffer::new(),
            outgoing_chunk_buffer: Buffer::new(),
            chunk_buffer: RefCell::new(Buffer::new()),
            decompress_buffer: RefCell::new(Buffer::new()),
            decompressed_chunk: Cell::new(None),
            encryptor: None,
            encryptor_name: String::new(),
            encryptor_param: String::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Open / close
    // -----------------------------------------------------------------------

    /// Open a bag file in the given mode.
    pub fn open(&mut self, path: impl AsRef<Path>, mode: BagMode) -> Result<()> {
        if self.is_open() {
            return Err(BagError::bag("bag is already open"));
        }
        self.reset_state();
        self.mode = mode;
        self.path = path.as_ref().to_path_buf();
        let result = match mode {
            BagMode::Write => self.open_write(),
            BagMode::Read => self.open_read(),
            BagMode::Append => self.open_append(),
        };
        if result.is_err() {
            let _ = self.file.borrow_mut().close();
        }
        result
    }

    /// Close the bag. Writing modes flush the open chunk and write the
    /// index trailer. Closing a closed bag is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        if matches!(self.mode, BagMode::Write | BagMode::Append) {
            self.stop_writing()?;
        }
        self.file.borrow_mut().close()?;
        debug!(path = %self.path.display(), "closed bag");
        Ok(())
    }

    /// True while the bag file is open.
    pub fn is_open(&self) -> bool {
        self.file.borrow().is_open()
    }

    /// Path of the bag file.
    pub fn file_name(&self) -> &Path {
        &self.path
    }

    /// The mode the bag was opened in.
    pub fn mode(&self) -> BagMode {
        self.mode
    }

    /// Major version of the open bag file.
    pub fn major_version(&self) -> u32 {
        self.version / 100
    }

    /// Minor version of the open bag file.
    pub fn minor_version(&self) -> u32 {
        self.version % 100
    }

    /// Current size of the bag file (a lower bound while writing).
    pub fn size(&self) -> Result<u64> {
        self.file.borrow().file_size()
    }

    /// Set the compression used for subsequently written chunks.
    pub fn set_compression(&mut self, compression: CompressionType) {
        self.compression = compression;
    }

    /// The compression used for newly written chunks.
    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    /// Set the outgoing-chunk size threshold in bytes.
    pub fn set_chunk_threshold(&mut self, chunk_threshold: u32) {
        self.chunk_threshold = chunk_threshold;
    }

    /// The outgoing-chunk size threshold in bytes.
    pub fn chunk_threshold(&self) -> u32 {
        self.chunk_threshold
    }

    /// Internal write sequence number.
    pub fn revision(&self) -> u32 {
        self.bag_revision
    }

    /// Select an encryptor plugin by name.
    ///
    /// Call before [`Bag::open`]. When writing, chunks and trailer
    /// connection records are encrypted. When reading or appending an
    /// encrypted bag the plugin named in the file header is instantiated
    /// automatically; this call supplies the parameter (e.g. the
    /// passphrase) it needs.
    pub fn set_encryptor(&mut self, plugin_name: &str, param: &str) -> Result<()> {
        if self.is_open() {
            return Err(BagError::bag("set_encryptor must be called before open"));
        }
        // Validate the name eagerly so typos fail here, not at open.
        create_encryptor(plugin_name)?;
        self.encryptor_name = plugin_name.to_string();
        self.encryptor_param = param.to_string();
        Ok(())
    }

    /// Connections recorded in the bag, in id order.
    pub fn connections(&self) -> impl Iterator<Item = &ConnectionInfo> {
        self.connections.values()
    }

    /// Chunk summaries of the bag. While writing, covers closed chunks.
    pub fn chunks(&self) -> &[ChunkInfo] {
        &self.chunks
    }

    pub(crate) fn connection_indexes(&self) -> &BTreeMap<u32, Vec<IndexEntry>> {
        &self.connection_indexes
    }

    pub(crate) fn connection_by_id(&self, id: u32) -> Option<&ConnectionInfo> {
        self.connections.get(&id)
    }

    fn reset_state(&mut self) {
        self.version = VERSION_200;
        self.bag_revision = 0;
        self.file_header_pos = 0;
        self.index_data_pos = 0;
        self.pending_connection_count = 0;
        self.pending_chunk_count = 0;
        self.chunk_open = false;
        self.topic_connection_ids.clear();
        self.header_connection_ids.clear();
        self.connections.clear();
        self.chunks.clear();
        self.connection_indexes.clear();
        self.curr_chunk_connection_indexes.clear();
        self.outgoing_chunk_buffer.clear();
        self.chunk_buffer.borrow_mut().clear();
        self.decompress_buffer.borrow_mut().clear();
        self.decompressed_chunk.set(None);
        self.encryptor = None;
    }

    fn open_write(&mut self) -> Result<()> {
        self.file.borrow_mut().open_write(&self.path)?;
        if !self.encryptor_name.is_empty() {
            let mut encryptor = create_encryptor(&self.encryptor_name)?;
            encryptor.init_for_writing(&self.encryptor_param)?;
            self.encryptor = Some(encryptor);
        }
        self.start_writing()?;
        debug!(path = %self.path.display(), "opened bag for writing");
        Ok(())
    }

    fn open_read(&mut self) -> Result<()> {
        self.file.borrow_mut().open_read(&self.path)?;
        self.read_version()?;
        match self.version {
            VERSION_200 => self.start_reading_version_200()?,
            VERSION_102 => self.start_reading_version_102()?,
            other => {
                return Err(BagError::format(format!(
                    "unsupported bag file version {}.{}",
                    other / 100,
                    other % 100
                )))
            }
        }
        debug!(
            path = %self.path.display(),
            connections = self.connections.len(),
            chunks = self.chunks.len(),
            "opened bag for reading"
        );
        Ok(())
    }

    fn open_append(&mut self) -> Result<()> {
        self.file.borrow_mut().open_read_write(&self.path)?;
        self.read_version()?;
        if self.version != VERSION_200 {
            return Err(BagError::bag(format!(
                "can only append to version 2.0 bags, found {}.{}",
                self.version / 100,
                self.version % 100
            )));
        }
        self.start_reading_version_200()?;

        // Chop off the trailer; close regenerates it.
        let trailer_pos = self.index_data_pos;
        {
            let mut file = self.file.borrow_mut();
            file.truncate(trailer_pos)?;
            file.seek(SeekFrom::End(0))?;
        }
        self.index_data_pos = 0;
        debug!(path = %self.path.display(), "opened bag for appending");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Writing
    // -----------------------------------------------------------------------

    /// Write a message on `topic` at `time`.
    pub fn write<T: RosMessage>(&mut self, topic: &str, time: Time, msg: &T) -> Result<()> {
        self.do_write(topic, time, msg, None)
    }

    /// Write a message with an explicit connection header. Two writes with
    /// byte-identical headers on the same topic share a connection.
    pub fn write_with_header<T: RosMessage>(
        &mut self,
        topic: &str,
        time: Time,
        msg: &T,
        connection_header: &FieldMap,
    ) -> Result<()> {
        self.do_write(topic, time, msg, Some(connection_header))
    }

    fn do_write<T: RosMessage>(
        &mut self,
        topic: &str,
        time: Time,
        msg: &T,
        connection_header: Option<&FieldMap>,
    ) -> Result<()> {
        if !self.is_open() {
            return Err(BagError::bag("cannot write to a closed bag"));
        }
        if !matches!(self.mode, BagMode::Write | BagMode::Append) {
            return Err(BagError::bag("bag is not open for writing"));
        }
        if time < TIME_MIN {
            return Err(BagError::bag(
                "tried to insert a message with time less than TIME_MIN",
            ));
        }

        self.bag_revision += 1;

        // Resolve the connection id. Without a connection header messages
        // are keyed by topic; with one, by the full header map with the
        // topic inserted, which distinguishes connections that differ only
        // by topic.
        let (conn_id, known) = match connection_header {
            None => match self.topic_connection_ids.get(topic) {
                Some(&id) => (id, true),
                None => {
                    let id = self.connections.len() as u32;
                    self.topic_connection_ids.insert(topic.to_string(), id);
                    (id, false)
                }
            },
            Some(header) => {
                let mut key = header.clone();
                key.insert(TOPIC_FIELD_NAME.to_string(), topic.as_bytes().to_vec());
                match self.header_connection_ids.get(&key) {
                    Some(&id) => (id, true),
                    None => {
                        let id = self.connections.len() as u32;
                        self.header_connection_ids.insert(key, id);
                        (id, false)
                    }
                }
            }
        };

        // A prior read may have moved the cursor.
        self.file.borrow_mut().seek(SeekFrom::End(0))?;

        if !self.chunk_open {
            self.start_writing_chunk(time)?;
        }

        if !known {
            let mut header = match connection_header {
                Some(h) => h.clone(),
                None => {
                    let mut h = FieldMap::new();
                    h.insert(
                        TYPE_FIELD_NAME.to_string(),
                        T::datatype().as_bytes().to_vec(),
                    );
                    h.insert(MD5_FIELD_NAME.to_string(), T::md5sum().as_bytes().to_vec());
                    h.insert(
                        DEFINITION_FIELD_NAME.to_string(),
                        T::definition().as_bytes().to_vec(),
                    );
                    h
                }
            };
            header.insert(TOPIC_FIELD_NAME.to_string(), topic.as_bytes().to_vec());

            let info = ConnectionInfo {
                id: conn_id,
                topic: topic.to_string(),
                datatype: T::datatype().to_string(),
                md5sum: T::md5sum().to_string(),
                msg_def: T::definition().to_string(),
                header,
            };
            // Connection records inside chunks are not separately encrypted.
            self.write_connection_record(&info, false)?;
            self.append_connection_record_to_chunk(&info);
            self.connections.insert(conn_id, info);
        }

        let entry = IndexEntry {
            time,
            chunk_pos: self.curr_chunk_info.pos,
            offset: self.outgoing_chunk_buffer.size() as u32,
        };

        self.write_message_data_record(conn_id, time, msg)?;

        // Index only after the record is fully written, so a failed write
        // never leaves a message half-indexed.
        insert_index_entry(
            self.curr_chunk_connection_indexes
                .entry(conn_id)
                .or_default(),
            entry,
        );
        insert_index_entry(self.connection_indexes.entry(conn_id).or_default(), entry);
        *self
            .curr_chunk_info
            .connection_counts
            .entry(conn_id)
            .or_default() += 1;
        if time > self.curr_chunk_info.end_time {
            self.curr_chunk_info.end_time = time;
        }
        if time < self.curr_chunk_info.start_time {
            self.curr_chunk_info.start_time = time;
        }

        if self.outgoing_chunk_buffer.size() as u32 > self.chunk_threshold {
            self.stop_writing_chunk()?;
        }

        Ok(())
    }

    fn start_writing(&mut self) -> Result<()> {
        let mut file = self.file.borrow_mut();
        file.write(VERSION_LINE.as_bytes())?;
        self.file_header_pos = file.offset();
        drop(file);
        self.write_file_header_record(0, 0, 0)
    }

    fn stop_writing(&mut self) -> Result<()> {
        if self.chunk_open {
            self.stop_writing_chunk()?;
        }
        self.file.borrow_mut().seek(SeekFrom::End(0))?;
        self.index_data_pos = self.file.borrow().offset();

        self.write_connection_records()?;
        self.write_chunk_info_records()?;

        self.file
            .borrow_mut()
            .seek(SeekFrom::Start(self.file_header_pos))?;
        self.write_file_header_record(
            self.connections.len() as u32,
            self.chunks.len() as u32,
            self.index_data_pos,
        )?;
        debug!(
            connections = self.connections.len(),
            chunks = self.chunks.len(),
            index_pos = self.index_data_pos,
            "wrote bag trailer"
        );
        Ok(())
    }

    fn start_writing_chunk(&mut self, time: Time) -> Result<()> {
        let pos = self.file.borrow().offset();
        self.curr_chunk_info = ChunkInfo {
            start_time: time,
            end_time: time,
            pos,
            connection_counts: BTreeMap::new(),
        };
        self.curr_chunk_compression = self.compression;
        // Placeholder sizes, patched when the chunk closes.
        self.write_chunk_header(self.curr_chunk_compression, 0, 0)?;
        self.curr_chunk_data_pos = self.file.borrow().offset();
        self.chunk_open = true;
        Ok(())
    }

    fn stop_writing_chunk(&mut self) -> Result<()> {
        if !self.chunk_open {
            return Ok(());
        }

        let uncompressed_size = self.outgoing_chunk_buffer.size() as u32;
        let provisional_end = self.curr_chunk_data_pos + uncompressed_size as u64;

        // The chunk body was written provisionally uncompressed while the
        // chunk was open. Replace it with the final body unless it already
        // is the final body.
        let end_of_chunk = match (&self.encryptor, self.curr_chunk_compression) {
            (None, CompressionType::Uncompressed) => provisional_end,
            (None, compression) => {
                let mut file = self.file.borrow_mut();
                file.seek(SeekFrom::Start(self.curr_chunk_data_pos))?;
                file.set_write_mode(compression)?;
                file.write(self.outgoing_chunk_buffer.data())?;
                file.set_write_mode(CompressionType::Uncompressed)?;
                file.offset()
            }
            (Some(encryptor), compression) => {
                let compressed =
                    stream::compress_chunk(compression, self.outgoing_chunk_buffer.data())?;
                let payload = encryptor.encrypt_chunk(&compressed)?;
                let mut file = self.file.borrow_mut();
                file.seek(SeekFrom::Start(self.curr_chunk_data_pos))?;
                file.write(&payload)?;
                file.offset()
            }
        };
        let compressed_size = (end_of_chunk - self.curr_chunk_data_pos) as u32;

        if end_of_chunk < provisional_end {
            self.file.borrow_mut().truncate(end_of_chunk)?;
        }

        // Patch the placeholder chunk header with the final sizes.
        self.file
            .borrow_mut()
            .seek(SeekFrom::Start(self.curr_chunk_info.pos))?;
        self.write_chunk_header(
            self.curr_chunk_compression,
            compressed_size,
            uncompressed_size,
        )?;
        self.file.borrow_mut().seek(SeekFrom::Start(end_of_chunk))?;

        self.write_index_records()?;

        debug!(
            pos = self.curr_chunk_info.pos,
            compressed_size,
            uncompressed_size,
            compression = self.curr_chunk_compression.tag(),
            "closed chunk"
        );

        self.chunks.push(self.curr_chunk_info.clone());
        self.curr_chunk_connection_indexes.clear();
        self.outgoing_chunk_buffer.clear();
        self.chunk_open = false;
        Ok(())
    }

    fn write_chunk_header(
        &self,
        compression: CompressionType,
        compressed_size: u32,
        uncompressed_size: u32,
    ) -> Result<()> {
        let mut fields = FieldMap::new();
        fields.insert(OP_FIELD_NAME.to_string(), vec![OP_CHUNK]);
        fields.insert(
            COMPRESSION_FIELD_NAME.to_string(),
            compression.tag().as_bytes().to_vec(),
        );
        fields.insert(SIZE_FIELD_NAME.to_string(), record::u32_field(uncompressed_size));

        let mut buf = Vec::new();
        record::append_header(&mut buf, &fields);
        record::append_data_length(&mut buf, compressed_size);
        self.file.borrow_mut().write(&buf)
    }

    fn write_file_header_record(
        &self,
        connection_count: u32,
        chunk_count: u32,
        index_pos: u64,
    ) -> Result<()> {
        let mut fields = FieldMap::new();
        fields.insert(OP_FIELD_NAME.to_string(), vec![OP_FILE_HEADER]);
        fields.insert(INDEX_POS_FIELD_NAME.to_string(), record::u64_field(index_pos));
        fields.insert(
            CONNECTION_COUNT_FIELD_NAME.to_string(),
            record::u32_field(connection_count),
        );
        fields.insert(
            CHUNK_COUNT_FIELD_NAME.to_string(),
            record::u32_field(chunk_count),
        );
        if let Some(encryptor) = &self.encryptor {
            fields.insert(
                ENCRYPTOR_FIELD_NAME.to_string(),
                self.encryptor_name.as_bytes().to_vec(),
            );
            encryptor.add_fields_to_file_header(&mut fields)?;
        }

        let mut buf = Vec::new();
        let header_len = record::append_header(&mut buf, &fields);
        let used = 4 + header_len + 4;
        if used > FILE_HEADER_LENGTH {
            return Err(BagError::bag("file header record too large"));
        }
        let data_len = FILE_HEADER_LENGTH - used;
        record::append_data_length(&mut buf, data_len);
        buf.resize(FILE_HEADER_LENGTH as usize, b' ');
        self.file.borrow_mut().write(&buf)
    }

    fn connection_record_bytes(&self, info: &ConnectionInfo, encrypt: bool) -> Result<Vec<u8>> {
        let mut fields = FieldMap::new();
        fields.insert(OP_FIELD_NAME.to_string(), vec![OP_CONNECTION]);
        fields.insert(
            TOPIC_FIELD_NAME.to_string(),
            info.topic.as_bytes().to_vec(),
        );
        fields.insert(CONNECTION_FIELD_NAME.to_string(), record::u32_field(info.id));

        let mut data = record::serialize_fields(&info.header);
        if encrypt {
            if let Some(encryptor) = &self.encryptor {
                data = encryptor.rewrite_connection_record(&data)?;
            }
        }

        let mut buf = Vec::new();
        record::append_header(&mut buf, &fields);
        record::append_data_length(&mut buf, data.len() as u32);
        buf.extend_from_slice(&data);
        Ok(buf)
    }

    fn write_connection_record(&self, info: &ConnectionInfo, encrypt: bool) -> Result<()> {
        let buf = self.connection_record_bytes(info, encrypt)?;
        self.file.borrow_mut().write(&buf)
    }

    fn append_connection_record_to_chunk(&mut self, info: &ConnectionInfo) {
        // Infallible: the unencrypted record bytes never fail to build.
        let buf = self
            .connection_record_bytes(info, false)
            .expect("building a connection record cannot fail");
        self.outgoing_chunk_buffer.append(&buf);
    }

    fn write_connection_records(&self) -> Result<()> {
        for info in self.connections.values() {
            self.write_connection_record(info, true)?;
        }
        Ok(())
    }

    fn write_chunk_info_records(&self) -> Result<()> {
        for chunk_info in &self.chunks {
            let mut fields = FieldMap::new();
            fields.insert(OP_FIELD_NAME.to_string(), vec![OP_CHUNK_INFO]);
            fields.insert(
                VER_FIELD_NAME.to_string(),
                record::u32_field(CHUNK_INFO_VERSION),
            );
            fields.insert(
                CHUNK_POS_FIELD_NAME.to_string(),
                record::u64_field(chunk_info.pos),
            );
            fields.insert(
                START_TIME_FIELD_NAME.to_string(),
                record::time_field(chunk_info.start_time),
            );
            fields.insert(
                END_TIME_FIELD_NAME.to_string(),
                record::time_field(chunk_info.end_time),
            );
            fields.insert(
                COUNT_FIELD_NAME.to_string(),
                record::u32_field(chunk_info.connection_counts.len() as u32),
            );

            let mut buf = Vec::new();
            record::append_header(&mut buf, &fields);
            record::append_data_length(&mut buf, chunk_info.connection_counts.len() as u32 * 8);
            for (&conn_id, &count) in &chunk_info.connection_counts {
                buf.extend_from_slice(&conn_id.to_le_bytes());
                buf.extend_from_slice(&count.to_le_bytes());
            }
            self.file.borrow_mut().write(&buf)?;
        }
        Ok(())
    }

    fn write_index_records(&self) -> Result<()> {
        for (&conn_id, entries) in &self.curr_chunk_connection_indexes {
            let mut fields = FieldMap::new();
            fields.insert(OP_FIELD_NAME.to_string(), vec![OP_INDEX_DATA]);
            fields.insert(CONNECTION_FIELD_NAME.to_string(), record::u32_field(conn_id));
            fields.insert(VER_FIELD_NAME.to_string(), record::u32_field(INDEX_VERSION));
            fields.insert(
                COUNT_FIELD_NAME.to_string(),
                record::u32_field(entries.len() as u32),
            );

            let mut buf = Vec::new();
            record::append_header(&mut buf, &fields);
            record::append_data_length(&mut buf, entries.len() as u32 * 12);
            for entry in entries {
                buf.extend_from_slice(&entry.time.sec.to_le_bytes());
                buf.extend_from_slice(&entry.time.nsec.to_le_bytes());
                buf.extend_from_slice(&entry.offset.to_le_bytes());
            }
            self.file.borrow_mut().write(&buf)?;
        }
        Ok(())
    }

    fn write_message_data_record<T: RosMessage>(
        &mut self,
        conn_id: u32,
        time: Time,
        msg: &T,
    ) -> Result<()> {
        let mut fields = FieldMap::new();
        fields.insert(OP_FIELD_NAME.to_string(), vec![OP_MSG_DATA]);
        fields.insert(CONNECTION_FIELD_NAME.to_string(), record::u32_field(conn_id));
        fields.insert(TIME_FIELD_NAME.to_string(), record::time_field(time));

        self.header_buffer.clear();
        let header = self.header_buffer.inner_mut();
        record::append_header(header, &fields);

        self.record_buffer.clear();
        let body = self.record_buffer.inner_mut();
        msg.serialize(body)?;
        let msg_len = body.len() as u32;
        if msg_len != msg.serialized_length() {
            return Err(BagError::bag(format!(
                "message serialized to {msg_len} bytes but declared {}",
                msg.serialized_length()
            )));
        }
        record::append_data_length(self.header_buffer.inner_mut(), msg_len);

        // Reading a MessageInstance from this same bag may have moved the
        // cursor; always land writes at the end.
        {
            let mut file = self.file.borrow_mut();
            file.seek(SeekFrom::End(0))?;
            debug!(
                offset = file.offset(),
                conn = conn_id,
                sec = time.sec,
                nsec = time.nsec,
                data_len = msg_len,
                "writing message data record"
            );
            file.write(self.header_buffer.data())?;
            file.write(self.record_buffer.data())?;
        }

        self.outgoing_chunk_buffer.append(self.header_buffer.data());
        self.outgoing_chunk_buffer.append(self.record_buffer.data());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    fn read_version(&mut self) -> Result<()> {
        let line = {
            let mut file = self.file.borrow_mut();
            let line = file.getline()?;
            self.file_header_pos = file.offset();
            line
        };
        let rest = line
            .strip_prefix(MAGIC_PREFIX)
            .ok_or_else(|| BagError::format(format!("invalid bag magic: {line:?}")))?;
        let (major, minor) = rest
            .split_once('.')
            .ok_or_else(|| BagError::format(format!("invalid bag version: {rest:?}")))?;
        let major: u32 = major
            .parse()
            .map_err(|_| BagError::format(format!("invalid bag version: {rest:?}")))?;
        let minor: u32 = minor
            .parse()
            .map_err(|_| BagError::format(format!("invalid bag version: {rest:?}")))?;
        self.version = major * 100 + minor;
        Ok(())
    }

    /// Read one record header (and its data length) at the current
    /// position.
    fn read_record_head(file: &mut ChunkedFile) -> Result<(FieldMap, u32)> {
        let mut len = [0u8; 4];
        file.read(&mut len)?;
        let header_len = u32::from_le_bytes(len);
        record::check_header_length(header_len)?;
        let mut header = vec![0u8; header_len as usize];
        file.read(&mut header)?;
        let fields = record::parse_fields(&header)?;
        file.read(&mut len)?;
        let data_len = u32::from_le_bytes(len);
        record::check_data_length(data_len)?;
        Ok((fields, data_len))
    }

    fn start_reading_version_200(&mut self) -> Result<()> {
        self.read_file_header_record()?;

        if self.index_data_pos == 0 {
            return Err(BagError::unindexed("file header has no index position"));
        }
        let file_size = self.file.borrow().file_size()?;
        if self.index_data_pos > file_size {
            return Err(BagError::format(format!(
                "index position {} is beyond the end of the file ({file_size} bytes)",
                self.index_data_pos
            )));
        }

        self.file
            .borrow_mut()
            .seek(SeekFrom::Start(self.index_data_pos))?;
        let connection_count = self.pending_connection_count;
        let chunk_count = self.pending_chunk_count;

        // A file that ends while the trailer is being ingested was cut off
        // mid-write; report it as unindexed rather than malformed.
        for _ in 0..connection_count {
            self.read_connection_record().map_err(io_to_unindexed)?;
        }
        for _ in 0..chunk_count {
            self.read_chunk_info_record().map_err(io_to_unindexed)?;
        }

        let chunk_positions: Vec<(u64, usize)> = self
            .chunks
            .iter()
            .map(|c| (c.pos, c.connection_counts.len()))
            .collect();
        for (pos, connection_count) in chunk_positions {
            {
                let mut file = self.file.borrow_mut();
                file.seek(SeekFrom::Start(pos))?;
            }
            let chunk_header = self.read_chunk_header()?;
            self.file
                .borrow_mut()
                .seek(SeekFrom::Current(chunk_header.compressed_size as i64))?;
            for _ in 0..connection_count {
                self.read_connection_index_record(pos)
                    .map_err(io_to_unindexed)?;
            }
        }
        Ok(())
    }

    fn read_file_header_record(&mut self) -> Result<()> {
        let (fields, _data_len) = {
            let mut file = self.file.borrow_mut();
            let head = Self::read_record_head(&mut file)?;
            file.seek(SeekFrom::Current(head.1 as i64))?;
            head
        };
        if record::read_op(&fields)? != OP_FILE_HEADER {
            return Err(BagError::format("first record is not a file header"));
        }
        self.index_data_pos = record::read_u64_field(&fields, INDEX_POS_FIELD_NAME)?;
        self.pending_connection_count =
            record::read_u32_field(&fields, CONNECTION_COUNT_FIELD_NAME).unwrap_or(0);
        self.pending_chunk_count =
            record::read_u32_field(&fields, CHUNK_COUNT_FIELD_NAME).unwrap_or(0);

        if let Some(name) = record::read_opt_string_field(&fields, ENCRYPTOR_FIELD_NAME) {
            let mut encryptor = create_encryptor(&name)?;
            encryptor.init_for_reading(&self.encryptor_param, &fields)?;
            self.encryptor = Some(encryptor);
            self.encryptor_name = name;
        }
        Ok(())
    }

    fn read_connection_record(&mut self) -> Result<()> {
        let (fields, data) = self.read_record_with_data()?;
        if record::read_op(&fields)? != OP_CONNECTION {
            return Err(BagError::format("expected a connection record"));
        }
        let id = record::read_u32_field(&fields, CONNECTION_FIELD_NAME)?;
        let topic = record::read_string_field(&fields, TOPIC_FIELD_NAME)?;

        let data = match &self.encryptor {
            Some(encryptor) => encryptor.read_connection_record(&data)?,
            None => data,
        };
        let mut header = record::parse_fields(&data)?;
        header
            .entry(TOPIC_FIELD_NAME.to_string())
            .or_insert_with(|| topic.as_bytes().to_vec());

        let info = ConnectionInfo {
            id,
            topic: topic.clone(),
            datatype: record::read_string_field(&header, TYPE_FIELD_NAME)?,
            md5sum: record::read_string_field(&header, MD5_FIELD_NAME)?,
            msg_def: record::read_opt_string_field(&header, DEFINITION_FIELD_NAME)
                .unwrap_or_default(),
            header: header.clone(),
        };
        self.topic_connection_ids.entry(topic).or_insert(id);
        self.header_connection_ids.insert(header, id);
        self.connections.insert(id, info);
        Ok(())
    }

    fn read_chunk_info_record(&mut self) -> Result<()> {
        let (fields, data) = self.read_record_with_data()?;
        if record::read_op(&fields)? != OP_CHUNK_INFO {
            return Err(BagError::format("expected a chunk info record"));
        }
        let ver = record::read_u32_field(&fields, VER_FIELD_NAME)?;
        if ver != CHUNK_INFO_VERSION {
            return Err(BagError::format(format!(
                "unsupported chunk info version {ver}"
            )));
        }
        let pos = record::read_u64_field(&fields, CHUNK_POS_FIELD_NAME)?;
        let start_time = record::read_time_field(&fields, START_TIME_FIELD_NAME)?;
        let end_time = record::read_time_field(&fields, END_TIME_FIELD_NAME)?;
        let count = record::read_u32_field(&fields, COUNT_FIELD_NAME)?;
        if data.len() != count as usize * 8 {
            return Err(BagError::format("chunk info record has the wrong size"));
        }

        let mut connection_counts = BTreeMap::new();
        for pair in data.chunks_exact(8) {
            let conn_id = u32::from_le_bytes(pair[0..4].try_into().unwrap());
            let msg_count = u32::from_le_bytes(pair[4..8].try_into().unwrap());
            connection_counts.insert(conn_id, msg_count);
        }
        self.chunks.push(ChunkInfo {
            start_time,
            end_time,
            pos,
            connection_counts,
        });
        Ok(())
    }

    fn read_chunk_header(&self) -> Result<ChunkHeader> {
        let mut file = self.file.borrow_mut();
        let (fields, data_len) = Self::read_record_head(&mut file)?;
        drop(file);
        if record::read_op(&fields)? != OP_CHUNK {
            return Err(BagError::format("expected a chunk record"));
        }
        let tag = record::read_string_field(&fields, COMPRESSION_FIELD_NAME)?;
        Ok(ChunkHeader {
            compression: CompressionType::from_tag(&tag)?,
            compressed_size: data_len,
            uncompressed_size: record::read_u32_field(&fields, SIZE_FIELD_NAME)?,
        })
    }

    fn read_connection_index_record(&mut self, chunk_pos: u64) -> Result<()> {
        let (fields, data) = self.read_record_with_data()?;
        if record::read_op(&fields)? != OP_INDEX_DATA {
            return Err(BagError::format("expected an index data record"));
        }
        let ver = record::read_u32_field(&fields, VER_FIELD_NAME)?;
        if ver != INDEX_VERSION {
            return Err(BagError::format(format!("unsupported index version {ver}")));
        }
        let conn_id = record::read_u32_field(&fields, CONNECTION_FIELD_NAME)?;
        if !self.connections.contains_key(&conn_id) {
            return Err(BagError::format(format!("unknown connection id {conn_id}")));
        }
        let count = record::read_u32_field(&fields, COUNT_FIELD_NAME)?;
        if data.len() != count as usize * 12 {
            return Err(BagError::format("index data record has the wrong size"));
        }

        let index = self.connection_indexes.entry(conn_id).or_default();
        for raw in data.chunks_exact(12) {
            let sec = u32::from_le_bytes(raw[0..4].try_into().unwrap());
            let nsec = u32::from_le_bytes(raw[4..8].try_into().unwrap());
            let offset = u32::from_le_bytes(raw[8..12].try_into().unwrap());
            insert_index_entry(
                index,
                IndexEntry {
                    time: Time { sec, nsec },
                    chunk_pos,
                    offset,
                },
            );
        }
        Ok(())
    }

    fn read_record_with_data(&self) -> Result<(FieldMap, Vec<u8>)> {
        let mut file = self.file.borrow_mut();
        let (fields, data_len) = Self::read_record_head(&mut file)?;
        let mut data = vec![0u8; data_len as usize];
        file.read(&mut data)?;
        Ok((fields, data))
    }

    // -----------------------------------------------------------------------
    // Legacy 1.02 reading
    // -----------------------------------------------------------------------

    fn start_reading_version_102(&mut self) -> Result<()> {
        self.read_file_header_record()?;
        if self.index_data_pos == 0 {
            return Err(BagError::unindexed("file header has no index position"));
        }
        let file_size = self.file.borrow().file_size()?;
        if self.index_data_pos > file_size {
            return Err(BagError::format(format!(
                "index position {} is beyond the end of the file ({file_size} bytes)",
                self.index_data_pos
            )));
        }
        self.file
            .borrow_mut()
            .seek(SeekFrom::Start(self.index_data_pos))?;

        // Definitions and per-topic indexes may interleave; resolve the
        // topic ids after the scan.
        let mut topic_entries: Vec<(String, Vec<IndexEntry>)> = Vec::new();
        while self.file.borrow().offset() < file_size {
            let (fields, data) = self.read_record_with_data().map_err(io_to_unindexed)?;
            match record::read_op(&fields)? {
                OP_MSG_DEF => {
                    let topic = record::read_string_field(&fields, TOPIC_FIELD_NAME)?;
                    if self.topic_connection_ids.contains_key(&topic) {
                        continue;
                    }
                    let datatype = record::read_string_field(&fields, TYPE_FIELD_NAME)?;
                    let md5sum = record::read_string_field(&fields, MD5_FIELD_NAME)?;
                    let msg_def = String::from_utf8_lossy(&data).to_string();
                    let id = self.connections.len() as u32;

                    let mut header = FieldMap::new();
                    header.insert(TOPIC_FIELD_NAME.to_string(), topic.as_bytes().to_vec());
                    header.insert(TYPE_FIELD_NAME.to_string(), datatype.as_bytes().to_vec());
                    header.insert(MD5_FIELD_NAME.to_string(), md5sum.as_bytes().to_vec());
                    header.insert(
                        DEFINITION_FIELD_NAME.to_string(),
                        msg_def.as_bytes().to_vec(),
                    );
                    self.topic_connection_ids.insert(topic.clone(), id);
                    self.connections.insert(
                        id,
                        ConnectionInfo {
                            id,
                            topic,
                            datatype,
                            md5sum,
                            msg_def,
                            header,
                        },
                    );
                }
                OP_INDEX_DATA => {
                    let ver = record::read_u32_field(&fields, VER_FIELD_NAME)?;
                    if ver != 0 {
                        return Err(BagError::format(format!(
                            "unsupported legacy index version {ver}"
                        )));
                    }
                    let topic = record::read_string_field(&fields, TOPIC_FIELD_NAME)?;
                    let count = record::read_u32_field(&fields, COUNT_FIELD_NAME)?;
                    if data.len() != count as usize * 16 {
                        return Err(BagError::format("legacy index record has the wrong size"));
                    }
                    let mut entries = Vec::with_capacity(count as usize);
                    for raw in data.chunks_exact(16) {
                        let sec = u32::from_le_bytes(raw[0..4].try_into().unwrap());
                        let nsec = u32::from_le_bytes(raw[4..8].try_into().unwrap());
                        let offset = u64::from_le_bytes(raw[8..16].try_into().unwrap());
                        entries.push(IndexEntry {
                            time: Time { sec, nsec },
                            chunk_pos: offset,
                            offset: 0,
                        });
                    }
                    topic_entries.push((topic, entries));
                }
                _ => {}
            }
        }

        for (topic, entries) in topic_entries {
            let conn_id = *self
                .topic_connection_ids
                .get(&topic)
                .ok_or_else(|| BagError::format(format!("index for unknown topic {topic}")))?;
            let index = self.connection_indexes.entry(conn_id).or_default();
            for entry in entries {
                insert_index_entry(index, entry);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Message materialization
    // -----------------------------------------------------------------------

    /// Read the record header and payload bytes behind an index entry.
    pub(crate) fn read_message_data(&self, entry: &IndexEntry) -> Result<(FieldMap, Vec<u8>)> {
        match self.version {
            VERSION_200 => {
                let source = self.decompress_chunk(entry.chunk_pos)?;
                let (fields, payload) = match source {
                    ChunkSource::Outgoing => {
                        extract_message(self.outgoing_chunk_buffer.data(), entry.offset)?
                    }
                    ChunkSource::Cached => {
                        let buffer = self.decompress_buffer.borrow();
                        extract_message(buffer.data(), entry.offset)?
                    }
                };
                let conn_id = record::read_u32_field(&fields, CONNECTION_FIELD_NAME)?;
                if !self.connections.contains_key(&conn_id) {
                    return Err(BagError::format(format!("unknown connection id {conn_id}")));
                }
                Ok((fields, payload))
            }
            VERSION_102 => {
                {
                    let mut file = self.file.borrow_mut();
                    file.seek(SeekFrom::Start(entry.chunk_pos))?;
                }
                let (fields, data) = self.read_record_with_data()?;
                if record::read_op(&fields)? != OP_MSG_DATA {
                    return Err(BagError::format("expected a message data record"));
                }
                let topic = record::read_string_field(&fields, TOPIC_FIELD_NAME)?;
                if !self.topic_connection_ids.contains_key(&topic) {
                    return Err(BagError::format(format!("unknown topic {topic}")));
                }
                Ok((fields, data))
            }
            other => Err(BagError::format(format!("unhandled version {other}"))),
        }
    }

    /// Deserialize the message behind an index entry.
    pub(crate) fn instantiate<T: RosMessage>(&self, entry: &IndexEntry) -> Result<T> {
        let (_, payload) = self.read_message_data(entry)?;
        T::deserialize(&payload)
    }

    /// Make the body of the chunk at `chunk_pos` available, decompressing
    /// into the single-slot cache unless it is already there, or serving
    /// the currently open chunk straight from the outgoing buffer.
    fn decompress_chunk(&self, chunk_pos: u64) -> Result<ChunkSource> {
        if self.chunk_open && chunk_pos == self.curr_chunk_info.pos {
            return Ok(ChunkSource::Outgoing);
        }
        if self.decompressed_chunk.get() == Some(chunk_pos) {
            return Ok(ChunkSource::Cached);
        }

        {
            let mut file = self.file.borrow_mut();
            file.seek(SeekFrom::Start(chunk_pos))?;
        }
        let chunk_header = self.read_chunk_header()?;

        let mut chunk_buffer = self.chunk_buffer.borrow_mut();
        chunk_buffer.set_size(chunk_header.compressed_size as usize);
        self.file.borrow_mut().read(chunk_buffer.data_mut())?;

        let body: &[u8] = chunk_buffer.data();
        let decrypted;
        let body = match &self.encryptor {
            Some(encryptor) => {
                decrypted = encryptor.decrypt_chunk(body)?;
                &decrypted[..]
            }
            None => body,
        };

        let mut decompress_buffer = self.decompress_buffer.borrow_mut();
        decompress_buffer.set_size(chunk_header.uncompressed_size as usize);
        stream::decompress_chunk(chunk_header.compression, decompress_buffer.data_mut(), body)?;
        self.decompressed_chunk.set(Some(chunk_pos));
        Ok(ChunkSource::Cached)
    }
}

/// Locate a message data record inside an uncompressed chunk body.
fn extract_message(buf: &[u8], offset: u32) -> Result<(FieldMap, Vec<u8>)> {
    let (fields, data_len, bytes_read) = record::read_header_from_buffer(buf, offset)?;
    if record::read_op(&fields)? != OP_MSG_DATA {
        return Err(BagError::format("index entry does not point at a message"));
    }
    let start = offset as usize + bytes_read as usize;
    Ok((fields, buf[start..start + data_len as usize].to_vec()))
}

/// Trailer ingestion hit the end of the file: the bag was never finalized.
fn io_to_unindexed(err: BagError) -> BagError {
    match err {
        BagError::Io(msg) => BagError::Unindexed(msg),
        other => other,
    }
}

impl Drop for Bag {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(err) = self.close() {
                warn!(path = %self.path.display(), error = %err, "failed to close bag on drop");
            }
        }
    }
}
