// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Record codec.
//!
//! Every record on disk shares one frame:
//!
//! ```text
//! <header_len: u32><header><data_len: u32><data>
//! ```
//!
//! where the header is a sequence of `<entry_len: u32><key>=<value>` pairs.
//! Keys are ASCII; values are opaque bytes. Numeric values are
//! little-endian; a time value is `(sec: u32, nsec: u32)`.
//!
//! Length prefixes read back from disk are sanity-capped so that a corrupt
//! offset fails with a format error instead of a giant allocation.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::core::{BagError, Result, Time};
use crate::io::constants::OP_FIELD_NAME;
use crate::types::FieldMap;

/// Upper bound accepted for a record header length.
const MAX_HEADER_LEN: u32 = 1 << 24;

/// Upper bound accepted for a record data length.
const MAX_DATA_LEN: u32 = 1 << 30;

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Serialize a field map into `<entry_len><key>=<value>` pairs.
pub fn serialize_fields(fields: &FieldMap) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in fields {
        let entry_len = key.len() + 1 + value.len();
        out.extend_from_slice(&(entry_len as u32).to_le_bytes());
        out.extend_from_slice(key.as_bytes());
        out.push(b'=');
        out.extend_from_slice(value);
    }
    out
}

/// Append a length-prefixed record header to `buf`. Returns the header
/// length (without its own length prefix).
pub fn append_header(buf: &mut Vec<u8>, fields: &FieldMap) -> u32 {
    let header = serialize_fields(fields);
    let header_len = header.len() as u32;
    buf.extend_from_slice(&header_len.to_le_bytes());
    buf.extend_from_slice(&header);
    header_len
}

/// Append a record data-length prefix to `buf`.
pub fn append_data_length(buf: &mut Vec<u8>, data_len: u32) {
    buf.extend_from_slice(&data_len.to_le_bytes());
}

/// Little-endian bytes of a `u32` field value.
pub fn u32_field(value: u32) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

/// Little-endian bytes of a `u64` field value.
pub fn u64_field(value: u64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

/// Eight-byte `(sec, nsec)` encoding of a time field value.
pub fn time_field(time: Time) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&time.sec.to_le_bytes());
    out.extend_from_slice(&time.nsec.to_le_bytes());
    out
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Parse header bytes into a field map.
pub fn parse_fields(header: &[u8]) -> Result<FieldMap> {
    let mut fields = FieldMap::new();
    let mut cursor = Cursor::new(header);

    while (cursor.position() as usize) < header.len() {
        let entry_len = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| BagError::format("truncated header field length"))? as usize;
        let start = cursor.position() as usize;
        if entry_len == 0 || start + entry_len > header.len() {
            return Err(BagError::format(format!(
                "invalid header field length {entry_len}"
            )));
        }
        let entry = &header[start..start + entry_len];
        let eq = entry
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(|| BagError::format("header field missing '=' separator"))?;
        let key = std::str::from_utf8(&entry[..eq])
            .map_err(|_| BagError::format("header field name is not valid UTF-8"))?;
        fields.insert(key.to_string(), entry[eq + 1..].to_vec());
        cursor.set_position((start + entry_len) as u64);
    }

    Ok(fields)
}

/// Validate a header length prefix read from disk.
pub fn check_header_length(header_len: u32) -> Result<()> {
    if header_len > MAX_HEADER_LEN {
        return Err(BagError::format(format!(
            "invalid record header length {header_len}"
        )));
    }
    Ok(())
}

/// Validate a data length prefix read from disk.
pub fn check_data_length(data_len: u32) -> Result<()> {
    if data_len > MAX_DATA_LEN {
        return Err(BagError::format(format!(
            "invalid record data length {data_len}"
        )));
    }
    Ok(())
}

/// Parse a record header embedded in a buffer at `offset`.
///
/// Returns the parsed fields, the record data size, and the number of bytes
/// consumed from `offset` up to the start of the data region.
pub fn read_header_from_buffer(
    buf: &[u8],
    offset: u32,
) -> Result<(FieldMap, u32, u32)> {
    let offset = offset as usize;
    let remaining = buf
        .len()
        .checked_sub(offset)
        .ok_or_else(|| BagError::format("record offset past end of buffer"))?;
    if remaining < 4 {
        return Err(BagError::format("truncated record header length"));
    }
    let header_len = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
    check_header_length(header_len)?;
    let header_end = offset + 4 + header_len as usize;
    if header_end + 4 > buf.len() {
        return Err(BagError::format("truncated record header"));
    }
    let fields = parse_fields(&buf[offset + 4..header_end])?;
    let data_len = u32::from_le_bytes(buf[header_end..header_end + 4].try_into().unwrap());
    check_data_length(data_len)?;
    let bytes_read = 4 + header_len + 4;
    if offset + bytes_read as usize + data_len as usize > buf.len() {
        return Err(BagError::format("truncated record data"));
    }
    Ok((fields, data_len, bytes_read))
}

// ---------------------------------------------------------------------------
// Typed field readers
// ---------------------------------------------------------------------------

fn field_with_len<'a>(fields: &'a FieldMap, name: &str, len: usize) -> Result<&'a [u8]> {
    let value = fields
        .get(name)
        .ok_or_else(|| BagError::format(format!("required field '{name}' missing")))?;
    if value.len() != len {
        return Err(BagError::format(format!(
            "field '{name}' has length {}, expected {len}",
            value.len()
        )));
    }
    Ok(value)
}

/// Read the single-byte `op` field.
pub fn read_op(fields: &FieldMap) -> Result<u8> {
    Ok(field_with_len(fields, OP_FIELD_NAME, 1)?[0])
}

/// Read a required little-endian `u32` field.
pub fn read_u32_field(fields: &FieldMap, name: &str) -> Result<u32> {
    let value = field_with_len(fields, name, 4)?;
    Ok(u32::from_le_bytes(value.try_into().unwrap()))
}

/// Read a required little-endian `u64` field.
pub fn read_u64_field(fields: &FieldMap, name: &str) -> Result<u64> {
    let value = field_with_len(fields, name, 8)?;
    Ok(u64::from_le_bytes(value.try_into().unwrap()))
}

/// Read a required `(sec, nsec)` time field.
pub fn read_time_field(fields: &FieldMap, name: &str) -> Result<Time> {
    let value = field_with_len(fields, name, 8)?;
    let sec = u32::from_le_bytes(value[0..4].try_into().unwrap());
    let nsec = u32::from_le_bytes(value[4..8].try_into().unwrap());
    Ok(Time { sec, nsec })
}

/// Read a required UTF-8 string field.
pub fn read_string_field(fields: &FieldMap, name: &str) -> Result<String> {
    let value = fields
        .get(name)
        .ok_or_else(|| BagError::format(format!("required field '{name}' missing")))?;
    String::from_utf8(value.clone())
        .map_err(|_| BagError::format(format!("field '{name}' is not valid UTF-8")))
}

/// Read an optional UTF-8 string field.
pub fn read_opt_string_field(fields: &FieldMap, name: &str) -> Option<String> {
    fields
        .get(name)
        .map(|v| String::from_utf8_lossy(v).to_string())
}
