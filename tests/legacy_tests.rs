// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Legacy version-1.02 reader tests.
//!
//! The engine never emits 1.02, so these tests assemble files byte by
//! byte: a version line, a file header pointing at the index section,
//! uncompressed message records, then message-definition and per-topic
//! index records.

mod common;

use std::fs;

use common::{temp_bag_path, StringMsg};
use robobag::{Bag, BagError, BagMode, Query, Time, View};

// ============================================================================
// Raw record assembly
// ============================================================================

fn push_field(header: &mut Vec<u8>, key: &str, value: &[u8]) {
    let entry_len = key.len() + 1 + value.len();
    header.extend_from_slice(&(entry_len as u32).to_le_bytes());
    header.extend_from_slice(key.as_bytes());
    header.push(b'=');
    header.extend_from_slice(value);
}

fn push_record(out: &mut Vec<u8>, fields: &[(&str, Vec<u8>)], data: &[u8]) {
    let mut header = Vec::new();
    for (key, value) in fields {
        push_field(&mut header, key, value);
    }
    out.extend_from_slice(&(header.len() as u32).to_le_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
}

fn time_bytes(sec: u32, nsec: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&sec.to_le_bytes());
    out.extend_from_slice(&nsec.to_le_bytes());
    out
}

fn string_payload(text: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(text.len() as u32).to_le_bytes());
    out.extend_from_slice(text.as_bytes());
    out
}

/// Assemble a small 1.02 bag with one topic and the given messages.
fn build_legacy_bag(messages: &[(u32, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"#ROSBAG V1.2\n");

    // File header record; index_pos patched once known.
    let header_record_at = out.len();
    push_record(
        &mut out,
        &[("op", vec![0x03]), ("index_pos", 0u64.to_le_bytes().to_vec())],
        &[],
    );

    // Message data records, remembering their absolute offsets.
    let mut offsets = Vec::new();
    for (sec, text) in messages {
        offsets.push(out.len() as u64);
        push_record(
            &mut out,
            &[
                ("op", vec![0x02]),
                ("topic", b"/legacy".to_vec()),
                ("time", time_bytes(*sec, 0)),
            ],
            &string_payload(text),
        );
    }

    // Index section: one message definition, one per-topic index record.
    let index_pos = out.len() as u64;
    push_record(
        &mut out,
        &[
            ("op", vec![0x01]),
            ("topic", b"/legacy".to_vec()),
            ("type", b"std_msgs/String".to_vec()),
            ("md5sum", b"992ce8a1687cec8c8bd883ec73ca41d1".to_vec()),
        ],
        b"string data",
    );

    let mut index_data = Vec::new();
    for ((sec, _), offset) in messages.iter().zip(&offsets) {
        index_data.extend_from_slice(&time_bytes(*sec, 0));
        index_data.extend_from_slice(&offset.to_le_bytes());
    }
    push_record(
        &mut out,
        &[
            ("op", vec![0x05]),
            ("topic", b"/legacy".to_vec()),
            ("ver", 0u32.to_le_bytes().to_vec()),
            ("count", (messages.len() as u32).to_le_bytes().to_vec()),
        ],
        &index_data,
    );

    // Patch index_pos inside the already-written file header record.
    let needle = b"index_pos=";
    let at = out[header_record_at..]
        .windows(needle.len())
        .position(|w| w == needle)
        .unwrap()
        + header_record_at
        + needle.len();
    out[at..at + 8].copy_from_slice(&index_pos.to_le_bytes());

    out
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_legacy_version_is_reported() {
    let (path, _guard) = temp_bag_path("legacy_version");
    fs::write(&path, build_legacy_bag(&[(5, "hello")])).unwrap();

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();
    assert_eq!(bag.major_version(), 1);
    assert_eq!(bag.minor_version(), 2);
    assert_eq!(bag.connections().count(), 1);
}

#[test]
fn test_legacy_messages_read_in_time_order() {
    let (path, _guard) = temp_bag_path("legacy_order");
    fs::write(
        &path,
        build_legacy_bag(&[(5, "five"), (1, "one"), (9, "nine")]),
    )
    .unwrap();

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();

    let view = View::of(&bag);
    let read_back: Vec<(u32, String)> = view
        .iter()
        .map(|m| (m.time().sec, m.instantiate::<StringMsg>().unwrap().data))
        .collect();
    assert_eq!(
        read_back,
        vec![
            (1, "one".to_string()),
            (5, "five".to_string()),
            (9, "nine".to_string())
        ]
    );
}

#[test]
fn test_legacy_connection_metadata() {
    let (path, _guard) = temp_bag_path("legacy_meta");
    fs::write(&path, build_legacy_bag(&[(2, "x")])).unwrap();

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();
    let conn = bag.connections().next().unwrap();
    assert_eq!(conn.topic, "/legacy");
    assert_eq!(conn.datatype, "std_msgs/String");
    assert_eq!(conn.md5sum, "992ce8a1687cec8c8bd883ec73ca41d1");
    assert_eq!(conn.msg_def, "string data");
}

#[test]
fn test_legacy_time_window_query() {
    let (path, _guard) = temp_bag_path("legacy_window");
    fs::write(
        &path,
        build_legacy_bag(&[(1, "a"), (3, "b"), (5, "c"), (7, "d")]),
    )
    .unwrap();

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();
    let mut view = View::new();
    view.add_query(
        &bag,
        Query::new()
            .start_time(Time::new(3, 0))
            .end_time(Time::new(5, 0)),
    );
    let secs: Vec<u32> = view.iter().map(|m| m.time().sec).collect();
    assert_eq!(secs, vec![3, 5]);
}

#[test]
fn test_legacy_without_index_is_unindexed() {
    let (path, _guard) = temp_bag_path("legacy_unindexed");
    let mut out = Vec::new();
    out.extend_from_slice(b"#ROSBAG V1.2\n");
    push_record(
        &mut out,
        &[("op", vec![0x03]), ("index_pos", 0u64.to_le_bytes().to_vec())],
        &[],
    );
    fs::write(&path, out).unwrap();

    let mut bag = Bag::new();
    let err = bag.open(&path, BagMode::Read).unwrap_err();
    assert!(matches!(err, BagError::Unindexed(_)), "got {err:?}");
}

#[test]
fn test_legacy_cannot_be_appended() {
    let (path, _guard) = temp_bag_path("legacy_append");
    fs::write(&path, build_legacy_bag(&[(1, "a")])).unwrap();

    let mut bag = Bag::new();
    let err = bag.open(&path, BagMode::Append).unwrap_err();
    assert!(matches!(err, BagError::Bag(_)), "got {err:?}");
}
