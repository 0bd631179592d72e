// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Append mode tests.
//!
//! Appending re-ingests the existing index, truncates the trailer and
//! continues the write state machine; the regenerated trailer must cover
//! the union of old and new messages.

mod common;

use common::{temp_bag_path, Int32Msg, StringMsg};
use robobag::{Bag, BagError, BagMode, CompressionType, Time, View};

fn write_initial(path: &std::path::Path) {
    let mut bag = Bag::new();
    bag.open(path, BagMode::Write).unwrap();
    bag.write("/a", Time::new(1, 0), &StringMsg::new("a1"))
        .unwrap();
    bag.write("/b", Time::new(2, 0), &StringMsg::new("b1"))
        .unwrap();
    bag.close().unwrap();
}

#[test]
fn test_append_one_message_on_new_topic() {
    // S4: the appended topic gets a fresh id; all prior messages survive.
    let (path, _guard) = temp_bag_path("s4");
    write_initial(&path);

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Append).unwrap();
    bag.write("/c", Time::new(3, 0), &StringMsg::new("c1"))
        .unwrap();
    bag.close().unwrap();

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();
    assert_eq!(bag.connections().count(), 3);
    let fresh = bag.connections().find(|c| c.topic == "/c").unwrap();
    assert_eq!(fresh.id, 2, "appended topic must get the next dense id");

    let view = View::of(&bag);
    let texts: Vec<String> = view
        .iter()
        .map(|m| m.instantiate::<StringMsg>().unwrap().data)
        .collect();
    assert_eq!(texts, vec!["a1", "b1", "c1"]);
}

#[test]
fn test_append_reuses_existing_connection() {
    let (path, _guard) = temp_bag_path("append_reuse");
    write_initial(&path);

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Append).unwrap();
    bag.write("/a", Time::new(5, 0), &StringMsg::new("a2"))
        .unwrap();
    bag.close().unwrap();

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();
    assert_eq!(bag.connections().count(), 2);
    let view = View::of(&bag);
    assert_eq!(view.len(), 3);
}

#[test]
fn test_append_round_trip_is_union() {
    // Property 8 over several appends.
    let (path, _guard) = temp_bag_path("append_union");

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Write).unwrap();
    for i in 0..10 {
        bag.write("/n", Time::new(1 + i, 0), &Int32Msg::new(i as i32))
            .unwrap();
    }
    bag.close().unwrap();

    for round in 0..3u32 {
        let mut bag = Bag::new();
        bag.open(&path, BagMode::Append).unwrap();
        for i in 0..5u32 {
            let sec = 100 + round * 10 + i;
            bag.write("/n", Time::new(sec, 0), &Int32Msg::new(sec as i32))
                .unwrap();
        }
        bag.close().unwrap();
    }

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();
    let view = View::of(&bag);
    let values: Vec<i32> = view
        .iter()
        .map(|m| m.instantiate::<Int32Msg>().unwrap().data)
        .collect();
    assert_eq!(values.len(), 25);
    let mut sorted = values.clone();
    sorted.sort_unstable();
    assert_eq!(values, sorted, "append must preserve global time order");
}

#[test]
fn test_append_to_compressed_bag() {
    let (path, _guard) = temp_bag_path("append_compressed");

    let mut bag = Bag::new();
    bag.set_compression(CompressionType::Bz2);
    bag.open(&path, BagMode::Write).unwrap();
    for i in 0..20u32 {
        bag.write("/z", Time::new(1 + i, 0), &StringMsg::new("m".repeat(128)))
            .unwrap();
    }
    bag.close().unwrap();

    let mut bag = Bag::new();
    bag.set_compression(CompressionType::Lz4);
    bag.open(&path, BagMode::Append).unwrap();
    for i in 20..30u32 {
        bag.write("/z", Time::new(1 + i, 0), &StringMsg::new("n".repeat(128)))
            .unwrap();
    }
    bag.close().unwrap();

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();
    let view = View::of(&bag);
    assert_eq!(view.len(), 30);
    for message in &view {
        assert!(message.instantiate::<StringMsg>().is_ok());
    }
}

#[test]
fn test_append_missing_file_fails() {
    let (path, _guard) = temp_bag_path("append_missing");
    let mut bag = Bag::new();
    let err = bag.open(&path, BagMode::Append).unwrap_err();
    assert!(matches!(err, BagError::Io(_)));
}

#[test]
fn test_append_nothing_preserves_content() {
    let (path, _guard) = temp_bag_path("append_noop");
    write_initial(&path);

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Append).unwrap();
    bag.close().unwrap();

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();
    assert_eq!(View::of(&bag).len(), 2);
}
