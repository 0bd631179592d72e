// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! View and query tests.
//!
//! Covers topic and predicate filtering, time windows, multi-bag merging,
//! tie-break stability and typed materialization.

mod common;

use common::{temp_bag_path, Int32Msg, StringMsg};
use robobag::{Bag, BagMode, Query, Time, View};

fn two_topic_bag(path: &std::path::Path) {
    let mut bag = Bag::new();
    bag.open(path, BagMode::Write).unwrap();
    for i in 0..10u32 {
        bag.write("/even", Time::new(2 * i + 2, 0), &Int32Msg::new(i as i32))
            .unwrap();
        bag.write("/odd", Time::new(2 * i + 1, 0), &Int32Msg::new(i as i32))
            .unwrap();
    }
    bag.close().unwrap();
}

#[test]
fn test_topic_filter() {
    let (path, _guard) = temp_bag_path("topic_filter");
    two_topic_bag(&path);

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();

    let mut view = View::new();
    view.add_query(&bag, Query::topics(["/even"]));
    assert_eq!(view.len(), 10);
    for message in &view {
        assert_eq!(message.topic(), "/even");
        assert_eq!(message.time().sec % 2, 0);
    }
}

#[test]
fn test_predicate_filter() {
    let (path, _guard) = temp_bag_path("predicate");
    two_topic_bag(&path);

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();

    let mut view = View::new();
    view.add_query(&bag, Query::filter(|conn| conn.topic.ends_with("dd")));
    let topics: Vec<String> = view.iter().map(|m| m.topic().to_string()).collect();
    assert_eq!(topics.len(), 10);
    assert!(topics.iter().all(|t| t == "/odd"));
}

#[test]
fn test_time_window() {
    let (path, _guard) = temp_bag_path("time_window");
    two_topic_bag(&path);

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();

    let mut view = View::new();
    view.add_query(
        &bag,
        Query::new()
            .start_time(Time::new(5, 0))
            .end_time(Time::new(10, 0)),
    );
    let secs: Vec<u32> = view.iter().map(|m| m.time().sec).collect();
    assert_eq!(secs, vec![5, 6, 7, 8, 9, 10], "window endpoints are inclusive");
}

#[test]
fn test_global_order_across_connections() {
    let (path, _guard) = temp_bag_path("global_order");
    two_topic_bag(&path);

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();

    let view = View::of(&bag);
    let secs: Vec<u32> = view.iter().map(|m| m.time().sec).collect();
    assert_eq!(secs, (1..=20).collect::<Vec<u32>>());
}

#[test]
fn test_merge_across_bags() {
    let (path_a, _guard_a) = temp_bag_path("merge_a");
    let (path_b, _guard_b) = temp_bag_path("merge_b");

    let mut bag = Bag::new();
    bag.open(&path_a, BagMode::Write).unwrap();
    for &sec in &[1u32, 4, 7] {
        bag.write("/a", Time::new(sec, 0), &StringMsg::new(format!("a{sec}")))
            .unwrap();
    }
    bag.close().unwrap();

    let mut bag = Bag::new();
    bag.open(&path_b, BagMode::Write).unwrap();
    for &sec in &[2u32, 5, 8] {
        bag.write("/b", Time::new(sec, 0), &StringMsg::new(format!("b{sec}")))
            .unwrap();
    }
    bag.close().unwrap();

    let mut bag_a = Bag::new();
    bag_a.open(&path_a, BagMode::Read).unwrap();
    let mut bag_b = Bag::new();
    bag_b.open(&path_b, BagMode::Read).unwrap();

    let mut view = View::new();
    view.add_query(&bag_a, Query::new());
    view.add_query(&bag_b, Query::new());
    let texts: Vec<String> = view
        .iter()
        .map(|m| m.instantiate::<StringMsg>().unwrap().data)
        .collect();
    assert_eq!(texts, vec!["a1", "b2", "a4", "b5", "a7", "b8"]);
}

#[test]
fn test_equal_times_are_stable() {
    // Duplicate (connection, time) pairs, including across chunks, replay
    // in insertion order; across bags the first-added bag wins ties.
    let (path_a, _guard_a) = temp_bag_path("ties_a");
    let (path_b, _guard_b) = temp_bag_path("ties_b");

    let mut bag = Bag::new();
    bag.set_chunk_threshold(256);
    bag.open(&path_a, BagMode::Write).unwrap();
    for i in 0..6 {
        bag.write(
            "/t",
            Time::new(5, 0),
            &StringMsg::new(format!("a{i}-{}", "pad".repeat(30))),
        )
        .unwrap();
    }
    bag.close().unwrap();

    let mut bag = Bag::new();
    bag.open(&path_b, BagMode::Write).unwrap();
    for i in 0..3 {
        bag.write("/t", Time::new(5, 0), &StringMsg::new(format!("b{i}")))
            .unwrap();
    }
    bag.close().unwrap();

    let mut bag_a = Bag::new();
    bag_a.open(&path_a, BagMode::Read).unwrap();
    assert!(bag_a.chunks().len() > 1, "ties must span chunks");
    let mut bag_b = Bag::new();
    bag_b.open(&path_b, BagMode::Read).unwrap();

    let mut view = View::new();
    view.add_query(&bag_a, Query::new());
    view.add_query(&bag_b, Query::new());
    let order: Vec<String> = view
        .iter()
        .map(|m| {
            m.instantiate::<StringMsg>()
                .unwrap()
                .data
                .chars()
                .take(2)
                .collect()
        })
        .collect();
    assert_eq!(
        order,
        vec!["a0", "a1", "a2", "a3", "a4", "a5", "b0", "b1", "b2"]
    );
}

#[test]
fn test_md5_mismatch_rejected() {
    let (path, _guard) = temp_bag_path("md5_mismatch");

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Write).unwrap();
    bag.write("/s", Time::new(1, 0), &StringMsg::new("hello"))
        .unwrap();
    bag.close().unwrap();

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();
    let view = View::of(&bag);
    let message = view.iter().next().unwrap();
    assert!(message.instantiate::<Int32Msg>().is_err());
    assert!(message.instantiate::<StringMsg>().is_ok());
    // RawMessage declares "*" and matches anything.
    assert!(message.instantiate::<robobag::msg::RawMessage>().is_ok());
}

#[test]
fn test_message_instance_metadata() {
    let (path, _guard) = temp_bag_path("metadata");

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Write).unwrap();
    bag.write("/meta", Time::new(3, 14), &StringMsg::new("pi"))
        .unwrap();
    bag.close().unwrap();

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();
    let view = View::of(&bag);
    let message = view.iter().next().unwrap();
    assert_eq!(message.time(), Time::new(3, 14));
    assert_eq!(message.topic(), "/meta");
    assert_eq!(message.datatype(), "std_msgs/String");
    assert_eq!(message.md5sum(), "992ce8a1687cec8c8bd883ec73ca41d1");
    assert_eq!(message.message_definition(), "string data");
    assert_eq!(message.caller_id(), None);
    assert_eq!(message.size().unwrap(), 6);
    assert_eq!(message.raw_bytes().unwrap().len(), 6);
}

#[test]
fn test_empty_view() {
    let (path, _guard) = temp_bag_path("empty_view");
    two_topic_bag(&path);

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();

    let mut view = View::new();
    view.add_query(&bag, Query::topics(["/missing"]));
    assert!(view.is_empty());
    assert_eq!(view.iter().count(), 0);

    let empty = View::new();
    assert_eq!(empty.iter().count(), 0);
}

#[test]
fn test_view_connections_listing() {
    let (path, _guard) = temp_bag_path("view_conns");
    two_topic_bag(&path);

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();
    let view = View::of(&bag);
    let mut topics: Vec<String> = view
        .connections()
        .iter()
        .map(|c| c.topic.clone())
        .collect();
    topics.sort();
    assert_eq!(topics, vec!["/even", "/odd"]);
}
