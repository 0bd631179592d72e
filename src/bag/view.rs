// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Ordered iteration over recorded messages.
//!
//! A [`Query`] selects connections by predicate and bounds the time
//! window; a [`View`] merges the matching per-connection indexes of one or
//! more bags into one globally time-ordered sequence. Iteration keeps a
//! min-heap of per-connection cursors, so advancing is O(log N) in the
//! number of selected connections. Ties on time are broken by bag order,
//! then connection id, then insertion order, so iteration is stable even
//! when two chunks carry messages with identical `(connection, time)`.
//!
//! Dereferencing yields a [`MessageInstance`], which materializes its
//! payload lazily: nothing is decompressed until the instance is asked for
//! its bytes.

use std::collections::BinaryHeap;

use crate::core::{BagError, Result, Time, TIME_MAX, TIME_MIN};
use crate::io::record;
use crate::msg::RosMessage;
use crate::types::{ConnectionInfo, IndexEntry};

use super::Bag;

/// Predicate and time window selecting a subset of a bag's messages.
pub struct Query<'a> {
    predicate: Box<dyn Fn(&ConnectionInfo) -> bool + 'a>,
    start_time: Time,
    end_time: Time,
}

impl Default for Query<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Query<'a> {
    /// Select every message.
    pub fn new() -> Self {
        Query {
            predicate: Box::new(|_| true),
            start_time: TIME_MIN,
            end_time: TIME_MAX,
        }
    }

    /// Select connections matching a predicate.
    pub fn filter(predicate: impl Fn(&ConnectionInfo) -> bool + 'a) -> Self {
        Query {
            predicate: Box::new(predicate),
            start_time: TIME_MIN,
            end_time: TIME_MAX,
        }
    }

    /// Select connections on any of the given topics.
    pub fn topics<S: Into<String>>(topics: impl IntoIterator<Item = S>) -> Self {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        Query::filter(move |conn| topics.iter().any(|t| *t == conn.topic))
    }

    /// Restrict to messages at or after `start_time`.
    pub fn start_time(mut self, start_time: Time) -> Self {
        self.start_time = start_time;
        self
    }

    /// Restrict to messages at or before `end_time`.
    pub fn end_time(mut self, end_time: Time) -> Self {
        self.end_time = end_time;
        self
    }
}

/// An ordered iteration over the messages selected by one or more
/// `(bag, query)` pairs.
pub struct View<'a> {
    queries: Vec<(&'a Bag, Query<'a>)>,
}

impl Default for View<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> View<'a> {
    /// Create an empty view.
    pub fn new() -> Self {
        View {
            queries: Vec::new(),
        }
    }

    /// Create a view over everything in one bag.
    pub fn of(bag: &'a Bag) -> Self {
        let mut view = View::new();
        view.add_query(bag, Query::new());
        view
    }

    /// Add a `(bag, query)` pair to the view.
    pub fn add_query(&mut self, bag: &'a Bag, query: Query<'a>) {
        self.queries.push((bag, query));
    }

    fn cursors(&self) -> Vec<Cursor<'a>> {
        let mut cursors = Vec::new();
        for (bag_order, (bag, query)) in self.queries.iter().enumerate() {
            for (&conn_id, entries) in bag.connection_indexes() {
                let Some(connection) = bag.connection_by_id(conn_id) else {
                    continue;
                };
                if !(query.predicate)(connection) {
                    continue;
                }
                let lo = entries.partition_point(|e| e.time < query.start_time);
                let hi = entries.partition_point(|e| e.time <= query.end_time);
                if lo < hi {
                    cursors.push(Cursor {
                        bag,
                        bag_order,
                        connection,
                        entries: &entries[lo..hi],
                        pos: 0,
                    });
                }
            }
        }
        cursors
    }

    /// Number of messages the view selects.
    pub fn len(&self) -> usize {
        self.cursors().iter().map(|c| c.entries.len()).sum()
    }

    /// True if the view selects no messages.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Connections selected by the view, in `(bag, id)` order.
    pub fn connections(&self) -> Vec<&'a ConnectionInfo> {
        self.cursors().iter().map(|c| c.connection).collect()
    }

    /// Iterate the selected messages in global time order.
    pub fn iter(&self) -> ViewIterator<'a> {
        ViewIterator {
            heap: self.cursors().into_iter().map(HeapEntry).collect(),
        }
    }
}

impl<'a> IntoIterator for &View<'a> {
    type Item = MessageInstance<'a>;
    type IntoIter = ViewIterator<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// One connection's slice of index entries, partially consumed.
struct Cursor<'a> {
    bag: &'a Bag,
    bag_order: usize,
    connection: &'a ConnectionInfo,
    entries: &'a [IndexEntry],
    pos: usize,
}

impl Cursor<'_> {
    fn head(&self) -> &IndexEntry {
        &self.entries[self.pos]
    }

    fn key(&self) -> (Time, usize, u32) {
        (self.head().time, self.bag_order, self.connection.id)
    }
}

/// Min-heap adapter: the cursor with the smallest key comes out first.
struct HeapEntry<'a>(Cursor<'a>);

impl PartialEq for HeapEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.0.key() == other.0.key()
    }
}

impl Eq for HeapEntry<'_> {}

impl PartialOrd for HeapEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry<'_> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.0.key().cmp(&self.0.key())
    }
}

/// Iterator over a view's messages in global time order.
pub struct ViewIterator<'a> {
    heap: BinaryHeap<HeapEntry<'a>>,
}

impl<'a> Iterator for ViewIterator<'a> {
    type Item = MessageInstance<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let HeapEntry(mut cursor) = self.heap.pop()?;
        let entry = *cursor.head();
        let instance = MessageInstance {
            bag: cursor.bag,
            connection: cursor.connection,
            entry,
        };
        cursor.pos += 1;
        if cursor.pos < cursor.entries.len() {
            self.heap.push(HeapEntry(cursor));
        }
        Some(instance)
    }
}

/// A lazy handle to one recorded message.
///
/// Metadata is available without touching the file; the payload is read
/// (and its chunk decompressed) on demand. A deserialized message owns its
/// data and may outlive the instance.
pub struct MessageInstance<'a> {
    bag: &'a Bag,
    connection: &'a ConnectionInfo,
    entry: IndexEntry,
}

impl MessageInstance<'_> {
    /// Timestamp of the message.
    pub fn time(&self) -> Time {
        self.entry.time
    }

    /// Topic the message was recorded on.
    pub fn topic(&self) -> &str {
        &self.connection.topic
    }

    /// Message type name.
    pub fn datatype(&self) -> &str {
        &self.connection.datatype
    }

    /// MD5 sum of the message schema.
    pub fn md5sum(&self) -> &str {
        &self.connection.md5sum
    }

    /// Full message definition text.
    pub fn message_definition(&self) -> &str {
        &self.connection.msg_def
    }

    /// The connection the message belongs to.
    pub fn connection(&self) -> &ConnectionInfo {
        self.connection
    }

    /// Caller id recorded in the connection header, if any.
    pub fn caller_id(&self) -> Option<String> {
        record::read_opt_string_field(
            &self.connection.header,
            crate::io::constants::CALLERID_FIELD_NAME,
        )
    }

    /// Size of the serialized payload in bytes.
    pub fn size(&self) -> Result<u32> {
        Ok(self.raw_bytes()?.len() as u32)
    }

    /// The serialized payload.
    pub fn raw_bytes(&self) -> Result<Vec<u8>> {
        let (_, payload) = self.bag.read_message_data(&self.entry)?;
        Ok(payload)
    }

    /// Deserialize the message as `T`.
    ///
    /// Fails unless `T`'s MD5 sum matches the connection's (either side
    /// may be `"*"`).
    pub fn instantiate<T: RosMessage>(&self) -> Result<T> {
        let md5 = T::md5sum();
        if md5 != "*" && self.connection.md5sum != "*" && md5 != self.connection.md5sum {
            return Err(BagError::bag(format!(
                "md5sum mismatch for topic {}: requested {md5}, recorded {}",
                self.connection.topic, self.connection.md5sum
            )));
        }
        self.bag.instantiate(&self.entry)
    }
}
