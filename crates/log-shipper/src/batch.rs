// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Label-keyed aggregation of log lines.
//!
//! A [`Batch`] groups entries into [`Stream`]s, one per distinct label set,
//! and tracks the running byte size and age used by the sealing policy:
//!
//! ```text
//!   add(labels, ts, line) ──> streams[label_set_key(labels)].entries.push(..)
//!                              bytes += line.len()
//!
//!   seal when: age() >= batch_wait  OR  size_bytes_after(line) > batch_size
//! ```
//!
//! Batches are owned by exactly one delivery client. A sealed batch is
//! serialized into the client's queue; the in-memory one is replaced by an
//! empty batch in the same critical section.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

use crate::labels::{label_set_key, LabelSet};

/// Converts a wall clock timestamp to nanoseconds since the Unix epoch.
///
/// Timestamps before the epoch are clamped to zero.
#[must_use]
pub fn unix_nanos(timestamp: SystemTime) -> i64 {
    timestamp
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Nanoseconds since the Unix epoch.
    pub timestamp: i64,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    pub labels: LabelSet,
    pub entries: Vec<Entry>,
    pub last_timestamp: i64,
}

impl Stream {
    fn new(labels: LabelSet) -> Self {
        Stream {
            labels,
            entries: Vec::new(),
            last_timestamp: i64::MIN,
        }
    }

    /// Stable sort by timestamp. Entries sharing a timestamp keep their
    /// arrival order.
    pub fn sort(&mut self) {
        self.entries.sort_by_key(|entry| entry.timestamp);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    streams: HashMap<String, Stream>,
    bytes: usize,
    /// Sequence number assigned when the batch is sealed.
    #[serde(default)]
    pub seq: u64,
    #[serde(skip, default = "Instant::now")]
    created_at: Instant,
}

impl Default for Batch {
    fn default() -> Self {
        Batch::new()
    }
}

impl Batch {
    #[must_use]
    pub fn new() -> Self {
        Batch {
            streams: HashMap::new(),
            bytes: 0,
            seq: 0,
            created_at: Instant::now(),
        }
    }

    /// Appends `line` to the stream identified by `labels`, creating it on
    /// first use. The batch age starts with its first entry.
    pub fn add(&mut self, labels: LabelSet, timestamp: i64, line: String) {
        if self.streams.is_empty() {
            self.created_at = Instant::now();
        }
        self.bytes += line.len();
        let stream = self
            .streams
            .entry(label_set_key(&labels))
            .or_insert_with(|| Stream::new(labels));
        stream.last_timestamp = stream.last_timestamp.max(timestamp);
        stream.entries.push(Entry { timestamp, line });
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.bytes
    }

    /// Size the batch would have once `line` is added.
    #[must_use]
    pub fn size_bytes_after(&self, line: &str) -> usize {
        self.bytes + line.len()
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.streams.values().map(|s| s.entries.len()).sum()
    }

    pub fn streams(&self) -> impl Iterator<Item = &Stream> {
        self.streams.values()
    }

    /// Sorts the entries of every stream. Must run before the batch is encoded
    /// for a push, backends reject out-of-order entries within a stream.
    pub fn sort(&mut self) {
        for stream in self.streams.values_mut() {
            stream.sort();
        }
    }

    /// True when either sealing threshold is crossed by adding `line`.
    #[must_use]
    pub fn should_seal_before(&self, line: &str, batch_size: usize) -> bool {
        !self.is_empty() && self.size_bytes_after(line) > batch_size
    }

    /// True when the batch has been open for at least `batch_wait`.
    #[must_use]
    pub fn is_expired(&self, batch_wait: Duration) -> bool {
        !self.is_empty() && self.age() >= batch_wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_new_batch_is_empty() {
        let batch = Batch::new();

        assert!(batch.is_empty());
        assert_eq!(batch.size_bytes(), 0);
        assert_eq!(batch.entry_count(), 0);
    }

    #[test]
    fn test_add_groups_by_label_set() {
        let mut batch = Batch::new();
        batch.add(labels(&[("app", "a")]), 1, "one".to_string());
        batch.add(labels(&[("app", "b")]), 2, "two".to_string());
        batch.add(labels(&[("app", "a")]), 3, "three".to_string());

        assert_eq!(batch.streams().count(), 2);
        assert_eq!(batch.entry_count(), 3);
        assert_eq!(batch.size_bytes(), 11);
        let stream_a = batch
            .streams()
            .find(|s| s.labels["app"] == "a")
            .unwrap();
        assert_eq!(stream_a.entries.len(), 2);
        assert_eq!(stream_a.last_timestamp, 3);
    }

    #[test]
    fn test_size_bytes_after() {
        let mut batch = Batch::new();
        batch.add(LabelSet::new(), 1, "12345".to_string());

        assert_eq!(batch.size_bytes_after("123"), 8);
        assert_eq!(batch.size_bytes(), 5);
    }

    #[test]
    fn test_stable_sort_keeps_arrival_order_for_ties() {
        let mut batch = Batch::new();
        let lbs = labels(&[("app", "a")]);
        batch.add(lbs.clone(), 5, "b".to_string());
        batch.add(lbs.clone(), 3, "a".to_string());
        batch.add(lbs, 5, "c".to_string());

        batch.sort();

        let stream = batch.streams().next().unwrap();
        let order: Vec<(i64, &str)> = stream
            .entries
            .iter()
            .map(|e| (e.timestamp, e.line.as_str()))
            .collect();
        assert_eq!(order, vec![(3, "a"), (5, "b"), (5, "c")]);
    }

    #[test]
    fn test_should_seal_on_size() {
        let mut batch = Batch::new();
        // an empty batch never seals, even for an oversized line
        assert!(!batch.should_seal_before(&"x".repeat(2000), 1000));

        batch.add(LabelSet::new(), 1, "x".repeat(600));
        assert!(!batch.should_seal_before(&"y".repeat(400), 1000));
        assert!(batch.should_seal_before(&"y".repeat(401), 1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_follows_batch_wait() {
        let mut batch = Batch::new();
        batch.add(LabelSet::new(), 1, "line".to_string());

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!batch.is_expired(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(batch.is_expired(Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_batch_never_expires() {
        let batch = Batch::new();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!batch.is_expired(Duration::from_secs(10)));
    }

    #[test]
    fn test_serialized_batch_restores_streams() {
        let mut batch = Batch::new();
        batch.seq = 7;
        batch.add(labels(&[("app", "a")]), 10, "hello".to_string());

        let payload = serde_json::to_vec(&batch).unwrap();
        let restored: Batch = serde_json::from_slice(&payload).unwrap();

        assert_eq!(restored.seq, 7);
        assert_eq!(restored.size_bytes(), 5);
        assert_eq!(
            restored.streams().next().unwrap().entries,
            vec![Entry { timestamp: 10, line: "hello".to_string() }]
        );
    }

    #[test]
    fn test_unix_nanos() {
        let ts = UNIX_EPOCH + Duration::from_millis(1500);
        assert_eq!(unix_nanos(ts), 1_500_000_000);
        assert_eq!(unix_nanos(UNIX_EPOCH - Duration::from_secs(1)), 0);
    }

    proptest! {
        #[test]
        fn prop_sort_is_stable(timestamps in proptest::collection::vec(0i64..5, 0..50)) {
            let mut batch = Batch::new();
            for (i, ts) in timestamps.iter().enumerate() {
                batch.add(LabelSet::new(), *ts, i.to_string());
            }
            batch.sort();

            if let Some(stream) = batch.streams().next() {
                for pair in stream.entries.windows(2) {
                    prop_assert!(pair[0].timestamp <= pair[1].timestamp);
                    if pair[0].timestamp == pair[1].timestamp {
                        let a: usize = pair[0].line.parse().unwrap();
                        let b: usize = pair[1].line.parse().unwrap();
                        prop_assert!(a < b);
                    }
                }
            };
        }
    }
}
