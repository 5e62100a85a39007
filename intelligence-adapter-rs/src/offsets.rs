//! Per-partition commit watermarks.
//!
//! Messages of one partition finish out of order. A partition's committable
//! position only advances across a contiguous run of finished offsets, so a
//! commit never acknowledges a message that is still in flight.

use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
struct PartitionWatermark {
    /// Dispatched offsets not yet folded into the watermark, and whether each has finished
    pending: BTreeMap<i64, bool>,
    /// Next offset covered by the watermark but not yet handed out for commit
    uncommitted_next: Option<i64>,
    /// Last next-offset handed out for commit
    committed_next: Option<i64>,
}

impl PartitionWatermark {
    fn advance(&mut self) {
        while let Some(entry) = self.pending.first_entry() {
            if !*entry.get() {
                break;
            }
            let offset = *entry.key();
            entry.remove();
            self.uncommitted_next = Some(offset + 1);
        }
    }
}

/// Commit bookkeeping for every assigned partition
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<(String, i32), PartitionWatermark>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `offset` entered the pipeline
    pub fn dispatched(&mut self, topic: &str, partition: i32, offset: i64) {
        self.partitions
            .entry((topic.to_string(), partition))
            .or_default()
            .pending
            .insert(offset, false);
    }

    /// Records that `offset` reached a terminal outcome
    pub fn completed(&mut self, topic: &str, partition: i32, offset: i64) {
        if let Some(watermark) = self.partitions.get_mut(&(topic.to_string(), partition)) {
            if let Some(done) = watermark.pending.get_mut(&offset) {
                *done = true;
                watermark.advance();
            }
        }
    }

    /// Partitions whose watermark moved since the last call, as
    /// `(topic, partition, next_offset)`
    pub fn take_committable(&mut self) -> Vec<(String, i32, i64)> {
        let mut ready: Vec<(String, i32, i64)> = self
            .partitions
            .iter_mut()
            .filter_map(|((topic, partition), watermark)| {
                let next = watermark.uncommitted_next.take()?;
                if watermark.committed_next.is_some_and(|c| c >= next) {
                    return None;
                }
                watermark.committed_next = Some(next);
                Some((topic.clone(), *partition, next))
            })
            .collect();
        ready.sort();
        ready
    }

    /// Hands `next_offset` out again on the next [`take_committable`] unless
    /// the watermark has moved past it meanwhile
    ///
    /// [`take_committable`]: OffsetTracker::take_committable
    pub fn commit_failed(&mut self, topic: &str, partition: i32, next_offset: i64) {
        if let Some(watermark) = self.partitions.get_mut(&(topic.to_string(), partition)) {
            if watermark.committed_next == Some(next_offset) {
                watermark.committed_next = None;
            }
            if watermark.uncommitted_next.map_or(true, |n| n < next_offset) {
                watermark.uncommitted_next = Some(next_offset);
            }
        }
    }

    /// Dispatched messages without a terminal outcome
    pub fn in_flight(&self) -> usize {
        self.partitions
            .values()
            .map(|w| w.pending.values().filter(|done| !**done).count())
            .sum()
    }

    /// Lowest unfinished offset of a partition
    pub fn blocking_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.partitions
            .get(&(topic.to_string(), partition))
            .and_then(|w| w.pending.iter().find(|(_, done)| !**done).map(|(offset, _)| *offset))
    }
}
