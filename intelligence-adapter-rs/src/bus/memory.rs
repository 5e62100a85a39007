//! In-process bus with partitioned logs and committed offsets. Clones share
//! state, so a test can drive the adapter through one handle and inspect the
//! produced records through another. Re-subscribing resumes from the last
//! committed offsets, the way a restarted group member would.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{BusError, BusMessage, MessageConsumer, MessageProducer};

/// A record written through [`MessageProducer::send`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedRecord {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct BusState {
    logs: HashMap<String, Vec<Vec<BusMessage>>>,
    subscribed: Vec<String>,
    positions: HashMap<(String, i32), i64>,
    committed: HashMap<(String, i32), i64>,
    commit_log: Vec<(String, i32, i64)>,
    produced: Vec<ProducedRecord>,
    failing_sends: u32,
    failing_commits: u32,
    closed: bool,
}

impl BusState {
    fn append(&mut self, topic: &str, partition: i32, key: Option<Vec<u8>>, payload: Vec<u8>) -> i64 {
        let partitions = self.logs.entry(topic.to_string()).or_insert_with(|| vec![Vec::new()]);
        let idx = partition.max(0) as usize;
        if partitions.len() <= idx {
            partitions.resize_with(idx + 1, Vec::new);
        }
        let log = &mut partitions[idx];
        let offset = log.len() as i64;
        log.push(BusMessage {
            topic: topic.to_string(),
            partition: idx as i32,
            offset,
            key,
            payload,
        });
        offset
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryBus {
    state: Arc<Mutex<BusState>>,
    notify: Arc<Notify>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `topic` with `partitions` empty partitions
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let mut state = self.lock();
        let logs = state.logs.entry(topic.to_string()).or_default();
        if logs.len() < partitions {
            logs.resize_with(partitions, Vec::new);
        }
    }

    /// Appends an input record and returns its offset
    pub fn publish(&self, topic: &str, partition: i32, payload: impl Into<Vec<u8>>) -> i64 {
        let offset = self.lock().append(topic, partition, None, payload.into());
        self.notify.notify_one();
        offset
    }

    /// Every record sent through the producer, in order
    pub fn produced(&self) -> Vec<ProducedRecord> {
        self.lock().produced.clone()
    }

    pub fn produced_to(&self, topic: &str) -> Vec<ProducedRecord> {
        self.lock()
            .produced
            .iter()
            .filter(|r| r.topic == topic)
            .cloned()
            .collect()
    }

    /// Last committed `next_offset` of a partition
    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.lock().committed.get(&(topic.to_string(), partition)).copied()
    }

    /// Every commit in call order
    pub fn commit_log(&self) -> Vec<(String, i32, i64)> {
        self.lock().commit_log.clone()
    }

    /// Makes the next `count` sends fail
    pub fn fail_next_sends(&self, count: u32) {
        self.lock().failing_sends = count;
    }

    /// Makes the next `count` commits fail as if the broker rejected them
    pub fn fail_next_commits(&self, count: u32) {
        self.lock().failing_commits = count;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn take_ready(&self, max: usize) -> Result<Vec<BusMessage>, BusError> {
        let mut state = self.lock();
        if state.closed {
            return Err(BusError::Closed);
        }

        let mut batch = Vec::new();
        let topics = state.subscribed.clone();
        for topic in topics {
            let partitions = state.logs.get(&topic).map(Vec::len).unwrap_or(0);
            for partition in 0..partitions as i32 {
                let key = (topic.clone(), partition);
                let mut position = state.positions.get(&key).copied().unwrap_or(0);
                while batch.len() < max {
                    let next = state
                        .logs
                        .get(&topic)
                        .and_then(|logs| logs.get(partition as usize))
                        .and_then(|log| log.get(position as usize))
                        .cloned();
                    match next {
                        Some(message) => {
                            batch.push(message);
                            position += 1;
                        }
                        None => break,
                    }
                }
                state.positions.insert(key, position);
                if batch.len() >= max {
                    return Ok(batch);
                }
            }
        }
        Ok(batch)
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MessageConsumer for InMemoryBus {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BusError> {
        let mut state = self.lock();
        state.closed = false;
        state.subscribed = topics.to_vec();
        state.positions = state.committed.clone();
        for topic in topics {
            state.logs.entry(topic.clone()).or_insert_with(|| vec![Vec::new()]);
        }
        Ok(())
    }

    async fn poll_batch(&self, max: usize, timeout: Duration) -> Result<Vec<BusMessage>, BusError> {
        let batch = self.take_ready(max)?;
        if !batch.is_empty() {
            return Ok(batch);
        }

        if tokio::time::timeout(timeout, self.notify.notified()).await.is_err() {
            return Ok(Vec::new());
        }
        self.take_ready(max)
    }

    async fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<(), BusError> {
        let mut state = self.lock();
        if state.closed {
            return Err(BusError::Commit {
                topic: topic.to_string(),
                partition,
                reason: "consumer is closed".to_string(),
            });
        }
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(BusError::Commit {
                topic: topic.to_string(),
                partition,
                reason: "commit rejected".to_string(),
            });
        }
        state.committed.insert((topic.to_string(), partition), next_offset);
        state.commit_log.push((topic.to_string(), partition, next_offset));
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.lock().closed = true;
        Ok(())
    }
}

#[async_trait]
impl MessageProducer for InMemoryBus {
    async fn send(&self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> Result<(), BusError> {
        let mut state = self.lock();
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(BusError::Send {
                topic: topic.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        state.produced.push(ProducedRecord {
            topic: topic.to_string(),
            key: key.map(<[u8]>::to_vec),
            payload: payload.to_vec(),
        });
        state.append(topic, 0, key.map(<[u8]>::to_vec), payload.to_vec());
        Ok(())
    }
}
