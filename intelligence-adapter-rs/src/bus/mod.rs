//! # Message Bus
//!
//! Partitioned, offset-based consumer and producer traits with Kafka
//! semantics. Committing `next_offset` acknowledges every record of the
//! partition below it.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

pub use memory::InMemoryBus;

#[cfg(feature = "kafka")]
pub use kafka::{KafkaBus, KafkaConsumer, KafkaProducer};

/// One record read from an input topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

/// Bus transport failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("bus connection failed: {0}")]
    Connection(String),

    #[error("subscription failed: {0}")]
    Subscribe(String),

    #[error("poll failed: {0}")]
    Poll(String),

    #[error("offset commit failed for {topic}/{partition}: {reason}")]
    Commit {
        topic: String,
        partition: i32,
        reason: String,
    },

    #[error("send to '{topic}' failed: {reason}")]
    Send { topic: String, reason: String },

    #[error("consumer is closed")]
    Closed,
}

/// Reads records and commits consumed positions
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    /// Joins the consumer group for `topics`. Consumption resumes from the
    /// last committed offsets.
    async fn subscribe(&self, topics: &[String]) -> Result<(), BusError>;

    /// Returns up to `max` records, waiting at most `timeout` for the first
    async fn poll_batch(&self, max: usize, timeout: Duration) -> Result<Vec<BusMessage>, BusError>;

    /// Commits `next_offset` (the offset of the next record to read)
    async fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<(), BusError>;

    async fn close(&self) -> Result<(), BusError>;
}

/// Writes records to output topics
#[async_trait]
pub trait MessageProducer: Send + Sync {
    async fn send(&self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> Result<(), BusError>;
}
