//! Kafka transport built on `rdkafka`. Auto-commit is disabled; offsets are
//! committed only through [`MessageConsumer::commit`], which waits for the
//! broker to acknowledge the commit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use config_rs::BusSettings;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as KafkaMessage;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use super::{BusError, BusMessage, MessageConsumer, MessageProducer};

/// Upper bound on waiting for follow-up records once a batch has started
const BATCH_FILL_WAIT: Duration = Duration::from_millis(5);

/// Per-send delivery timeout
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KafkaConsumer {
    consumer: Arc<StreamConsumer>,
}

impl KafkaConsumer {
    pub fn new(settings: &BusSettings) -> Result<Self, BusError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &settings.bootstrap_servers)
            .set("group.id", &settings.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &settings.auto_offset_reset)
            .set("session.timeout.ms", settings.session_timeout_ms.to_string())
            .create()
            .map_err(|e| BusError::Connection(e.to_string()))?;

        Ok(Self {
            consumer: Arc::new(consumer),
        })
    }
}

#[async_trait]
impl MessageConsumer for KafkaConsumer {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BusError> {
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&names)
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        info!(topics = ?names, "Subscribed to Kafka topics");
        Ok(())
    }

    async fn poll_batch(&self, max: usize, timeout: Duration) -> Result<Vec<BusMessage>, BusError> {
        let mut batch = Vec::with_capacity(max);
        let mut wait = timeout;

        while batch.len() < max {
            match tokio::time::timeout(wait, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Err(e)) => {
                    if batch.is_empty() {
                        return Err(BusError::Poll(e.to_string()));
                    }
                    warn!(error = %e, "Kafka receive failed mid-batch");
                    break;
                }
                Ok(Ok(msg)) => {
                    batch.push(BusMessage {
                        topic: msg.topic().to_string(),
                        partition: msg.partition(),
                        offset: msg.offset(),
                        key: msg.key().map(<[u8]>::to_vec),
                        payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                    });
                    wait = BATCH_FILL_WAIT;
                }
            }
        }

        Ok(batch)
    }

    async fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<(), BusError> {
        let commit_error = |reason: String| BusError::Commit {
            topic: topic.to_string(),
            partition,
            reason,
        };

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(next_offset))
            .map_err(|e| commit_error(e.to_string()))?;

        // A sync commit blocks until the broker answers, so it runs off the runtime threads
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| commit_error(e.to_string()))?
            .map_err(|e| commit_error(e.to_string()))?;

        debug!(topic = %topic, partition = %partition, next_offset = %next_offset, "Committed offset");
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.consumer.unsubscribe();
        info!("Kafka consumer unsubscribed");
        Ok(())
    }
}

pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    pub fn new(settings: &BusSettings) -> Result<Self, BusError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &settings.bootstrap_servers)
            .set("message.timeout.ms", SEND_TIMEOUT.as_millis().to_string())
            .set("acks", "all")
            .create()
            .map_err(|e| BusError::Connection(e.to_string()))?;

        Ok(Self { producer })
    }

    /// Waits for queued deliveries
    pub fn flush(&self, timeout: Duration) -> Result<(), BusError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|e| BusError::Connection(e.to_string()))
    }
}

#[async_trait]
impl MessageProducer for KafkaProducer {
    async fn send(&self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> Result<(), BusError> {
        let mut record = FutureRecord::<[u8], [u8]>::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }

        self.producer
            .send(record, Timeout::After(SEND_TIMEOUT))
            .await
            .map(|_| ())
            .map_err(|(e, _)| BusError::Send {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Consumer and producer sharing one set of bus settings
pub struct KafkaBus {
    pub consumer: KafkaConsumer,
    pub producer: KafkaProducer,
}

impl KafkaBus {
    pub fn connect(settings: &BusSettings) -> Result<Self, BusError> {
        Ok(Self {
            consumer: KafkaConsumer::new(settings)?,
            producer: KafkaProducer::new(settings)?,
        })
    }
}
