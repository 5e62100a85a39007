//! # Publisher
//!
//! Builds completed, failed and dead letter events and writes them to their
//! output topics. Every event gets a fresh `event_id`, carries the originating
//! `correlation_id`, and names the originating `event_id` as its
//! `causation_id`.
//!
//! Sends are retried locally with a short exponential backoff. They never go
//! through a route's resilience client. Exhausting the retries is logged as a
//! fatal at-least-once risk and reported to the caller, which still treats the
//! message as finished. A retry wait interrupted by shutdown ends with
//! [`PublishError::Cancelled`] instead, leaving the message for redelivery.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use resilience::{Backoff, Cancellation, RetryPolicy};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::bus::{BusError, MessageProducer};
use crate::dead_letter::{DeadLetterEnvelope, DeadLetterRouter, SalvagedIds};
use crate::envelope::{encode, EventEnvelope, EventKind, EventSource, EventType};
use crate::metrics::AdapterMetrics;
use crate::transformer::AnalysisOutput;

static VERSIONED_TOPIC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<base>.+)\.(?P<version>v\d+)$")
        .unwrap_or_else(|e| panic!("invalid topic pattern: {}", e))
});

/// Metadata keys carried over from the originating event
const PROPAGATED_METADATA: [&str; 3] = ["trace_id", "span_id", "parent_span_id"];

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("event could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("publish to '{topic}' failed after {attempts} attempts: {source}")]
    Exhausted {
        topic: String,
        attempts: u32,
        source: BusError,
    },

    #[error("publish to '{topic}' cancelled after {attempts} attempts")]
    Cancelled { topic: String, attempts: u32 },
}

impl PublishError {
    /// The event was never written and the message should be redelivered
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PublishError::Cancelled { .. })
    }
}

/// Output topic names for an input topic
#[derive(Debug, Clone, Default)]
pub struct TopicResolver {
    completed_override: Option<String>,
    failed_override: Option<String>,
}

impl TopicResolver {
    pub fn new(completed_override: Option<String>, failed_override: Option<String>) -> Self {
        Self {
            completed_override,
            failed_override,
        }
    }

    /// `<input without .vN>.completed.vN`
    pub fn completed_topic(&self, input_topic: &str) -> String {
        self.completed_override
            .clone()
            .unwrap_or_else(|| derive_topic(input_topic, "completed"))
    }

    /// `<input without .vN>.failed.vN`
    pub fn failed_topic(&self, input_topic: &str) -> String {
        self.failed_override
            .clone()
            .unwrap_or_else(|| derive_topic(input_topic, "failed"))
    }

    pub fn dead_letter_topic(&self, input_topic: &str) -> String {
        DeadLetterRouter::dlq_topic(input_topic)
    }
}

fn derive_topic(input_topic: &str, outcome: &str) -> String {
    match VERSIONED_TOPIC_RE.captures(input_topic) {
        Some(caps) => format!("{}.{}.{}", &caps["base"], outcome, &caps["version"]),
        None => format!("{}.{}", input_topic, outcome),
    }
}

/// Local send retry settings
#[derive(Debug, Clone)]
pub struct PublishRetry {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl PublishRetry {
    fn backoff(&self) -> Backoff {
        RetryPolicy {
            max_retries: self.max_attempts.saturating_sub(1),
            base_delay: self.base_delay,
            max_delay: self.base_delay.saturating_mul(8),
        }
        .backoff()
    }
}

/// What a successful publish produced
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub event_id: Uuid,
    pub attempts: u32,
}

pub struct EventPublisher {
    producer: Arc<dyn MessageProducer>,
    identity: EventSource,
    topics: TopicResolver,
    retry: PublishRetry,
    metrics: Arc<AdapterMetrics>,
}

impl EventPublisher {
    pub fn new(
        producer: Arc<dyn MessageProducer>,
        identity: EventSource,
        topics: TopicResolver,
        retry: PublishRetry,
        metrics: Arc<AdapterMetrics>,
    ) -> Self {
        Self {
            producer,
            identity,
            topics,
            retry,
            metrics,
        }
    }

    pub fn topics(&self) -> &TopicResolver {
        &self.topics
    }

    /// Publishes a successful analysis to the completed topic
    pub async fn publish_completed(
        &self,
        origin: &EventEnvelope,
        input_topic: &str,
        output: AnalysisOutput,
        dispatched_at: Instant,
        cancel: &Cancellation,
    ) -> Result<Published, PublishError> {
        let topic = self.topics.completed_topic(input_topic);
        let event_type = origin.event_type.derive(EventKind::Response, "-completed");
        self.publish_output(origin, topic, event_type, output, dispatched_at, "completed", cancel)
            .await
    }

    /// Publishes a failed analysis to the failed topic
    pub async fn publish_failed(
        &self,
        origin: &EventEnvelope,
        input_topic: &str,
        output: AnalysisOutput,
        dispatched_at: Instant,
        cancel: &Cancellation,
    ) -> Result<Published, PublishError> {
        let topic = self.topics.failed_topic(input_topic);
        let event_type = origin.event_type.derive(EventKind::Response, "-failed");
        self.publish_output(origin, topic, event_type, output, dispatched_at, "failed", cancel)
            .await
    }

    /// Publishes a dead letter to `<original_topic>.dlq`.
    ///
    /// Identifiers come from whatever could be salvaged from the original
    /// message; a missing correlation id is replaced with a new one.
    pub async fn publish_dead_letter(
        &self,
        ids: &SalvagedIds,
        dead_letter: &DeadLetterEnvelope,
        dispatched_at: Instant,
        cancel: &Cancellation,
    ) -> Result<Published, PublishError> {
        let topic = self.topics.dead_letter_topic(&dead_letter.original_topic);
        let event_type = match &ids.event_type {
            Some(origin_type) => origin_type.derive(EventKind::Event, "-dead-lettered"),
            None => fallback_dead_letter_type(&dead_letter.original_topic),
        };
        let correlation_id = ids.correlation_id.unwrap_or_else(|| {
            warn!(
                topic = %dead_letter.original_topic,
                offset = %dead_letter.original_offset,
                "Dead letter has no usable correlation_id, assigning a new one"
            );
            Uuid::new_v4()
        });

        let mut payload = serde_json::to_value(dead_letter)?;
        if let Value::Object(map) = &mut payload {
            map.insert(
                "processing_time_ms".into(),
                json!(dispatched_at.elapsed().as_millis() as u64),
            );
        }

        let envelope = EventEnvelope::new(
            event_type,
            correlation_id,
            ids.event_id,
            self.identity.clone(),
            payload,
        );
        self.send_envelope(&topic, &envelope, "dead_letter", cancel).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn publish_output(
        &self,
        origin: &EventEnvelope,
        topic: String,
        event_type: EventType,
        output: AnalysisOutput,
        dispatched_at: Instant,
        kind: &'static str,
        cancel: &Cancellation,
    ) -> Result<Published, PublishError> {
        let output = output.with_processing_time(dispatched_at.elapsed().as_millis() as u64);
        let payload = serde_json::to_value(&output)?;

        let envelope = EventEnvelope::new(
            event_type,
            origin.correlation_id,
            Some(origin.event_id),
            self.identity.clone(),
            payload,
        )
        .with_metadata(propagated_metadata(origin));

        self.send_envelope(&topic, &envelope, kind, cancel).await
    }

    async fn send_envelope(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
        kind: &'static str,
        cancel: &Cancellation,
    ) -> Result<Published, PublishError> {
        let bytes = encode(envelope)?;
        let key = envelope.correlation_id.to_string();
        let mut backoff = self.retry.backoff();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.producer.send(topic, Some(key.as_bytes()), &bytes).await {
                Ok(()) => {
                    debug!(
                        topic = %topic,
                        event_id = %envelope.event_id,
                        causation_id = ?envelope.causation_id,
                        attempts = %attempts,
                        "Published {} event", kind
                    );
                    return Ok(Published {
                        topic: topic.to_string(),
                        event_id: envelope.event_id,
                        attempts,
                    });
                }
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            topic = %topic,
                            attempt = %attempts,
                            delay_ms = %delay.as_millis(),
                            error = %e,
                            "Publish failed, retrying"
                        );
                        if cancel.sleep(delay).await.is_err() {
                            warn!(
                                topic = %topic,
                                kind = %kind,
                                event_id = %envelope.event_id,
                                attempts = %attempts,
                                "Publish retry interrupted by shutdown"
                            );
                            return Err(PublishError::Cancelled {
                                topic: topic.to_string(),
                                attempts,
                            });
                        }
                    }
                    None => {
                        error!(
                            fatal = true,
                            at_least_once_risk = true,
                            topic = %topic,
                            kind = %kind,
                            event_id = %envelope.event_id,
                            correlation_id = %envelope.correlation_id,
                            attempts = %attempts,
                            error = %e,
                            "Publish retries exhausted, event lost; the input offset is still committed"
                        );
                        self.metrics.record_publish_exhausted(kind);
                        return Err(PublishError::Exhausted {
                            topic: topic.to_string(),
                            attempts,
                            source: e,
                        });
                    }
                },
            }
        }
    }
}

fn propagated_metadata(origin: &EventEnvelope) -> Map<String, Value> {
    PROPAGATED_METADATA
        .iter()
        .filter_map(|key| origin.metadata.get(*key).map(|v| (key.to_string(), v.clone())))
        .collect()
}

/// Event type for dead letters whose original type is unreadable
fn fallback_dead_letter_type(original_topic: &str) -> EventType {
    let env = original_topic
        .split('.')
        .next()
        .filter(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        .unwrap_or("unknown");

    EventType {
        env: env.to_string(),
        domain: "intelligence-adapter".to_string(),
        kind: EventKind::Event,
        name: "message-dead-lettered".to_string(),
        version: 1,
    }
}
