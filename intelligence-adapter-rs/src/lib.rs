//! # Intelligence Adapter
//!
//! Event-driven bridge between a partitioned message bus and the HTTP
//! intelligence scoring backend. Analysis requests are consumed from input
//! topics, routed by operation type, sent to the backend through a per-route
//! circuit breaker and retry policy, and answered with completed, failed or
//! dead letter events.
//!
//! Delivery is at-least-once: an input offset is committed only after its
//! message reached a terminal outcome.

pub mod bus;
pub mod consumer;
pub mod dead_letter;
pub mod envelope;
pub mod gateway;
pub mod logging;
pub mod metrics;
pub mod offsets;
pub mod operation;
pub mod pipeline;
pub mod publisher;
pub mod router;
pub mod transformer;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use config_rs::AdapterConfig;
use resilience::{Cancellation, CircuitBreakerConfig, RetryPolicy};
use tracing::info;

pub use bus::{BusError, BusMessage, InMemoryBus, MessageConsumer, MessageProducer};
pub use consumer::{ConsumerError, ConsumerLoop, ConsumerLoopSettings, ConsumerReport, ConsumerState};
pub use dead_letter::{DeadLetterEnvelope, DeadLetterRouter, Redactor};
pub use envelope::{decode, encode, DecodeError, EventEnvelope, EventKind, EventSource, EventType};
pub use gateway::{BackendError, BackendGateway, HttpBackendGateway, RawResponse};
pub use metrics::{AdapterMetrics, AnalysisStats, MetricsSnapshot};
pub use operation::{OperationRequest, OperationType};
pub use pipeline::{MessageOutcome, MessagePipeline};
pub use publisher::{EventPublisher, PublishError, PublishRetry, TopicResolver};
pub use router::{Router, UnroutableError};
pub use transformer::{AnalysisOutput, ErrorCode};

/// A fully wired adapter: pipeline, consumer loop and metrics
pub struct AdapterRuntime {
    consumer: ConsumerLoop,
    pipeline: Arc<MessagePipeline>,
    metrics: Arc<AdapterMetrics>,
}

impl AdapterRuntime {
    /// Wires every component from `config`. The transports and the backend
    /// are injected so the same runtime runs against Kafka or the in-memory
    /// bus.
    pub fn new(
        config: &AdapterConfig,
        consumer: Arc<dyn MessageConsumer>,
        producer: Arc<dyn MessageProducer>,
        gateway: Arc<dyn BackendGateway>,
    ) -> Self {
        let identity = EventSource {
            service: config.service.name.clone(),
            instance_id: config.service.instance_id.clone(),
        };

        let breaker = CircuitBreakerConfig {
            failure_threshold: config.resilience.failure_threshold,
            cooldown: config.resilience.cooldown(),
        };
        let policy = RetryPolicy {
            max_retries: config.resilience.max_retries,
            base_delay: config.resilience.base_delay(),
            max_delay: config.resilience.max_delay(),
        };
        let router = Router::for_topics(&config.bus.input_topics, breaker, policy);
        let metrics = Arc::new(AdapterMetrics::new(router.clients().cloned().collect()));

        let publisher = EventPublisher::new(
            producer,
            identity.clone(),
            TopicResolver::new(config.bus.completed_topic.clone(), config.bus.failed_topic.clone()),
            PublishRetry {
                max_attempts: config.publisher.max_attempts,
                base_delay: config.publisher.base_delay(),
            },
            Arc::clone(&metrics),
        );
        let dead_letters = DeadLetterRouter::new(Redactor::new(&config.dead_letter.redacted_keys), identity);

        let pipeline = Arc::new(MessagePipeline::new(
            router,
            gateway,
            publisher,
            dead_letters,
            Arc::clone(&metrics),
        ));

        let consumer = ConsumerLoop::new(
            consumer,
            Arc::clone(&pipeline),
            Arc::clone(&metrics),
            ConsumerLoopSettings {
                topics: config.bus.input_topics.clone(),
                max_in_flight: config.consumer.max_in_flight,
                poll_batch_size: config.bus.poll_batch_size,
                poll_timeout: config.bus.poll_timeout(),
                drain_timeout: config.consumer.drain_timeout(),
            },
        );

        info!(
            service = %config.service.name,
            instance_id = %config.service.instance_id,
            topics = ?config.bus.input_topics,
            backend = %config.backend.base_url,
            max_in_flight = %config.consumer.max_in_flight,
            "Intelligence adapter configured"
        );

        Self {
            consumer,
            pipeline,
            metrics,
        }
    }

    pub fn metrics(&self) -> Arc<AdapterMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn pipeline(&self) -> &Arc<MessagePipeline> {
        &self.pipeline
    }

    pub fn consumer(&self) -> &ConsumerLoop {
        &self.consumer
    }

    /// Consumes until `shutdown` fires, then drains and stops
    pub async fn run(&self, shutdown: Cancellation) -> Result<ConsumerReport, ConsumerError> {
        self.consumer.run(shutdown).await
    }
}
