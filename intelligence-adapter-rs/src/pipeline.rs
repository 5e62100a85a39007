//! # Message Pipeline
//!
//! Drives one message through decode, route, backend call, transform and
//! publish. Every error is handled here; nothing escapes to the consumer loop
//! except the resulting [`MessageOutcome`].

use std::sync::Arc;

use resilience::{Attempted, Cancellation, ResilienceError};
use tokio::time::Instant;
use tracing::{debug, info, warn, Span};

use crate::bus::BusMessage;
use crate::dead_letter::{DeadLetterCause, DeadLetterRouter, SalvagedIds};
use crate::envelope::{decode, EventEnvelope};
use crate::gateway::{BackendError, BackendGateway, RawResponse};
use crate::metrics::AdapterMetrics;
use crate::operation::{OperationRequest, OperationType};
use crate::publisher::{EventPublisher, PublishError, Published};
use crate::router::{Handler, Router};
use crate::transformer::{transform, AnalysisOutput, ErrorCode};

/// Final state of one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// A completed event was published (or its publish exhausted retries)
    Completed { operation: OperationType },
    /// A failed event was published (or its publish exhausted retries)
    Failed {
        operation: OperationType,
        error_code: ErrorCode,
    },
    /// The message went to the dead letter queue
    DeadLettered { error_type: &'static str },
    /// Shutdown interrupted a backend or publish backoff wait. Nothing was
    /// published, so the offset stays uncommitted.
    Abandoned,
}

impl MessageOutcome {
    /// Terminal outcomes make the offset committable
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MessageOutcome::Abandoned)
    }
}

pub struct MessagePipeline {
    router: Router,
    gateway: Arc<dyn BackendGateway>,
    publisher: EventPublisher,
    dead_letters: DeadLetterRouter,
    metrics: Arc<AdapterMetrics>,
}

impl MessagePipeline {
    pub fn new(
        router: Router,
        gateway: Arc<dyn BackendGateway>,
        publisher: EventPublisher,
        dead_letters: DeadLetterRouter,
        metrics: Arc<AdapterMetrics>,
    ) -> Self {
        Self {
            router,
            gateway,
            publisher,
            dead_letters,
            metrics,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Processes `message`. `cancel` interrupts retry backoff waits.
    pub async fn process(
        &self,
        message: &BusMessage,
        dispatched_at: Instant,
        cancel: &Cancellation,
    ) -> MessageOutcome {
        let outcome = self.run(message, dispatched_at, cancel).await;
        self.metrics.record_outcome(&outcome, dispatched_at.elapsed());
        outcome
    }

    async fn run(&self, message: &BusMessage, dispatched_at: Instant, cancel: &Cancellation) -> MessageOutcome {
        let envelope = match decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Undecodable message");
                let ids = SalvagedIds::from_bytes(&message.payload);
                return self
                    .dead_letter(message, ids, DeadLetterCause::Decode(e), dispatched_at, cancel)
                    .await;
            }
        };

        let span = Span::current();
        span.record("correlation_id", tracing::field::display(envelope.correlation_id));
        span.record("event_id", tracing::field::display(envelope.event_id));

        let handler = match self.router.route(&message.topic, &envelope) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(error = %e, "Unroutable message");
                let ids = SalvagedIds::from_envelope(&envelope);
                return self
                    .dead_letter(message, ids, DeadLetterCause::Unroutable(e), dispatched_at, cancel)
                    .await;
            }
        };

        let output = self.invoke(handler, &envelope, cancel).await;
        let Some(output) = output else {
            info!(operation = %handler.operation, "Shutdown interrupted retry backoff, leaving message for redelivery");
            return MessageOutcome::Abandoned;
        };

        self.publish(&envelope, &message.topic, output, dispatched_at, cancel)
            .await
    }

    /// Calls the backend through the route's resilience client. `None` means
    /// the call was abandoned because of cancellation.
    async fn invoke(
        &self,
        handler: &Handler,
        envelope: &EventEnvelope,
        cancel: &Cancellation,
    ) -> Option<AnalysisOutput> {
        let operation = handler.operation;
        let correlation_id = envelope.correlation_id;

        let request = match OperationRequest::from_envelope(operation, envelope) {
            Ok(request) => request,
            Err(e) => {
                warn!(operation = %operation, error = %e, "Invalid analysis request");
                return Some(AnalysisOutput::failure(
                    operation,
                    correlation_id,
                    ErrorCode::InvalidRequest,
                    e.to_string(),
                    false,
                ));
            }
        };

        let result = handler
            .client
            .execute(cancel, |attempt| {
                debug!(operation = %operation, attempt = %attempt, "Backend attempt");
                self.gateway.invoke(&request)
            })
            .await;
        self.metrics.record_circuit(&handler.client);

        match result {
            Ok(Attempted { value, attempts }) => {
                debug!(operation = %operation, attempts = %attempts, "Backend call succeeded");
                Some(self.transform(operation, correlation_id, &value))
            }
            Err(e) => failure_output(operation, correlation_id, e),
        }
    }

    fn transform(&self, operation: OperationType, correlation_id: uuid::Uuid, raw: &RawResponse) -> AnalysisOutput {
        let output = transform(operation, correlation_id, raw);
        if !output.warnings().is_empty() {
            warn!(
                operation = %operation,
                warnings = %output.warnings().len(),
                "Backend scores clamped to [0, 1]"
            );
        }
        output
    }

    async fn publish(
        &self,
        origin: &EventEnvelope,
        input_topic: &str,
        output: AnalysisOutput,
        dispatched_at: Instant,
        cancel: &Cancellation,
    ) -> MessageOutcome {
        let operation = output.operation_type;
        let outcome = match output.failure_details() {
            None => MessageOutcome::Completed { operation },
            Some(details) => MessageOutcome::Failed {
                operation,
                error_code: details.error_code,
            },
        };

        let published = match outcome {
            MessageOutcome::Completed { .. } => {
                self.publisher
                    .publish_completed(origin, input_topic, output, dispatched_at, cancel)
                    .await
            }
            _ => {
                self.publisher
                    .publish_failed(origin, input_topic, output, dispatched_at, cancel)
                    .await
            }
        };

        settle(outcome, published)
    }

    async fn dead_letter(
        &self,
        message: &BusMessage,
        ids: SalvagedIds,
        cause: DeadLetterCause,
        dispatched_at: Instant,
        cancel: &Cancellation,
    ) -> MessageOutcome {
        let error_type = cause.error_type();
        let dead_letter = self.dead_letters.to_dead_letter(message, &cause, 0);
        let published = self
            .publisher
            .publish_dead_letter(&ids, &dead_letter, dispatched_at, cancel)
            .await;
        settle(MessageOutcome::DeadLettered { error_type }, published)
    }
}

/// Exhaustion is logged and counted by the publisher and the outcome stays
/// terminal. Only an interrupted publish hands the message back.
fn settle(outcome: MessageOutcome, published: Result<Published, PublishError>) -> MessageOutcome {
    match published {
        Err(e) if e.is_cancelled() => {
            info!(error = %e, "Shutdown interrupted publish retry, leaving message for redelivery");
            MessageOutcome::Abandoned
        }
        _ => outcome,
    }
}

/// Maps a resilience failure to the failed event payload
fn failure_output(
    operation: OperationType,
    correlation_id: uuid::Uuid,
    err: ResilienceError<BackendError>,
) -> Option<AnalysisOutput> {
    let (code, retry_allowed) = match &err {
        ResilienceError::Cancelled { .. } => return None,
        ResilienceError::CircuitOpen { .. } => (ErrorCode::CircuitOpen, true),
        ResilienceError::Exhausted { .. } => (ErrorCode::BackendUnavailable, true),
        ResilienceError::Permanent { .. } => (ErrorCode::BackendRejected, false),
    };
    warn!(
        operation = %operation,
        error_code = %code,
        attempts = %err.attempts(),
        error = %err,
        "Analysis failed"
    );

    let mut output = AnalysisOutput::failure(operation, correlation_id, code, err.to_string(), retry_allowed);
    output
        .metadata
        .insert("attempts".into(), serde_json::json!(err.attempts()));
    if let Some(status) = backend_status(&err) {
        output
            .metadata
            .insert("backend_status".into(), serde_json::json!(status));
    }
    Some(output)
}

fn backend_status(err: &ResilienceError<BackendError>) -> Option<u16> {
    match err {
        ResilienceError::Exhausted { source, .. } | ResilienceError::Permanent { source, .. } => source.status(),
        _ => None,
    }
}
