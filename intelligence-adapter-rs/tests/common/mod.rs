//! Shared fixtures for the adapter scenario tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use config_rs::AdapterConfig;
use intelligence_adapter::bus::InMemoryBus;
use intelligence_adapter::{
    decode, AdapterRuntime, BackendError, BackendGateway, ConsumerError, ConsumerReport, EventEnvelope,
    OperationRequest, OperationType, RawResponse,
};
use resilience::{cancellation, CancellationSource};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const INPUT: &str = "dev.archon-intelligence.cmd.omniintelligence.code-analysis-requested.v1";
pub const COMPLETED: &str = "dev.archon-intelligence.cmd.omniintelligence.code-analysis-requested.completed.v1";
pub const FAILED: &str = "dev.archon-intelligence.cmd.omniintelligence.code-analysis-requested.failed.v1";
pub const DLQ: &str = "dev.archon-intelligence.cmd.omniintelligence.code-analysis-requested.v1.dlq";

type Responder = dyn Fn(&OperationRequest, usize) -> Result<RawResponse, BackendError> + Send + Sync;
type DelayFn = dyn Fn(&OperationRequest) -> Duration + Send + Sync;

/// Backend double answering from a closure. The closure receives the
/// request and the 1-based call number.
pub struct ScriptedGateway {
    responder: Box<Responder>,
    delay: Box<DelayFn>,
    calls: Mutex<Vec<OperationType>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&OperationRequest, usize) -> Result<RawResponse, BackendError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            delay: Box::new(|_| Duration::ZERO),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Always answers `body` with a 200
    pub fn answering(body: Value) -> Self {
        Self::new(move |_, _| Ok(ok(body.clone())))
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.with_delay_fn(move |_| delay)
    }

    pub fn with_delay_fn<F>(mut self, delay: F) -> Self
    where
        F: Fn(&OperationRequest) -> Duration + Send + Sync + 'static,
    {
        self.delay = Box::new(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, operation: OperationType) -> usize {
        self.calls.lock().unwrap().iter().filter(|op| **op == operation).count()
    }

    /// Highest number of concurrent invocations observed
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendGateway for ScriptedGateway {
    async fn invoke(&self, request: &OperationRequest) -> Result<RawResponse, BackendError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.operation_type);
            calls.len()
        };

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let delay = (self.delay)(request);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        (self.responder)(request, call)
    }
}

pub fn ok(body: Value) -> RawResponse {
    RawResponse {
        status: 200,
        body,
        latency: Duration::from_millis(3),
    }
}

pub fn server_error() -> BackendError {
    BackendError::Server {
        status: 503,
        body: "unavailable".to_string(),
    }
}

/// Adapter settings tuned for fast scenario runs
pub fn test_config() -> AdapterConfig {
    let mut config = AdapterConfig::default();
    config.service.instance_id = "scenario-1".to_string();
    config.bus.input_topics = vec![INPUT.to_string()];
    config.bus.poll_timeout_ms = 50;
    config.bus.poll_batch_size = 10;
    config.consumer.max_in_flight = 10;
    config.consumer.drain_timeout_ms = 30_000;
    config.resilience.failure_threshold = 5;
    config.resilience.cooldown_ms = 60_000;
    config.resilience.max_retries = 0;
    config.resilience.base_delay_ms = 1_000;
    config.resilience.max_delay_ms = 30_000;
    config.publisher.base_delay_ms = 1;
    config
}

/// An inbound analysis request as raw bus bytes
pub fn request(operation: &str, content: &str, event_id: Uuid, correlation_id: Uuid) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "event_id": event_id,
        "event_type": "dev.archon-intelligence.request.code-analysis.v1",
        "correlation_id": correlation_id,
        "timestamp": "2025-01-15T10:30:00.000Z",
        "version": "1.0.0",
        "source": { "service": "archon-server", "instance_id": "archon-1" },
        "metadata": { "trace_id": "trace-1" },
        "payload": {
            "operation_type": operation,
            "target": { "source_path": "src/lib.rs", "content": content, "language": "rust" },
        },
    }))
    .unwrap()
}

pub fn simple_request(operation: &str) -> Vec<u8> {
    request(operation, "fn main() {}", Uuid::new_v4(), Uuid::new_v4())
}

pub fn published(bus: &InMemoryBus, topic: &str) -> Vec<EventEnvelope> {
    bus.produced_to(topic)
        .iter()
        .map(|record| decode(&record.payload).expect("published events decode"))
        .collect()
}

/// Polls `condition` on virtual time, panicking after 50 seconds
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// A runtime consuming from the in-memory bus in a background task
pub struct Running {
    pub runtime: Arc<AdapterRuntime>,
    source: CancellationSource,
    handle: JoinHandle<Result<ConsumerReport, ConsumerError>>,
}

impl Running {
    pub fn start(config: &AdapterConfig, bus: &InMemoryBus, gateway: Arc<ScriptedGateway>) -> Self {
        let runtime = Arc::new(AdapterRuntime::new(
            config,
            Arc::new(bus.clone()),
            Arc::new(bus.clone()),
            gateway,
        ));
        let (source, shutdown) = cancellation();
        let task_runtime = Arc::clone(&runtime);
        let handle = tokio::spawn(async move { task_runtime.run(shutdown).await });

        Self {
            runtime,
            source,
            handle,
        }
    }

    /// Signals shutdown and waits for the loop to stop
    pub async fn stop(self) -> ConsumerReport {
        self.source.cancel();
        self.handle
            .await
            .expect("consumer task panicked")
            .expect("consumer failed")
    }
}
