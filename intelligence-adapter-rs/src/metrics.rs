//! # Adapter Metrics
//!
//! Counters are kept twice: in process atomics that back the
//! [`MetricsSnapshot`] and [`AnalysisStats`] handed to health surfaces, and
//! through the `metrics` facade for whichever recorder the host installs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use resilience::{CircuitSnapshot, ResilienceClient};
use serde::Serialize;

use crate::operation::OperationType;
use crate::pipeline::MessageOutcome;

/// Point-in-time view of message processing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub messages_consumed: u64,
    /// Messages that reached a terminal outcome
    pub messages_processed: u64,
    pub messages_completed: u64,
    pub messages_failed: u64,
    pub messages_dead_lettered: u64,
    pub messages_abandoned: u64,
    /// Messages skipped because their task panicked
    pub messages_panicked: u64,
    pub publish_exhausted: u64,
    pub average_processing_time_ms: f64,
    pub circuits: Vec<CircuitSnapshot>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OperationStats {
    pub success: u64,
    pub failure: u64,
}

/// Analysis success and failure counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnalysisStats {
    pub total_success: u64,
    pub total_failure: u64,
    pub by_operation: BTreeMap<OperationType, OperationStats>,
}

#[derive(Debug)]
pub struct AdapterMetrics {
    consumed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    abandoned: AtomicU64,
    panicked: AtomicU64,
    publish_exhausted: AtomicU64,
    processing_time_total_ms: AtomicU64,
    analysis: Mutex<BTreeMap<OperationType, OperationStats>>,
    clients: Vec<ResilienceClient>,
}

impl AdapterMetrics {
    /// Tracks circuit state for `clients`
    pub fn new(clients: Vec<ResilienceClient>) -> Self {
        Self {
            consumed: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
            publish_exhausted: AtomicU64::new(0),
            processing_time_total_ms: AtomicU64::new(0),
            analysis: Mutex::new(BTreeMap::new()),
            clients,
        }
    }

    pub fn record_consumed(&self, topic: &str) {
        self.consumed.fetch_add(1, Ordering::Relaxed);
        counter!("intelligence_adapter.messages.consumed", 1, "topic" => topic.to_string());
    }

    /// Records the outcome of one message and its dispatch-to-outcome time
    pub fn record_outcome(&self, outcome: &MessageOutcome, elapsed: Duration) {
        match outcome {
            MessageOutcome::Completed { operation } => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                self.record_analysis(*operation, true);
                counter!("intelligence_adapter.messages.completed", 1, "route" => operation.as_str());
            }
            MessageOutcome::Failed { operation, error_code } => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.record_analysis(*operation, false);
                counter!(
                    "intelligence_adapter.messages.failed",
                    1,
                    "route" => operation.as_str(),
                    "error_code" => error_code.as_str()
                );
            }
            MessageOutcome::DeadLettered { error_type } => {
                self.dead_lettered.fetch_add(1, Ordering::Relaxed);
                counter!("intelligence_adapter.messages.dead_lettered", 1, "error_type" => *error_type);
            }
            MessageOutcome::Abandoned => {
                self.abandoned.fetch_add(1, Ordering::Relaxed);
                counter!("intelligence_adapter.messages.abandoned", 1);
                return;
            }
        }

        let ms = elapsed.as_millis() as u64;
        self.processing_time_total_ms.fetch_add(ms, Ordering::Relaxed);
        histogram!("intelligence_adapter.processing_time_ms", ms as f64);
    }

    pub fn record_panicked(&self, topic: &str) {
        self.panicked.fetch_add(1, Ordering::Relaxed);
        counter!("intelligence_adapter.messages.panicked", 1, "topic" => topic.to_string());
    }

    pub fn record_publish_exhausted(&self, kind: &'static str) {
        self.publish_exhausted.fetch_add(1, Ordering::Relaxed);
        counter!("intelligence_adapter.messages.publish_exhausted", 1, "kind" => kind);
    }

    /// Exports the state of a route's circuit as a gauge
    pub fn record_circuit(&self, client: &ResilienceClient) {
        gauge!(
            "intelligence_adapter.circuit_state",
            client.state().as_gauge(),
            "route" => client.name().to_string()
        );
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let dead_lettered = self.dead_lettered.load(Ordering::Relaxed);
        let processed = completed + failed + dead_lettered;
        let total_ms = self.processing_time_total_ms.load(Ordering::Relaxed);

        MetricsSnapshot {
            messages_consumed: self.consumed.load(Ordering::Relaxed),
            messages_processed: processed,
            messages_completed: completed,
            messages_failed: failed,
            messages_dead_lettered: dead_lettered,
            messages_abandoned: self.abandoned.load(Ordering::Relaxed),
            messages_panicked: self.panicked.load(Ordering::Relaxed),
            publish_exhausted: self.publish_exhausted.load(Ordering::Relaxed),
            average_processing_time_ms: if processed == 0 {
                0.0
            } else {
                total_ms as f64 / processed as f64
            },
            circuits: self.clients.iter().map(ResilienceClient::snapshot).collect(),
        }
    }

    pub fn analysis_stats(&self) -> AnalysisStats {
        let by_operation = self
            .analysis
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        AnalysisStats {
            total_success: by_operation.values().map(|s| s.success).sum(),
            total_failure: by_operation.values().map(|s| s.failure).sum(),
            by_operation,
        }
    }

    fn record_analysis(&self, operation: OperationType, success: bool) {
        let mut stats = self.analysis.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = stats.entry(operation).or_default();
        if success {
            entry.success += 1;
        } else {
            entry.failure += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformer::ErrorCode;

    #[test]
    fn test_snapshot_counts_and_average() {
        let metrics = AdapterMetrics::new(Vec::new());
        metrics.record_consumed("t");
        metrics.record_consumed("t");
        metrics.record_consumed("t");

        metrics.record_outcome(
            &MessageOutcome::Completed { operation: OperationType::AssessQuality },
            Duration::from_millis(100),
        );
        metrics.record_outcome(
            &MessageOutcome::Failed {
                operation: OperationType::AssessQuality,
                error_code: ErrorCode::CircuitOpen,
            },
            Duration::from_millis(20),
        );
        metrics.record_outcome(&MessageOutcome::Abandoned, Duration::from_secs(30));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_consumed, 3);
        assert_eq!(snapshot.messages_processed, 2);
        assert_eq!(snapshot.messages_abandoned, 1);
        assert_eq!(snapshot.average_processing_time_ms, 60.0);
    }

    #[test]
    fn test_analysis_stats_per_operation() {
        let metrics = AdapterMetrics::new(Vec::new());
        metrics.record_outcome(
            &MessageOutcome::Completed { operation: OperationType::GetPatterns },
            Duration::ZERO,
        );
        metrics.record_outcome(
            &MessageOutcome::Failed {
                operation: OperationType::AnalyzePerformance,
                error_code: ErrorCode::BackendUnavailable,
            },
            Duration::ZERO,
        );
        metrics.record_outcome(
            &MessageOutcome::DeadLettered { error_type: "decode_error" },
            Duration::ZERO,
        );

        let stats = metrics.analysis_stats();
        assert_eq!(stats.total_success, 1);
        assert_eq!(stats.total_failure, 1);
        assert_eq!(stats.by_operation[&OperationType::GetPatterns].success, 1);
        assert_eq!(stats.by_operation[&OperationType::AnalyzePerformance].failure, 1);
    }
}
