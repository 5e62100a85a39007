//! # Consumer Loop
//!
//! `STOPPED -> STARTING -> RUNNING -> DRAINING -> STOPPED`
//!
//! While RUNNING the loop polls bounded batches and dispatches every message
//! as its own task. At most `max_in_flight` messages are in flight; when the
//! limit is reached polling pauses until a message finishes. An offset is
//! committed only once its message, and every earlier message of the same
//! partition, has reached a terminal outcome.
//!
//! The shutdown signal moves the loop to DRAINING: polling stops, backoff
//! waits inside the pipeline are interrupted, and in-flight messages get up to
//! `drain_timeout` to finish. Whatever is still running afterwards is aborted
//! and left uncommitted for redelivery.
//!
//! A panicking message task is logged and its offset treated as terminal, so
//! one bad message cannot hold back commits for the rest of its partition.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use resilience::Cancellation;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::bus::{BusError, MessageConsumer};
use crate::metrics::AdapterMetrics;
use crate::offsets::OffsetTracker;
use crate::pipeline::{MessageOutcome, MessagePipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Stopped,
    Starting,
    Running,
    Draining,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerState::Stopped => write!(f, "STOPPED"),
            ConsumerState::Starting => write!(f, "STARTING"),
            ConsumerState::Running => write!(f, "RUNNING"),
            ConsumerState::Draining => write!(f, "DRAINING"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("consumer failed to start: {0}")]
    Start(#[source] BusError),
}

/// Loop settings, taken from the adapter configuration
#[derive(Debug, Clone)]
pub struct ConsumerLoopSettings {
    pub topics: Vec<String>,
    pub max_in_flight: usize,
    pub poll_batch_size: usize,
    pub poll_timeout: Duration,
    pub drain_timeout: Duration,
}

/// Bookkeeping for one dispatched message, keyed by the id of the task
/// running it so the offset survives the task.
#[derive(Debug, Clone)]
pub struct InFlightLease {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub dispatched_at: Instant,
}

/// Totals for one run of the loop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub dispatched: u64,
    /// Includes `panicked`
    pub terminal: u64,
    pub abandoned: u64,
    /// Message tasks that panicked. Their offsets are committed and the
    /// messages are not retried.
    pub panicked: u64,
    pub commits: u64,
}

/// Per-run state that outlives individual message tasks
#[derive(Default)]
struct Ledger {
    in_flight: HashMap<task::Id, InFlightLease>,
    tracker: OffsetTracker,
    report: ConsumerReport,
}

pub struct ConsumerLoop {
    consumer: Arc<dyn MessageConsumer>,
    pipeline: Arc<MessagePipeline>,
    metrics: Arc<AdapterMetrics>,
    settings: ConsumerLoopSettings,
    state: watch::Sender<ConsumerState>,
}

impl ConsumerLoop {
    pub fn new(
        consumer: Arc<dyn MessageConsumer>,
        pipeline: Arc<MessagePipeline>,
        metrics: Arc<AdapterMetrics>,
        settings: ConsumerLoopSettings,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Stopped);
        Self {
            consumer,
            pipeline,
            metrics,
            settings,
            state,
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Observes state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Runs until `shutdown` is signalled and in-flight work has drained
    pub async fn run(&self, shutdown: Cancellation) -> Result<ConsumerReport, ConsumerError> {
        let mut ledger = Ledger::default();
        let mut tasks: JoinSet<MessageOutcome> = JoinSet::new();
        let slots = Arc::new(Semaphore::new(self.settings.max_in_flight));

        self.transition(ConsumerState::Starting);
        if let Err(e) = self.consumer.subscribe(&self.settings.topics).await {
            error!(error = %e, "Subscription failed");
            self.transition(ConsumerState::Stopped);
            return Err(ConsumerError::Start(e));
        }
        self.transition(ConsumerState::Running);

        loop {
            while let Some(joined) = tasks.try_join_next_with_id() {
                self.finish(joined, &mut ledger);
            }
            self.commit_ready(&mut ledger).await;

            if shutdown.is_cancelled() {
                break;
            }

            let available = slots.available_permits();
            if available == 0 {
                debug!(in_flight = %tasks.len(), "In-flight limit reached, pausing polls");
                tokio::select! {
                    Some(joined) = tasks.join_next_with_id() => self.finish(joined, &mut ledger),
                    _ = shutdown.cancelled() => {}
                }
                continue;
            }

            let max = self.settings.poll_batch_size.min(available);
            let polled = tokio::select! {
                polled = self.consumer.poll_batch(max, self.settings.poll_timeout) => polled,
                _ = shutdown.cancelled() => break,
            };

            let batch = match polled {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "Poll failed");
                    let _ = shutdown.sleep(self.settings.poll_timeout).await;
                    continue;
                }
            };

            for message in batch {
                let permit = match slots.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => match slots.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let lease = InFlightLease {
                    topic: message.topic.clone(),
                    partition: message.partition,
                    offset: message.offset,
                    dispatched_at: Instant::now(),
                };
                ledger.tracker.dispatched(&lease.topic, lease.partition, lease.offset);
                self.metrics.record_consumed(&lease.topic);
                ledger.report.dispatched += 1;

                let span = info_span!(
                    "message",
                    topic = %lease.topic,
                    partition = %lease.partition,
                    offset = %lease.offset,
                    correlation_id = tracing::field::Empty,
                    event_id = tracing::field::Empty,
                );
                let pipeline = Arc::clone(&self.pipeline);
                let cancel = shutdown.clone();
                let dispatched_at = lease.dispatched_at;

                // The permit is released when the task ends, however it ends
                let handle = tasks.spawn(
                    async move {
                        let _permit = permit;
                        pipeline.process(&message, dispatched_at, &cancel).await
                    }
                    .instrument(span),
                );
                ledger.in_flight.insert(handle.id(), lease);
            }
        }

        self.drain(&mut tasks, &mut ledger).await;

        if let Err(e) = self.consumer.close().await {
            warn!(error = %e, "Consumer close failed");
        }
        self.transition(ConsumerState::Stopped);

        let report = ledger.report;
        info!(
            dispatched = %report.dispatched,
            terminal = %report.terminal,
            abandoned = %report.abandoned,
            panicked = %report.panicked,
            commits = %report.commits,
            "Consumer stopped"
        );
        Ok(report)
    }

    async fn drain(&self, tasks: &mut JoinSet<MessageOutcome>, ledger: &mut Ledger) {
        self.transition(ConsumerState::Draining);
        info!(
            in_flight = %tasks.len(),
            drain_timeout_ms = %self.settings.drain_timeout.as_millis(),
            "Draining in-flight messages"
        );

        let deadline = Instant::now() + self.settings.drain_timeout;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next_with_id()).await {
                Ok(Some(joined)) => self.finish(joined, ledger),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        remaining = %tasks.len(),
                        "Drain timeout elapsed, abandoning remaining messages for redelivery"
                    );
                    tasks.abort_all();
                    while let Some(joined) = tasks.join_next_with_id().await {
                        self.finish(joined, ledger);
                    }
                    break;
                }
            }
        }

        self.commit_ready(ledger).await;
    }

    fn finish(&self, joined: Result<(task::Id, MessageOutcome), JoinError>, ledger: &mut Ledger) {
        let (id, outcome) = match joined {
            Ok((id, outcome)) => (id, Ok(outcome)),
            Err(e) => (e.id(), Err(e)),
        };
        let Some(lease) = ledger.in_flight.remove(&id) else {
            error!(task = %id, "Finished task has no in-flight record");
            return;
        };

        match outcome {
            Ok(outcome) if outcome.is_terminal() => {
                ledger.tracker.completed(&lease.topic, lease.partition, lease.offset);
                ledger.report.terminal += 1;
            }
            Ok(_) => {
                debug!(
                    topic = %lease.topic,
                    partition = %lease.partition,
                    offset = %lease.offset,
                    "Message abandoned, offset left uncommitted"
                );
                ledger.report.abandoned += 1;
            }
            Err(e) if e.is_cancelled() => {
                self.metrics.record_outcome(&MessageOutcome::Abandoned, Duration::ZERO);
                ledger.report.abandoned += 1;
            }
            Err(e) => {
                error!(
                    topic = %lease.topic,
                    partition = %lease.partition,
                    offset = %lease.offset,
                    error = %e,
                    "Message task panicked, skipping message"
                );
                self.metrics.record_panicked(&lease.topic);
                ledger.tracker.completed(&lease.topic, lease.partition, lease.offset);
                ledger.report.terminal += 1;
                ledger.report.panicked += 1;
            }
        }
    }

    async fn commit_ready(&self, ledger: &mut Ledger) {
        for (topic, partition, next_offset) in ledger.tracker.take_committable() {
            match self.consumer.commit(&topic, partition, next_offset).await {
                Ok(()) => ledger.report.commits += 1,
                Err(e) => {
                    warn!(error = %e, topic = %topic, partition = %partition, "Offset commit failed, will retry");
                    ledger.tracker.commit_failed(&topic, partition, next_offset);
                }
            }
        }
    }

    fn transition(&self, next: ConsumerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "Consumer state changed");
        }
    }
}
