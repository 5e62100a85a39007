//! # Resilience Client
//!
//! Combines one circuit breaker with a retry policy. Every physical attempt
//! asks the breaker for a permit first, so an open circuit short-circuits the
//! retry loop as well as the first call.

use std::future::Future;
use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};

use crate::cancel::Cancellation;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
use crate::retry::RetryPolicy;
use crate::types::{Classify, ResilienceError};

/// A successful result together with the number of physical calls it took
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Circuit breaker plus retry executor for a single backend route
#[derive(Debug, Clone)]
pub struct ResilienceClient {
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
}

impl ResilienceClient {
    pub fn new(name: impl Into<String>, breaker: CircuitBreakerConfig, policy: RetryPolicy) -> Self {
        Self {
            breaker: Arc::new(CircuitBreaker::new(name, breaker)),
            policy,
        }
    }

    /// Builds a client around an existing breaker
    pub fn with_breaker(breaker: Arc<CircuitBreaker>, policy: RetryPolicy) -> Self {
        Self { breaker, policy }
    }

    pub fn name(&self) -> &str {
        self.breaker.name()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        self.breaker.snapshot()
    }

    /// Runs `operation` under the circuit breaker and retry policy.
    ///
    /// `operation` receives the 1-based attempt number. Transient failures are
    /// recorded against the circuit and retried after an exponential backoff
    /// that is interrupted by `cancel`. Permanent failures are returned at once
    /// and count as a reachable backend for the circuit.
    pub async fn execute<T, E, F, Fut>(
        &self,
        cancel: &Cancellation,
        mut operation: F,
    ) -> Result<Attempted<T>, ResilienceError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Classify + 'static,
    {
        let mut backoff = self.policy.backoff();
        let mut attempts = 0u32;

        loop {
            let permit = match self.breaker.try_acquire() {
                Ok(permit) => permit,
                Err(open) => {
                    debug!(
                        circuit = %self.name(),
                        attempts = %attempts,
                        "Call rejected by open circuit"
                    );
                    return Err(ResilienceError::CircuitOpen {
                        source: open,
                        attempts,
                    });
                }
            };

            attempts += 1;
            counter!("resilience.attempts", 1, "circuit" => self.name().to_string());

            match operation(attempts).await {
                Ok(value) => {
                    permit.success();
                    if attempts > 1 {
                        debug!(circuit = %self.name(), attempts = %attempts, "Call succeeded after retry");
                    }
                    return Ok(Attempted { value, attempts });
                }
                Err(err) if err.is_transient() => {
                    permit.failure();

                    let Some(delay) = backoff.next_delay() else {
                        warn!(
                            circuit = %self.name(),
                            attempts = %attempts,
                            error = %err,
                            "Retries exhausted"
                        );
                        return Err(ResilienceError::Exhausted { source: err, attempts });
                    };

                    debug!(
                        circuit = %self.name(),
                        attempt = %attempts,
                        delay_ms = %delay.as_millis(),
                        error = %err,
                        "Transient failure, retrying after backoff"
                    );
                    counter!("resilience.retries", 1, "circuit" => self.name().to_string());

                    if cancel.sleep(delay).await.is_err() {
                        debug!(circuit = %self.name(), attempts = %attempts, "Backoff interrupted by cancellation");
                        return Err(ResilienceError::Cancelled {
                            last_error: Some(err),
                            attempts,
                        });
                    }
                }
                Err(err) => {
                    // The backend answered, so the route is reachable
                    permit.success();
                    debug!(
                        circuit = %self.name(),
                        attempts = %attempts,
                        error = %err,
                        "Permanent failure, not retrying"
                    );
                    return Err(ResilienceError::Permanent { source: err, attempts });
                }
            }
        }
    }
}
