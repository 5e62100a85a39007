//! # Resilience
//!
//! Resilience primitives shared by every backend route of the intelligence
//! adapter:
//!
//! - A three-state circuit breaker driven by an explicit transition table
//! - An exponential backoff state machine and a retry executor
//! - A cancellation signal observed by every backoff wait
//! - A classification trait that separates transient from permanent failures
//!
//! One [`ResilienceClient`] owns exactly one [`CircuitBreaker`]. Callers keep
//! one client per backend route and pass it by reference; nothing in this
//! crate is global.

pub mod cancel;
pub mod circuit_breaker;
pub mod client;
pub mod retry;
pub mod types;

pub use cancel::{cancellation, Cancellation, CancellationSource, Cancelled};
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitEvent, CircuitSnapshot, CircuitState,
    ResilienceState,
};
pub use client::{Attempted, ResilienceClient};
pub use retry::{Backoff, RetryPolicy};
pub use types::{CircuitOpenError, Classify, FailureClass, ResilienceError};
