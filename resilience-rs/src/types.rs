//! # Failure Classification and Resilience Errors
//!
//! The resilience layer only needs to know one thing about an error: whether
//! repeating the call could plausibly succeed. Everything else is carried
//! through untouched inside [`ResilienceError`].

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Whether a failure may succeed on a later attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Timeout, connection failure, server-side error
    Transient,
    /// Client error or validation failure; retrying cannot help
    Permanent,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::Transient => write!(f, "transient"),
            FailureClass::Permanent => write!(f, "permanent"),
        }
    }
}

/// Errors that can be classified for retry and circuit decisions
pub trait Classify {
    /// Returns the failure class of this error
    fn failure_class(&self) -> FailureClass;

    /// Returns true if the error is transient
    fn is_transient(&self) -> bool {
        self.failure_class() == FailureClass::Transient
    }
}

/// A call was rejected without being attempted because the circuit is open
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit '{circuit}' is open, retry after {retry_after:?}")]
pub struct CircuitOpenError {
    /// Name of the rejecting circuit
    pub circuit: String,
    /// Time left until the circuit admits a probe; zero while a probe is in flight
    pub retry_after: Duration,
}

/// Terminal outcome of a call made through a [`crate::ResilienceClient`]
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + 'static,
{
    /// The circuit rejected the call before (or between) attempts
    #[error("{source}")]
    CircuitOpen {
        source: CircuitOpenError,
        /// Physical attempts made before the rejection
        attempts: u32,
    },

    /// A transient failure persisted through every permitted retry
    #[error("retries exhausted after {attempts} attempts: {source}")]
    Exhausted {
        source: E,
        attempts: u32,
    },

    /// A permanent failure; never retried
    #[error("permanent failure after {attempts} attempts: {source}")]
    Permanent {
        source: E,
        attempts: u32,
    },

    /// Cancellation was observed while waiting between attempts
    #[error("cancelled after {attempts} attempts")]
    Cancelled {
        last_error: Option<E>,
        attempts: u32,
    },
}

impl<E> ResilienceError<E>
where
    E: std::error::Error + 'static,
{
    /// Number of physical calls that were made
    pub fn attempts(&self) -> u32 {
        match self {
            ResilienceError::CircuitOpen { attempts, .. }
            | ResilienceError::Exhausted { attempts, .. }
            | ResilienceError::Permanent { attempts, .. }
            | ResilienceError::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// Returns true if resubmitting the same request later may succeed
    pub fn retry_allowed(&self) -> bool {
        !matches!(self, ResilienceError::Permanent { .. })
    }

    /// Returns true if the call was abandoned because of cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ResilienceError::Cancelled { .. })
    }
}
