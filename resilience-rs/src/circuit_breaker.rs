//! # Circuit Breaker
//!
//! A per-route circuit breaker modelled as a three-state finite automaton.
//!
//! ```text
//!            threshold reached              cooldown elapsed
//!   CLOSED ─────────────────────▶ OPEN ─────────────────────▶ HALF_OPEN
//!     ▲                            ▲                              │
//!     │        probe succeeded     │       probe failed           │
//!     └────────────────────────────┼──────────────────────────────┤
//!                                  └──────────────────────────────┘
//! ```
//!
//! All state lives in one [`ResilienceState`] guarded by a single mutex, so a
//! burst of concurrent failures crosses the threshold exactly once. In
//! HALF_OPEN exactly one probe is admitted; every other caller is rejected
//! until the probe reports back.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::types::CircuitOpenError;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed,
    /// Failing, requests are rejected without a call
    Open,
    /// Cooldown elapsed, a single probe is allowed
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used for the circuit state gauge
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Inputs to the circuit automaton
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitEvent {
    /// Consecutive failures reached the configured threshold
    ThresholdReached,
    /// The open cooldown has elapsed
    CooldownElapsed,
    /// The half-open probe succeeded
    ProbeSucceeded,
    /// The half-open probe failed
    ProbeFailed,
    /// Administrative reset
    Reset,
}

impl CircuitEvent {
    /// The transition table. `None` means the event is not valid in `from`.
    pub fn transition(self, from: CircuitState) -> Option<CircuitState> {
        use CircuitEvent::*;
        use CircuitState::*;

        match (from, self) {
            (Closed, ThresholdReached) => Some(Open),
            (Open, CooldownElapsed) => Some(HalfOpen),
            (HalfOpen, ProbeSucceeded) => Some(Closed),
            (HalfOpen, ProbeFailed) => Some(Open),
            (_, Reset) => Some(Closed),
            _ => None,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before admitting a probe
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Mutable state of one route's circuit
#[derive(Debug, Clone)]
pub struct ResilienceState {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    pub cooldown: Duration,
    pub half_open_probe_in_flight: bool,
}

impl ResilienceState {
    fn new(cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            cooldown,
            half_open_probe_in_flight: false,
        }
    }

    fn cooldown_remaining(&self, now: Instant) -> Duration {
        match self.opened_at {
            Some(opened_at) => self.cooldown.saturating_sub(now.saturating_duration_since(opened_at)),
            None => Duration::ZERO,
        }
    }
}

/// Point-in-time view of a circuit for metrics and health surfaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_probe_in_flight: bool,
}

/// Whether a permit belongs to a normal call or to the half-open probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitKind {
    Normal,
    Probe,
}

/// Thread-safe circuit breaker for a single backend route
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<ResilienceState>,
}

impl CircuitBreaker {
    /// Creates a closed circuit with the given name and configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let state = ResilienceState::new(config.cooldown);
        Self {
            name: name.into(),
            config,
            state: Mutex::new(state),
        }
    }

    /// Name of this circuit (the backend route)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Asks the circuit for permission to make one physical call.
    ///
    /// The returned permit must be resolved with [`CallPermit::success`] or
    /// [`CallPermit::failure`]. Dropping it unresolved releases a held probe
    /// slot without changing the state.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitOpenError> {
        let now = Instant::now();
        let mut state = self.lock();

        match state.state {
            CircuitState::Closed => Ok(self.permit(PermitKind::Normal)),
            CircuitState::Open => {
                let remaining = state.cooldown_remaining(now);
                if remaining.is_zero() {
                    self.apply(&mut state, CircuitEvent::CooldownElapsed);
                    state.half_open_probe_in_flight = true;
                    debug!(circuit = %self.name, "Half-open probe admitted");
                    Ok(self.permit(PermitKind::Probe))
                } else {
                    counter!("resilience.circuit.rejected", 1, "circuit" => self.name.clone());
                    Err(CircuitOpenError {
                        circuit: self.name.clone(),
                        retry_after: remaining,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if state.half_open_probe_in_flight {
                    counter!("resilience.circuit.rejected", 1, "circuit" => self.name.clone());
                    Err(CircuitOpenError {
                        circuit: self.name.clone(),
                        retry_after: Duration::ZERO,
                    })
                } else {
                    state.half_open_probe_in_flight = true;
                    debug!(circuit = %self.name, "Half-open probe admitted");
                    Ok(self.permit(PermitKind::Probe))
                }
            }
        }
    }

    /// Current state of the circuit
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Current consecutive failure count
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Copies the full mutable state
    pub fn resilience_state(&self) -> ResilienceState {
        self.lock().clone()
    }

    /// Point-in-time snapshot for health reporting
    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            half_open_probe_in_flight: state.half_open_probe_in_flight,
        }
    }

    /// Forces the circuit back to CLOSED
    pub fn reset(&self) {
        let mut state = self.lock();
        let previous = state.state;
        self.apply(&mut state, CircuitEvent::Reset);
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.half_open_probe_in_flight = false;
        info!(circuit = %self.name, previous_state = %previous, "Circuit manually reset to CLOSED");
    }

    fn permit(&self, kind: PermitKind) -> CallPermit<'_> {
        CallPermit {
            breaker: self,
            kind,
            resolved: false,
        }
    }

    fn on_success(&self, kind: PermitKind) {
        let mut state = self.lock();

        match kind {
            PermitKind::Probe => {
                state.half_open_probe_in_flight = false;
                if self.apply(&mut state, CircuitEvent::ProbeSucceeded) {
                    state.consecutive_failures = 0;
                    state.opened_at = None;
                    info!(circuit = %self.name, "Circuit CLOSED: probe succeeded");
                }
            }
            PermitKind::Normal => {
                // Calls admitted before the circuit opened do not affect it afterwards
                if state.state == CircuitState::Closed {
                    state.consecutive_failures = 0;
                }
            }
        }
    }

    fn on_failure(&self, kind: PermitKind) {
        let now = Instant::now();
        let mut state = self.lock();

        match kind {
            PermitKind::Probe => {
                state.half_open_probe_in_flight = false;
                if self.apply(&mut state, CircuitEvent::ProbeFailed) {
                    state.opened_at = Some(now);
                    warn!(
                        circuit = %self.name,
                        cooldown_ms = %state.cooldown.as_millis(),
                        "Circuit REOPENED: probe failed"
                    );
                }
            }
            PermitKind::Normal => {
                if state.state != CircuitState::Closed {
                    return;
                }

                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold
                    && self.apply(&mut state, CircuitEvent::ThresholdReached)
                {
                    state.opened_at = Some(now);
                    warn!(
                        circuit = %self.name,
                        consecutive_failures = %state.consecutive_failures,
                        threshold = %self.config.failure_threshold,
                        "Circuit OPEN: failure threshold reached"
                    );
                }
            }
        }
    }

    fn on_abandoned(&self, kind: PermitKind) {
        if kind == PermitKind::Probe {
            let mut state = self.lock();
            state.half_open_probe_in_flight = false;
            debug!(circuit = %self.name, "Half-open probe abandoned, slot released");
        }
    }

    /// Applies `event` through the transition table. Returns false if the
    /// event is not valid in the current state.
    fn apply(&self, state: &mut ResilienceState, event: CircuitEvent) -> bool {
        match event.transition(state.state) {
            Some(next) => {
                state.state = next;
                gauge!("resilience.circuit.state", next.as_gauge(), "circuit" => self.name.clone());
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ResilienceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Permission to make exactly one call through a circuit
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    kind: PermitKind,
    resolved: bool,
}

impl CallPermit<'_> {
    /// Returns true if this permit is the half-open probe
    pub fn is_probe(&self) -> bool {
        self.kind == PermitKind::Probe
    }

    /// Reports that the backend answered
    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.kind);
    }

    /// Reports a transient backend failure
    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.kind);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.on_abandoned(self.kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test-route",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown,
            },
        )
    }

    #[test]
    fn test_transition_table() {
        use CircuitEvent::*;
        use CircuitState::*;

        assert_eq!(ThresholdReached.transition(Closed), Some(Open));
        assert_eq!(CooldownElapsed.transition(Open), Some(HalfOpen));
        assert_eq!(ProbeSucceeded.transition(HalfOpen), Some(Closed));
        assert_eq!(ProbeFailed.transition(HalfOpen), Some(Open));
        assert_eq!(Reset.transition(Open), Some(Closed));

        assert_eq!(ThresholdReached.transition(Open), None);
        assert_eq!(CooldownElapsed.transition(Closed), None);
        assert_eq!(ProbeSucceeded.transition(Closed), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_closed_initially() {
        let cb = breaker(5, Duration::from_secs(60));
        assert_eq!(cb.state(), CircuitState::Closed);

        let permit = cb.try_acquire().unwrap();
        assert!(!permit.is_probe());
        permit.success();
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_at_threshold() {
        let cb = breaker(3, Duration::from_secs(60));

        for _ in 0..2 {
            cb.try_acquire().unwrap().failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 2);

        cb.try_acquire().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);

        let err = cb.try_acquire().unwrap_err();
        assert_eq!(err.circuit, "test-route");
        assert!(err.retry_after > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let cb = breaker(3, Duration::from_secs(60));

        cb.try_acquire().unwrap().failure();
        cb.try_acquire().unwrap().failure();
        cb.try_acquire().unwrap().success();
        cb.try_acquire().unwrap().failure();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failures_trip_once() {
        let cb = breaker(3, Duration::from_secs(60));

        // All permits taken while closed, failures reported afterwards
        let permits: Vec<_> = (0..10).map(|_| cb.try_acquire().unwrap()).collect();
        for permit in permits {
            permit.failure();
        }

        let state = cb.resilience_state();
        assert_eq!(state.state, CircuitState::Open);
        assert_eq!(state.consecutive_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_after_cooldown() {
        let cb = breaker(1, Duration::from_secs(60));
        cb.try_acquire().unwrap().failure();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cb.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        let probe = cb.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Second caller is rejected while the probe is outstanding
        let rejected = cb.try_acquire().unwrap_err();
        assert_eq!(rejected.retry_after, Duration::ZERO);

        probe.success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
        assert!(!cb.try_acquire().unwrap().is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens_with_fresh_cooldown() {
        let cb = breaker(1, Duration::from_secs(60));
        cb.try_acquire().unwrap().failure();

        tokio::time::advance(Duration::from_secs(61)).await;
        cb.try_acquire().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        let err = cb.try_acquire().unwrap_err();
        assert!(err.retry_after >= Duration::from_secs(29));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_releases_slot() {
        let cb = breaker(1, Duration::from_secs(1));
        cb.try_acquire().unwrap().failure();
        tokio::time::advance(Duration::from_secs(2)).await;

        let probe = cb.try_acquire().unwrap();
        drop(probe);

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().unwrap().is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_half_open_admits_one_probe() {
        let cb = Arc::new(breaker(1, Duration::from_secs(1)));
        cb.try_acquire().unwrap().failure();
        tokio::time::advance(Duration::from_secs(2)).await;

        let mut admitted = Vec::new();
        let mut rejected = 0;
        for _ in 0..8 {
            match cb.try_acquire() {
                Ok(permit) => admitted.push(permit),
                Err(_) => rejected += 1,
            }
        }

        assert_eq!(admitted.len(), 1);
        assert_eq!(rejected, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let cb = breaker(1, Duration::from_secs(60));
        cb.try_acquire().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
        assert!(cb.try_acquire().is_ok());
    }
}
