//! Fail-fast wrapping of outbound calls with three-state recovery.
//!
//! One circuit per named scope. CLOSED forwards calls and counts consecutive
//! classified failures; at the threshold the circuit OPENs and rejects
//! immediately. After the cooldown the circuit admits a bounded number of
//! HALF_OPEN probes: the first success closes it, any failure (or exceeding
//! the probe allowance) re-opens it with a fresh cooldown.
//!
//! Caller contract: each successful [`CircuitBreaker::try_acquire`] must be
//! followed by exactly one [`CircuitBreaker::record_success`] or
//! [`CircuitBreaker::record_failure`] for the same scope. Rejections
//! (`CircuitOpen`) need no bookkeeping and never count as failures.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Circuit breaker configuration, shared by all scopes.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive classified failures before opening.
    pub failure_threshold: u32,
    /// How long an open circuit rejects before admitting probes.
    pub cooldown: Duration,
    /// Maximum concurrent probes while half-open.
    pub half_open_max: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            half_open_max: 1,
        }
    }
}

/// State of one circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_in_flight: 0,
        }
    }

    fn reopen(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.half_open_in_flight = 0;
    }
}

/// Point-in-time view of one circuit (for stats output).
#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitSnapshot {
    pub scope: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

/// Per-scope circuit breaker.
pub struct CircuitBreaker {
    circuits: Mutex<HashMap<String, Circuit>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create a breaker; every scope starts CLOSED.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Ask to forward one call for `scope`.
    ///
    /// Returns `Ok(())` when the call may proceed (CLOSED, or admitted as a
    /// HALF_OPEN probe) and [`Error::CircuitOpen`] otherwise.
    pub async fn try_acquire(&self, scope: &str) -> Result<()> {
        let mut circuits = self.circuits.lock().await;
        let circuit = circuits
            .entry(scope.to_string())
            .or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = circuit
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed < self.config.cooldown {
                    return Err(Error::CircuitOpen(scope.to_string()));
                }
                // Cooldown elapsed: admit the first probe.
                circuit.state = CircuitState::HalfOpen;
                circuit.half_open_in_flight = 1;
                info!(scope, "circuit half-open, admitting probe");
                Ok(())
            }
            CircuitState::HalfOpen => {
                if circuit.half_open_in_flight < self.config.half_open_max {
                    circuit.half_open_in_flight += 1;
                    Ok(())
                } else {
                    // Exceeding the probe allowance re-opens the circuit.
                    circuit.reopen();
                    warn!(scope, "circuit re-opened: probe allowance exceeded");
                    Err(Error::CircuitOpen(scope.to_string()))
                }
            }
        }
    }

    /// Record a successful outbound call.
    pub async fn record_success(&self, scope: &str) {
        let mut circuits = self.circuits.lock().await;
        let circuit = circuits
            .entry(scope.to_string())
            .or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::HalfOpen => {
                info!(scope, "circuit closed after successful probe");
                *circuit = Circuit::new();
            }
            _ => {
                circuit.consecutive_failures = 0;
            }
        }
    }

    /// Record a failure-classified outbound error.
    pub async fn record_failure(&self, scope: &str) {
        let mut circuits = self.circuits.lock().await;
        let circuit = circuits
            .entry(scope.to_string())
            .or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::HalfOpen => {
                warn!(scope, "circuit re-opened: probe failed");
                circuit.reopen();
            }
            CircuitState::Closed => {
                circuit.consecutive_failures += 1;
                if circuit.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        scope,
                        failures = circuit.consecutive_failures,
                        "circuit opened"
                    );
                    circuit.reopen();
                }
            }
            CircuitState::Open => {
                // Late failure report from a call admitted before opening.
            }
        }
    }

    /// Release an admission that ended in neither success nor failure
    /// (e.g. the task was cancelled before the child finished).
    pub async fn record_cancelled(&self, scope: &str) {
        let mut circuits = self.circuits.lock().await;
        if let Some(circuit) = circuits.get_mut(scope) {
            if circuit.state == CircuitState::HalfOpen {
                circuit.half_open_in_flight = circuit.half_open_in_flight.saturating_sub(1);
            }
        }
    }

    /// Current state for `scope` (CLOSED if never seen).
    pub async fn state(&self, scope: &str) -> CircuitState {
        self.circuits
            .lock()
            .await
            .get(scope)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Snapshot every known scope.
    pub async fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let circuits = self.circuits.lock().await;
        let mut out: Vec<CircuitSnapshot> = circuits
            .iter()
            .map(|(scope, c)| CircuitSnapshot {
                scope: scope.clone(),
                state: c.state,
                consecutive_failures: c.consecutive_failures,
            })
            .collect();
        out.sort_by(|a, b| a.scope.cmp(&b.scope));
        out
    }
}
