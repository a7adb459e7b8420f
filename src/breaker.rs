//! Circuit breaker for the render subsystem
//!
//! # States
//!
//! ```text
//!            failures in window >= failure_threshold
//!   CLOSED ─────────────────────────────────────────▶ OPEN
//!     ▲                                                │
//!     │ success_threshold                              │ reset_timeout
//!     │ consecutive successes                          ▼
//!     └────────────────────────────────────────── HALF_OPEN
//!                       any failure ──▶ OPEN (timer restarts)
//! ```
//!
//! While OPEN the guarded operation is never polled: the fallback runs
//! immediately, or the call fails with [`GatewayError::CircuitOpen`].
//! HALF_OPEN admits at most `half_open_max_calls` concurrent trials; extra
//! callers are short-circuited exactly like OPEN.
//!
//! Every state change bumps a generation counter. Outcomes from calls
//! admitted under an older generation are discarded, so a slow call that
//! started before the circuit opened cannot close it again.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, GatewayResult};

// ============================================================================
// Configuration
// ============================================================================

/// Circuit breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures within `monitoring_window` that open the circuit
    pub failure_threshold: u32,
    /// Consecutive HALF_OPEN successes that close the circuit
    pub success_threshold: u32,
    /// Time spent OPEN before trial calls are admitted
    pub reset_timeout: Duration,
    /// Hard timeout applied to every guarded operation
    pub timeout_threshold: Duration,
    /// Concurrent trial calls admitted while HALF_OPEN
    pub half_open_max_calls: u32,
    /// Sliding window over which CLOSED failures are counted
    pub monitoring_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            timeout_threshold: Duration::from_secs(30),
            half_open_max_calls: 1,
            monitoring_window: Duration::from_secs(60),
        }
    }
}

impl BreakerConfig {
    /// Set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the success threshold
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the reset timeout
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the per-operation timeout
    pub fn with_timeout_threshold(mut self, timeout: Duration) -> Self {
        self.timeout_threshold = timeout;
        self
    }

    /// Set the HALF_OPEN concurrency
    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    /// Set the monitoring window
    pub fn with_monitoring_window(mut self, window: Duration) -> Self {
        self.monitoring_window = window;
        self
    }
}

// ============================================================================
// State
// ============================================================================

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are short-circuited
    Open,
    /// Limited trial calls probe for recovery
    HalfOpen,
}

impl CircuitState {
    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitSnapshot {
    /// Current state
    pub state: CircuitState,
    /// Failures counted in the current window (CLOSED)
    pub failure_count: u32,
    /// Consecutive trial successes (HALF_OPEN)
    pub success_count: u32,
    /// Trial calls currently running (HALF_OPEN)
    pub half_open_in_flight: u32,
    /// When the current state was entered
    pub last_transition_at: DateTime<Utc>,
    /// When trial calls will be admitted (OPEN)
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Calls short-circuited since startup
    pub short_circuited: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    generation: u64,
    failures: VecDeque<Instant>,
    successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
    last_transition_at: DateTime<Utc>,
    short_circuited: u64,
}

enum Admission {
    Allowed { generation: u64, trial: bool },
    Rejected { retry_in: Duration },
}

// ============================================================================
// Execution result
// ============================================================================

/// Outcome of [`CircuitBreaker::execute`]
#[derive(Debug)]
pub struct ExecutionResult<T> {
    /// Operation or fallback result
    pub outcome: GatewayResult<T>,
    /// State after the call
    pub circuit_state: CircuitState,
    /// Whether `outcome` came from the fallback
    pub fallback_used: bool,
    /// Whether the operation was skipped because the circuit was open
    pub short_circuited: bool,
}

impl<T> ExecutionResult<T> {
    /// Whether the call produced a value
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Discard the bookkeeping
    pub fn into_result(self) -> GatewayResult<T> {
        self.outcome
    }
}

// ============================================================================
// Breaker
// ============================================================================

/// Three-state circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

/// Admission ticket; frees a trial slot if dropped without an outcome
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, outcome: Option<bool>) {
        self.settled = true;
        self.breaker.settle(self.generation, self.trial, outcome);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.settle(self.generation, self.trial, None);
        }
    }
}

impl CircuitBreaker {
    /// Create a breaker guarding the subsystem called `name`
    pub fn new(name: &'static str, config: BreakerConfig) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                generation: 0,
                failures: VecDeque::new(),
                successes: 0,
                half_open_in_flight: 0,
                opened_at: None,
                last_transition_at: Utc::now(),
                short_circuited: 0,
            }),
        }
    }

    /// Configuration (immutable)
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Guarded subsystem name
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `operation` through the breaker, recording its outcome
    ///
    /// `operation` is only polled when the breaker admits the call. If it
    /// fails (or the circuit is open) and `fallback` is supplied, the
    /// fallback's result is returned instead.
    pub async fn execute<'a, T, Op>(
        &self,
        operation: Op,
        fallback: Option<BoxFuture<'a, GatewayResult<T>>>,
    ) -> ExecutionResult<T>
    where
        Op: Future<Output = GatewayResult<T>>,
    {
        self.run(operation, fallback, true).await
    }

    /// Like [`execute`](Self::execute) but leaves the counters untouched
    ///
    /// Still short-circuited while the circuit is not CLOSED, so trial
    /// slots stay reserved for tracked calls.
    pub async fn execute_untracked<'a, T, Op>(
        &self,
        operation: Op,
        fallback: Option<BoxFuture<'a, GatewayResult<T>>>,
    ) -> ExecutionResult<T>
    where
        Op: Future<Output = GatewayResult<T>>,
    {
        self.run(operation, fallback, false).await
    }

    async fn run<'a, T, Op>(
        &self,
        operation: Op,
        fallback: Option<BoxFuture<'a, GatewayResult<T>>>,
        tracked: bool,
    ) -> ExecutionResult<T>
    where
        Op: Future<Output = GatewayResult<T>>,
    {
        let permit = match self.admit(tracked) {
            Admission::Allowed { generation, trial } => Permit {
                breaker: self,
                generation,
                trial,
                settled: false,
            },
            Admission::Rejected { retry_in } => {
                metrics::counter!("rendergate_circuit_short_circuits_total", "breaker" => self.name)
                    .increment(1);
                debug!(breaker = self.name, "Call short-circuited");
                return match fallback {
                    Some(fallback) => ExecutionResult {
                        outcome: fallback.await,
                        circuit_state: self.state(),
                        fallback_used: true,
                        short_circuited: true,
                    },
                    None => ExecutionResult {
                        outcome: Err(GatewayError::CircuitOpen {
                            retry_in_ms: retry_in.as_millis() as u64,
                        }),
                        circuit_state: self.state(),
                        fallback_used: false,
                        short_circuited: true,
                    },
                };
            }
        };

        let threshold = self.config.timeout_threshold;
        let outcome = match tokio::time::timeout(threshold, operation).await {
            Ok(outcome) => outcome,
            Err(_) => Err(GatewayError::OperationTimeout(threshold)),
        };

        let recorded = match &outcome {
            _ if !tracked => None,
            Ok(_) => Some(true),
            Err(e) if e.is_render_failure() => Some(false),
            Err(_) => None,
        };
        permit.settle(recorded);

        match (outcome, fallback) {
            (Err(error), Some(fallback)) => {
                debug!(breaker = self.name, error = %error, "Operation failed, using fallback");
                ExecutionResult {
                    outcome: fallback.await,
                    circuit_state: self.state(),
                    fallback_used: true,
                    short_circuited: false,
                }
            }
            (outcome, _) => ExecutionResult {
                outcome,
                circuit_state: self.state(),
                fallback_used: false,
                short_circuited: false,
            },
        }
    }

    fn admit(&self, tracked: bool) -> Admission {
        let mut inner = self.lock();
        self.refresh(&mut inner);

        match inner.state {
            CircuitState::Closed => Admission::Allowed {
                generation: inner.generation,
                trial: false,
            },
            CircuitState::HalfOpen
                if tracked && inner.half_open_in_flight < self.config.half_open_max_calls =>
            {
                inner.half_open_in_flight += 1;
                Admission::Allowed {
                    generation: inner.generation,
                    trial: true,
                }
            }
            CircuitState::HalfOpen => {
                inner.short_circuited += 1;
                Admission::Rejected {
                    retry_in: Duration::ZERO,
                }
            }
            CircuitState::Open => {
                inner.short_circuited += 1;
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                Admission::Rejected {
                    retry_in: self.config.reset_timeout.saturating_sub(elapsed),
                }
            }
        }
    }

    /// Apply a call outcome: `Some(true)` success, `Some(false)` failure,
    /// `None` release without recording
    fn settle(&self, generation: u64, trial: bool, outcome: Option<bool>) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        if trial {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }

        match (inner.state, outcome) {
            (_, None) | (CircuitState::Open, _) => {}
            (CircuitState::Closed, Some(true)) => inner.failures.clear(),
            (CircuitState::Closed, Some(false)) => {
                let now = Instant::now();
                inner.failures.push_back(now);
                self.prune_failures(&mut inner, now);
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            (CircuitState::HalfOpen, Some(true)) => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            (CircuitState::HalfOpen, Some(false)) => {
                self.transition(&mut inner, CircuitState::Open);
            }
        }
    }

    fn prune_failures(&self, inner: &mut Inner, now: Instant) {
        let window = self.config.monitoring_window;
        while let Some(oldest) = inner.failures.front() {
            if now.duration_since(*oldest) > window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Lazy OPEN -> HALF_OPEN transition
    fn refresh(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open
            && inner
                .opened_at
                .is_some_and(|at| at.elapsed() >= self.config.reset_timeout)
        {
            self.transition(inner, CircuitState::HalfOpen);
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.failures.clear();
        inner.successes = 0;
        inner.half_open_in_flight = 0;
        inner.opened_at = (to == CircuitState::Open).then(Instant::now);
        inner.last_transition_at = Utc::now();

        metrics::counter!(
            "rendergate_circuit_transitions_total",
            "breaker" => self.name,
            "to" => to.as_str()
        )
        .increment(1);
        metrics::gauge!("rendergate_circuit_state", "breaker" => self.name)
            .set(to.gauge_value());

        match to {
            CircuitState::Open => warn!(breaker = self.name, %from, %to, "Circuit opened"),
            _ => info!(breaker = self.name, %from, %to, "Circuit state changed"),
        }
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Current state and counters
    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut inner = self.lock();
        self.refresh(&mut inner);

        if inner.state == CircuitState::Closed {
            self.prune_failures(&mut inner, Instant::now());
        }

        let next_retry_at = inner.opened_at.map(|at| {
            let remaining = self.config.reset_timeout.saturating_sub(at.elapsed());
            Utc::now() + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero())
        });

        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failures.len() as u32,
            success_count: inner.successes,
            half_open_in_flight: inner.half_open_in_flight,
            last_transition_at: inner.last_transition_at,
            next_retry_at,
            short_circuited: inner.short_circuited,
        }
    }

    /// Force the circuit CLOSED
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.transition(&mut inner, CircuitState::Closed);
    }
}
