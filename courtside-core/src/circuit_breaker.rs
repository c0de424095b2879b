use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use courtside_model::{CircuitState, FailureKind, SourceId};

use crate::config::BreakerConfig;
use crate::telemetry::Telemetry;

/// Result of asking the breaker whether a request may go out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single half-open trial request.
    Probe,
    /// Fail fast without touching the network. `retry_after` is zero while
    /// another request holds the half-open probe: dispatch stays gated on
    /// [`CircuitBreaker::admits_dispatch`] until that probe reports back.
    Rejected { retry_after: Duration },
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }
}

/// Per-source circuit breaker.
///
/// Failures add to a weighted score (rate-limited responses count
/// `rate_limited_weight`, everything else 1). Reaching `failure_threshold`
/// trips CLOSED to OPEN. Once `reset_timeout` has elapsed the next request
/// is a single HALF_OPEN probe whose outcome closes or reopens the circuit.
/// A success while CLOSED clears the score.
pub struct CircuitBreaker {
    source: SourceId,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
    telemetry: Option<Telemetry>,
}

#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    failure_score: f64,
    opened_at: Option<DateTime<Utc>>,
    probe_started_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of a breaker.
#[derive(Clone, Debug, PartialEq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_score: f64,
    pub opened_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("CircuitBreaker");
        debug.field("source", &self.source).field("config", &self.config);
        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("state", &state.state)
                    .field("failure_score", &state.failure_score);
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl CircuitBreaker {
    pub fn new(source: SourceId, config: BreakerConfig) -> Self {
        Self {
            source,
            config,
            state: Mutex::new(BreakerState::default()),
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// When a timeout started at `from` elapses. `None` if it never does.
    fn deadline(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(self.config.reset_timeout())
            .ok()
            .and_then(|timeout| from.checked_add_signed(timeout))
    }

    fn until(deadline: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
        match deadline {
            Some(deadline) => (deadline - now).to_std().unwrap_or(Duration::ZERO),
            None => Duration::MAX,
        }
    }

    fn transition(
        &self,
        state: &mut BreakerState,
        to: CircuitState,
        now: DateTime<Utc>,
    ) {
        let from = state.state;
        if from == to {
            return;
        }
        state.state = to;
        match to {
            CircuitState::Open => {
                state.opened_at = Some(now);
                state.probe_started_at = None;
            }
            CircuitState::HalfOpen => {
                state.probe_started_at = None;
            }
            CircuitState::Closed => {
                state.opened_at = None;
                state.probe_started_at = None;
                state.failure_count = 0;
                state.failure_score = 0.0;
            }
        }
        if let Some(telemetry) = &self.telemetry {
            telemetry.breaker_changed(&self.source, from, to, now);
        }
    }

    /// Moves an expired OPEN circuit to HALF_OPEN.
    fn refresh(&self, state: &mut BreakerState, now: DateTime<Utc>) {
        if state.state == CircuitState::Open
            && let Some(opened_at) = state.opened_at
            && self.deadline(opened_at).is_some_and(|deadline| now >= deadline)
        {
            self.transition(state, CircuitState::HalfOpen, now);
        }
    }

    fn remaining_open(&self, state: &BreakerState, now: DateTime<Utc>) -> Duration {
        match state.opened_at {
            Some(opened_at) => Self::until(self.deadline(opened_at), now),
            None => Duration::ZERO,
        }
    }

    /// A probe that never reported back (its task timed out) frees the
    /// slot after one reset timeout.
    fn probe_stale(&self, state: &BreakerState, now: DateTime<Utc>) -> bool {
        state.probe_started_at.is_none_or(|started| {
            self.deadline(started).is_some_and(|deadline| now >= deadline)
        })
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> CircuitState {
        let mut state = self.lock();
        self.refresh(&mut state, now);
        state.state
    }

    /// Whether a new task may be dispatched to this source. Does not take
    /// the half-open probe slot.
    pub fn admits_dispatch(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.lock();
        self.refresh(&mut state, now);
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => self.probe_stale(&state, now),
        }
    }

    /// How long until dispatch may be admitted again; zero when it already
    /// is.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        let mut state = self.lock();
        self.refresh(&mut state, now);
        match state.state {
            CircuitState::Closed => Duration::ZERO,
            CircuitState::Open => self.remaining_open(&state, now),
            CircuitState::HalfOpen => match state.probe_started_at {
                Some(started) if !self.probe_stale(&state, now) => {
                    Self::until(self.deadline(started), now)
                }
                _ => Duration::ZERO,
            },
        }
    }

    /// Admission check made right before each request.
    pub fn try_acquire(&self, now: DateTime<Utc>) -> Admission {
        let mut state = self.lock();
        self.refresh(&mut state, now);
        match state.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => Admission::Rejected {
                retry_after: self.remaining_open(&state, now),
            },
            CircuitState::HalfOpen => {
                if self.probe_stale(&state, now) {
                    state.probe_started_at = Some(now);
                    Admission::Probe
                } else {
                    Admission::Rejected {
                        retry_after: Duration::ZERO,
                    }
                }
            }
        }
    }

    pub fn record_success(&self, now: DateTime<Utc>) {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
                state.failure_score = 0.0;
            }
            CircuitState::HalfOpen => {
                self.transition(&mut state, CircuitState::Closed, now);
            }
            // A request admitted before the trip finished late; the circuit
            // stays open until its probe.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, kind: FailureKind, now: DateTime<Utc>) {
        let weight = match kind {
            FailureKind::RateLimited => self.config.rate_limited_weight,
            FailureKind::Transient | FailureKind::Permanent => 1.0,
        };
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => {
                state.failure_count = state.failure_count.saturating_add(1);
                state.failure_score += weight;
                if state.failure_score >= self.config.failure_threshold {
                    self.transition(&mut state, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => {
                state.failure_count = state.failure_count.saturating_add(1);
                self.transition(&mut state, CircuitState::Open, now);
            }
            CircuitState::Open => {}
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> BreakerSnapshot {
        let mut state = self.lock();
        self.refresh(&mut state, now);
        BreakerSnapshot {
            state: state.state,
            failure_count: state.failure_count,
            failure_score: state.failure_score,
            opened_at: state.opened_at,
        }
    }
}
