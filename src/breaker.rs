//! Circuit breaker guarding calls to the remote API.
//!
//! # States
//! - Closed: calls pass through; consecutive failures are counted
//! - Open: `now < open_until`; calls are short-circuited without running
//! - Half-Open: cooldown elapsed; exactly one trial call is let through
//!
//! ```text
//! Closed    → Open:      failures >= threshold
//! Open      → Half-Open: now >= open_until
//! Half-Open → Closed:    trial succeeds
//! Half-Open → Open:      trial fails (cooldown restarts)
//! ```
//!
//! Failures are consecutive, not windowed: any success resets the count.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::BreakerConfig;
use crate::lock;

/// Errors that can be classified by the breaker.
pub trait BreakerFailure {
  /// Whether this error counts as one consecutive failure.
  fn trips_breaker(&self) -> bool {
    true
  }
}

/// Outcome of a guarded call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guarded<T> {
  /// The call ran and returned this value
  Ready(T),
  /// The breaker is open; the call was not attempted
  CircuitOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitPhase {
  Closed,
  Open,
  HalfOpen,
}

/// Point-in-time view of the breaker for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
  pub failures: u32,
  pub threshold: u32,
  pub cooldown_ms: u64,
  pub open_until: Option<u64>,
  pub phase: CircuitPhase,
}

#[derive(Debug, Default)]
struct CircuitState {
  failures: u32,
  open_until: Option<u64>,
  trial_in_flight: bool,
  fast_retries: bool,
}

enum Admission {
  Pass,
  Trial,
  Reject,
}

/// Consecutive-failure circuit breaker.
pub struct CircuitBreaker {
  config: BreakerConfig,
  clock: Arc<dyn Clock>,
  state: Mutex<CircuitState>,
}

impl CircuitBreaker {
  pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
    Self {
      config,
      clock,
      state: Mutex::new(CircuitState::default()),
    }
  }

  /// Shrink the cooldown to `fast_retry_cooldown_ms` (or restore it).
  ///
  /// Applies from the next time the breaker opens.
  pub fn set_fast_retries(&self, enabled: bool) {
    lock(&self.state).fast_retries = enabled;
  }

  pub fn snapshot(&self) -> CircuitSnapshot {
    let state = lock(&self.state);
    CircuitSnapshot {
      failures: state.failures,
      threshold: self.config.threshold,
      cooldown_ms: self.cooldown_ms(&state),
      open_until: state.open_until,
      phase: self.phase_of(&state),
    }
  }

  pub fn phase(&self) -> CircuitPhase {
    self.phase_of(&lock(&self.state))
  }

  /// Whether calls are currently being short-circuited.
  pub fn is_open(&self) -> bool {
    self.phase() == CircuitPhase::Open
  }

  /// Close the breaker and forget past failures.
  pub fn reset(&self) {
    let mut state = lock(&self.state);
    state.failures = 0;
    state.open_until = None;
    state.trial_in_flight = false;
    info!("circuit manually reset");
  }

  /// Run `operation` unless the breaker is open.
  ///
  /// Returns `Guarded::CircuitOpen` without invoking `operation` while open,
  /// or while a half-open trial is already in flight. Errors from
  /// `operation` are recorded and passed back unchanged.
  pub async fn guarded_call<T, E, F, Fut>(&self, operation: F) -> Result<Guarded<T>, E>
  where
    E: BreakerFailure + std::fmt::Display,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    let trial = match self.admit() {
      Admission::Reject => {
        debug!("circuit open, short-circuiting call");
        return Ok(Guarded::CircuitOpen);
      }
      Admission::Trial => {
        debug!("circuit half-open, sending trial call");
        Some(TrialGuard { breaker: self })
      }
      Admission::Pass => None,
    };

    let result = operation().await;
    // The outcome below decides the next state; the guard only covers drops.
    if let Some(guard) = trial {
      std::mem::forget(guard);
    }

    match result {
      Ok(value) => {
        self.record_success();
        Ok(Guarded::Ready(value))
      }
      Err(e) => {
        self.record_failure(&e);
        Err(e)
      }
    }
  }

  fn cooldown_ms(&self, state: &CircuitState) -> u64 {
    if state.fast_retries {
      self.config.fast_retry_cooldown_ms
    } else {
      self.config.cooldown_ms
    }
  }

  fn phase_of(&self, state: &CircuitState) -> CircuitPhase {
    match state.open_until {
      Some(until) if self.clock.now_ms() < until => CircuitPhase::Open,
      Some(_) => CircuitPhase::HalfOpen,
      None => CircuitPhase::Closed,
    }
  }

  fn admit(&self) -> Admission {
    let mut state = lock(&self.state);
    match self.phase_of(&state) {
      CircuitPhase::Closed => Admission::Pass,
      CircuitPhase::Open => Admission::Reject,
      CircuitPhase::HalfOpen if state.trial_in_flight => Admission::Reject,
      CircuitPhase::HalfOpen => {
        state.trial_in_flight = true;
        Admission::Trial
      }
    }
  }

  fn record_success(&self) {
    let mut state = lock(&self.state);
    if state.open_until.is_some() || state.failures > 0 {
      info!(previous_failures = state.failures, "circuit closed");
    }
    state.failures = 0;
    state.open_until = None;
    state.trial_in_flight = false;
  }

  fn record_failure<E: BreakerFailure + std::fmt::Display>(&self, error: &E) {
    let mut state = lock(&self.state);
    state.trial_in_flight = false;

    if !error.trips_breaker() {
      debug!(error = %error, "failure not counted by circuit breaker");
      return;
    }

    state.failures += 1;
    if state.failures >= self.config.threshold {
      let until = self.clock.now_ms() + self.cooldown_ms(&state);
      state.open_until = Some(until);
      warn!(
        failures = state.failures,
        open_until = until,
        error = %error,
        "circuit opened"
      );
    } else {
      debug!(failures = state.failures, error = %error, "remote call failed");
    }
  }
}

/// Releases the half-open trial slot if the trial future is dropped
/// before it resolves.
struct TrialGuard<'a> {
  breaker: &'a CircuitBreaker,
}

impl Drop for TrialGuard<'_> {
  fn drop(&mut self) {
    lock(&self.breaker.state).trial_in_flight = false;
  }
}
