//! Time source and timer scheduling.
//!
//! Everything time-dependent in the layer (breaker cooldowns, debounce timers,
//! cache timestamps) goes through [`Clock`], so tests can drive time by hand
//! with [`ManualClock`] instead of sleeping.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::lock;

/// Handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(u64);

/// Work to run when a timer fires.
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Source of the current time plus one-shot timers.
pub trait Clock: Send + Sync {
  /// Milliseconds elapsed since the clock's epoch.
  fn now_ms(&self) -> u64;

  /// Run `task` once after `delay`.
  fn schedule(&self, delay: Duration, task: TimerTask) -> TimerToken;

  /// Cancel a pending timer. Cancelling a timer that already fired is a no-op.
  fn cancel(&self, token: TimerToken);
}

/// Clock backed by the tokio runtime.
///
/// `schedule` spawns a task, so it must be called from within a runtime.
/// Uses tokio's `Instant`, which means paused test time applies here too.
pub struct TokioClock {
  epoch: Instant,
  next_token: AtomicU64,
  timers: Arc<Mutex<HashMap<TimerToken, AbortHandle>>>,
}

impl TokioClock {
  pub fn new() -> Self {
    Self {
      epoch: Instant::now(),
      next_token: AtomicU64::new(1),
      timers: Arc::new(Mutex::new(HashMap::new())),
    }
  }
}

impl Default for TokioClock {
  fn default() -> Self {
    Self::new()
  }
}

impl Clock for TokioClock {
  fn now_ms(&self) -> u64 {
    self.epoch.elapsed().as_millis() as u64
  }

  fn schedule(&self, delay: Duration, task: TimerTask) -> TimerToken {
    let token = TimerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
    let shared = Arc::clone(&self.timers);

    // Held until the handle is registered, so the task's own removal
    // always comes after the insert.
    let mut timers = lock(&self.timers);
    let handle = tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      lock(&shared).remove(&token);
      task();
    });
    timers.insert(token, handle.abort_handle());
    token
  }

  fn cancel(&self, token: TimerToken) {
    if let Some(handle) = lock(&self.timers).remove(&token) {
      handle.abort();
    }
  }
}

/// Deterministic clock for tests.
///
/// Time only moves on [`ManualClock::advance`], which fires due timers in
/// deadline order on the calling thread.
#[derive(Default)]
pub struct ManualClock {
  now: AtomicU64,
  next_token: AtomicU64,
  pending: Mutex<BTreeMap<(u64, TimerToken), TimerTask>>,
}

impl ManualClock {
  pub fn new() -> Self {
    Self::default()
  }

  /// Create a clock whose current time is `ms`.
  pub fn starting_at(ms: u64) -> Self {
    let clock = Self::default();
    clock.now.store(ms, Ordering::SeqCst);
    clock
  }

  /// Move time forward, running every timer that comes due on the way.
  ///
  /// Timers scheduled by a firing task are honored if they fall inside the
  /// advanced window.
  pub fn advance(&self, by: Duration) {
    let target = self.now_ms() + by.as_millis() as u64;

    loop {
      let due = {
        let mut pending = lock(&self.pending);
        let next_key = pending
          .keys()
          .next()
          .copied()
          .filter(|(deadline, _)| *deadline <= target);
        next_key.and_then(|key| pending.remove(&key).map(|task| (key.0, task)))
      };

      match due {
        Some((deadline, task)) => {
          self.now.fetch_max(deadline, Ordering::SeqCst);
          task();
        }
        None => break,
      }
    }

    self.now.fetch_max(target, Ordering::SeqCst);
  }

  /// Number of timers that have not fired or been cancelled.
  pub fn pending_timers(&self) -> usize {
    lock(&self.pending).len()
  }
}

impl Clock for ManualClock {
  fn now_ms(&self) -> u64 {
    self.now.load(Ordering::SeqCst)
  }

  fn schedule(&self, delay: Duration, task: TimerTask) -> TimerToken {
    let token = TimerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
    let deadline = self.now_ms() + delay.as_millis() as u64;
    lock(&self.pending).insert((deadline, token), task);
    token
  }

  fn cancel(&self, token: TimerToken) {
    lock(&self.pending).retain(|(_, pending), _| *pending != token);
  }
}
