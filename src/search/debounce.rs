//! Debounced, cancelable search dispatch.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::api::AbortSignal;
use crate::clock::{Clock, TimerToken};
use crate::config::SearchConfig;
use crate::lock;

/// Receiver of settled search input.
pub trait SearchSink: Send + Sync {
  /// Run a search for `term`. `signal` is aborted once a newer input supersedes it.
  fn search(&self, term: &str, signal: AbortSignal);

  /// The input was cleared; drop any active search results.
  fn clear(&self);
}

#[derive(Debug, Default)]
struct DebounceState {
  raw_value: String,
  settled_value: Option<String>,
  timer: Option<TimerToken>,
  active_abort: Option<AbortSignal>,
  /// Bumped on every input event; a timer only settles its own generation.
  generation: u64,
}

enum Settlement {
  Search(String, AbortSignal),
  Clear,
  BelowMinimum,
}

/// Delays search until input has been quiet for `debounce_ms`.
///
/// Settled values are gated: empty input clears, input shorter than
/// `min_chars` is ignored, anything else searches. Each new keystroke aborts
/// the search started by the previous settlement.
pub struct Debouncer {
  config: SearchConfig,
  clock: Arc<dyn Clock>,
  sink: Arc<dyn SearchSink>,
  state: Arc<Mutex<DebounceState>>,
}

impl Debouncer {
  pub fn new(config: SearchConfig, clock: Arc<dyn Clock>, sink: Arc<dyn SearchSink>) -> Self {
    Self {
      config,
      clock,
      sink,
      state: Arc::new(Mutex::new(DebounceState::default())),
    }
  }

  /// Record a new input value and restart the quiet-period timer.
  pub fn on_input_change(&self, value: &str) {
    let mut state = lock(&self.state);
    state.raw_value = value.to_string();
    self.interrupt(&mut state);

    let generation = state.generation;
    let shared = Arc::clone(&self.state);
    let sink = Arc::clone(&self.sink);
    let min_chars = self.config.min_chars;

    let token = self.clock.schedule(
      Duration::from_millis(self.config.debounce_ms),
      Box::new(move || settle(&shared, sink.as_ref(), min_chars, Some(generation))),
    );
    state.timer = Some(token);
  }

  /// Settle immediately (e.g. Enter), applying the same length gate.
  pub fn submit(&self) {
    {
      let mut state = lock(&self.state);
      self.interrupt(&mut state);
    }
    settle(&self.state, self.sink.as_ref(), self.config.min_chars, None);
  }

  /// Clear the input and notify the sink right away (e.g. Escape).
  pub fn escape(&self) {
    {
      let mut state = lock(&self.state);
      self.interrupt(&mut state);
      if let Some(signal) = state.active_abort.take() {
        signal.abort();
      }
      state.raw_value.clear();
      state.settled_value = Some(String::new());
    }
    debug!("search escaped");
    self.sink.clear();
  }

  /// Drop any pending timer and abort the active search.
  pub fn cancel(&self) {
    let mut state = lock(&self.state);
    self.interrupt(&mut state);
    if let Some(signal) = state.active_abort.take() {
      signal.abort();
    }
  }

  pub fn raw_value(&self) -> String {
    lock(&self.state).raw_value.clone()
  }

  /// Last settled value, if input has settled at least once.
  pub fn settled_value(&self) -> Option<String> {
    lock(&self.state).settled_value.clone()
  }

  /// Whether a settlement is waiting on the quiet period.
  pub fn is_pending(&self) -> bool {
    lock(&self.state).timer.is_some()
  }

  /// Signal of the search most recently dispatched, if still current.
  pub fn active_signal(&self) -> Option<AbortSignal> {
    lock(&self.state).active_abort.clone()
  }

  /// Callback that drops any pending settlement and aborts the active search.
  ///
  /// Meant for whoever owns the filter context, so a context change can
  /// cancel the timer before it settles for the old context. The callback
  /// does nothing once the debouncer is dropped.
  pub fn interrupter(&self) -> impl Fn() + Send + Sync + 'static {
    let state = Arc::downgrade(&self.state);
    let clock = Arc::clone(&self.clock);
    move || {
      if let Some(state) = state.upgrade() {
        interrupt(clock.as_ref(), &mut lock(&state));
        debug!("pending search interrupted");
      }
    }
  }

  fn interrupt(&self, state: &mut DebounceState) {
    interrupt(self.clock.as_ref(), state);
  }
}

/// Cancel the timer, invalidate older timers and abort the previous search.
fn interrupt(clock: &dyn Clock, state: &mut DebounceState) {
  state.generation += 1;
  if let Some(token) = state.timer.take() {
    clock.cancel(token);
  }
  if let Some(signal) = &state.active_abort {
    signal.abort();
  }
}

impl Drop for Debouncer {
  fn drop(&mut self) {
    self.cancel();
  }
}

fn settle(state: &Mutex<DebounceState>, sink: &dyn SearchSink, min_chars: usize, generation: Option<u64>) {
  let settlement = {
    let mut state = lock(state);
    if generation.is_some_and(|g| g != state.generation) {
      return;
    }
    state.timer = None;

    let term = state.raw_value.trim().to_string();
    state.settled_value = Some(term.clone());

    let length = term.chars().count();
    if length == 0 {
      if let Some(signal) = state.active_abort.take() {
        signal.abort();
      }
      Settlement::Clear
    } else if length < min_chars {
      Settlement::BelowMinimum
    } else {
      if let Some(previous) = state.active_abort.take() {
        previous.abort();
      }
      let signal = AbortSignal::new();
      state.active_abort = Some(signal.clone());
      Settlement::Search(term, signal)
    }
  };

  match settlement {
    Settlement::Search(term, signal) => {
      debug!(term = %term, "search settled");
      sink.search(&term, signal);
    }
    Settlement::Clear => {
      debug!("search settled empty, clearing");
      sink.clear();
    }
    Settlement::BelowMinimum => {
      debug!(min_chars, "search below minimum length, ignoring");
    }
  }
}
