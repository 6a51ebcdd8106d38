use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Cancellation signal handed to in-flight requests.
///
/// Clones share state: aborting any clone aborts them all.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
  inner: Arc<SignalInner>,
}

#[derive(Debug, Default)]
struct SignalInner {
  aborted: AtomicBool,
  notify: Notify,
}

impl AbortSignal {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn abort(&self) {
    if !self.inner.aborted.swap(true, Ordering::SeqCst) {
      self.inner.notify.notify_waiters();
    }
  }

  pub fn is_aborted(&self) -> bool {
    self.inner.aborted.load(Ordering::SeqCst)
  }

  /// Whether `other` is a clone of this signal.
  pub fn same_as(&self, other: &AbortSignal) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }

  /// Resolves once the signal is aborted.
  pub async fn cancelled(&self) {
    loop {
      let notified = self.inner.notify.notified();
      if self.is_aborted() {
        return;
      }
      notified.await;
    }
  }
}
