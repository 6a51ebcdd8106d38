//! Resilient data-access layer for entity collections.
//!
//! The layer sits between UI collaborators and a remote HTTP API and combines:
//! - a circuit breaker that stops hammering a failing endpoint
//! - a page cache (keyed by filter context) with next-page prefetch
//! - a debounced, cancelable search pipeline
//! - optimistic mutations with exact rollback on failure
//!
//! One [`store::CollectionStore`] is built per collection (products,
//! suppliers, ...) with its clock, API client and preference store injected.

pub mod api;
pub mod breaker;
pub mod cache;
pub mod clock;
pub mod config;
pub mod filters;
pub mod model;
pub mod prefs;
pub mod search;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// State guarded this way is only ever replaced wholesale, so a poisoned
/// lock still holds a consistent value.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
