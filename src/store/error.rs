//! Store error types.

use thiserror::Error;

use crate::api::ApiError;

/// Errors surfaced by user-initiated store operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
  #[error("{0}")]
  Remote(#[from] ApiError),

  #[error("invalid change: {0}")]
  Validation(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of a load that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Loaded<T> {
  /// Fresh (or cached) data, now reflected in the store
  Data(T),
  /// The circuit breaker is open; nothing was requested
  CircuitOpen,
  /// A newer request or filter change overtook this one; the response was dropped
  Superseded,
}

impl<T> Loaded<T> {
  pub fn data(self) -> Option<T> {
    match self {
      Loaded::Data(data) => Some(data),
      _ => None,
    }
  }

  pub fn is_circuit_open(&self) -> bool {
    matches!(self, Loaded::CircuitOpen)
  }

  pub fn is_superseded(&self) -> bool {
    matches!(self, Loaded::Superseded)
  }
}
