//! Remote API contract consumed by the collection stores.
//!
//! The core only ever sees [`PageSlice`], `Vec<E>` and `E`. Whatever shape the
//! server answers with is normalized before it crosses this boundary.

mod http;
mod signal;
mod wire;

use async_trait::async_trait;
use thiserror::Error;

use crate::breaker::BreakerFailure;
use crate::cache::Entity;
use crate::filters::FilterContext;

pub use http::HttpCollectionApi;
pub use signal::AbortSignal;
pub use wire::{EntityResponse, ListResponse};

/// Field → value changes applied to an entity.
pub type Patch = serde_json::Map<String, serde_json::Value>;

/// One page of a collection as returned by the API.
#[derive(Debug, Clone, PartialEq)]
pub struct PageSlice<E> {
  pub items: Vec<E>,
  /// Total matching items across all pages, when the server reports it
  pub total: Option<u64>,
}

impl<E> PageSlice<E> {
  pub fn new(items: Vec<E>, total: Option<u64>) -> Self {
    Self { items, total }
  }

  /// Number of pages for `page_size`, given this slice is page `page`.
  ///
  /// Without a reported total, a full page is taken to mean there is at least
  /// one more.
  pub fn total_pages(&self, page: u32, page_size: u32) -> u32 {
    match self.total {
      Some(total) if page_size > 0 => total.div_ceil(page_size as u64) as u32,
      Some(_) => 0,
      None if self.items.len() as u64 >= page_size as u64 && page_size > 0 => page + 1,
      None => page,
    }
  }
}

/// Errors from the remote API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
  #[error("server returned HTTP {status}: {message}")]
  Http { status: u16, message: String },

  #[error("request failed: {0}")]
  Transport(String),

  #[error("could not decode response: {0}")]
  Decode(String),

  #[error("request was aborted")]
  Aborted,
}

impl BreakerFailure for ApiError {
  fn trips_breaker(&self) -> bool {
    !matches!(self, ApiError::Aborted)
  }
}

/// Remote API for one entity collection.
#[async_trait]
pub trait CollectionApi<E: Entity>: Send + Sync {
  /// Fetch one page (1-based) of entities matching `filters`.
  async fn fetch_page(
    &self,
    page: u32,
    page_size: u32,
    filters: &FilterContext,
  ) -> Result<PageSlice<E>, ApiError>;

  /// Free-text search. Implementations should stop work once `signal` aborts.
  async fn search(&self, term: &str, signal: &AbortSignal) -> Result<Vec<E>, ApiError>;

  /// Apply `patch` to entity `id`, returning the canonical entity.
  async fn mutate(&self, id: &str, patch: &Patch) -> Result<E, ApiError>;
}
