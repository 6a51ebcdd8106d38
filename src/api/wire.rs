//! Serde types matching the response shapes the ERP API is known to send.
//!
//! Different endpoints wrap lists differently (`data`, `results`, or a bare
//! array). These types accept all of them and normalize to one shape.

use serde::Deserialize;

use super::PageSlice;

#[derive(Debug, Deserialize, Default)]
pub struct ApiMeta {
  #[serde(default, alias = "count", alias = "total_count")]
  pub total: Option<u64>,
}

/// Any list response the API may send.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ListResponse<E> {
  Data {
    data: Vec<E>,
    #[serde(default, alias = "total_count")]
    total: Option<u64>,
    #[serde(default)]
    meta: Option<ApiMeta>,
  },
  Results {
    results: Vec<E>,
    #[serde(default)]
    count: Option<u64>,
  },
  Bare(Vec<E>),
}

impl<E> ListResponse<E> {
  pub fn into_slice(self) -> PageSlice<E> {
    match self {
      ListResponse::Data { data, total, meta } => {
        let total = total.or_else(|| meta.and_then(|m| m.total));
        PageSlice::new(data, total)
      }
      ListResponse::Results { results, count } => PageSlice::new(results, count),
      ListResponse::Bare(items) => PageSlice::new(items, None),
    }
  }
}

/// A single entity, either bare or wrapped in `data`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EntityResponse<E> {
  Wrapped { data: E },
  Bare(E),
}

impl<E> EntityResponse<E> {
  pub fn into_entity(self) -> E {
    match self {
      EntityResponse::Wrapped { data } => data,
      EntityResponse::Bare(entity) => entity,
    }
  }
}
