//! Test doubles shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::api::{AbortSignal, ApiError, CollectionApi, PageSlice, Patch};
use crate::cache::Entity;
use crate::filters::FilterContext;
use crate::lock;
use crate::model::Product;
use crate::search::SearchSink;

/// Products `P{from}..=P{to}` named "Product {n}".
pub(crate) fn products(from: u32, to: u32) -> Vec<Product> {
  (from..=to)
    .map(|n| Product::new(format!("P{}", n), format!("Product {}", n)))
    .collect()
}

struct FakeState<E> {
  pages: HashMap<u32, Vec<E>>,
  total: Option<u64>,
  search_results: HashMap<String, Vec<E>>,
  canonical: Option<E>,
  failure: Option<ApiError>,
  fetch_calls: Vec<(u32, u32, FilterContext)>,
  search_calls: Vec<String>,
  mutate_calls: Vec<(String, Patch)>,
}

/// Scripted in-memory API.
///
/// Calls can be held open with [`FakeApi::hold`]; the returned sender
/// releases the call, optionally with an error to fail it.
pub(crate) struct FakeApi<E = Product> {
  state: Mutex<FakeState<E>>,
  gates: Mutex<HashMap<String, VecDeque<oneshot::Receiver<Option<ApiError>>>>>,
}

impl<E: Entity> FakeApi<E> {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(FakeState {
        pages: HashMap::new(),
        total: None,
        search_results: HashMap::new(),
        canonical: None,
        failure: None,
        fetch_calls: Vec::new(),
        search_calls: Vec::new(),
        mutate_calls: Vec::new(),
      }),
      gates: Mutex::new(HashMap::new()),
    }
  }

  pub fn set_page(&self, page: u32, items: Vec<E>) {
    lock(&self.state).pages.insert(page, items);
  }

  pub fn set_total(&self, total: u64) {
    lock(&self.state).total = Some(total);
  }

  pub fn set_search(&self, term: &str, items: Vec<E>) {
    lock(&self.state)
      .search_results
      .insert(term.to_string(), items);
  }

  /// Entity returned by `mutate` instead of the patched stored copy.
  pub fn set_canonical(&self, entity: E) {
    lock(&self.state).canonical = Some(entity);
  }

  /// Fail every call with `error` until [`FakeApi::recover`].
  pub fn fail_with(&self, error: ApiError) {
    lock(&self.state).failure = Some(error);
  }

  pub fn recover(&self) {
    lock(&self.state).failure = None;
  }

  /// Hold the next call for `key` ("page:2", "search:drill", "mutate:P1").
  pub fn hold(&self, key: &str) -> oneshot::Sender<Option<ApiError>> {
    let (tx, rx) = oneshot::channel();
    lock(&self.gates)
      .entry(key.to_string())
      .or_default()
      .push_back(rx);
    tx
  }

  pub fn fetch_calls(&self) -> usize {
    lock(&self.state).fetch_calls.len()
  }

  pub fn fetched_pages(&self) -> Vec<u32> {
    lock(&self.state).fetch_calls.iter().map(|(page, _, _)| *page).collect()
  }

  pub fn last_filters(&self) -> Option<FilterContext> {
    lock(&self.state).fetch_calls.last().map(|(_, _, f)| f.clone())
  }

  pub fn search_calls(&self) -> Vec<String> {
    lock(&self.state).search_calls.clone()
  }

  pub fn mutate_calls(&self) -> usize {
    lock(&self.state).mutate_calls.len()
  }

  async fn pass_gate(&self, key: &str) -> Result<(), ApiError> {
    let gate = lock(&self.gates).get_mut(key).and_then(|queue| queue.pop_front());
    if let Some(gate) = gate {
      if let Ok(Some(error)) = gate.await {
        return Err(error);
      }
    }
    match &lock(&self.state).failure {
      Some(error) => Err(error.clone()),
      None => Ok(()),
    }
  }
}

#[async_trait]
impl<E: Entity> CollectionApi<E> for FakeApi<E> {
  async fn fetch_page(
    &self,
    page: u32,
    page_size: u32,
    filters: &FilterContext,
  ) -> Result<PageSlice<E>, ApiError> {
    lock(&self.state)
      .fetch_calls
      .push((page, page_size, filters.clone()));
    self.pass_gate(&format!("page:{}", page)).await?;

    let state = lock(&self.state);
    let items = state.pages.get(&page).cloned().unwrap_or_default();
    Ok(PageSlice::new(items, state.total))
  }

  async fn search(&self, term: &str, _signal: &AbortSignal) -> Result<Vec<E>, ApiError> {
    lock(&self.state).search_calls.push(term.to_string());
    self.pass_gate(&format!("search:{}", term)).await?;

    Ok(
      lock(&self.state)
        .search_results
        .get(term)
        .cloned()
        .unwrap_or_default(),
    )
  }

  async fn mutate(&self, id: &str, patch: &Patch) -> Result<E, ApiError> {
    lock(&self.state)
      .mutate_calls
      .push((id.to_string(), patch.clone()));
    self.pass_gate(&format!("mutate:{}", id)).await?;

    let mut state = lock(&self.state);
    if let Some(canonical) = state.canonical.clone() {
      return Ok(canonical);
    }

    let stored = state
      .pages
      .values_mut()
      .flat_map(|items| items.iter_mut())
      .find(|e| e.id() == id)
      .ok_or_else(|| ApiError::Http {
        status: 404,
        message: format!("{} not found", id),
      })?;

    let mut fields = match serde_json::to_value(&*stored) {
      Ok(Value::Object(fields)) => fields,
      _ => return Err(ApiError::Decode(format!("stored {} entity", E::collection()))),
    };
    fields.extend(patch.clone());
    let updated: E =
      serde_json::from_value(Value::Object(fields)).map_err(|e| ApiError::Decode(e.to_string()))?;
    *stored = updated.clone();
    Ok(updated)
  }
}

/// Search sink that records what it was asked to do.
#[derive(Default)]
pub(crate) struct RecordingSink {
  searches: Mutex<Vec<String>>,
  clears: AtomicUsize,
}

impl RecordingSink {
  pub fn searches(&self) -> Vec<String> {
    lock(&self.searches).clone()
  }

  pub fn clears(&self) -> usize {
    self.clears.load(Ordering::SeqCst)
  }
}

impl SearchSink for RecordingSink {
  fn search(&self, term: &str, _signal: AbortSignal) {
    lock(&self.searches).push(term.to_string());
  }

  fn clear(&self) {
    self.clears.fetch_add(1, Ordering::SeqCst);
  }
}
