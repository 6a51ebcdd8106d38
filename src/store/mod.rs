//! Collection store: the composition root UI collaborators talk to.
//!
//! One store per collection owns the entity list, pagination, filters, the
//! page cache and the circuit breaker. All remote calls go through the
//! breaker. State sits behind a mutex that is never held across an await, so
//! operations interleave freely; ordering is enforced by two checks made when
//! a response arrives:
//! - the page cache's filter-context hash must still match the one the
//!   request was made for, otherwise nothing is cached
//! - the request generation must still be the latest, otherwise the entity
//!   list is left alone (last request wins, not last response)

mod error;
mod mutation;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{AbortSignal, ApiError, CollectionApi, Patch};
use crate::breaker::{CircuitBreaker, CircuitPhase, CircuitSnapshot, Guarded};
use crate::cache::{Entity, PageCache, PageCacheEntry};
use crate::clock::Clock;
use crate::config::{BreakerConfig, Config};
use crate::filters::{self, FilterContext, StockFilter};
use crate::lock;
use crate::prefs::PreferenceStore;
use crate::search::SearchSink;

pub use error::{Loaded, StoreError, StoreResult};
pub use mutation::PendingMutation;

/// Message stored when a mutation is reverted because the circuit is open.
const CIRCUIT_OPEN_MUTATION: &str = "service temporarily unavailable; change was reverted";

/// Callback run after every filter-context change.
type FilterHook = Arc<dyn Fn() + Send + Sync>;

/// Position within the current filter context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
  /// Current page, 1-based
  pub page: u32,
  pub page_size: u32,
  pub total_items: Option<u64>,
  /// 0 until the first page has loaded
  pub total_pages: u32,
}

impl Pagination {
  fn first(page_size: u32) -> Self {
    Self {
      page: 1,
      page_size,
      total_items: None,
      total_pages: 0,
    }
  }
}

/// Construction options for a store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
  pub breaker: BreakerConfig,
  pub page_size: u32,
  /// Prefix for persisted preference keys
  pub namespace: String,
}

impl StoreOptions {
  pub fn from_config(config: &Config) -> Self {
    Self {
      breaker: config.breaker,
      page_size: config.page_size,
      namespace: config.namespace.clone(),
    }
  }
}

impl Default for StoreOptions {
  fn default() -> Self {
    Self {
      breaker: BreakerConfig::default(),
      page_size: 20,
      namespace: "stockdesk".to_string(),
    }
  }
}

struct StoreState<E> {
  entities: Vec<E>,
  pagination: Pagination,
  filters: FilterContext,
  cache: PageCache<E>,
  error: Option<String>,
  loading: bool,
  /// Bumped by every operation that replaces the entity list
  generation: u64,
  next_mutation: u64,
  pending: HashMap<u64, PendingMutation<E>>,
}

impl<E: Entity> StoreState<E> {
  /// Start a new cache for the current filters and page size.
  fn invalidate(&mut self) {
    let context = self.filters.cache_hash(self.pagination.page_size);
    debug!(
      collection = E::collection(),
      dropped_pages = self.cache.len(),
      "page cache invalidated"
    );
    self.cache = PageCache::new(context);
    self.pagination = Pagination::first(self.pagination.page_size);
  }

  fn next_generation(&mut self) -> u64 {
    self.generation += 1;
    self.generation
  }

  fn replace_entity(&mut self, entity: &E) {
    for current in self.entities.iter_mut().filter(|e| e.id() == entity.id()) {
      *current = entity.clone();
    }
    self.cache.replace_entity(entity);
  }

  /// Resolve mutation `ticket`, whose entry has already been removed.
  ///
  /// `base` is the entity as it stands without that mutation's patch, or with
  /// the server's answer to it. Later mutations of the same entity that are
  /// still pending are rebased onto it: their snapshots are rewritten and
  /// their patches reapplied in start order.
  fn settle_mutation(&mut self, ticket: u64, id: &str, base: E) {
    let mut later: Vec<u64> = self
      .pending
      .iter()
      .filter(|(t, m)| **t > ticket && m.entity_id == id)
      .map(|(t, _)| *t)
      .collect();
    later.sort_unstable();

    let mut current = base;
    for t in later {
      if let Some(mutation) = self.pending.get_mut(&t) {
        mutation.previous_snapshot = current.clone();
        match mutation::apply_patch(&current, &mutation.patch) {
          Ok(next) => current = next,
          Err(e) => warn!(collection = E::collection(), id, error = %e, "pending patch no longer applies"),
        }
      }
    }
    self.replace_entity(&current);
  }
}

struct StoreInner<E: Entity> {
  api: Arc<dyn CollectionApi<E>>,
  clock: Arc<dyn Clock>,
  prefs: Arc<dyn PreferenceStore>,
  breaker: CircuitBreaker,
  namespace: String,
  state: Mutex<StoreState<E>>,
  filter_hooks: Mutex<Vec<FilterHook>>,
}

/// Resilient data access for one entity collection.
///
/// Cloning is cheap and yields a handle to the same store.
pub struct CollectionStore<E: Entity> {
  inner: Arc<StoreInner<E>>,
}

impl<E: Entity> Clone for CollectionStore<E> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<E: Entity> CollectionStore<E> {
  /// Create a store, rehydrating persisted filter selections.
  pub fn new(
    api: Arc<dyn CollectionApi<E>>,
    clock: Arc<dyn Clock>,
    prefs: Arc<dyn PreferenceStore>,
    options: StoreOptions,
  ) -> Self {
    let namespace = format!("{}:{}", options.namespace, E::collection());
    let filters = filters::load_filters(prefs.as_ref(), &namespace);
    let page_size = options.page_size.max(1);

    let state = StoreState {
      entities: Vec::new(),
      pagination: Pagination::first(page_size),
      cache: PageCache::new(filters.cache_hash(page_size)),
      filters,
      error: None,
      loading: false,
      generation: 0,
      next_mutation: 0,
      pending: HashMap::new(),
    };

    Self {
      inner: Arc::new(StoreInner {
        breaker: CircuitBreaker::new(options.breaker, Arc::clone(&clock)),
        api,
        clock,
        prefs,
        namespace,
        state: Mutex::new(state),
        filter_hooks: Mutex::new(Vec::new()),
      }),
    }
  }

  fn state(&self) -> MutexGuard<'_, StoreState<E>> {
    lock(&self.inner.state)
  }

  // ==========================================================================
  // Loading
  // ==========================================================================

  /// Load page `page` of the current filter context.
  ///
  /// A cached page is served without touching the network. A different
  /// `page_size` changes page numbering and so invalidates the cache.
  pub async fn fetch_page(&self, page: u32, page_size: u32) -> StoreResult<Loaded<Vec<E>>> {
    let page = page.max(1);
    let page_size = page_size.max(1);

    let (generation, context, filters) = {
      let mut state = self.state();
      if state.pagination.page_size != page_size {
        state.pagination.page_size = page_size;
        state.invalidate();
      }
      let generation = state.next_generation();

      if let Some(entry) = state.cache.get(page) {
        let entities = entry.entities.clone();
        debug!(collection = E::collection(), page, "page served from cache");
        state.entities = entities.clone();
        state.pagination.page = page;
        state.error = None;
        state.loading = false;
        return Ok(Loaded::Data(entities));
      }

      state.loading = true;
      (generation, state.cache.context().to_string(), state.filters.clone())
    };

    let api = &self.inner.api;
    let result = self
      .inner
      .breaker
      .guarded_call(|| api.fetch_page(page, page_size, &filters))
      .await;

    let mut state = self.state();
    let current = state.generation == generation;
    if current {
      state.loading = false;
    }

    match result {
      Ok(Guarded::CircuitOpen) => Ok(Loaded::CircuitOpen),
      Ok(Guarded::Ready(slice)) => {
        let total_pages = slice.total_pages(page, page_size);
        let now = self.inner.clock.now_ms();
        if !state.cache.insert_for(&context, page, slice.items.clone(), now) {
          debug!(collection = E::collection(), page, "dropping page for stale filter context");
          return Ok(Loaded::Superseded);
        }
        if !current {
          debug!(collection = E::collection(), page, "page cached, newer request owns the view");
          return Ok(Loaded::Superseded);
        }

        state.entities = slice.items.clone();
        state.pagination = Pagination {
          page,
          page_size,
          total_items: slice.total,
          total_pages,
        };
        state.error = None;
        Ok(Loaded::Data(slice.items))
      }
      Err(e) => {
        if current {
          state.error = Some(e.to_string());
        }
        Err(StoreError::Remote(e))
      }
    }
  }

  /// Search the collection; results replace the entity list.
  ///
  /// The term becomes part of the filter context. A response is dropped if
  /// `signal` was aborted or any newer load started while it was in flight.
  pub async fn search(&self, term: &str, signal: AbortSignal) -> StoreResult<Loaded<Vec<E>>> {
    let term = term.trim().to_string();
    if term.is_empty() {
      return Err(StoreError::Validation("search term is empty".to_string()));
    }

    let generation = {
      let mut state = self.state();
      if state.filters.search_term() != term {
        state.filters.search_term = term.clone();
        state.invalidate();
      }
      state.loading = true;
      state.next_generation()
    };

    let api = &self.inner.api;
    let result = self
      .inner
      .breaker
      .guarded_call(|| api.search(&term, &signal))
      .await;

    let mut state = self.state();
    let current = state.generation == generation;
    if current {
      state.loading = false;
    }
    if !current || signal.is_aborted() {
      debug!(collection = E::collection(), term = %term, "dropping superseded search");
      return Ok(Loaded::Superseded);
    }

    match result {
      Ok(Guarded::CircuitOpen) => Ok(Loaded::CircuitOpen),
      Ok(Guarded::Ready(items)) => {
        state.pagination = Pagination {
          page: 1,
          page_size: state.pagination.page_size,
          total_items: Some(items.len() as u64),
          total_pages: 1,
        };
        state.entities = items.clone();
        state.error = None;
        Ok(Loaded::Data(items))
      }
      Err(ApiError::Aborted) => Ok(Loaded::Superseded),
      Err(e) => {
        state.error = Some(e.to_string());
        Err(StoreError::Remote(e))
      }
    }
  }

  /// Fetch the page after the current one in the background.
  ///
  /// Does nothing if there is no next page, it is already cached, or the
  /// circuit is open. Failures are dropped silently. The returned handle
  /// may be ignored.
  pub fn prefetch_next_page(&self) -> Option<JoinHandle<()>> {
    let (next, page_size, context, filters) = {
      let state = self.state();
      let next = state.pagination.page + 1;
      if next > state.pagination.total_pages || state.cache.contains(next) {
        return None;
      }
      (
        next,
        state.pagination.page_size,
        state.cache.context().to_string(),
        state.filters.clone(),
      )
    };

    // A half-open breaker admits one trial call; leave it to the user.
    if self.inner.breaker.phase() != CircuitPhase::Closed {
      debug!(collection = E::collection(), page = next, "circuit not closed, skipping prefetch");
      return None;
    }

    let store = self.clone();
    Some(tokio::spawn(async move {
      store.prefetch(next, page_size, context, filters).await;
    }))
  }

  async fn prefetch(&self, page: u32, page_size: u32, context: String, filters: FilterContext) {
    let api = &self.inner.api;
    let result = self
      .inner
      .breaker
      .guarded_call(|| api.fetch_page(page, page_size, &filters))
      .await;

    match result {
      Ok(Guarded::Ready(slice)) => {
        let now = self.inner.clock.now_ms();
        let stored = self.state().cache.insert_for(&context, page, slice.items, now);
        debug!(collection = E::collection(), page, stored, "prefetch finished");
      }
      Ok(Guarded::CircuitOpen) => {}
      Err(e) => {
        debug!(collection = E::collection(), page, error = %e, "prefetch failed");
      }
    }
  }

  /// Drop the current page from the cache and load it again.
  pub async fn refresh(&self) -> StoreResult<Loaded<Vec<E>>> {
    let pagination = {
      let mut state = self.state();
      let page = state.pagination.page;
      state.cache.remove(page);
      state.pagination
    };
    self.fetch_page(pagination.page, pagination.page_size).await
  }

  // ==========================================================================
  // Mutation
  // ==========================================================================

  /// Apply `patch` locally at once, then confirm it remotely.
  ///
  /// Returns `Ok(true)` once the server accepts the change and `Ok(false)`
  /// if it was rejected or the circuit was open; in that case the entity is
  /// restored to exactly what it was when this call began and the error
  /// field is set. Invalid patches fail before anything is applied.
  pub async fn optimistic_update(&self, id: &str, patch: Patch) -> StoreResult<bool> {
    let ticket = match self.apply_optimistic(id, &patch) {
      Ok(ticket) => ticket,
      Err(e) => {
        self.state().error = Some(e.to_string());
        return Err(e);
      }
    };

    let guard = PendingGuard { store: self, ticket };
    let api = &self.inner.api;
    let result = self
      .inner
      .breaker
      .guarded_call(|| api.mutate(id, &patch))
      .await;
    // The outcome below settles the ticket; the guard only covers drops.
    std::mem::forget(guard);

    let mut state = self.state();
    let Some(pending) = state.pending.remove(&ticket) else {
      warn!(collection = E::collection(), id, "pending mutation vanished");
      return Ok(false);
    };

    let failure = match result {
      Ok(Guarded::Ready(canonical)) => {
        let local = mutation::apply_patch(&pending.previous_snapshot, &pending.patch)
          .unwrap_or_else(|_| canonical.clone());
        let reconciled = mutation::reconcile(&local, &canonical);
        state.settle_mutation(ticket, id, reconciled);
        debug!(collection = E::collection(), id, "mutation confirmed");
        return Ok(true);
      }
      Ok(Guarded::CircuitOpen) => CIRCUIT_OPEN_MUTATION.to_string(),
      Err(e) => e.to_string(),
    };

    state.settle_mutation(ticket, id, pending.previous_snapshot);
    info!(
      collection = E::collection(),
      id,
      error = %failure,
      "mutation failed, rolled back"
    );
    state.error = Some(failure);
    Ok(false)
  }

  /// Validate, snapshot and apply a patch; returns the pending-mutation ticket.
  fn apply_optimistic(&self, id: &str, patch: &Patch) -> StoreResult<u64> {
    mutation::validate_patch(id, patch)?;

    let mut state = self.state();
    let snapshot = state
      .entities
      .iter()
      .find(|e| e.id() == id)
      .cloned()
      .ok_or_else(|| StoreError::Validation(format!("{} is not loaded", id)))?;

    let optimistic = mutation::apply_patch(&snapshot, patch)?;
    state.replace_entity(&optimistic);

    let ticket = state.next_mutation;
    state.next_mutation += 1;
    state.pending.insert(
      ticket,
      PendingMutation {
        entity_id: id.to_string(),
        patch: patch.clone(),
        previous_snapshot: snapshot,
      },
    );
    Ok(ticket)
  }

  // ==========================================================================
  // Filters
  // ==========================================================================

  /// Replace the filter context.
  ///
  /// A real change clears the page cache and supersedes in-flight loads
  /// before returning; selections are persisted.
  pub fn set_filters(&self, filters: FilterContext) {
    {
      let mut state = self.state();
      if state.filters == filters {
        return;
      }
      state.filters = filters;
      state.invalidate();
      state.next_generation();
      state.loading = false;
      filters::save_filters(self.inner.prefs.as_ref(), &self.inner.namespace, &state.filters);
    }

    let hooks = lock(&self.inner.filter_hooks).clone();
    for hook in hooks {
      hook();
    }
  }

  /// Run `hook` after every filter-context change, once the cache is cleared.
  ///
  /// A search binding registers [`Debouncer::interrupter`] here so a timer
  /// armed under the old context never settles.
  ///
  /// [`Debouncer::interrupter`]: crate::search::Debouncer::interrupter
  pub fn on_filters_changed(&self, hook: impl Fn() + Send + Sync + 'static) {
    lock(&self.inner.filter_hooks).push(Arc::new(hook));
  }

  pub fn set_search_term(&self, term: &str) {
    let filters = FilterContext {
      search_term: term.to_string(),
      ..self.filters()
    };
    self.set_filters(filters);
  }

  pub fn set_category(&self, category: Option<String>) {
    let filters = FilterContext {
      category,
      ..self.filters()
    };
    self.set_filters(filters);
  }

  pub fn set_stock_filter(&self, stock_filter: StockFilter) {
    let filters = FilterContext {
      stock_filter,
      ..self.filters()
    };
    self.set_filters(filters);
  }

  pub fn reset_filters(&self) {
    self.set_filters(FilterContext::default());
  }

  /// Drop the search term and any in-flight search.
  pub fn clear_search(&self) {
    self.set_search_term("");
  }

  // ==========================================================================
  // Circuit
  // ==========================================================================

  pub fn circuit(&self) -> CircuitSnapshot {
    self.inner.breaker.snapshot()
  }

  /// Shrink the breaker cooldown for deterministic timer tests.
  pub fn set_testing_fast_retries(&self, enabled: bool) {
    self.inner.breaker.set_fast_retries(enabled);
  }

  pub fn reset_circuit(&self) {
    self.inner.breaker.reset();
  }

  // ==========================================================================
  // Accessors for UI rendering
  // ==========================================================================

  pub fn entities(&self) -> Vec<E> {
    self.state().entities.clone()
  }

  pub fn entity(&self, id: &str) -> Option<E> {
    self.state().entities.iter().find(|e| e.id() == id).cloned()
  }

  pub fn pagination(&self) -> Pagination {
    self.state().pagination
  }

  pub fn filters(&self) -> FilterContext {
    self.state().filters.clone()
  }

  pub fn error(&self) -> Option<String> {
    self.state().error.clone()
  }

  pub fn clear_error(&self) {
    self.state().error = None;
  }

  pub fn is_loading(&self) -> bool {
    self.state().loading
  }

  /// Page numbers cached for the current filter context.
  pub fn cached_pages(&self) -> Vec<u32> {
    self.state().cache.pages()
  }

  pub fn cached_page(&self, page: u32) -> Option<PageCacheEntry<E>> {
    self.state().cache.get(page).cloned()
  }

  /// Number of optimistic updates awaiting the server.
  pub fn pending_mutations(&self) -> usize {
    self.state().pending.len()
  }
}

/// Rolls back a mutation whose future was dropped before the server answered.
struct PendingGuard<'a, E: Entity> {
  store: &'a CollectionStore<E>,
  ticket: u64,
}

impl<E: Entity> Drop for PendingGuard<'_, E> {
  fn drop(&mut self) {
    let mut state = self.store.state();
    if let Some(pending) = state.pending.remove(&self.ticket) {
      info!(
        collection = E::collection(),
        id = %pending.entity_id,
        "mutation abandoned, rolled back"
      );
      state.settle_mutation(self.ticket, &pending.entity_id, pending.previous_snapshot);
    }
  }
}

impl<E: Entity> SearchSink for CollectionStore<E> {
  fn search(&self, term: &str, signal: AbortSignal) {
    let store = self.clone();
    let term = term.to_string();
    tokio::spawn(async move {
      if let Err(e) = CollectionStore::search(&store, &term, signal).await {
        debug!(collection = E::collection(), error = %e, "debounced search failed");
      }
    });
  }

  fn clear(&self) {
    self.clear_search();
    let store = self.clone();
    let page_size = self.pagination().page_size;
    tokio::spawn(async move {
      if let Err(e) = store.fetch_page(1, page_size).await {
        debug!(collection = E::collection(), error = %e, "reload after clear failed");
      }
    });
  }
}

#[cfg(test)]
mod tests;
