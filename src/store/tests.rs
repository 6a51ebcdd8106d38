use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use super::*;
use crate::breaker::CircuitPhase;
use crate::clock::ManualClock;
use crate::config::SearchConfig;
use crate::model::{Product, Supplier};
use crate::prefs::MemoryPreferences;
use crate::search::Debouncer;
use crate::testing::{products, FakeApi};

const COOLDOWN_MS: u64 = 1_000;

struct Harness {
  store: CollectionStore<Product>,
  api: Arc<FakeApi>,
  clock: Arc<ManualClock>,
  prefs: Arc<MemoryPreferences>,
}

fn options() -> StoreOptions {
  StoreOptions {
    breaker: BreakerConfig {
      threshold: 4,
      cooldown_ms: COOLDOWN_MS,
      fast_retry_cooldown_ms: 50,
    },
    page_size: 10,
    namespace: "test".to_string(),
  }
}

fn harness_with_prefs(prefs: Arc<MemoryPreferences>) -> Harness {
  let api = Arc::new(FakeApi::<Product>::new());
  let clock = Arc::new(ManualClock::starting_at(1_000));
  let store = CollectionStore::new(
    Arc::clone(&api) as Arc<dyn CollectionApi<Product>>,
    Arc::clone(&clock) as Arc<dyn Clock>,
    Arc::clone(&prefs) as Arc<dyn PreferenceStore>,
    options(),
  );
  Harness {
    store,
    api,
    clock,
    prefs,
  }
}

fn harness() -> Harness {
  harness_with_prefs(Arc::new(MemoryPreferences::new()))
}

fn patch(value: Value) -> Patch {
  match value {
    Value::Object(map) => map,
    _ => panic!("patch must be an object"),
  }
}

fn server_error() -> ApiError {
  ApiError::Http {
    status: 500,
    message: "boom".to_string(),
  }
}

/// Let spawned tasks run until `done` holds.
async fn settle(mut done: impl FnMut() -> bool) {
  for _ in 0..200 {
    if done() {
      return;
    }
    tokio::task::yield_now().await;
  }
  panic!("condition never became true");
}

/// Fail `threshold` fetches of an uncached page so the circuit opens.
async fn open_circuit(h: &Harness, page: u32) {
  h.api.fail_with(ApiError::Transport("connection refused".to_string()));
  for _ in 0..4 {
    assert!(h.store.fetch_page(page, 10).await.is_err());
  }
  h.api.recover();
}

// ============================================================================
// Breaker integration
// ============================================================================

#[tokio::test]
async fn test_breaker_opens_after_threshold_failures() {
  let h = harness();
  h.api.fail_with(ApiError::Transport("connection refused".to_string()));

  for _ in 0..4 {
    let err = h.store.fetch_page(1, 10).await.unwrap_err();
    assert!(matches!(err, StoreError::Remote(ApiError::Transport(_))));
  }
  assert_eq!(h.api.fetch_calls(), 4);
  assert!(h.store.error().is_some());

  let fifth = h.store.fetch_page(1, 10).await.unwrap();
  assert!(fifth.is_circuit_open());
  assert_eq!(h.api.fetch_calls(), 4);

  let circuit = h.store.circuit();
  assert_eq!(circuit.failures, 4);
  assert_eq!(circuit.phase, CircuitPhase::Open);
  assert_eq!(circuit.open_until, Some(1_000 + COOLDOWN_MS));
}

#[tokio::test]
async fn test_breaker_closes_after_cooldown_and_success() {
  let h = harness();
  open_circuit(&h, 1).await;
  assert!(h.store.fetch_page(1, 10).await.unwrap().is_circuit_open());

  h.clock.advance(Duration::from_millis(COOLDOWN_MS + 10));
  h.api.set_page(1, products(1, 10));

  let loaded = h.store.fetch_page(1, 10).await.unwrap();
  assert_eq!(loaded.data(), Some(products(1, 10)));
  assert_eq!(h.store.entities(), products(1, 10));
  assert_eq!(h.store.error(), None);

  let circuit = h.store.circuit();
  assert_eq!(circuit.failures, 0);
  assert_eq!(circuit.open_until, None);
  assert_eq!(circuit.phase, CircuitPhase::Closed);
}

#[tokio::test]
async fn test_fast_retries_shorten_cooldown() {
  let h = harness();
  h.store.set_testing_fast_retries(true);
  assert_eq!(h.store.circuit().cooldown_ms, 50);

  open_circuit(&h, 1).await;
  h.clock.advance(Duration::from_millis(60));
  assert!(h.store.fetch_page(1, 10).await.unwrap().data().is_some());

  h.store.set_testing_fast_retries(false);
  assert_eq!(h.store.circuit().cooldown_ms, COOLDOWN_MS);
}

#[tokio::test]
async fn test_reset_circuit_allows_calls_again() {
  let h = harness();
  open_circuit(&h, 1).await;

  h.store.reset_circuit();
  assert_eq!(h.store.circuit().failures, 0);
  assert!(h.store.fetch_page(1, 10).await.unwrap().data().is_some());
}

// ============================================================================
// Pagination and cache
// ============================================================================

#[tokio::test]
async fn test_fetch_updates_pagination_and_cache() {
  let h = harness();
  h.api.set_total(25);
  h.api.set_page(1, products(1, 10));

  h.store.fetch_page(1, 10).await.unwrap();

  let pagination = h.store.pagination();
  assert_eq!(pagination.page, 1);
  assert_eq!(pagination.page_size, 10);
  assert_eq!(pagination.total_items, Some(25));
  assert_eq!(pagination.total_pages, 3);
  assert_eq!(h.store.cached_pages(), vec![1]);
  assert_eq!(h.store.cached_page(1).unwrap().fetched_at, 1_000);
  assert!(!h.store.is_loading());
}

#[tokio::test]
async fn test_cached_page_skips_network() {
  let h = harness();
  h.api.set_page(1, products(1, 10));
  h.store.fetch_page(1, 10).await.unwrap();

  // Even an open circuit does not block a cache hit.
  open_circuit(&h, 2).await;
  let again = h.store.fetch_page(1, 10).await.unwrap();

  assert_eq!(again.data(), Some(products(1, 10)));
  assert_eq!(h.api.fetched_pages(), vec![1, 2, 2, 2, 2]);
}

#[tokio::test]
async fn test_refresh_refetches_current_page() {
  let h = harness();
  h.api.set_page(1, products(1, 10));
  h.store.fetch_page(1, 10).await.unwrap();

  h.api.set_page(1, products(11, 20));
  let refreshed = h.store.refresh().await.unwrap();

  assert_eq!(refreshed.data(), Some(products(11, 20)));
  assert_eq!(h.api.fetch_calls(), 2);
}

#[tokio::test]
async fn test_page_size_change_invalidates_cache() {
  let h = harness();
  h.api.set_page(1, products(1, 10));
  h.store.fetch_page(1, 10).await.unwrap();

  h.store.fetch_page(1, 5).await.unwrap();

  assert_eq!(h.api.fetch_calls(), 2);
  assert_eq!(h.store.pagination().page_size, 5);
  assert_eq!(h.store.cached_pages(), vec![1]);
}

#[tokio::test]
async fn test_fetch_passes_filters_to_api() {
  let h = harness();
  h.store.set_category(Some("tools".to_string()));
  h.store.set_stock_filter(StockFilter::LowStock);

  h.store.fetch_page(1, 10).await.unwrap();

  let sent = h.api.last_filters().unwrap();
  assert_eq!(sent.category.as_deref(), Some("tools"));
  assert_eq!(sent.stock_filter, StockFilter::LowStock);
}

// ============================================================================
// Prefetch
// ============================================================================

#[tokio::test]
async fn test_prefetch_loads_only_the_next_page() {
  let h = harness();
  h.api.set_total(30);
  for page in 1..=3 {
    h.api.set_page(page, products(page * 10 - 9, page * 10));
  }
  h.store.fetch_page(1, 10).await.unwrap();
  assert_eq!(h.store.pagination().total_pages, 3);

  h.store.prefetch_next_page().unwrap().await.unwrap();

  assert_eq!(h.store.cached_pages(), vec![1, 2]);
  assert_eq!(h.api.fetched_pages(), vec![1, 2]);
  // The view does not move.
  assert_eq!(h.store.pagination().page, 1);
  assert_eq!(h.store.entities(), products(1, 10));

  h.store.fetch_page(2, 10).await.unwrap();
  assert_eq!(h.api.fetch_calls(), 2);
}

#[tokio::test]
async fn test_prefetch_skips_when_nothing_to_do() {
  let h = harness();
  assert!(h.store.prefetch_next_page().is_none());

  h.api.set_total(10);
  h.api.set_page(1, products(1, 10));
  h.store.fetch_page(1, 10).await.unwrap();
  assert!(h.store.prefetch_next_page().is_none(), "last page");

  h.api.set_total(20);
  h.store.refresh().await.unwrap();
  h.store.prefetch_next_page().unwrap().await.unwrap();
  assert!(h.store.prefetch_next_page().is_none(), "already cached");
}

#[tokio::test]
async fn test_prefetch_skipped_while_circuit_open() {
  let h = harness();
  h.api.set_total(30);
  h.api.set_page(1, products(1, 10));
  h.store.fetch_page(1, 10).await.unwrap();
  open_circuit(&h, 3).await;

  assert!(h.store.prefetch_next_page().is_none());
}

#[tokio::test]
async fn test_prefetch_leaves_half_open_trial_to_the_user() {
  let h = harness();
  h.api.set_total(30);
  h.api.set_page(1, products(1, 10));
  h.store.fetch_page(1, 10).await.unwrap();
  open_circuit(&h, 3).await;
  h.clock.advance(Duration::from_millis(COOLDOWN_MS + 10));
  assert_eq!(h.store.circuit().phase, CircuitPhase::HalfOpen);

  assert!(h.store.prefetch_next_page().is_none());

  let trial = h.store.fetch_page(3, 10).await.unwrap();
  assert!(trial.data().is_some());
  assert_eq!(h.store.circuit().phase, CircuitPhase::Closed);
}

#[tokio::test]
async fn test_prefetch_failure_is_silent() {
  let h = harness();
  h.api.set_total(30);
  h.api.set_page(1, products(1, 10));
  h.store.fetch_page(1, 10).await.unwrap();

  h.api.fail_with(server_error());
  h.store.prefetch_next_page().unwrap().await.unwrap();

  assert_eq!(h.store.error(), None);
  assert_eq!(h.store.cached_pages(), vec![1]);
  assert_eq!(h.store.entities(), products(1, 10));
  assert_eq!(h.store.circuit().failures, 1);
}

#[tokio::test]
async fn test_prefetch_result_dropped_after_filter_change() {
  let h = harness();
  h.api.set_total(30);
  h.api.set_page(1, products(1, 10));
  h.api.set_page(2, products(11, 20));
  h.store.fetch_page(1, 10).await.unwrap();

  let release = h.api.hold("page:2");
  let handle = h.store.prefetch_next_page().unwrap();
  settle(|| h.api.fetch_calls() == 2).await;

  h.store.set_category(Some("tools".to_string()));
  release.send(None).unwrap();
  handle.await.unwrap();

  assert!(h.store.cached_pages().is_empty());
}

// ============================================================================
// Filters
// ============================================================================

#[tokio::test]
async fn test_filter_change_clears_cache_before_returning() {
  let h = harness();
  h.api.set_total(30);
  h.api.set_page(1, products(1, 10));
  h.store.fetch_page(1, 10).await.unwrap();
  h.store.prefetch_next_page().unwrap().await.unwrap();
  assert_eq!(h.store.cached_pages(), vec![1, 2]);

  h.store.set_stock_filter(StockFilter::OutOfStock);

  assert!(h.store.cached_pages().is_empty());
  let pagination = h.store.pagination();
  assert_eq!(pagination.page, 1);
  assert_eq!(pagination.total_pages, 0);
}

#[tokio::test]
async fn test_unchanged_filters_keep_cache() {
  let h = harness();
  h.api.set_page(1, products(1, 10));
  h.store.fetch_page(1, 10).await.unwrap();

  h.store.set_filters(h.store.filters());
  h.store.set_category(None);

  assert_eq!(h.store.cached_pages(), vec![1]);
}

#[tokio::test]
async fn test_response_for_old_filters_is_not_cached() {
  let h = harness();
  h.api.set_page(1, products(1, 10));

  let release = h.api.hold("page:1");
  let store = h.store.clone();
  let pending = tokio::spawn(async move { store.fetch_page(1, 10).await });
  settle(|| h.api.fetch_calls() == 1).await;

  h.store.set_category(Some("tools".to_string()));
  release.send(None).unwrap();

  let loaded = pending.await.unwrap().unwrap();
  assert!(loaded.is_superseded());
  assert!(h.store.cached_pages().is_empty());
  assert!(h.store.entities().is_empty());
}

#[tokio::test]
async fn test_filters_are_persisted_without_search_term() {
  let h = harness();
  h.store.set_category(Some("tools".to_string()));
  h.store.set_stock_filter(StockFilter::InStock);
  h.store.set_search_term("drill");

  let raw = h.prefs.get("test:products:filters").unwrap().unwrap();
  let saved: Value = serde_json::from_str(&raw).unwrap();
  assert_eq!(saved["category"], "tools");
  assert_eq!(saved["stock_filter"], "in_stock");
  assert!(saved.get("search_term").is_none());
}

#[tokio::test]
async fn test_persisted_filters_rehydrate_on_construction() {
  let prefs = Arc::new(MemoryPreferences::new());
  prefs
    .set(
      "test:products:filters",
      r#"{"category":"tools","stock_filter":"low_stock"}"#,
    )
    .unwrap();

  let h = harness_with_prefs(prefs);
  h.store.fetch_page(1, 10).await.unwrap();

  let filters = h.store.filters();
  assert_eq!(filters.category.as_deref(), Some("tools"));
  assert_eq!(filters.stock_filter, StockFilter::LowStock);
  assert_eq!(h.api.last_filters(), Some(filters));
}

#[tokio::test]
async fn test_corrupt_persisted_filters_fall_back_to_defaults() {
  let prefs = Arc::new(MemoryPreferences::new());
  prefs.set("test:products:filters", "{not json").unwrap();

  let h = harness_with_prefs(prefs);
  assert!(h.store.filters().is_default());
}

#[tokio::test]
async fn test_reset_filters() {
  let h = harness();
  h.store.set_category(Some("tools".to_string()));
  h.store.reset_filters();
  assert!(h.store.filters().is_default());
}

#[tokio::test]
async fn test_collections_keep_separate_state() {
  let prefs = Arc::new(MemoryPreferences::new());
  let h = harness_with_prefs(Arc::clone(&prefs));

  let acme = Supplier {
    id: "S1".to_string(),
    name: "Acme".to_string(),
    email: None,
    phone: None,
    active: true,
  };
  let supplier_api = Arc::new(FakeApi::<Supplier>::new());
  supplier_api.set_page(1, vec![acme.clone()]);
  let suppliers = CollectionStore::new(
    Arc::clone(&supplier_api) as Arc<dyn CollectionApi<Supplier>>,
    Arc::clone(&h.clock) as Arc<dyn Clock>,
    Arc::clone(&prefs) as Arc<dyn PreferenceStore>,
    options(),
  );

  open_circuit(&h, 1).await;
  h.store.set_category(Some("tools".to_string()));

  assert_eq!(suppliers.circuit().failures, 0);
  assert!(suppliers.filters().is_default());
  assert!(prefs.get("test:products:filters").unwrap().is_some());
  assert!(prefs.get("test:suppliers:filters").unwrap().is_none());

  let loaded = suppliers.fetch_page(1, 10).await.unwrap();
  assert_eq!(loaded.data(), Some(vec![acme]));
  assert_eq!(suppliers.error(), None);
  assert!(h.store.cached_pages().is_empty());

  let confirmed = suppliers
    .optimistic_update("S1", patch(json!({"active": false})))
    .await
    .unwrap();
  assert!(confirmed);
  assert!(!suppliers.entity("S1").unwrap().active);
  assert_eq!(supplier_api.mutate_calls(), 1);
  assert_eq!(h.api.mutate_calls(), 0);
}

// ============================================================================
// Search
// ============================================================================

#[tokio::test]
async fn test_search_replaces_entities() {
  let h = harness();
  h.api.set_page(1, products(1, 10));
  h.store.fetch_page(1, 10).await.unwrap();
  h.api.set_search("drill", products(3, 4));

  let loaded = h.store.search("  drill ", AbortSignal::new()).await.unwrap();

  assert_eq!(loaded.data(), Some(products(3, 4)));
  assert_eq!(h.store.entities(), products(3, 4));
  assert_eq!(h.store.filters().search_term, "drill");
  assert_eq!(h.api.search_calls(), vec!["drill".to_string()]);
  let pagination = h.store.pagination();
  assert_eq!((pagination.page, pagination.total_pages), (1, 1));
  assert_eq!(pagination.total_items, Some(2));
}

#[tokio::test]
async fn test_last_search_request_wins() {
  let h = harness();
  h.api.set_search("slow", products(1, 1));
  h.api.set_search("fast", products(2, 2));

  let release = h.api.hold("search:slow");
  let store = h.store.clone();
  let slow = tokio::spawn(async move { store.search("slow", AbortSignal::new()).await });
  settle(|| h.api.search_calls().len() == 1).await;

  let fast = h.store.search("fast", AbortSignal::new()).await.unwrap();
  assert_eq!(fast.data(), Some(products(2, 2)));

  release.send(None).unwrap();
  let slow = slow.await.unwrap().unwrap();

  assert!(slow.is_superseded());
  assert_eq!(h.store.entities(), products(2, 2));
  assert_eq!(h.store.filters().search_term, "fast");
}

#[tokio::test]
async fn test_aborted_search_is_dropped() {
  let h = harness();
  h.api.set_page(1, products(1, 10));
  h.store.fetch_page(1, 10).await.unwrap();
  h.api.set_search("drill", products(3, 4));

  let release = h.api.hold("search:drill");
  let signal = AbortSignal::new();
  let store = h.store.clone();
  let task_signal = signal.clone();
  let pending = tokio::spawn(async move { store.search("drill", task_signal).await });
  settle(|| h.api.search_calls().len() == 1).await;

  signal.abort();
  release.send(None).unwrap();

  assert!(pending.await.unwrap().unwrap().is_superseded());
  assert_eq!(h.store.entities(), products(1, 10));
}

#[tokio::test]
async fn test_search_failure_sets_error() {
  let h = harness();
  h.api.fail_with(server_error());

  let err = h.store.search("drill", AbortSignal::new()).await.unwrap_err();

  assert!(matches!(err, StoreError::Remote(ApiError::Http { status: 500, .. })));
  assert!(h.store.error().unwrap().contains("500"));
  assert_eq!(h.store.circuit().failures, 1);
}

#[tokio::test]
async fn test_search_with_open_circuit_is_not_an_error() {
  let h = harness();
  open_circuit(&h, 1).await;
  h.store.clear_error();

  let loaded = h.store.search("drill", AbortSignal::new()).await.unwrap();

  assert!(loaded.is_circuit_open());
  assert_eq!(h.store.error(), None);
  assert!(h.api.search_calls().is_empty());
}

#[tokio::test]
async fn test_empty_search_is_rejected() {
  let h = harness();
  let err = h.store.search("   ", AbortSignal::new()).await.unwrap_err();
  assert!(matches!(err, StoreError::Validation(_)));
  assert!(h.api.search_calls().is_empty());
}

#[tokio::test]
async fn test_debounced_typing_drives_store_search() {
  let h = harness();
  h.api.set_search("drill", products(5, 6));
  let debouncer = Debouncer::new(
    SearchConfig::default(),
    Arc::clone(&h.clock) as Arc<dyn Clock>,
    Arc::new(h.store.clone()),
  );

  for value in ["d", "dr", "dri", "dril", "drill"] {
    debouncer.on_input_change(value);
    h.clock.advance(Duration::from_millis(100));
  }
  assert!(h.api.search_calls().is_empty());

  h.clock.advance(Duration::from_millis(300));
  settle(|| h.store.entities() == products(5, 6)).await;
  assert_eq!(h.api.search_calls(), vec!["drill".to_string()]);

  h.api.set_page(1, products(1, 10));
  debouncer.escape();
  assert_eq!(h.store.filters().search_term, "");
  settle(|| h.store.entities() == products(1, 10)).await;
}

#[tokio::test]
async fn test_filter_change_cancels_pending_debounce() {
  let h = harness();
  h.api.set_search("drill", products(5, 6));
  let debouncer = Debouncer::new(
    SearchConfig::default(),
    Arc::clone(&h.clock) as Arc<dyn Clock>,
    Arc::new(h.store.clone()),
  );
  h.store.on_filters_changed(debouncer.interrupter());

  debouncer.on_input_change("drill");
  h.store.set_category(Some("tools".to_string()));
  assert!(!debouncer.is_pending());

  h.clock.advance(Duration::from_millis(300));
  for _ in 0..10 {
    tokio::task::yield_now().await;
  }

  assert!(h.api.search_calls().is_empty());
  assert_eq!(h.store.filters().search_term, "");
  assert_eq!(h.store.filters().category.as_deref(), Some("tools"));
}

// ============================================================================
// Optimistic mutation
// ============================================================================

async fn loaded_with_original(h: &Harness) {
  h.api.set_page(1, vec![Product::new("P1", "Original"), Product::new("P2", "Other")]);
  h.store.fetch_page(1, 10).await.unwrap();
}

#[tokio::test]
async fn test_failed_update_rolls_back_exactly() {
  let h = harness();
  loaded_with_original(&h).await;
  h.api.fail_with(server_error());

  let confirmed = h
    .store
    .optimistic_update("P1", patch(json!({"name": "Nuevo"})))
    .await
    .unwrap();

  assert!(!confirmed);
  assert_eq!(h.store.entity("P1"), Some(Product::new("P1", "Original")));
  assert_eq!(
    h.store.cached_page(1).unwrap().entities[0],
    Product::new("P1", "Original")
  );
  assert!(h.store.error().is_some());
  assert_eq!(h.store.pending_mutations(), 0);
}

#[tokio::test]
async fn test_update_is_visible_before_server_answers() {
  let h = harness();
  loaded_with_original(&h).await;

  let release = h.api.hold("mutate:P1");
  let store = h.store.clone();
  let pending = tokio::spawn(async move {
    store
      .optimistic_update("P1", patch(json!({"name": "Nuevo", "stock": 3})))
      .await
  });
  settle(|| h.api.mutate_calls() == 1).await;

  let optimistic = h.store.entity("P1").unwrap();
  assert_eq!(optimistic.name, "Nuevo");
  assert_eq!(optimistic.stock, Some(3));
  assert_eq!(h.store.pending_mutations(), 1);

  release.send(None).unwrap();
  assert!(pending.await.unwrap().unwrap());
  assert_eq!(h.store.pending_mutations(), 0);
  assert_eq!(h.store.entity("P1").unwrap().name, "Nuevo");
  assert_eq!(h.store.error(), None);
}

#[tokio::test]
async fn test_server_values_win_on_confirm() {
  let h = harness();
  loaded_with_original(&h).await;
  let mut canonical = Product::new("P1", "Nuevo (server)");
  canonical.stock = Some(7);
  h.api.set_canonical(canonical.clone());

  let confirmed = h
    .store
    .optimistic_update("P1", patch(json!({"name": "Nuevo"})))
    .await
    .unwrap();

  assert!(confirmed);
  assert_eq!(h.store.entity("P1"), Some(canonical.clone()));
  assert_eq!(h.store.cached_page(1).unwrap().entities[0], canonical);
}

#[tokio::test]
async fn test_overlapping_updates_restore_their_own_snapshot() {
  let h = harness();
  loaded_with_original(&h).await;

  let first_gate = h.api.hold("mutate:P1");
  let second_gate = h.api.hold("mutate:P1");

  let store = h.store.clone();
  let first = tokio::spawn(async move {
    store
      .optimistic_update("P1", patch(json!({"name": "B"})))
      .await
  });
  settle(|| h.api.mutate_calls() == 1).await;

  let store = h.store.clone();
  let second = tokio::spawn(async move {
    store
      .optimistic_update("P1", patch(json!({"name": "C"})))
      .await
  });
  settle(|| h.api.mutate_calls() == 2).await;
  assert_eq!(h.store.entity("P1").unwrap().name, "C");
  assert_eq!(h.store.pending_mutations(), 2);

  second_gate.send(Some(server_error())).unwrap();
  assert!(!second.await.unwrap().unwrap());
  assert_eq!(h.store.entity("P1").unwrap().name, "B");

  first_gate.send(None).unwrap();
  assert!(first.await.unwrap().unwrap());
  assert_eq!(h.store.entity("P1").unwrap().name, "B");
  assert_eq!(h.store.entity("P2"), Some(Product::new("P2", "Other")));
}

#[tokio::test]
async fn test_invalid_patches_never_reach_the_server() {
  let h = harness();
  loaded_with_original(&h).await;

  let empty = h.store.optimistic_update("P1", Patch::new()).await;
  let id_change = h
    .store
    .optimistic_update("P1", patch(json!({"id": "P9"})))
    .await;
  let wrong_type = h
    .store
    .optimistic_update("P1", patch(json!({"stock": "lots"})))
    .await;
  let unknown = h
    .store
    .optimistic_update("P404", patch(json!({"name": "x"})))
    .await;

  for result in [empty, id_change, wrong_type, unknown] {
    assert!(matches!(result, Err(StoreError::Validation(_))));
  }
  assert_eq!(h.api.mutate_calls(), 0);
  assert_eq!(h.store.circuit().failures, 0);
  assert!(h.store.error().is_some());
  assert_eq!(h.store.entity("P1"), Some(Product::new("P1", "Original")));
}

#[tokio::test]
async fn test_update_with_open_circuit_rolls_back() {
  let h = harness();
  loaded_with_original(&h).await;
  open_circuit(&h, 2).await;

  let confirmed = h
    .store
    .optimistic_update("P1", patch(json!({"name": "Nuevo"})))
    .await
    .unwrap();

  assert!(!confirmed);
  assert_eq!(h.api.mutate_calls(), 0);
  assert_eq!(h.store.entity("P1"), Some(Product::new("P1", "Original")));
  assert!(h
    .store
    .error()
    .unwrap()
    .contains("temporarily unavailable"));
}

/// Start an update of P1 and wait until it reaches the server.
async fn start_update(h: &Harness, name: &str) -> tokio::task::JoinHandle<StoreResult<bool>> {
  let calls = h.api.mutate_calls();
  let store = h.store.clone();
  let patch = patch(json!({ "name": name }));
  let handle = tokio::spawn(async move { store.optimistic_update("P1", patch).await });
  settle(|| h.api.mutate_calls() == calls + 1).await;
  handle
}

#[tokio::test]
async fn test_overlapping_updates_failing_in_start_order_restore_original() {
  let h = harness();
  loaded_with_original(&h).await;
  let first_gate = h.api.hold("mutate:P1");
  let second_gate = h.api.hold("mutate:P1");

  let first = start_update(&h, "B").await;
  let second = start_update(&h, "C").await;

  first_gate.send(Some(server_error())).unwrap();
  assert!(!first.await.unwrap().unwrap());
  // The later update is still pending and is rebased onto the original.
  assert_eq!(h.store.entity("P1").unwrap().name, "C");

  second_gate.send(Some(server_error())).unwrap();
  assert!(!second.await.unwrap().unwrap());
  assert_eq!(h.store.entity("P1"), Some(Product::new("P1", "Original")));
  assert_eq!(
    h.store.cached_page(1).unwrap().entities[0],
    Product::new("P1", "Original")
  );
  assert_eq!(h.store.pending_mutations(), 0);
}

#[tokio::test]
async fn test_later_update_confirms_after_earlier_rollback() {
  let h = harness();
  loaded_with_original(&h).await;
  let first_gate = h.api.hold("mutate:P1");
  let second_gate = h.api.hold("mutate:P1");

  let first = start_update(&h, "B").await;
  let second = start_update(&h, "C").await;

  first_gate.send(Some(server_error())).unwrap();
  assert!(!first.await.unwrap().unwrap());

  second_gate.send(None).unwrap();
  assert!(second.await.unwrap().unwrap());
  assert_eq!(h.store.entity("P1").unwrap().name, "C");
}

#[tokio::test]
async fn test_abandoned_update_rolls_back() {
  let h = harness();
  loaded_with_original(&h).await;
  let _gate = h.api.hold("mutate:P1");

  let pending = start_update(&h, "Nuevo").await;
  assert_eq!(h.store.entity("P1").unwrap().name, "Nuevo");

  pending.abort();
  assert!(pending.await.unwrap_err().is_cancelled());

  assert_eq!(h.store.entity("P1"), Some(Product::new("P1", "Original")));
  assert_eq!(h.store.pending_mutations(), 0);
}
