//! Filter context for a collection and its persistence.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::prefs::PreferenceStore;

/// Stock level filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockFilter {
  #[default]
  All,
  InStock,
  LowStock,
  OutOfStock,
}

impl StockFilter {
  /// Query parameter value, or `None` when no filtering applies.
  pub fn as_query(&self) -> Option<&'static str> {
    match self {
      StockFilter::All => None,
      StockFilter::InStock => Some("in_stock"),
      StockFilter::LowStock => Some("low_stock"),
      StockFilter::OutOfStock => Some("out_of_stock"),
    }
  }

  /// Parse a CLI/query value. Unknown values are `None`.
  pub fn parse(value: &str) -> Option<Self> {
    match value.trim().to_lowercase().replace('-', "_").as_str() {
      "all" => Some(StockFilter::All),
      "in_stock" => Some(StockFilter::InStock),
      "low_stock" => Some(StockFilter::LowStock),
      "out_of_stock" => Some(StockFilter::OutOfStock),
      _ => None,
    }
  }
}

/// The active search/category/stock filters scoping page numbering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterContext {
  #[serde(default)]
  pub search_term: String,
  #[serde(default)]
  pub category: Option<String>,
  #[serde(default)]
  pub stock_filter: StockFilter,
}

impl FilterContext {
  /// Search term as sent to the API (trimmed).
  pub fn search_term(&self) -> &str {
    self.search_term.trim()
  }

  pub fn is_default(&self) -> bool {
    self.search_term().is_empty() && self.category.is_none() && self.stock_filter == StockFilter::All
  }

  /// Stable hash identifying this context together with the page size.
  ///
  /// Two contexts that differ only in search-term case or surrounding
  /// whitespace hash the same.
  pub fn cache_hash(&self, page_size: u32) -> String {
    let input = format!(
      "search:{}|category:{}|stock:{}|size:{}",
      normalize_term(&self.search_term),
      self.category.as_deref().unwrap_or(""),
      self.stock_filter.as_query().unwrap_or("all"),
      page_size
    );

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

fn normalize_term(term: &str) -> String {
  term.trim().to_lowercase()
}

/// The part of a filter context that survives restarts.
///
/// The free-text search term is deliberately left out; only the selections
/// are rehydrated.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedFilters {
  #[serde(default)]
  category: Option<String>,
  #[serde(default)]
  stock_filter: StockFilter,
}

/// Preference key for a collection's filters.
pub fn filters_key(namespace: &str) -> String {
  format!("{}:filters", namespace)
}

/// Load persisted filter selections.
///
/// Missing, unreadable or corrupt data falls back to the default context.
pub fn load_filters(prefs: &dyn PreferenceStore, namespace: &str) -> FilterContext {
  let key = filters_key(namespace);

  let raw = match prefs.get(&key) {
    Ok(Some(raw)) => raw,
    Ok(None) => return FilterContext::default(),
    Err(e) => {
      warn!(key = %key, error = %e, "could not read persisted filters, using defaults");
      return FilterContext::default();
    }
  };

  match serde_json::from_str::<PersistedFilters>(&raw) {
    Ok(persisted) => {
      debug!(key = %key, "rehydrated persisted filters");
      FilterContext {
        search_term: String::new(),
        category: persisted.category,
        stock_filter: persisted.stock_filter,
      }
    }
    Err(e) => {
      warn!(key = %key, error = %e, "persisted filters are corrupt, using defaults");
      FilterContext::default()
    }
  }
}

/// Persist filter selections. Failures are logged, never returned.
pub fn save_filters(prefs: &dyn PreferenceStore, namespace: &str, filters: &FilterContext) {
  let key = filters_key(namespace);
  let persisted = PersistedFilters {
    category: filters.category.clone(),
    stock_filter: filters.stock_filter,
  };

  let result = serde_json::to_string(&persisted)
    .map_err(|e| color_eyre::eyre::eyre!("Failed to serialize filters: {}", e))
    .and_then(|json| prefs.set(&key, &json));

  if let Err(e) = result {
    warn!(key = %key, error = %e, "could not persist filters");
  }
}
