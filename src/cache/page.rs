//! Page cache bound to a single filter context.

use std::collections::HashMap;

use super::traits::Entity;

/// One cached page of results.
#[derive(Debug, Clone)]
pub struct PageCacheEntry<E> {
  pub page: u32,
  pub entities: Vec<E>,
  /// Clock time (ms) at which the page was fetched
  pub fetched_at: u64,
}

/// Cache of fetched pages for one filter context.
///
/// The cache is never re-keyed: when the filter context changes the owner
/// drops it and starts a new one, so a response that was in flight for the
/// old context can be recognised by its context hash and discarded.
#[derive(Debug, Clone)]
pub struct PageCache<E> {
  context: String,
  entries: HashMap<u32, PageCacheEntry<E>>,
}

impl<E: Entity> PageCache<E> {
  /// Create an empty cache for the given filter context hash.
  pub fn new(context: impl Into<String>) -> Self {
    Self {
      context: context.into(),
      entries: HashMap::new(),
    }
  }

  /// Hash of the filter context this cache belongs to.
  pub fn context(&self) -> &str {
    &self.context
  }

  pub fn get(&self, page: u32) -> Option<&PageCacheEntry<E>> {
    self.entries.get(&page)
  }

  pub fn contains(&self, page: u32) -> bool {
    self.entries.contains_key(&page)
  }

  /// Store a page, replacing any previous entry for the same page number.
  pub fn insert(&mut self, page: u32, entities: Vec<E>, fetched_at: u64) {
    self.entries.insert(
      page,
      PageCacheEntry {
        page,
        entities,
        fetched_at,
      },
    );
  }

  /// Store a page only if this cache still belongs to `context`.
  ///
  /// Returns whether the page was stored.
  pub fn insert_for(&mut self, context: &str, page: u32, entities: Vec<E>, fetched_at: u64) -> bool {
    if self.context != context {
      return false;
    }
    self.insert(page, entities, fetched_at);
    true
  }

  pub fn remove(&mut self, page: u32) -> Option<PageCacheEntry<E>> {
    self.entries.remove(&page)
  }

  /// Cached page numbers in ascending order.
  pub fn pages(&self) -> Vec<u32> {
    let mut pages: Vec<u32> = self.entries.keys().copied().collect();
    pages.sort_unstable();
    pages
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Replace every cached copy of `entity` (matched by id).
  ///
  /// Returns how many copies were replaced.
  pub fn replace_entity(&mut self, entity: &E) -> usize {
    let mut replaced = 0;
    for entry in self.entries.values_mut() {
      for cached in entry.entities.iter_mut().filter(|e| e.id() == entity.id()) {
        *cached = entity.clone();
        replaced += 1;
      }
    }
    replaced
  }
}
