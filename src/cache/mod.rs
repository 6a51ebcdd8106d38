//! Page-indexed cache for collection data.
//!
//! This module provides the in-memory cache a collection store keeps:
//! - Entries are keyed by page number within one filter context
//! - The whole cache is replaced when the filter context changes
//! - No TTL or size-based eviction; it is bounded by the page count

mod page;
mod traits;

pub use page::{PageCache, PageCacheEntry};
pub use traits::Entity;
