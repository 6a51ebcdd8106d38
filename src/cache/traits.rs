//! Core traits for entities held by the layer.

use serde::{de::DeserializeOwned, Serialize};

/// A record managed by a collection store.
///
/// The layer never looks at business fields. It only needs a stable id and a
/// serde representation, which is what patches are applied to.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Stable identifier, unique within the collection.
  fn id(&self) -> &str;

  /// Collection name used for logging and preference namespaces
  /// (e.g., "products", "suppliers").
  fn collection() -> &'static str;
}
