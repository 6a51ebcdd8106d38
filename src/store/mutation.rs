//! Patch application for optimistic updates.

use serde_json::{Map, Value};

use super::error::{StoreError, StoreResult};
use crate::api::Patch;
use crate::cache::Entity;

/// A local change awaiting remote confirmation.
#[derive(Debug, Clone)]
pub struct PendingMutation<E> {
  pub entity_id: String,
  pub patch: Patch,
  /// Entity as it was when this mutation began
  pub previous_snapshot: E,
}

/// Check a patch before anything is applied or sent.
pub(crate) fn validate_patch(id: &str, patch: &Patch) -> StoreResult<()> {
  if patch.is_empty() {
    return Err(StoreError::Validation("patch is empty".to_string()));
  }
  if let Some(new_id) = patch.get("id") {
    if new_id.as_str() != Some(id) {
      return Err(StoreError::Validation(format!(
        "patch may not change the id of {}",
        id
      )));
    }
  }
  Ok(())
}

/// Apply `patch` to `entity`, field by field.
pub(crate) fn apply_patch<E: Entity>(entity: &E, patch: &Patch) -> StoreResult<E> {
  let mut fields = to_object(entity)?;
  for (key, value) in patch {
    fields.insert(key.clone(), value.clone());
  }

  serde_json::from_value(Value::Object(fields))
    .map_err(|e| StoreError::Validation(format!("patch does not fit {}: {}", E::collection(), e)))
}

/// Overlay the server's canonical entity on the local one; server wins.
///
/// Local-only fields the server did not send are kept.
pub(crate) fn reconcile<E: Entity>(local: &E, canonical: &E) -> E {
  let merged = to_object(local).and_then(|mut fields| {
    let server = to_object(canonical)?;
    fields.extend(server);
    serde_json::from_value(Value::Object(fields))
      .map_err(|e| StoreError::Validation(e.to_string()))
  });

  merged.unwrap_or_else(|_| canonical.clone())
}

fn to_object<E: Entity>(entity: &E) -> StoreResult<Map<String, Value>> {
  match serde_json::to_value(entity) {
    Ok(Value::Object(fields)) => Ok(fields),
    Ok(_) => Err(StoreError::Validation(format!(
      "{} entities are not JSON objects",
      E::collection()
    ))),
    Err(e) => Err(StoreError::Validation(e.to_string())),
  }
}
