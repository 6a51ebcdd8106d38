//! Collection entity types.

use serde::{Deserialize, Deserializer, Serialize};

use crate::cache::Entity;

/// Inventory product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
  #[serde(deserialize_with = "string_or_number")]
  pub id: String,
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sku: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub stock: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub price: Option<f64>,
}

impl Product {
  pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      name: name.into(),
      sku: None,
      category: None,
      stock: None,
      price: None,
    }
  }
}

impl Entity for Product {
  fn id(&self) -> &str {
    &self.id
  }

  fn collection() -> &'static str {
    "products"
  }
}

/// Supplier record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Supplier {
  #[serde(deserialize_with = "string_or_number")]
  pub id: String,
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub email: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub phone: Option<String>,
  #[serde(default)]
  pub active: bool,
}

impl Entity for Supplier {
  fn id(&self) -> &str {
    &self.id
  }

  fn collection() -> &'static str {
    "suppliers"
  }
}

/// Accept ids sent either as JSON strings or numbers.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Id {
    Text(String),
    Number(i64),
  }

  Ok(match Id::deserialize(deserializer)? {
    Id::Text(s) => s,
    Id::Number(n) => n.to_string(),
  })
}
