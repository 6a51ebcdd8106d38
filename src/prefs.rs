//! Key-value store for UI preferences and its SQLite implementation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::lock;

/// Trait for preference storage backends.
pub trait PreferenceStore: Send + Sync {
  /// Read the raw value stored under `key`.
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Store `value` under `key`, replacing any previous value.
  fn set(&self, key: &str, value: &str) -> Result<()>;

  /// Delete `key`. Removing a missing key is not an error.
  fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory preferences, used when nothing should outlive the process.
#[derive(Debug, Default)]
pub struct MemoryPreferences {
  values: Mutex<HashMap<String, String>>,
}

impl MemoryPreferences {
  pub fn new() -> Self {
    Self::default()
  }
}

impl PreferenceStore for MemoryPreferences {
  fn get(&self, key: &str) -> Result<Option<String>> {
    Ok(lock(&self.values).get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    lock(&self.values).insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    lock(&self.values).remove(key);
    Ok(())
  }
}

/// SQLite-backed preferences.
pub struct SqlitePreferences {
  conn: Mutex<Connection>,
}

impl SqlitePreferences {
  /// Open the preference database at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the preference database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create preferences directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open preferences at {}: {}", path.display(), e))?;

    conn
      .execute_batch(PREFS_SCHEMA)
      .map_err(|e| eyre!("Failed to run preference migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("stockdesk").join("prefs.db"))
  }
}

const PREFS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS preferences (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl PreferenceStore for SqlitePreferences {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let conn = lock(&self.conn);
    conn
      .query_row(
        "SELECT value FROM preferences WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read preference {}: {}", key, e))
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let conn = lock(&self.conn);
    conn
      .execute(
        "INSERT OR REPLACE INTO preferences (key, value, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to store preference {}: {}", key, e))?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = lock(&self.conn);
    conn
      .execute("DELETE FROM preferences WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to remove preference {}: {}", key, e))?;
    Ok(())
  }
}
