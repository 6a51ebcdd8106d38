use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub breaker: BreakerConfig,
  #[serde(default)]
  pub search: SearchConfig,
  /// Items per page for list views
  #[serde(default = "default_page_size")]
  pub page_size: u32,
  /// Prefix for persisted preference keys
  #[serde(default = "default_namespace")]
  pub namespace: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the REST API, e.g. "https://erp.example.com/api"
  pub base_url: String,
  /// Per-request timeout enforced by the HTTP client
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BreakerConfig {
  /// Consecutive failures before the circuit opens
  pub threshold: u32,
  /// How long the circuit stays open
  pub cooldown_ms: u64,
  /// Cooldown used when fast retries are enabled (tests, manual retry)
  pub fast_retry_cooldown_ms: u64,
}

impl Default for BreakerConfig {
  fn default() -> Self {
    Self {
      threshold: 4,
      cooldown_ms: 30_000,
      fast_retry_cooldown_ms: 50,
    }
  }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SearchConfig {
  /// Quiet period before a typed search settles
  pub debounce_ms: u64,
  /// Minimum settled length that triggers a search
  pub min_chars: usize,
}

impl Default for SearchConfig {
  fn default() -> Self {
    Self {
      debounce_ms: 300,
      min_chars: 4,
    }
  }
}

fn default_page_size() -> u32 {
  20
}

fn default_namespace() -> String {
  "stockdesk".to_string()
}

fn default_timeout_secs() -> u64 {
  15
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./stockdesk.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/stockdesk/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/stockdesk/config.yaml\n\
                 with at least `api: {{ base_url: ... }}`."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("stockdesk.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("stockdesk").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;

    if config.page_size == 0 {
      return Err(eyre!("page_size must be at least 1"));
    }
    if config.breaker.threshold == 0 {
      return Err(eyre!("breaker.threshold must be at least 1"));
    }

    Ok(config)
  }

  /// Get the API token from the environment, if one is set.
  ///
  /// Checks STOCKDESK_API_TOKEN.
  pub fn api_token() -> Option<String> {
    std::env::var("STOCKDESK_API_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
