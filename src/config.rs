use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/gmail/v1/users/me";
pub const DEFAULT_LABEL: &str = "INBOX";
pub const DEFAULT_OTHERS_LABEL: &str = "Others";

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_label() -> String {
    DEFAULT_LABEL.to_string()
}

fn default_others_label() -> String {
    DEFAULT_OTHERS_LABEL.to_string()
}

fn default_page_size() -> u32 {
    500
}

fn default_batch_size() -> usize {
    50
}

fn default_max_retries() -> u32 {
    3
}

fn default_favicon_concurrency() -> usize {
    6
}

// ---------------------------------------------------------------------------
// On-disk config
// ---------------------------------------------------------------------------

/// Tunables for fetching and enrichment, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// OAuth client id the embedding app signs in with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Mailbox label to visualize.
    #[serde(default = "default_label")]
    pub label: String,
    /// Ids requested per listing page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Metadata requests issued together; also the live-update granularity.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Rate-limit retries before a request is given up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Favicon lookups in flight at once.
    #[serde(default = "default_favicon_concurrency")]
    pub favicon_concurrency: usize,
    #[serde(default = "default_others_label")]
    pub others_label: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            api_base: default_api_base(),
            label: default_label(),
            page_size: default_page_size(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            favicon_concurrency: default_favicon_concurrency(),
            others_label: default_others_label(),
        }
    }
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailtiles")
}

fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

impl AppConfig {
    /// Load from disk, falling back to defaults, then apply env overrides.
    pub fn load() -> Self {
        let mut cfg = match fs::read_to_string(config_path()) {
            Ok(data) => Self::from_json(&data).unwrap_or_else(|e| {
                log::warn!("Ignoring unreadable config: {}", e);
                Self::default()
            }),
            Err(_) => {
                log::info!("No config file found, using defaults");
                Self::default()
            }
        };
        cfg.apply_env();
        cfg
    }

    /// Parse and clamp to sane ranges.
    pub fn from_json(data: &str) -> Result<Self, String> {
        let cfg: AppConfig =
            serde_json::from_str(data).map_err(|e| format!("parse config: {e}"))?;
        Ok(cfg.clamped())
    }

    fn clamped(self) -> Self {
        AppConfig {
            page_size: self.page_size.clamp(1, 500),
            batch_size: self.batch_size.clamp(1, 100),
            max_retries: self.max_retries.min(8),
            favicon_concurrency: self.favicon_concurrency.clamp(1, 16),
            ..self
        }
    }

    fn apply_env(&mut self) {
        if let Ok(id) = std::env::var("MAILTILES_CLIENT_ID") {
            if !id.trim().is_empty() {
                self.client_id = Some(id.trim().to_string());
            }
        }
        if let Ok(base) = std::env::var("MAILTILES_API_BASE") {
            if !base.trim().is_empty() {
                self.api_base = base.trim().trim_end_matches('/').to_string();
            }
        }
    }

    pub fn save(&self) -> Result<(), String> {
        let path = config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("create config dir: {e}"))?;
        }
        let data =
            serde_json::to_string_pretty(self).map_err(|e| format!("serialize config: {e}"))?;
        fs::write(&path, data).map_err(|e| format!("write config: {e}"))
    }
}

/// Directory holding the cache database.
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailtiles")
}
