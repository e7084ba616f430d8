//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.opsdesk/config.json`) and environment.
//! Every section has defaults, so an empty `{}` file is a valid config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::store::RestStoreConfig;
use crate::watch::WatchSettings;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Hosted database (REST + realtime).
    #[serde(default)]
    pub store: StoreConfig,

    /// Automation webhook.
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Reply detection timing.
    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub console: ConsoleConfig,
}

/// Database endpoint and table names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// Project base URL. Overridden by OPSDESK_STORE_URL env.
    pub url: Option<String>,
    /// Public API key. Overridden by OPSDESK_STORE_KEY env.
    pub api_key: Option<String>,
    #[serde(default = "default_messages_table")]
    pub messages_table: String,
    #[serde(default = "default_conversations_table")]
    pub conversations_table: String,
}

fn default_messages_table() -> String {
    "chat_messages".to_string()
}

fn default_conversations_table() -> String {
    "chat_sessions".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            messages_table: default_messages_table(),
            conversations_table: default_conversations_table(),
        }
    }
}

/// Webhook endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    /// Webhook URL. Overridden by OPSDESK_WEBHOOK_URL env.
    pub url: Option<String>,
    /// HTTP timeout for the webhook call (default 120). The reply itself may arrive later.
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
    /// How many recent messages go into the request context (default 10).
    #[serde(default = "default_context_messages")]
    pub context_messages: usize,
}

fn default_webhook_timeout_secs() -> u64 {
    120
}

fn default_context_messages() -> usize {
    10
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_webhook_timeout_secs(),
            context_messages: default_context_messages(),
        }
    }
}

/// Push/poll timing for reply detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
    /// Give up on a reply after this many seconds (default 300).
    #[serde(default = "default_watch_timeout_secs")]
    pub timeout_secs: u64,
    /// Delay before reopening a failed or dropped subscription.
    #[serde(default = "default_resubscribe_delay_ms")]
    pub resubscribe_delay_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    2500
}

fn default_max_poll_attempts() -> u32 {
    120
}

fn default_watch_timeout_secs() -> u64 {
    300
}

fn default_resubscribe_delay_ms() -> u64 {
    2500
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_attempts: default_max_poll_attempts(),
            timeout_secs: default_watch_timeout_secs(),
            resubscribe_delay_ms: default_resubscribe_delay_ms(),
        }
    }
}

impl WatchConfig {
    /// Timing for watch sessions. Zero durations are raised to the minimum tokio timers accept.
    pub fn settings(&self) -> WatchSettings {
        WatchSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            max_poll_attempts: self.max_poll_attempts.max(1),
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
            resubscribe_delay: Duration::from_millis(self.resubscribe_delay_ms.max(1)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleConfig {
    /// Max characters of a title derived from the first user message (default 50).
    #[serde(default = "default_title_max_chars")]
    pub title_max_chars: usize,
}

fn default_title_max_chars() -> usize {
    50
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            title_max_chars: default_title_max_chars(),
        }
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn config_nonempty(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve the webhook URL: env OPSDESK_WEBHOOK_URL overrides config.
pub fn resolve_webhook_url(config: &Config) -> Option<String> {
    env_nonempty("OPSDESK_WEBHOOK_URL").or_else(|| config_nonempty(&config.webhook.url))
}

/// Resolve database settings: env OPSDESK_STORE_URL / OPSDESK_STORE_KEY override config.
/// None when either the URL or the key is missing.
pub fn resolve_store(config: &Config) -> Option<RestStoreConfig> {
    let url = env_nonempty("OPSDESK_STORE_URL").or_else(|| config_nonempty(&config.store.url))?;
    let api_key =
        env_nonempty("OPSDESK_STORE_KEY").or_else(|| config_nonempty(&config.store.api_key))?;
    Some(RestStoreConfig {
        url,
        api_key,
        messages_table: config.store.messages_table.clone(),
        conversations_table: config.store.conversations_table.clone(),
    })
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("OPSDESK_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".opsdesk").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, or the default path (or OPSDESK_CONFIG_PATH).
/// Missing file => default config. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
