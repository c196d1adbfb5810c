//! Layered configuration: built-in defaults, then `lingo-relay.toml` in the
//! working directory (optional), then `LINGO__SECTION__KEY` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(#[from] config::ConfigError);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub translator: TranslatorConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Interval between `heartbeat` events on every push channel.
    pub heartbeat_secs: u64,
    /// Per-connection push queue depth; a full queue counts as a failed push.
    pub channel_capacity: usize,
    /// Seed a demo conversation into the in-memory store on startup.
    pub seed_demo: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            heartbeat_secs: 25,
            channel_capacity: 64,
            seed_demo: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranslatorConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    /// Per-call budget, enforced independently of the HTTP client timeout.
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Minimum spacing between outbound requests.
    pub min_interval_ms: u64,
    /// Translations at or below this confidence are neither cached nor shown.
    pub min_confidence: f64,
    pub max_text_chars: usize,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".into(),
            model: "gpt-4o-mini".into(),
            api_key: None,
            timeout_secs: 10,
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            min_interval_ms: 50,
            min_confidence: 0.5,
            max_text_chars: 4_000,
        }
    }
}

impl TranslatorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub max_age_secs: u64,
    pub evict_fraction: f64,
    pub sweep_interval_secs: u64,
    /// SQLite file for the durable tier; the tier is off when unset.
    pub durable_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            max_age_secs: 24 * 3600,
            evict_fraction: 0.10,
            sweep_interval_secs: 3600,
            durable_path: None,
        }
    }
}

impl CacheConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name("lingo-relay").required(false))
            .add_source(
                config::Environment::with_prefix("LINGO")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        Ok(cfg.try_deserialize()?)
    }
}
