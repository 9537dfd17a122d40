//! Engine configuration: construction parameters plus TOML loading.

use crate::error::{BeaconError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default collection endpoint.
const DEFAULT_ENDPOINT: &str = "https://collect.beacon.dev/v1";

/// Default IP-geolocation service (ipinfo-style JSON response).
const DEFAULT_GEO_SERVICE_URL: &str = "https://ipinfo.io/json";

/// Configuration for a Beacon engine instance.
///
/// `api_key` and `source` are required; everything else has a default.
/// Deserializable from TOML for file-based setups, or built directly via
/// [`EngineConfig::new`] when embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// API key sent as `x-api-key` on every delivery. Required.
    pub api_key: String,
    /// Logical channel label (e.g. "product", "marketing"). Required.
    pub source: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_geo_service_url")]
    pub geo_service_url: String,
    #[serde(default)]
    pub track_clicks: bool,
    #[serde(default)]
    pub track_forms: bool,
    #[serde(default = "default_true")]
    pub respect_do_not_track: bool,
    #[serde(default)]
    pub enable_consent: bool,
    /// Seeds the analytics and marketing consent categories.
    #[serde(default)]
    pub default_consent: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_debounce_delay_ms")]
    pub debounce_delay_ms: u64,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.into()
}

fn default_geo_service_url() -> String {
    DEFAULT_GEO_SERVICE_URL.into()
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_interval_ms() -> u64 {
    2_000
}

fn default_session_timeout_ms() -> u64 {
    30 * 60 * 1_000
}

fn default_debounce_delay_ms() -> u64 {
    2_000
}

impl EngineConfig {
    /// Build a configuration with defaults for everything but the required
    /// fields.
    pub fn new(api_key: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            source: source.into(),
            endpoint: default_endpoint(),
            geo_service_url: default_geo_service_url(),
            track_clicks: false,
            track_forms: false,
            respect_do_not_track: true,
            enable_consent: false,
            default_consent: false,
            batch_size: default_batch_size(),
            batch_interval_ms: default_batch_interval_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            debounce_delay_ms: default_debounce_delay_ms(),
        }
    }

    /// Load configuration from a TOML file at the given path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| BeaconError::Config(format!("failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Validate the configuration. A missing API key or source is fatal:
    /// the engine refuses to construct and nothing is captured.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(BeaconError::Config("api_key must not be empty".into()));
        }
        if self.source.is_empty() {
            return Err(BeaconError::Config("source must not be empty".into()));
        }
        if self.endpoint.is_empty() {
            return Err(BeaconError::Config("endpoint must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(BeaconError::Config("batch_size must be at least 1".into()));
        }
        Ok(())
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn debounce_delay(&self) -> Duration {
        Duration::from_millis(self.debounce_delay_ms)
    }
}
