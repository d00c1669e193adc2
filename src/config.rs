//! Client configuration.
//!
//! Loaded from a JSON file when one is given. Otherwise, and for any field
//! the file omits, environment variables and built-in defaults apply:
//! - `MUSICDL_API_URL` - base URL of the HTTP API
//! - `MUSICDL_SOCKET_URL` - push channel endpoint (derived from the API URL if unset)
//! - `MUSICDL_REQUEST_TIMEOUT_SECS` - per-request timeout

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_API_URL: &str = "http://127.0.0.1:5000/api";
const SOCKET_PATH: &str = "/socket.io/";
const MAX_MULTIPLIER: f64 = 10.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid reconnect policy: {0}")]
    InvalidPolicy(String),
}

/// Backoff used by the push channel between reconnect attempts.
///
/// Attempts are unbounded; only the delay is capped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random, `0.0..=1.0`
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl ReconnectPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms))
    }

    /// Delay that follows `current`, without jitter. Never exceeds
    /// [`max_delay`](Self::max_delay).
    pub fn next_delay(&self, current: Duration) -> Duration {
        let multiplier = if self.multiplier.is_finite() && self.multiplier >= 1.0 {
            self.multiplier
        } else {
            1.0
        };
        scale(current, multiplier, self.max_delay())
    }

    /// Apply jitter to `delay` using `sample` in `0.0..1.0`.
    pub fn jittered(&self, delay: Duration, sample: f64) -> Duration {
        let jitter = if self.jitter.is_nan() {
            0.0
        } else {
            self.jitter.clamp(0.0, 1.0)
        };
        let factor = 1.0 + jitter * (2.0 * sample.clamp(0.0, 1.0) - 1.0);
        scale(delay, factor, self.max_delay().saturating_mul(2))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_delay_ms == 0 {
            return Err(ConfigError::InvalidPolicy(
                "initial_delay_ms must be at least 1".to_string(),
            ));
        }
        if !(1.0..=MAX_MULTIPLIER).contains(&self.multiplier) {
            return Err(ConfigError::InvalidPolicy(format!(
                "multiplier must be within 1..={}, got {}",
                MAX_MULTIPLIER, self.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::InvalidPolicy(format!(
                "jitter must be within 0..=1, got {}",
                self.jitter
            )));
        }
        Ok(())
    }
}

/// `delay * factor`, saturating at `cap`.
fn scale(delay: Duration, factor: f64, cap: Duration) -> Duration {
    let secs = delay.as_secs_f64() * factor;
    if !secs.is_finite() || secs >= cap.as_secs_f64() {
        return cap;
    }
    Duration::try_from_secs_f64(secs.max(0.0)).map_or(cap, |d| d.min(cap))
}

/// Everything needed to reach the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_api_url")]
    pub api_base_url: String,
    /// Push channel endpoint; derived from `api_base_url` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    /// Capacity of the task change broadcast.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_event_buffer() -> usize {
    256
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_url(),
            socket_url: None,
            request_timeout_secs: default_timeout_secs(),
            reconnect: ReconnectPolicy::default(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl ClientConfig {
    /// Config pointing at `api_base_url` with every other field defaulted.
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("MUSICDL_API_URL") {
            if !url.trim().is_empty() {
                config.api_base_url = url.trim().to_string();
            }
        }
        if let Ok(url) = std::env::var("MUSICDL_SOCKET_URL") {
            if !url.trim().is_empty() {
                config.socket_url = Some(url.trim().to_string());
            }
        }
        if let Some(secs) = std::env::var("MUSICDL_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            config.request_timeout_secs = secs;
        }
        config
    }

    /// Load from a JSON file, falling back to [`ClientConfig::from_env`] if
    /// the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!(
                "No config file found at {}, using environment defaults",
                path.display()
            );
            return Ok(Self::from_env());
        }

        let contents = std::fs::read_to_string(path)?;
        let config: ClientConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Check that both endpoints parse and the reconnect policy is sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.api_url()?;
        self.socket_endpoint()?;
        self.reconnect.validate()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn api_url(&self) -> Result<Url, ConfigError> {
        parse_url(self.api_base_url.trim_end_matches('/'))
    }

    /// WebSocket URL of the push channel, including the Engine.IO query.
    ///
    /// Without an explicit `socket_url`, the API host is reused with
    /// `http`/`https` mapped to `ws`/`wss` and the default Socket.IO path.
    pub fn socket_endpoint(&self) -> Result<Url, ConfigError> {
        let mut url = match &self.socket_url {
            Some(raw) => parse_url(raw)?,
            None => {
                let mut url = self.api_url()?;
                url.set_path(SOCKET_PATH);
                url
            }
        };

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ConfigError::InvalidUrl {
                    url: url.to_string(),
                    reason: format!("unsupported scheme {}", other),
                })
            }
        };
        if url.set_scheme(scheme).is_err() {
            return Err(ConfigError::InvalidUrl {
                url: url.to_string(),
                reason: "cannot switch to a websocket scheme".to_string(),
            });
        }

        if url.path().is_empty() || url.path() == "/" {
            url.set_path(SOCKET_PATH);
        }
        url.query_pairs_mut()
            .clear()
            .append_pair("EIO", "4")
            .append_pair("transport", "websocket");
        Ok(url)
    }
}

fn parse_url(raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })
}
