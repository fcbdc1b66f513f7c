//! Configuration parsed from environment variables.
//!
//! Every tunable has a documented default so a bare environment still yields
//! a working offline-only setup. Only the remote base URL is required, and
//! only by callers that want to reach the server.

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;

use std::time::Duration;

pub const DEFAULT_DB_PATH: &str = "sketchsync.db";
pub const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_REMOTE_CONNECT_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_FETCH_MIN_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_AUTOSAVE_DEBOUNCE_MS: u64 = 1500;
pub const DEFAULT_RELAY_BATCH_MS: u64 = 100;
pub const DEFAULT_RELAY_BATCH_MAX_MS: u64 = 500;
pub const DEFAULT_RELAY_SETTLE_MS: u64 = 50;
pub const DEFAULT_RELAY_RECONNECT_BASE_MS: u64 = 2000;
pub const DEFAULT_RELAY_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RELAY_SUBSCRIBE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

impl crate::error::ErrorCode for ConfigError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Missing(_) => "E_CONFIG_MISSING",
            Self::Invalid { .. } => "E_CONFIG_INVALID",
        }
    }
}

/// Parse an environment variable, falling back to `default` when absent or unparseable.
pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_string(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => Some(raw.trim().to_owned()),
        _ => None,
    }
}

// =============================================================================
// REMOTE
// =============================================================================

/// Connection settings for the hosted relational store and its realtime endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Base URL, e.g. `https://project.example.co`. Trailing slashes are trimmed.
    pub base_url: String,
    /// Anonymous API key sent as the `apikey` header.
    pub api_key: String,
    /// User access token sent as a bearer token. Falls back to the API key.
    pub access_token: String,
    /// Websocket endpoint for the operation relay.
    pub realtime_url: String,
    pub connect_timeout: Duration,
}

impl RemoteConfig {
    /// Build remote settings from the environment.
    ///
    /// Required: `SKETCHSYNC_REMOTE_URL`.
    /// Optional: `SKETCHSYNC_API_KEY`, `SKETCHSYNC_ACCESS_TOKEN`,
    /// `SKETCHSYNC_REALTIME_URL`, `REMOTE_CONNECT_TIMEOUT_SECS`.
    ///
    /// # Errors
    ///
    /// Returns `Missing` if the base URL is unset and `Invalid` if it is not http(s).
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = env_string("SKETCHSYNC_REMOTE_URL").ok_or(ConfigError::Missing("SKETCHSYNC_REMOTE_URL"))?;
        let api_key = env_string("SKETCHSYNC_API_KEY").unwrap_or_default();
        let access_token = env_string("SKETCHSYNC_ACCESS_TOKEN").unwrap_or_else(|| api_key.clone());
        let mut config = Self::new(&base_url, api_key, access_token)?;
        if let Some(realtime_url) = env_string("SKETCHSYNC_REALTIME_URL") {
            config.realtime_url = realtime_url;
        }
        config.connect_timeout =
            Duration::from_secs(env_parse("REMOTE_CONNECT_TIMEOUT_SECS", DEFAULT_REMOTE_CONNECT_TIMEOUT_SECS));
        Ok(config)
    }

    /// Build remote settings from explicit values, deriving the realtime URL.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` if `base_url` is not an http(s) URL.
    pub fn new(base_url: &str, api_key: String, access_token: String) -> Result<Self, ConfigError> {
        let base_url = base_url.trim_end_matches('/').to_owned();
        let realtime_url = derive_realtime_url(&base_url)
            .ok_or_else(|| ConfigError::Invalid { key: "SKETCHSYNC_REMOTE_URL", value: base_url.clone() })?;
        Ok(Self {
            base_url,
            api_key,
            access_token,
            realtime_url,
            connect_timeout: Duration::from_secs(DEFAULT_REMOTE_CONNECT_TIMEOUT_SECS),
        })
    }
}

/// Map `http(s)://host` to `ws(s)://host/realtime/v1`.
fn derive_realtime_url(base_url: &str) -> Option<String> {
    if let Some(rest) = base_url.strip_prefix("https://") {
        return Some(format!("wss://{rest}/realtime/v1"));
    }
    if let Some(rest) = base_url.strip_prefix("http://") {
        return Some(format!("ws://{rest}/realtime/v1"));
    }
    None
}

// =============================================================================
// ACCESS LAYER
// =============================================================================

/// Timing knobs for the document access layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessConfig {
    /// Upper bound on any single remote call.
    pub remote_timeout: Duration,
    /// Minimum spacing between two full-list refreshes.
    pub fetch_min_interval: Duration,
}

impl AccessConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            remote_timeout: Duration::from_secs(env_parse("REMOTE_TIMEOUT_SECS", DEFAULT_REMOTE_TIMEOUT_SECS)),
            fetch_min_interval: Duration::from_millis(env_parse(
                "FETCH_MIN_INTERVAL_MS",
                DEFAULT_FETCH_MIN_INTERVAL_MS,
            )),
        }
    }
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            remote_timeout: Duration::from_secs(DEFAULT_REMOTE_TIMEOUT_SECS),
            fetch_min_interval: Duration::from_millis(DEFAULT_FETCH_MIN_INTERVAL_MS),
        }
    }
}

// =============================================================================
// RELAY
// =============================================================================

/// Timing knobs for the realtime operation relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Quiet period after the latest outbound change before it is sent.
    pub batch_window: Duration,
    /// Longest a change waits while edits keep arriving.
    pub batch_max_wait: Duration,
    /// Delay after an inbound apply before outbound broadcasting resumes.
    pub settle_delay: Duration,
    /// Reconnect delay is `attempt * reconnect_base`.
    pub reconnect_base: Duration,
    pub max_reconnect_attempts: u32,
    pub subscribe_timeout: Duration,
}

impl RelayConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            batch_window: Duration::from_millis(env_parse("RELAY_BATCH_MS", DEFAULT_RELAY_BATCH_MS)),
            batch_max_wait: Duration::from_millis(env_parse("RELAY_BATCH_MAX_MS", DEFAULT_RELAY_BATCH_MAX_MS)),
            settle_delay: Duration::from_millis(env_parse("RELAY_SETTLE_MS", DEFAULT_RELAY_SETTLE_MS)),
            reconnect_base: Duration::from_millis(env_parse(
                "RELAY_RECONNECT_BASE_MS",
                DEFAULT_RELAY_RECONNECT_BASE_MS,
            )),
            max_reconnect_attempts: env_parse("RELAY_MAX_RECONNECT_ATTEMPTS", DEFAULT_RELAY_MAX_RECONNECT_ATTEMPTS),
            subscribe_timeout: Duration::from_secs(env_parse(
                "RELAY_SUBSCRIBE_TIMEOUT_SECS",
                DEFAULT_RELAY_SUBSCRIBE_TIMEOUT_SECS,
            )),
        }
    }

    /// Delay before reconnect attempt number `attempt` (1-based).
    #[must_use]
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_base.saturating_mul(attempt)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(DEFAULT_RELAY_BATCH_MS),
            batch_max_wait: Duration::from_millis(DEFAULT_RELAY_BATCH_MAX_MS),
            settle_delay: Duration::from_millis(DEFAULT_RELAY_SETTLE_MS),
            reconnect_base: Duration::from_millis(DEFAULT_RELAY_RECONNECT_BASE_MS),
            max_reconnect_attempts: DEFAULT_RELAY_MAX_RECONNECT_ATTEMPTS,
            subscribe_timeout: Duration::from_secs(DEFAULT_RELAY_SUBSCRIBE_TIMEOUT_SECS),
        }
    }
}

// =============================================================================
// AUTOSAVE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutosaveConfig {
    pub debounce: Duration,
}

impl AutosaveConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self { debounce: Duration::from_millis(env_parse("AUTOSAVE_DEBOUNCE_MS", DEFAULT_AUTOSAVE_DEBOUNCE_MS)) }
    }
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self { debounce: Duration::from_millis(DEFAULT_AUTOSAVE_DEBOUNCE_MS) }
    }
}

// =============================================================================
// TOP LEVEL
// =============================================================================

/// Everything a [`crate::session::Session`] needs to start.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Path of the local SQLite database file.
    pub db_path: String,
    /// `None` runs the session purely offline.
    pub remote: Option<RemoteConfig>,
    pub access: AccessConfig,
    pub relay: RelayConfig,
    pub autosave: AutosaveConfig,
}

impl SyncConfig {
    /// Build the full config from the environment.
    ///
    /// A missing `SKETCHSYNC_REMOTE_URL` yields an offline-only config.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` if a remote URL is set but malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let remote = match RemoteConfig::from_env() {
            Ok(remote) => Some(remote),
            Err(ConfigError::Missing(_)) => None,
            Err(e) => return Err(e),
        };
        Ok(Self {
            db_path: env_string("SKETCHSYNC_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_owned()),
            remote,
            access: AccessConfig::from_env(),
            relay: RelayConfig::from_env(),
            autosave: AutosaveConfig::from_env(),
        })
    }
}
