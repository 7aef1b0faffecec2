//! Backend configuration parsed from environment variables.

use std::time::Duration;

pub const DEFAULT_STORAGE_BUCKET: &str = "fotos";

const DEFAULT_FEED_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_FEED_HEARTBEAT_SECS: u64 = 30;
const DEFAULT_FEED_RECONNECT_BASE_MS: u64 = 1000;
const DEFAULT_FEED_RECONNECT_MAX_MS: u64 = 10_000;
const DEFAULT_FEED_RECONNECT_ATTEMPTS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var: {0}")]
    MissingVar(&'static str),
}

/// Tuning knobs for the realtime feed transport.
#[derive(Debug, Clone, Copy)]
pub struct FeedConfig {
    /// Bounded capacity of the per-subscription event channel.
    pub channel_capacity: usize,
    /// Keepalive period for the websocket.
    pub heartbeat: Duration,
    /// Base delay for exponential reconnect back-off.
    pub reconnect_base: Duration,
    /// Back-off ceiling.
    pub reconnect_max: Duration,
    /// Consecutive connect failures tolerated before the subscription is
    /// marked `Failed` and abandoned to the caller.
    pub reconnect_attempts: usize,
}

impl FeedConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            channel_capacity: env_parse("FEED_CHANNEL_CAPACITY", DEFAULT_FEED_CHANNEL_CAPACITY),
            heartbeat: Duration::from_secs(env_parse("FEED_HEARTBEAT_SECS", DEFAULT_FEED_HEARTBEAT_SECS)),
            reconnect_base: Duration::from_millis(env_parse("FEED_RECONNECT_BASE_MS", DEFAULT_FEED_RECONNECT_BASE_MS)),
            reconnect_max: Duration::from_millis(env_parse("FEED_RECONNECT_MAX_MS", DEFAULT_FEED_RECONNECT_MAX_MS)),
            reconnect_attempts: env_parse("FEED_RECONNECT_ATTEMPTS", DEFAULT_FEED_RECONNECT_ATTEMPTS),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_FEED_CHANNEL_CAPACITY,
            heartbeat: Duration::from_secs(DEFAULT_FEED_HEARTBEAT_SECS),
            reconnect_base: Duration::from_millis(DEFAULT_FEED_RECONNECT_BASE_MS),
            reconnect_max: Duration::from_millis(DEFAULT_FEED_RECONNECT_MAX_MS),
            reconnect_attempts: DEFAULT_FEED_RECONNECT_ATTEMPTS,
        }
    }
}

/// Connection settings for the hosted backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Project base URL, e.g. `https://xyz.example.co`. No trailing slash.
    pub base_url: String,
    /// Anonymous API key, sent as `apikey` and as the bearer fallback.
    pub api_key: String,
    /// Storage bucket for recipe photos.
    pub storage_bucket: String,
    pub feed: FeedConfig,
}

impl BackendConfig {
    /// Load from `BACKEND_URL` and `BACKEND_ANON_KEY` (required) plus
    /// `BACKEND_STORAGE_BUCKET` and the `FEED_*` tunables (optional).
    ///
    /// # Errors
    ///
    /// Returns `MissingVar` if a required variable is absent.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = std::env::var("BACKEND_URL").map_err(|_| ConfigError::MissingVar("BACKEND_URL"))?;
        let api_key = std::env::var("BACKEND_ANON_KEY").map_err(|_| ConfigError::MissingVar("BACKEND_ANON_KEY"))?;
        let storage_bucket =
            std::env::var("BACKEND_STORAGE_BUCKET").unwrap_or_else(|_| DEFAULT_STORAGE_BUCKET.to_string());

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            storage_bucket,
            feed: FeedConfig::from_env(),
        })
    }

    /// Websocket endpoint for the realtime feed, derived from the base URL.
    #[must_use]
    pub fn realtime_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{ws_base}/realtime/v1/websocket?apikey={}&vsn=1.0.0", self.api_key)
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_url: &str) -> BackendConfig {
        BackendConfig {
            base_url: base_url.to_string(),
            api_key: "anon-key".to_string(),
            storage_bucket: DEFAULT_STORAGE_BUCKET.to_string(),
            feed: FeedConfig::default(),
        }
    }

    #[test]
    fn realtime_url_swaps_scheme() {
        let https = config("https://proj.example.co");
        assert_eq!(
            https.realtime_url(),
            "wss://proj.example.co/realtime/v1/websocket?apikey=anon-key&vsn=1.0.0"
        );

        let http = config("http://localhost:54321");
        assert!(http.realtime_url().starts_with("ws://localhost:54321/realtime"));
    }

    #[test]
    fn feed_config_defaults() {
        let feed = FeedConfig::default();
        assert_eq!(feed.channel_capacity, 256);
        assert_eq!(feed.heartbeat, Duration::from_secs(30));
        assert_eq!(feed.reconnect_attempts, 5);
    }
}
