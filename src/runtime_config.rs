// =============================================================================
// Runtime Configuration — file + environment settings for the relay
// =============================================================================
//
// Settings come from an optional JSON file, then environment variables (a
// `.env` file is loaded in main.rs beforehand) override individual fields.
// All fields carry `#[serde(default)]` so a partial file, or no file at all,
// yields a runnable configuration.
//
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::market_data::LateTickPolicy;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["AAPL".to_string(), "AMZN".to_string()]
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_feed_url() -> String {
    "wss://ws.finnhub.io".to_string()
}

fn default_bucket_secs() -> u64 {
    60
}

fn default_live_interval_ms() -> u64 {
    1000
}

fn default_idle_close_grace_secs() -> u64 {
    5
}

fn default_feed_reconnect_secs() -> u64 {
    5
}

fn default_consumer_outbox_capacity() -> usize {
    256
}

fn default_db_max_connections() -> u32 {
    5
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Symbols subscribed on the feed and aggregated.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Address the HTTP / WebSocket server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Trade feed WebSocket endpoint (token appended as `?token=`).
    #[serde(default = "default_feed_url")]
    pub feed_url: String,

    /// Trade feed token. Never logged.
    #[serde(default)]
    pub feed_api_key: String,

    /// Postgres URL. `None` keeps closed candles in memory only.
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// Candle bucket width in seconds.
    #[serde(default = "default_bucket_secs")]
    pub bucket_secs: u64,

    /// Coalescing interval for live updates, in milliseconds.
    #[serde(default = "default_live_interval_ms")]
    pub live_interval_ms: u64,

    /// Seconds after a bucket's end before a quiet symbol's candle is closed
    /// without waiting for its next tick. `0` disables the sweep.
    #[serde(default = "default_idle_close_grace_secs")]
    pub idle_close_grace_secs: u64,

    #[serde(default)]
    pub late_tick_policy: LateTickPolicy,

    /// Delay before the feed supervisor reconnects.
    #[serde(default = "default_feed_reconnect_secs")]
    pub feed_reconnect_secs: u64,

    /// Per-consumer queue depth; a consumer that falls this far behind is
    /// disconnected.
    #[serde(default = "default_consumer_outbox_capacity")]
    pub consumer_outbox_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            bind_addr: default_bind_addr(),
            feed_url: default_feed_url(),
            feed_api_key: String::new(),
            database_url: None,
            db_max_connections: default_db_max_connections(),
            bucket_secs: default_bucket_secs(),
            live_interval_ms: default_live_interval_ms(),
            idle_close_grace_secs: default_idle_close_grace_secs(),
            late_tick_policy: LateTickPolicy::default(),
            feed_reconnect_secs: default_feed_reconnect_secs(),
            consumer_outbox_capacity: default_consumer_outbox_capacity(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            "config loaded"
        );

        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup. Unset keys leave fields alone.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(syms) = lookup("CANDLE_SYMBOLS") {
            self.symbols = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(addr) = lookup("CANDLE_BIND_ADDR") {
            self.bind_addr = addr;
        } else if let Some(port) = lookup("SERVER_PORT") {
            self.bind_addr = format!("0.0.0.0:{}", port.trim());
        }
        if let Some(url) = lookup("FEED_URL") {
            self.feed_url = url;
        }
        if let Some(key) = lookup("FEED_API_KEY").or_else(|| lookup("API_KEY")) {
            self.feed_api_key = key;
        }
        if let Some(url) = lookup("DATABASE_URL").filter(|u| !u.trim().is_empty()) {
            self.database_url = Some(url);
        }
        if let Some(v) = lookup("CANDLE_BUCKET_SECS") {
            self.bucket_secs = parse_var("CANDLE_BUCKET_SECS", &v)?;
        }
        if let Some(v) = lookup("LIVE_INTERVAL_MS") {
            self.live_interval_ms = parse_var("LIVE_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("IDLE_CLOSE_GRACE_SECS") {
            self.idle_close_grace_secs = parse_var("IDLE_CLOSE_GRACE_SECS", &v)?;
        }
        if let Some(v) = lookup("LATE_TICK_POLICY") {
            self.late_tick_policy = v.parse()?;
        }
        if let Some(v) = lookup("FEED_RECONNECT_SECS") {
            self.feed_reconnect_secs = parse_var("FEED_RECONNECT_SECS", &v)?;
        }
        if let Some(v) = lookup("CONSUMER_OUTBOX_CAPACITY") {
            self.consumer_outbox_capacity = parse_var("CONSUMER_OUTBOX_CAPACITY", &v)?;
        }
        Ok(())
    }

    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            anyhow::bail!("no symbols configured");
        }
        if self.bucket_secs == 0 {
            anyhow::bail!("bucket_secs must be greater than zero");
        }
        if self.live_interval_ms == 0 {
            anyhow::bail!("live_interval_ms must be greater than zero");
        }
        if self.consumer_outbox_capacity == 0 {
            anyhow::bail!("consumer_outbox_capacity must be greater than zero");
        }
        Ok(())
    }

    pub fn bucket_width(&self) -> TimeDelta {
        TimeDelta::seconds(self.bucket_secs as i64)
    }

    pub fn live_interval(&self) -> Duration {
        Duration::from_millis(self.live_interval_ms)
    }

    /// `None` when the idle sweep is disabled.
    pub fn idle_close_grace(&self) -> Option<TimeDelta> {
        (self.idle_close_grace_secs > 0)
            .then(|| TimeDelta::seconds(self.idle_close_grace_secs as i64))
    }

    pub fn feed_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.feed_reconnect_secs)
    }
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("invalid value for {name}: {raw}"))
}
