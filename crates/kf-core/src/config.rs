//! Configuration parsing for the kline feed.
//!
//! Everything is read from a single JSON file. Every section and every field
//! is optional; missing values fall back to the defaults below.
//!
//! # Example config
//!
//! ```json
//! {
//!   "logging": { "module_name": "kline_feed", "log_path": "/var/log/kline" },
//!   "rest":    { "exchanges": ["binance", "okx", "bybit"], "timeout_ms": 10000 },
//!   "stream":  { "symbols": ["BTC/USDT", "ETH/USDT"], "interval": "1m",
//!                "primary": "bybit", "secondary": "binance" },
//!   "buffer":  { "max_buffer_size": 100, "flush_interval_sec": 30 }
//! }
//! ```

use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::error::KfError;
use crate::types::{Exchange, Interval, normalize_pair};
use crate::ws::ReconnectPolicy;

/// Top-level application config, deserialized from a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Module metadata (name, log path).
    pub logging: Option<LoggingConfig>,

    #[serde(default)]
    pub rest: RestConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub buffer: BufferConfig,
}

/// Logging metadata block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    pub module_name: Option<String>,
    pub log_path: Option<String>,
    /// Emit JSON lines instead of human-readable text.
    pub json: Option<bool>,
}

impl AppConfig {
    /// Log file prefix, defaulting to `kline_feed`.
    pub fn module_name(&self) -> String {
        self.logging.as_ref().and_then(|m| m.module_name.clone()).unwrap_or_else(|| "kline_feed".to_string())
    }

    pub fn log_path(&self) -> Option<String> {
        self.logging.as_ref().and_then(|m| m.log_path.clone())
    }

    pub fn json_logs(&self) -> bool {
        self.logging.as_ref().and_then(|m| m.json).unwrap_or(false)
    }

    /// Reject configurations the runtime cannot honour.
    pub fn validate(&self) -> Result<(), KfError> {
        self.rest.validate()?;
        self.stream.validate()?;
        self.buffer.validate()
    }
}

// ---------------------------------------------------------------------------
// REST
// ---------------------------------------------------------------------------

/// REST adapters taking part in race fetches.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    /// Adapters in priority order.
    pub exchanges: Vec<Exchange>,
    /// Per-adapter request deadline.
    pub timeout_ms: u64,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self { exchanges: Exchange::ALL.to_vec(), timeout_ms: 10_000 }
    }
}

impl RestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self) -> Result<(), KfError> {
        if self.exchanges.is_empty() {
            return Err(KfError::Config("rest.exchanges must list at least one exchange".into()));
        }
        for (i, ex) in self.exchanges.iter().enumerate() {
            if self.exchanges[..i].contains(ex) {
                return Err(KfError::Config(format!("rest.exchanges lists {ex} twice")));
            }
        }
        if self.timeout_ms == 0 {
            return Err(KfError::Config("rest.timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Live streaming and fallback chain settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Canonical `BASE/QUOTE` symbols tracked from startup.
    pub symbols: Vec<String>,
    pub interval: Interval,
    pub primary: Exchange,
    pub secondary: Exchange,
    /// Reconnect attempts before a connection reports `failed`.
    pub max_reconnect_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub connect_timeout_ms: u64,
    pub ping_interval_sec: u64,
    pub rest_poll_interval_sec: u64,
    /// A connected stream silent for this long is treated as failed.
    pub stale_after_sec: u64,
    pub health_check_interval_sec: u64,
    /// Consecutive failed REST polls before a symbol is reported exhausted.
    pub rest_failure_threshold: u32,
    /// Consecutive disconnects or errors from the active stream, with no
    /// kline update in between, before the chain advances.
    pub max_errors_before_fallback: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            interval: Interval::Min1,
            primary: Exchange::Bybit,
            secondary: Exchange::Binance,
            max_reconnect_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            connect_timeout_ms: 10_000,
            ping_interval_sec: 20,
            rest_poll_interval_sec: 60,
            stale_after_sec: 30,
            health_check_interval_sec: 10,
            rest_failure_threshold: 3,
            max_errors_before_fallback: 3,
        }
    }
}

impl StreamConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.initial_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
            multiplier: 2,
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_sec)
    }

    pub fn rest_poll_interval(&self) -> Duration {
        Duration::from_secs(self.rest_poll_interval_sec)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_sec)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_sec)
    }

    /// Symbols normalized to canonical upper-case form.
    pub fn normalized_symbols(&self) -> Result<Vec<String>, KfError> {
        self.symbols.iter().map(|s| normalize_pair(s)).collect()
    }

    fn validate(&self) -> Result<(), KfError> {
        for (role, ex) in [("primary", self.primary), ("secondary", self.secondary)] {
            if !ex.supports_streaming() {
                return Err(KfError::Config(format!("stream.{role}: {ex} has no kline stream")));
            }
        }
        if self.primary == self.secondary {
            return Err(KfError::Config("stream.primary and stream.secondary must differ".into()));
        }
        if self.initial_backoff_ms == 0 || self.max_backoff_ms < self.initial_backoff_ms {
            return Err(KfError::Config("stream backoff must satisfy 0 < initial <= max".into()));
        }
        let positive = [
            ("ping_interval_sec", self.ping_interval_sec),
            ("rest_poll_interval_sec", self.rest_poll_interval_sec),
            ("stale_after_sec", self.stale_after_sec),
            ("health_check_interval_sec", self.health_check_interval_sec),
            ("connect_timeout_ms", self.connect_timeout_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(KfError::Config(format!("stream.{name} must be positive")));
        }
        if self.max_errors_before_fallback == 0 {
            return Err(KfError::Config("stream.max_errors_before_fallback must be positive".into()));
        }
        self.normalized_symbols().map_err(|e| KfError::Config(format!("stream.symbols: {e}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Buffer
// ---------------------------------------------------------------------------

/// Closed-candle write buffer settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Size that triggers an immediate flush.
    pub max_buffer_size: usize,
    pub flush_interval_sec: u64,
    /// Attempts per batch before its entries are dropped.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub retry_delay_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { max_buffer_size: 100, flush_interval_sec: 30, max_retries: 3, retry_delay_ms: 500 }
    }
}

impl BufferConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_sec)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    fn validate(&self) -> Result<(), KfError> {
        if self.max_buffer_size == 0 {
            return Err(KfError::Config("buffer.max_buffer_size must be positive".into()));
        }
        if self.flush_interval_sec == 0 {
            return Err(KfError::Config("buffer.flush_interval_sec must be positive".into()));
        }
        if self.max_retries == 0 {
            return Err(KfError::Config("buffer.max_retries must be positive".into()));
        }
        Ok(())
    }
}

/// Load, parse and validate a JSON config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config: AppConfig =
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let cfg: AppConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.module_name(), "kline_feed");
        assert_eq!(cfg.rest.exchanges.len(), 6);
        assert_eq!(cfg.stream.primary, Exchange::Bybit);
        assert_eq!(cfg.stream.secondary, Exchange::Binance);
        assert_eq!(cfg.stream.max_reconnect_attempts, 3);
        assert_eq!(cfg.stream.max_errors_before_fallback, 3);
        assert_eq!(cfg.buffer.max_buffer_size, 100);
        assert_eq!(cfg.buffer.flush_interval(), Duration::from_secs(30));
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let json = r#"{
            "logging": { "module_name": "feed", "json": true },
            "rest": { "exchanges": ["kraken", "binance"] },
            "stream": { "symbols": ["btc/usdt"], "interval": "5m" },
            "buffer": { "max_buffer_size": 10 }
        }"#;
        let cfg: AppConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.validate().is_ok());
        assert!(cfg.json_logs());
        assert_eq!(cfg.rest.exchanges, vec![Exchange::Kraken, Exchange::Binance]);
        assert_eq!(cfg.rest.timeout_ms, 10_000);
        assert_eq!(cfg.stream.interval, Interval::Min5);
        assert_eq!(cfg.stream.normalized_symbols().unwrap(), vec!["BTC/USDT".to_string()]);
        assert_eq!(cfg.buffer.max_buffer_size, 10);
        assert_eq!(cfg.buffer.max_retries, 3);
    }

    #[test]
    fn rejects_non_streaming_primary() {
        let cfg: AppConfig = serde_json::from_str(r#"{"stream": {"primary": "kraken"}}"#).unwrap();
        assert!(matches!(cfg.validate(), Err(KfError::Config(_))));
    }

    #[test]
    fn rejects_identical_stream_sources() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"stream": {"primary": "binance", "secondary": "binance"}}"#).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bad_symbols_and_sizes() {
        let cfg: AppConfig = serde_json::from_str(r#"{"stream": {"symbols": ["BTCUSDT"]}}"#).unwrap();
        assert!(cfg.validate().is_err());

        let cfg: AppConfig = serde_json::from_str(r#"{"buffer": {"max_buffer_size": 0}}"#).unwrap();
        assert!(cfg.validate().is_err());

        let cfg: AppConfig = serde_json::from_str(r#"{"rest": {"exchanges": []}}"#).unwrap();
        assert!(cfg.validate().is_err());

        let cfg: AppConfig = serde_json::from_str(r#"{"stream": {"max_errors_before_fallback": 0}}"#).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_exchange_fails_to_parse() {
        assert!(serde_json::from_str::<AppConfig>(r#"{"rest": {"exchanges": ["ftx"]}}"#).is_err());
    }

    #[test]
    fn reconnect_policy_from_stream_section() {
        let policy = StreamConfig::default().reconnect_policy();
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.max_attempts, 3);
    }
}
