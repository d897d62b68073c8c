//! Runtime configuration loaded from the environment

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::market_data::Symbol;

pub const DEFAULT_WATCHLIST: &[&str] = &[
    "AAPL", "MSFT", "GOOGL", "AMZN", "NVDA", "TSLA", "META", "ASML.AS", "SHELL.AS", "INGA.AS",
    "BTC-USD", "ETH-USD", "SOL-USD",
];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// Alpaca market data credentials and endpoints
#[derive(Debug, Clone)]
pub struct AlpacaConfig {
    pub api_key: String,
    pub secret_key: String,
    pub data_url: String,
    pub stream_url: String,
    /// Data feed ("iex" for free accounts, "sip" for paid)
    pub feed: String,
}

impl Default for AlpacaConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            data_url: "https://data.alpaca.markets".to_string(),
            stream_url: "wss://stream.data.alpaca.markets/v2/iex".to_string(),
            feed: "iex".to_string(),
        }
    }
}

impl AlpacaConfig {
    pub fn has_credentials(&self) -> bool {
        !self.api_key.trim().is_empty() && !self.secret_key.trim().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct BinanceConfig {
    pub rest_url: String,
    pub stream_url: String,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://api.binance.com".to_string(),
            stream_url: "wss://stream.binance.com:9443/ws".to_string(),
        }
    }
}

/// Live stream behaviour shared by all connectors
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// 1.0 keeps a fixed delay
    pub backoff_multiplier: f64,
    /// 0 = retry forever
    pub max_reconnect_attempts: u32,
    pub connect_timeout: Duration,
    pub auth_timeout: Duration,
    pub ping_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(60),
            backoff_multiplier: 1.0,
            max_reconnect_attempts: 0,
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// REST request ceilings, requests per minute (0 disables)
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub alpaca_per_minute: u32,
    pub binance_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            alpaca_per_minute: 200,
            binance_per_minute: 1200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub alpaca: AlpacaConfig,
    pub binance: BinanceConfig,
    pub stream: StreamConfig,
    pub rate_limits: RateLimitConfig,
    pub watchlist: Vec<Symbol>,
    pub log_level: String,
    pub status_api_port: Option<u16>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            alpaca: AlpacaConfig::default(),
            binance: BinanceConfig::default(),
            stream: StreamConfig::default(),
            rate_limits: RateLimitConfig::default(),
            watchlist: DEFAULT_WATCHLIST.iter().map(|s| Symbol::new(*s)).collect(),
            log_level: "info".to_string(),
            status_api_port: None,
        }
    }
}

impl Settings {
    /// Load `.env` (if present) then read the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded .env file");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup, starting from defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut settings = Settings::default();

        if let Some(v) = get("ALPACA_API_KEY") {
            settings.alpaca.api_key = v;
        }
        if let Some(v) = get("ALPACA_SECRET_KEY") {
            settings.alpaca.secret_key = v;
        }
        if let Some(v) = get("ALPACA_DATA_URL") {
            settings.alpaca.data_url = v;
        }
        if let Some(v) = get("ALPACA_STREAM_URL") {
            settings.alpaca.stream_url = v;
        }
        if let Some(v) = get("ALPACA_FEED") {
            settings.alpaca.feed = v;
        }
        if let Some(v) = get("BINANCE_REST_URL") {
            settings.binance.rest_url = v;
        }
        if let Some(v) = get("BINANCE_WS_URL") {
            settings.binance.stream_url = v;
        }

        if let Some(secs) = parse::<u64>("WS_RECONNECT_DELAY_SECS", get("WS_RECONNECT_DELAY_SECS"))? {
            settings.stream.reconnect_delay = Duration::from_secs(secs);
        }
        if let Some(attempts) = parse("WS_MAX_RECONNECT_ATTEMPTS", get("WS_MAX_RECONNECT_ATTEMPTS"))? {
            settings.stream.max_reconnect_attempts = attempts;
        }
        if let Some(multiplier) = parse::<f64>("WS_BACKOFF_MULTIPLIER", get("WS_BACKOFF_MULTIPLIER"))? {
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(ConfigError::Invalid {
                    key: "WS_BACKOFF_MULTIPLIER".to_string(),
                    value: multiplier.to_string(),
                });
            }
            settings.stream.backoff_multiplier = multiplier;
        }
        if let Some(limit) = parse("ALPACA_RATE_LIMIT", get("ALPACA_RATE_LIMIT"))? {
            settings.rate_limits.alpaca_per_minute = limit;
        }
        if let Some(limit) = parse("BINANCE_RATE_LIMIT", get("BINANCE_RATE_LIMIT"))? {
            settings.rate_limits.binance_per_minute = limit;
        }
        if let Some(port) = parse("STATUS_API_PORT", get("STATUS_API_PORT"))? {
            settings.status_api_port = Some(port);
        }
        if let Some(list) = get("WATCHLIST") {
            settings.watchlist = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| Symbol::new(s.to_uppercase()))
                .collect();
        }
        if let Some(level) = get("LOG_LEVEL") {
            settings.log_level = level.to_lowercase();
        }

        Ok(settings)
    }
}

fn parse<T: FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>, ConfigError> {
    match raw {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key: key.to_string(), value }),
    }
}
