//! Unified market data model shared by every provider

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Canonical instrument identifier (e.g. "AAPL", "BTC-USD")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Upper-cased copy, used for lookups against canonical tables
    pub fn normalized(&self) -> Symbol {
        Symbol(self.0.trim().to_uppercase())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Symbol(s)
    }
}

/// Asset class a symbol belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketCategory {
    Equity,
    Crypto,
    Unknown,
}

impl fmt::Display for MarketCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MarketCategory::Equity => write!(f, "EQUITY"),
            MarketCategory::Crypto => write!(f, "CRYPTO"),
            MarketCategory::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Upstream data vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Alpaca,
    Binance,
}

impl Provider {
    pub fn name(&self) -> &'static str {
        match self {
            Provider::Alpaca => "alpaca",
            Provider::Binance => "binance",
        }
    }

    pub fn category(&self) -> MarketCategory {
        match self {
            Provider::Alpaca => MarketCategory::Equity,
            Provider::Binance => MarketCategory::Crypto,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A single normalized price observation.
///
/// Optional fields are `None` when the provider did not report them; they are
/// never filled with zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub symbol: Symbol,
    pub price: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub bid_size: Option<f64>,
    pub ask_size: Option<f64>,
    pub volume: Option<f64>,
    pub change_24h: Option<f64>,
    pub provider: Provider,
    pub timestamp: DateTime<Utc>,
}

impl PriceUpdate {
    pub fn new(symbol: Symbol, provider: Provider, price: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol,
            price,
            bid: None,
            ask: None,
            bid_size: None,
            ask_size: None,
            volume: None,
            change_24h: None,
            provider,
            timestamp,
        }
    }

    pub fn with_quote(mut self, bid: f64, ask: f64, bid_size: Option<f64>, ask_size: Option<f64>) -> Self {
        self.bid = Some(bid);
        self.ask = Some(ask);
        self.bid_size = bid_size;
        self.ask_size = ask_size;
        self
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn with_change_24h(mut self, change: f64) -> Self {
        self.change_24h = Some(change);
        self
    }

    pub fn spread(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }
}

/// Bar aggregation period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1D")]
    OneDay,
}

impl Timeframe {
    pub const ALL: [Timeframe; 6] = [
        Timeframe::OneMinute,
        Timeframe::FiveMinutes,
        Timeframe::FifteenMinutes,
        Timeframe::OneHour,
        Timeframe::FourHours,
        Timeframe::OneDay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::OneMinute => "1m",
            Timeframe::FiveMinutes => "5m",
            Timeframe::FifteenMinutes => "15m",
            Timeframe::OneHour => "1h",
            Timeframe::FourHours => "4h",
            Timeframe::OneDay => "1D",
        }
    }

    /// Lenient parse: any label outside the enumerated set maps to daily.
    pub fn from_label(label: &str) -> Self {
        label.parse().unwrap_or_else(|_| {
            tracing::debug!(label, "unrecognized timeframe, falling back to daily");
            Timeframe::OneDay
        })
    }

    pub fn duration(&self) -> Duration {
        match self {
            Timeframe::OneMinute => Duration::minutes(1),
            Timeframe::FiveMinutes => Duration::minutes(5),
            Timeframe::FifteenMinutes => Duration::minutes(15),
            Timeframe::OneHour => Duration::hours(1),
            Timeframe::FourHours => Duration::hours(4),
            Timeframe::OneDay => Duration::days(1),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::OneMinute),
            "5m" => Ok(Timeframe::FiveMinutes),
            "15m" => Ok(Timeframe::FifteenMinutes),
            "1h" => Ok(Timeframe::OneHour),
            "4h" => Ok(Timeframe::FourHours),
            "1D" | "1d" => Ok(Timeframe::OneDay),
            other => Err(format!("unsupported timeframe: {}", other)),
        }
    }
}

impl From<&str> for Timeframe {
    fn from(label: &str) -> Self {
        Timeframe::from_label(label)
    }
}

impl From<&String> for Timeframe {
    fn from(label: &String) -> Self {
        Timeframe::from_label(label)
    }
}

/// Reasons a bar is rejected at construction
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BarError {
    #[error("bar contains a non-finite value")]
    NonFinite,

    #[error("high {high} is below open/close")]
    HighBelowBody { high: f64 },

    #[error("low {low} is above open/close")]
    LowAboveBody { low: f64 },

    #[error("negative volume {volume}")]
    NegativeVolume { volume: f64 },
}

/// One OHLCV bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, BarError> {
        if ![open, high, low, close, volume].iter().all(|v| v.is_finite()) {
            return Err(BarError::NonFinite);
        }
        if high < open.max(close) {
            return Err(BarError::HighBelowBody { high });
        }
        if low > open.min(close) {
            return Err(BarError::LowAboveBody { low });
        }
        if volume < 0.0 {
            return Err(BarError::NegativeVolume { volume });
        }

        Ok(Self { timestamp, open, high, low, close, volume })
    }
}

/// Time-ordered, immutable bar sequence.
///
/// Cloning shares the underlying storage.
#[derive(Debug, Clone, PartialEq)]
pub struct BarSeries {
    symbol: Symbol,
    timeframe: Timeframe,
    bars: Arc<[Bar]>,
}

impl BarSeries {
    pub fn new(symbol: Symbol, timeframe: Timeframe, mut bars: Vec<Bar>) -> Self {
        bars.sort_by_key(|bar| bar.timestamp);
        Self {
            symbol,
            timeframe,
            bars: bars.into(),
        }
    }

    /// `None` for an empty sequence, so callers never see an empty series as data
    pub fn non_empty(symbol: Symbol, timeframe: Timeframe, bars: Vec<Bar>) -> Option<Self> {
        if bars.is_empty() {
            None
        } else {
            Some(Self::new(symbol, timeframe, bars))
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn first(&self) -> Option<&Bar> {
        self.bars.first()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    pub fn highs(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.high).collect()
    }

    pub fn lows(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.low).collect()
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.volume).collect()
    }
}

/// Connector lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Uninitialized,
    Connected,
    Disconnected,
}

/// Health snapshot for one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub name: String,
    pub state: ConnectionState,
    pub connected: bool,
    pub last_error: Option<String>,
}

impl ProviderStatus {
    pub fn unavailable(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ConnectionState::Uninitialized,
            connected: false,
            last_error: Some(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_timeframe_labels() {
        assert_eq!(Timeframe::from_label("1m"), Timeframe::OneMinute);
        assert_eq!(Timeframe::from_label("4h"), Timeframe::FourHours);
        assert_eq!(Timeframe::from_label("1D"), Timeframe::OneDay);
        assert_eq!(Timeframe::OneHour.to_string(), "1h");
    }

    #[test]
    fn test_unknown_timeframe_falls_back_to_daily() {
        assert_eq!(Timeframe::from_label("2h"), Timeframe::OneDay);
        assert_eq!(Timeframe::from("weekly"), Timeframe::OneDay);
        assert!("2h".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_bar_validation() {
        assert!(Bar::new(ts(1), 10.0, 12.0, 9.0, 11.0, 100.0).is_ok());
        assert_eq!(
            Bar::new(ts(1), 10.0, 10.5, 9.0, 11.0, 100.0),
            Err(BarError::HighBelowBody { high: 10.5 })
        );
        assert_eq!(
            Bar::new(ts(1), 10.0, 12.0, 10.5, 11.0, 100.0),
            Err(BarError::LowAboveBody { low: 10.5 })
        );
        assert_eq!(Bar::new(ts(1), f64::NAN, 12.0, 9.0, 11.0, 1.0), Err(BarError::NonFinite));
        assert!(matches!(
            Bar::new(ts(1), 10.0, 12.0, 9.0, 11.0, -1.0),
            Err(BarError::NegativeVolume { .. })
        ));
    }

    #[test]
    fn test_bar_series_is_time_ordered() {
        let bars = vec![
            Bar::new(ts(3), 3.0, 3.0, 3.0, 3.0, 1.0).unwrap(),
            Bar::new(ts(1), 1.0, 1.0, 1.0, 1.0, 1.0).unwrap(),
            Bar::new(ts(2), 2.0, 2.0, 2.0, 2.0, 1.0).unwrap(),
        ];
        let series = BarSeries::new(Symbol::new("AAPL"), Timeframe::OneDay, bars);

        assert_eq!(series.closes(), vec![1.0, 2.0, 3.0]);
        assert_eq!(series.last().unwrap().timestamp, ts(3));
        assert!(BarSeries::non_empty(Symbol::new("AAPL"), Timeframe::OneDay, Vec::new()).is_none());
    }

    #[test]
    fn test_price_update_optional_fields_default_to_none() {
        let update = PriceUpdate::new(Symbol::new("AAPL"), Provider::Alpaca, 190.0, ts(1));
        assert_eq!(update.bid, None);
        assert_eq!(update.volume, None);
        assert_eq!(update.spread(), None);

        let quoted = update.with_quote(189.9, 190.1, Some(100.0), None);
        assert!((quoted.spread().unwrap() - 0.2).abs() < 1e-9);
    }
}
