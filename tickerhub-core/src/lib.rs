//! TickerHub core
//!
//! Multi-provider market data: equities from Alpaca, crypto from Binance,
//! behind one orchestrator that routes by symbol, caches the latest price
//! and fans streamed updates out to subscribers. Indicators, agent tools and
//! a status API sit on top.

pub mod api;
pub mod config;
pub mod exchanges;
pub mod indicators;
pub mod market_data;
pub mod tools;

// Re-export main types for easy access
pub use api::StatusApiServer;
pub use config::{ConfigError, Settings};
pub use exchanges::{Connector, ConnectorError, ConnectorRegistry, ConnectorResult, ConnectorState, OnMessage};
pub use indicators::{compute_all, generate_signals, IndicatorKind, IndicatorSeries, IndicatorSet, Signal};
pub use market_data::{
    callback, classify, Bar, BarSeries, CallbackId, DataOrchestrator, MarketCategory, PriceUpdate, Provider,
    ProviderStatus, Symbol, SymbolClassifier, Timeframe, UpdateCallback,
};
pub use tools::{Tool, ToolError, ToolRegistry};
