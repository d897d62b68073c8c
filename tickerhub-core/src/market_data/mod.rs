//! Unified market data: model, classification, cache, fan-out and orchestration

pub mod cache;
pub mod classifier;
pub mod fanout;
pub mod orchestrator;
pub mod types;

pub use cache::PriceCache;
pub use classifier::{canonical_from_alias, classify, resolve_alias, SymbolClassifier};
pub use fanout::{callback, CallbackId, FeedStatistics, UpdateCallback};
pub use orchestrator::DataOrchestrator;
pub use types::{
    Bar, BarError, BarSeries, ConnectionState, MarketCategory, PriceUpdate, Provider, ProviderStatus,
    Symbol, Timeframe,
};
