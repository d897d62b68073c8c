//! Provider connectivity: connector contract, concrete connectors and plumbing

pub mod alpaca;
pub mod binance;
pub mod connector;
pub mod errors;
pub mod rate_limit;
pub mod reconnect;
pub mod registry;
pub mod websocket;

pub use alpaca::AlpacaConnector;
pub use binance::BinanceConnector;
pub use connector::{Connector, ConnectorState, MonotonicGuard, OnMessage};
pub use errors::{ConnectorError, ConnectorResult, ErrorKind};
pub use rate_limit::RateLimiter;
pub use reconnect::{Backoff, ReconnectConfig, ReconnectPolicy};
pub use registry::{ConnectorFactory, ConnectorRegistry};
