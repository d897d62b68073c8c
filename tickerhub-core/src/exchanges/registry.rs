//! Category → connector factory table

use std::collections::BTreeMap;
use std::sync::Arc;

use super::alpaca::AlpacaConnector;
use super::binance::BinanceConnector;
use super::connector::Connector;
use super::errors::ConnectorResult;
use crate::config::Settings;
use crate::market_data::MarketCategory;

pub type ConnectorFactory = Box<dyn Fn(&Settings) -> ConnectorResult<Arc<dyn Connector>> + Send + Sync>;

struct Registration {
    name: String,
    factory: ConnectorFactory,
}

/// Which connector serves which market category
#[derive(Default)]
pub struct ConnectorRegistry {
    entries: BTreeMap<MarketCategory, Registration>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    /// Alpaca for equities, Binance for crypto
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(MarketCategory::Equity, "alpaca", |settings| {
            Ok(Arc::new(AlpacaConnector::from_settings(settings)?) as Arc<dyn Connector>)
        });
        registry.register(MarketCategory::Crypto, "binance", |settings| {
            Ok(Arc::new(BinanceConnector::from_settings(settings)?) as Arc<dyn Connector>)
        });
        registry
    }

    /// Replaces any previous registration for the category
    pub fn register<F>(&mut self, category: MarketCategory, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Settings) -> ConnectorResult<Arc<dyn Connector>> + Send + Sync + 'static,
    {
        let name = name.into();
        if let Some(previous) = self.entries.insert(
            category,
            Registration { name: name.clone(), factory: Box::new(factory) },
        ) {
            tracing::debug!(%category, previous = %previous.name, replacement = %name, "connector factory replaced");
        }
        self
    }

    pub fn categories(&self) -> Vec<MarketCategory> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every factory; each result is independent of the others
    pub(crate) fn build_all(&self, settings: &Settings) -> Vec<(MarketCategory, String, ConnectorResult<Arc<dyn Connector>>)> {
        self.entries
            .iter()
            .map(|(category, registration)| {
                (*category, registration.name.clone(), (registration.factory)(settings))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::errors::ConnectorError;

    #[test]
    fn test_defaults_cover_equity_and_crypto() {
        let registry = ConnectorRegistry::with_defaults();
        assert_eq!(registry.categories(), vec![MarketCategory::Equity, MarketCategory::Crypto]);
    }

    #[test]
    fn test_factories_fail_independently() {
        // No Alpaca credentials in default settings
        let built = ConnectorRegistry::with_defaults().build_all(&Settings::default());

        let (category, name, equity) = &built[0];
        assert_eq!((*category, name.as_str()), (MarketCategory::Equity, "alpaca"));
        assert!(matches!(equity, Err(ConnectorError::Configuration(_))));

        let (_, name, crypto) = &built[1];
        assert_eq!(name, "binance");
        assert!(crypto.as_ref().map(|c| c.name() == "binance").unwrap_or(false));
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = ConnectorRegistry::new();
        registry
            .register(MarketCategory::Crypto, "first", |_| Err(ConnectorError::NotConnected))
            .register(MarketCategory::Crypto, "second", |_| Err(ConnectorError::NotConnected));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.build_all(&Settings::default())[0].1, "second");
    }
}
