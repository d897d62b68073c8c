//! Latest-price cache keyed by canonical symbol

use dashmap::DashMap;
use std::collections::BTreeMap;

use super::types::{PriceUpdate, Symbol};

/// Last-write-wins store holding the most recent update per symbol.
///
/// Only the update router writes here.
#[derive(Debug, Default)]
pub struct PriceCache {
    entries: DashMap<Symbol, PriceUpdate>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    pub fn get(&self, symbol: &Symbol) -> Option<PriceUpdate> {
        self.entries.get(symbol).map(|entry| entry.value().clone())
    }

    pub(crate) fn insert(&self, update: PriceUpdate) -> Option<PriceUpdate> {
        self.entries.insert(update.symbol.clone(), update)
    }

    pub fn snapshot(&self) -> BTreeMap<Symbol, PriceUpdate> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::types::Provider;
    use chrono::Utc;

    #[test]
    fn test_last_write_wins() {
        let cache = PriceCache::new();
        let symbol = Symbol::new("BTC-USD");

        cache.insert(PriceUpdate::new(symbol.clone(), Provider::Binance, 100.0, Utc::now()));
        let previous = cache.insert(PriceUpdate::new(symbol.clone(), Provider::Binance, 101.0, Utc::now()));

        assert_eq!(previous.map(|u| u.price), Some(100.0));
        assert_eq!(cache.get(&symbol).map(|u| u.price), Some(101.0));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&Symbol::new("ETH-USD")).is_none());
    }
}
