//! Symbol classification and provider alias resolution
//!
//! The classifier is built once and is read-only afterwards, so it can be
//! shared freely between tasks.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use super::types::{MarketCategory, Provider, Symbol};

/// US listings served by the equity connector
pub const DEFAULT_EQUITY_SYMBOLS: &[&str] = &[
    "AAPL", "MSFT", "GOOGL", "AMZN", "NVDA", "TSLA", "META", "BRK.B", "JPM", "V", "UNH", "JNJ",
    "WMT", "XOM", "PG",
];

/// USD crypto pairs served by the crypto connector
pub const DEFAULT_CRYPTO_SYMBOLS: &[&str] = &[
    "BTC-USD", "ETH-USD", "BNB-USD", "SOL-USD", "ADA-USD", "XRP-USD", "DOT-USD", "DOGE-USD",
    "AVAX-USD", "MATIC-USD",
];

/// Static symbol → category table
#[derive(Debug, Clone, Default)]
pub struct SymbolClassifier {
    categories: HashMap<Symbol, MarketCategory>,
}

impl SymbolClassifier {
    /// Classifier preloaded with the default equity and crypto universes
    pub fn new() -> Self {
        Self::empty()
            .with_symbols(DEFAULT_EQUITY_SYMBOLS.iter().copied(), MarketCategory::Equity)
            .with_symbols(DEFAULT_CRYPTO_SYMBOLS.iter().copied(), MarketCategory::Crypto)
    }

    pub fn empty() -> Self {
        Self { categories: HashMap::new() }
    }

    pub fn with_symbol(mut self, symbol: impl Into<Symbol>, category: MarketCategory) -> Self {
        let symbol: Symbol = symbol.into();
        self.categories.insert(symbol.normalized(), category);
        self
    }

    pub fn with_symbols<I, S>(self, symbols: I, category: MarketCategory) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        symbols
            .into_iter()
            .fold(self, |classifier, symbol| classifier.with_symbol(symbol, category))
    }

    /// Total: anything outside the table is `Unknown`
    pub fn classify(&self, symbol: &Symbol) -> MarketCategory {
        self.categories
            .get(&symbol.normalized())
            .copied()
            .unwrap_or(MarketCategory::Unknown)
    }

    /// Group symbols by category, dropping duplicates and keeping first-seen order
    pub fn partition<'a, I>(&self, symbols: I) -> BTreeMap<MarketCategory, Vec<Symbol>>
    where
        I: IntoIterator<Item = &'a Symbol>,
    {
        let mut groups: BTreeMap<MarketCategory, Vec<Symbol>> = BTreeMap::new();
        for symbol in symbols {
            let group = groups.entry(self.classify(symbol)).or_default();
            if !group.contains(symbol) {
                group.push(symbol.clone());
            }
        }
        groups
    }

    pub fn known_symbols(&self, category: MarketCategory) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self
            .categories
            .iter()
            .filter(|(_, c)| **c == category)
            .map(|(s, _)| s.clone())
            .collect();
        symbols.sort();
        symbols
    }
}

fn default_classifier() -> &'static SymbolClassifier {
    static DEFAULT: OnceLock<SymbolClassifier> = OnceLock::new();
    DEFAULT.get_or_init(SymbolClassifier::new)
}

/// Classify against the default tables
pub fn classify(symbol: &Symbol) -> MarketCategory {
    default_classifier().classify(symbol)
}

/// Canonical symbol → provider-native identifier.
///
/// `None` means the provider cannot serve the symbol.
pub fn resolve_alias(symbol: &Symbol, provider: Provider) -> Option<String> {
    let symbol = symbol.normalized();
    if symbol.is_empty() {
        return None;
    }

    match provider {
        Provider::Binance => {
            let (base, quote) = symbol.as_str().split_once('-')?;
            if quote != "USD" || base.is_empty() || !base.chars().all(|c| c.is_ascii_alphanumeric()) {
                return None;
            }
            Some(format!("{}usdt", base.to_lowercase()))
        }
        Provider::Alpaca => {
            let raw = symbol.as_str();
            if raw.contains('-') || !raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '.') {
                return None;
            }
            // Share classes (BRK.B) pass, exchange suffixes (ASML.AS) do not
            match raw.split_once('.') {
                Some((root, class)) if root.is_empty() || class.len() != 1 => None,
                _ => Some(raw.to_string()),
            }
        }
    }
}

/// Provider-native identifier → canonical symbol
pub fn canonical_from_alias(alias: &str, provider: Provider) -> Option<Symbol> {
    let upper = alias.trim().to_uppercase();
    if upper.is_empty() {
        return None;
    }

    match provider {
        Provider::Binance => {
            let base = upper.strip_suffix("USDT")?;
            if base.is_empty() {
                return None;
            }
            Some(Symbol::new(format!("{}-USD", base)))
        }
        Provider::Alpaca => Some(Symbol::new(upper)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_classification() {
        assert_eq!(classify(&Symbol::new("AAPL")), MarketCategory::Equity);
        assert_eq!(classify(&Symbol::new("BRK.B")), MarketCategory::Equity);
        assert_eq!(classify(&Symbol::new("BTC-USD")), MarketCategory::Crypto);
        assert_eq!(classify(&Symbol::new("MATIC-USD")), MarketCategory::Crypto);
        assert_eq!(classify(&Symbol::new("ASML.AS")), MarketCategory::Unknown);
        assert_eq!(classify(&Symbol::new("UNKNOWN-SYM")), MarketCategory::Unknown);
        assert_eq!(classify(&Symbol::new("")), MarketCategory::Unknown);
    }

    #[test]
    fn test_classification_is_stable() {
        let symbol = Symbol::new("ETH-USD");
        let first = classify(&symbol);
        for _ in 0..10 {
            assert_eq!(classify(&symbol), first);
        }
    }

    #[test]
    fn test_custom_entries() {
        let classifier = SymbolClassifier::empty().with_symbol("COIN", MarketCategory::Equity);
        assert_eq!(classifier.classify(&Symbol::new("COIN")), MarketCategory::Equity);
        assert_eq!(classifier.classify(&Symbol::new("AAPL")), MarketCategory::Unknown);
    }

    #[test]
    fn test_partition_groups_and_dedups() {
        let classifier = SymbolClassifier::new();
        let symbols: Vec<Symbol> = ["AAPL", "BTC-USD", "AAPL", "ASML.AS", "ETH-USD"]
            .iter()
            .map(|s| Symbol::new(*s))
            .collect();

        let groups = classifier.partition(&symbols);
        assert_eq!(groups[&MarketCategory::Equity], vec![Symbol::new("AAPL")]);
        assert_eq!(
            groups[&MarketCategory::Crypto],
            vec![Symbol::new("BTC-USD"), Symbol::new("ETH-USD")]
        );
        assert_eq!(groups[&MarketCategory::Unknown], vec![Symbol::new("ASML.AS")]);
    }

    #[test]
    fn test_binance_alias_round_trip() {
        let alias = resolve_alias(&Symbol::new("BTC-USD"), Provider::Binance);
        assert_eq!(alias.as_deref(), Some("btcusdt"));
        assert_eq!(canonical_from_alias("BTCUSDT", Provider::Binance), Some(Symbol::new("BTC-USD")));
        assert_eq!(canonical_from_alias("btcusdt", Provider::Binance), Some(Symbol::new("BTC-USD")));
    }

    #[test]
    fn test_binance_only_maps_usd_quotes() {
        assert_eq!(resolve_alias(&Symbol::new("ETH-BTC"), Provider::Binance), None);
        assert_eq!(resolve_alias(&Symbol::new("AAPL"), Provider::Binance), None);
        assert_eq!(canonical_from_alias("ETHBTC", Provider::Binance), None);
    }

    #[test]
    fn test_alpaca_alias() {
        assert_eq!(resolve_alias(&Symbol::new("aapl"), Provider::Alpaca).as_deref(), Some("AAPL"));
        assert_eq!(resolve_alias(&Symbol::new("BRK.B"), Provider::Alpaca).as_deref(), Some("BRK.B"));
        assert_eq!(resolve_alias(&Symbol::new("ASML.AS"), Provider::Alpaca), None);
        assert_eq!(resolve_alias(&Symbol::new("BTC-USD"), Provider::Alpaca), None);
        assert_eq!(resolve_alias(&Symbol::new(""), Provider::Alpaca), None);
    }
}
