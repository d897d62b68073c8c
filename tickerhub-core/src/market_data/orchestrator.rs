//! Data orchestrator: one entry point over every provider
//!
//! Owns the connectors, routes requests by symbol category, keeps the latest
//! price per symbol and fans updates out to registered callbacks. One value
//! of this type is one session: build it, `initialize`, use it, `shutdown`.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::classifier::SymbolClassifier;
use super::fanout::{CallbackId, FeedStatistics, UpdateCallback, UpdateRouter};
use super::types::{BarSeries, MarketCategory, PriceUpdate, Provider, ProviderStatus, Symbol, Timeframe};
use crate::config::Settings;
use crate::exchanges::{Connector, ConnectorRegistry, OnMessage};

pub struct DataOrchestrator {
    settings: Settings,
    classifier: SymbolClassifier,
    registry: ConnectorRegistry,
    connectors: RwLock<BTreeMap<MarketCategory, Arc<dyn Connector>>>,
    /// Providers whose construction failed, with the reason
    unavailable: RwLock<BTreeMap<String, String>>,
    router: UpdateRouter,
    shutdown: CancellationToken,
}

impl DataOrchestrator {
    /// Default providers and symbol tables
    pub fn new(settings: Settings) -> Self {
        Self::with_registry(settings, ConnectorRegistry::with_defaults(), SymbolClassifier::new())
    }

    pub fn with_registry(settings: Settings, registry: ConnectorRegistry, classifier: SymbolClassifier) -> Self {
        Self {
            settings,
            classifier,
            registry,
            connectors: RwLock::new(BTreeMap::new()),
            unavailable: RwLock::new(BTreeMap::new()),
            router: UpdateRouter::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn classifier(&self) -> &SymbolClassifier {
        &self.classifier
    }

    /// Build and connect every registered provider.
    ///
    /// Each provider succeeds or fails on its own; zero connected providers
    /// is a degraded state, not an error. Returns how many connected.
    pub async fn initialize(&self) -> usize {
        if !self.connectors.read().is_empty() {
            debug!("orchestrator already initialized");
            return self.connected_count();
        }

        let mut built = Vec::new();
        for (category, name, result) in self.registry.build_all(&self.settings) {
            match result {
                Ok(connector) => built.push((category, connector)),
                Err(e) => {
                    warn!(provider = %name, %category, error = %e, "provider unavailable");
                    self.unavailable.write().insert(name, e.to_string());
                }
            }
        }

        let attempts = built.iter().map(|(_, connector)| {
            let connector = connector.clone();
            async move { connector.connect().await }
        });
        let outcomes = join_all(attempts).await;

        let mut connected = 0;
        for ((category, connector), ok) in built.into_iter().zip(outcomes) {
            if ok {
                connected += 1;
                info!(provider = connector.name(), %category, "provider connected");
            } else {
                warn!(
                    provider = connector.name(),
                    %category,
                    error = ?connector.status().last_error,
                    "provider failed to connect"
                );
            }
            self.connectors.write().insert(category, connector);
        }

        if connected == 0 {
            warn!("no providers connected, running degraded");
        } else {
            info!(connected, "orchestrator initialized");
        }
        connected
    }

    fn route(&self, category: MarketCategory) -> Option<Arc<dyn Connector>> {
        self.connectors
            .read()
            .get(&category)
            .filter(|connector| connector.is_connected())
            .cloned()
    }

    fn all_connectors(&self) -> Vec<Arc<dyn Connector>> {
        self.connectors.read().values().cloned().collect()
    }

    fn connected_count(&self) -> usize {
        self.connectors.read().values().filter(|c| c.is_connected()).count()
    }

    /// Route each symbol to its category's connector. Symbols without a
    /// connected connector are dropped.
    pub async fn subscribe_symbols(&self, symbols: &[Symbol]) {
        let symbols = normalize_all(symbols);
        for (category, group) in self.classifier.partition(&symbols) {
            match self.route(category) {
                Some(connector) => {
                    debug!(provider = connector.name(), count = group.len(), "subscribing");
                    connector.subscribe(&group).await;
                }
                None => info!(%category, symbols = ?group, "no connected provider, dropping symbols"),
            }
        }
    }

    pub async fn unsubscribe_symbols(&self, symbols: &[Symbol]) {
        let symbols = normalize_all(symbols);
        for (category, group) in self.classifier.partition(&symbols) {
            if let Some(connector) = self.route(category) {
                connector.unsubscribe(&group).await;
            }
        }
    }

    /// Cached update if present, otherwise one pull from the provider.
    /// Pulled prices are not written to the cache.
    pub async fn get_latest_price(&self, symbol: &Symbol) -> Option<PriceUpdate> {
        let symbol = symbol.normalized();
        if let Some(cached) = self.cached_price(&symbol) {
            return Some(cached);
        }

        let connector = self.route(self.classifier.classify(&symbol))?;
        connector.get_latest_price(&symbol).await
    }

    /// Labels outside the supported set fall back to daily bars
    pub async fn get_historical_data(
        &self,
        symbol: &Symbol,
        timeframe: impl Into<Timeframe>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Option<BarSeries> {
        let timeframe = timeframe.into();
        let symbol = symbol.normalized();
        let connector = self.route(self.classifier.classify(&symbol))?;
        connector
            .get_historical_data(&symbol, timeframe, start, end, limit)
            .await
    }

    pub fn register_update_callback(&self, callback: UpdateCallback) -> CallbackId {
        self.router.register(callback)
    }

    pub fn unregister_update_callback(&self, id: CallbackId) -> bool {
        self.router.unregister(id)
    }

    pub fn callback_count(&self) -> usize {
        self.router.callback_count()
    }

    /// Stream sink for `provider`: cache write, then callbacks
    pub(crate) fn price_sink(&self, provider: Provider) -> OnMessage {
        self.router.sink_for(provider)
    }

    /// Run every provider's stream until shutdown.
    ///
    /// Providers whose first connect failed are started too; their reconnect
    /// loop keeps retrying. A stream that fails or panics is logged and the
    /// others keep running.
    pub async fn start_streams(&self) {
        if self.is_shut_down() {
            debug!("orchestrator shut down, not starting streams");
            return;
        }

        let connectors = self.all_connectors();
        if connectors.is_empty() {
            warn!("no providers, nothing to stream");
            return;
        }

        let tasks = connectors.into_iter().map(|connector| {
            let name = connector.name().to_string();
            if !connector.is_connected() {
                info!(provider = %name, "provider not connected, stream will retry");
            }
            let on_message = self.price_sink(connector.provider());
            let cancel = self.shutdown.child_token();
            info!(provider = %name, "starting stream");
            let handle = tokio::spawn(async move { connector.run_stream(on_message, cancel).await });
            async move { (name, handle.await) }
        });

        for (name, outcome) in join_all(tasks).await {
            match outcome {
                Ok(Ok(())) => info!(provider = %name, "stream finished"),
                Ok(Err(e)) => error!(provider = %name, error = %e, "stream failed"),
                Err(e) if e.is_panic() => error!(provider = %name, "stream task panicked"),
                Err(e) => warn!(provider = %name, error = %e, "stream task aborted"),
            }
        }
    }

    /// Stop all streams, then disconnect every provider. Never fails.
    pub async fn shutdown(&self) {
        info!("shutting down orchestrator");
        self.shutdown.cancel();

        for connector in self.all_connectors() {
            let name = connector.name().to_string();
            if AssertUnwindSafe(connector.disconnect()).catch_unwind().await.is_err() {
                error!(provider = %name, "disconnect panicked");
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled by [`shutdown`](Self::shutdown)
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Provider name → currently connected
    pub fn get_provider_status(&self) -> BTreeMap<String, bool> {
        let mut status: BTreeMap<String, bool> = self
            .unavailable
            .read()
            .keys()
            .map(|name| (name.clone(), false))
            .collect();
        for connector in self.all_connectors() {
            status.insert(connector.name().to_string(), connector.is_connected());
        }
        status
    }

    pub fn provider_health(&self) -> Vec<ProviderStatus> {
        let mut health: Vec<ProviderStatus> = self
            .unavailable
            .read()
            .iter()
            .map(|(name, reason)| ProviderStatus::unavailable(name.clone(), reason.clone()))
            .collect();
        health.extend(self.all_connectors().iter().map(|connector| connector.status()));
        health.sort_by(|a, b| a.name.cmp(&b.name));
        health
    }

    pub fn subscriptions(&self) -> BTreeMap<String, BTreeSet<Symbol>> {
        self.all_connectors()
            .iter()
            .map(|connector| (connector.name().to_string(), connector.subscriptions()))
            .collect()
    }

    /// Latest streamed update for one symbol, without touching providers
    pub fn cached_price(&self, symbol: &Symbol) -> Option<PriceUpdate> {
        self.router.cache().get(&symbol.normalized())
    }

    pub fn get_all_prices(&self) -> BTreeMap<Symbol, PriceUpdate> {
        self.router.cache().snapshot()
    }

    pub fn feed_statistics(&self) -> Vec<(Provider, FeedStatistics)> {
        self.router.statistics()
    }
}

fn normalize_all(symbols: &[Symbol]) -> Vec<Symbol> {
    symbols
        .iter()
        .map(Symbol::normalized)
        .filter(|symbol| !symbol.is_empty())
        .collect()
}
