//! Provider connector contract and shared connector bookkeeping

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::errors::ConnectorResult;
use crate::market_data::{
    BarSeries, ConnectionState, MarketCategory, PriceUpdate, Provider, ProviderStatus, Symbol,
    Timeframe,
};

/// Sink a live stream pushes normalized updates into
pub type OnMessage = Arc<dyn Fn(PriceUpdate) -> BoxFuture<'static, ()> + Send + Sync>;

/// Adapter for one upstream data provider.
///
/// Fetch failures surface as `false`/`None` and are logged by the
/// connector; only `run_stream` reports errors to the caller.
#[async_trait]
pub trait Connector: Send + Sync {
    fn provider(&self) -> Provider;

    fn name(&self) -> &str {
        self.provider().name()
    }

    fn category(&self) -> MarketCategory {
        self.provider().category()
    }

    /// Establish the session. Idempotent once connected.
    async fn connect(&self) -> bool;

    /// Release the session. Never fails.
    async fn disconnect(&self);

    /// Add symbols to the subscription set
    async fn subscribe(&self, symbols: &[Symbol]);

    /// Remove symbols from the subscription set
    async fn unsubscribe(&self, symbols: &[Symbol]);

    fn subscriptions(&self) -> BTreeSet<Symbol>;

    async fn get_latest_price(&self, symbol: &Symbol) -> Option<PriceUpdate>;

    /// Bars in `[start, end]`; `start` defaults to 30 days ago, `end` to now
    async fn get_historical_data(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Option<BarSeries>;

    /// Long-lived receive loop. Returns `Ok(())` on cancellation.
    async fn run_stream(&self, on_message: OnMessage, cancel: CancellationToken) -> ConnectorResult<()>;

    fn status(&self) -> ProviderStatus;

    fn is_connected(&self) -> bool {
        self.status().connected
    }

    fn supported_symbols(&self) -> Vec<Symbol> {
        Vec::new()
    }

    fn supported_timeframes(&self) -> &'static [Timeframe] {
        &Timeframe::ALL
    }
}

#[derive(Debug)]
struct Health {
    state: ConnectionState,
    last_error: Option<String>,
    /// Cancels the running stream loop, tagged with the loop's lease id
    stream: Option<(u64, CancellationToken)>,
}

/// Connection state, last error and subscription set for one connector.
///
/// Subscription changes wake the stream loop so it can resync with the
/// provider.
#[derive(Debug)]
pub struct ConnectorState {
    provider: Provider,
    health: RwLock<Health>,
    subscriptions: RwLock<BTreeSet<Symbol>>,
    changed: Notify,
    next_lease: AtomicU64,
}

impl ConnectorState {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            health: RwLock::new(Health {
                state: ConnectionState::Uninitialized,
                last_error: None,
                stream: None,
            }),
            subscriptions: RwLock::new(BTreeSet::new()),
            changed: Notify::new(),
            next_lease: AtomicU64::new(1),
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn mark_connected(&self) {
        let mut health = self.health.write();
        health.state = ConnectionState::Connected;
        health.last_error = None;
    }

    pub fn mark_disconnected(&self, error: Option<String>) {
        let mut health = self.health.write();
        health.state = ConnectionState::Disconnected;
        if error.is_some() {
            health.last_error = error;
        }
    }

    /// Register a running stream loop. The returned token is cancelled by
    /// `parent` or by [`release`](Self::release), whichever comes first.
    pub fn attach_stream(&self, parent: &CancellationToken) -> (u64, CancellationToken) {
        let lease = self.next_lease.fetch_add(1, Ordering::Relaxed);
        let token = parent.child_token();
        if let Some((_, previous)) = self.health.write().stream.replace((lease, token.clone())) {
            previous.cancel();
        }
        (lease, token)
    }

    pub fn detach_stream(&self, lease: u64) {
        let mut health = self.health.write();
        if matches!(health.stream, Some((current, _)) if current == lease) {
            health.stream = None;
        }
    }

    /// Mark connected unless the stream was cancelled first. Checked under
    /// the same lock `release` takes, so a concurrent disconnect always wins.
    pub fn mark_stream_live(&self, cancel: &CancellationToken) -> bool {
        let mut health = self.health.write();
        if cancel.is_cancelled() {
            return false;
        }
        health.state = ConnectionState::Connected;
        health.last_error = None;
        true
    }

    /// Stop the running stream loop, if any, and mark disconnected
    pub fn release(&self) {
        let mut health = self.health.write();
        if let Some((_, token)) = health.stream.take() {
            token.cancel();
        }
        health.state = ConnectionState::Disconnected;
    }

    /// Record a non-fatal error without changing the connection state
    pub fn record_error(&self, error: impl Into<String>) {
        self.health.write().last_error = Some(error.into());
    }

    pub fn state(&self) -> ConnectionState {
        self.health.read().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn status(&self, name: &str) -> ProviderStatus {
        let health = self.health.read();
        ProviderStatus {
            name: name.to_string(),
            state: health.state,
            connected: health.state == ConnectionState::Connected,
            last_error: health.last_error.clone(),
        }
    }

    /// Returns the symbols that were not already present
    pub fn add_subscriptions(&self, symbols: &[Symbol]) -> Vec<Symbol> {
        let added: Vec<Symbol> = {
            let mut subscriptions = self.subscriptions.write();
            symbols
                .iter()
                .filter(|s| subscriptions.insert((*s).clone()))
                .cloned()
                .collect()
        };
        if !added.is_empty() {
            debug!(provider = %self.provider, count = added.len(), "subscriptions added");
            self.changed.notify_one();
        }
        added
    }

    /// Returns the symbols that were actually removed
    pub fn remove_subscriptions(&self, symbols: &[Symbol]) -> Vec<Symbol> {
        let removed: Vec<Symbol> = {
            let mut subscriptions = self.subscriptions.write();
            symbols
                .iter()
                .filter(|s| subscriptions.remove(*s))
                .cloned()
                .collect()
        };
        if !removed.is_empty() {
            debug!(provider = %self.provider, count = removed.len(), "subscriptions removed");
            self.changed.notify_one();
        }
        removed
    }

    pub fn subscriptions(&self) -> BTreeSet<Symbol> {
        self.subscriptions.read().clone()
    }

    /// Resolves after the next subscription change
    pub async fn subscriptions_changed(&self) {
        self.changed.notified().await
    }
}

/// Drops events older than the last one emitted for the same symbol
#[derive(Debug, Default)]
pub struct MonotonicGuard {
    last_seen: HashMap<Symbol, DateTime<Utc>>,
}

impl MonotonicGuard {
    pub fn admit(&mut self, update: &PriceUpdate) -> bool {
        match self.last_seen.get(&update.symbol) {
            Some(last) if update.timestamp < *last => {
                debug!(symbol = %update.symbol, "dropping out-of-order update");
                false
            }
            _ => {
                self.last_seen.insert(update.symbol.clone(), update.timestamp);
                true
            }
        }
    }
}

/// Bar count to request. Zero asks for nothing; oversized limits are capped.
pub(crate) fn bounded_limit(provider: Provider, limit: u32, max: u32) -> Option<u32> {
    if limit == 0 {
        debug!(%provider, "bar limit of zero, skipping request");
        return None;
    }
    if limit > max {
        debug!(%provider, limit, max, "bar limit capped");
    }
    Some(limit.min(max))
}

/// Collapse a fetch result into the optional form the contract exposes
pub(crate) fn log_fetch<T>(
    state: &ConnectorState,
    operation: &str,
    symbol: &Symbol,
    result: ConnectorResult<Option<T>>,
) -> Option<T> {
    match result {
        Ok(value) => {
            if value.is_none() {
                debug!(provider = %state.provider, operation, symbol = %symbol, "no data");
            }
            value
        }
        Err(e) => {
            warn!(provider = %state.provider, operation, symbol = %symbol, error = %e, "request failed");
            state.record_error(e.to_string());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_subscription_set_semantics() {
        let state = ConnectorState::new(Provider::Binance);
        let btc = Symbol::new("BTC-USD");
        let eth = Symbol::new("ETH-USD");

        assert_eq!(state.add_subscriptions(&[btc.clone(), eth.clone()]).len(), 2);
        assert!(state.add_subscriptions(&[btc.clone()]).is_empty());
        assert_eq!(state.subscriptions().len(), 2);

        assert_eq!(state.remove_subscriptions(&[btc.clone(), btc.clone()]), vec![btc.clone()]);
        assert!(state.remove_subscriptions(&[btc]).is_empty());
        assert_eq!(state.subscriptions().into_iter().collect::<Vec<_>>(), vec![eth]);
    }

    #[tokio::test]
    async fn test_change_notification_is_not_lost() {
        let state = ConnectorState::new(Provider::Alpaca);
        state.add_subscriptions(&[Symbol::new("AAPL")]);

        // Permit stored even though nobody was waiting yet
        tokio::time::timeout(std::time::Duration::from_secs(1), state.subscriptions_changed())
            .await
            .expect("notification should be pending");
    }

    #[test]
    fn test_health_transitions() {
        let state = ConnectorState::new(Provider::Alpaca);
        assert_eq!(state.state(), ConnectionState::Uninitialized);

        state.mark_connected();
        assert!(state.status("alpaca").connected);

        state.mark_disconnected(Some("socket reset".to_string()));
        let status = state.status("alpaca");
        assert!(!status.connected);
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.last_error.as_deref(), Some("socket reset"));

        state.mark_connected();
        assert_eq!(state.status("alpaca").last_error, None);
    }

    #[test]
    fn test_release_cancels_attached_stream() {
        let state = ConnectorState::new(Provider::Binance);
        let parent = CancellationToken::new();
        let (lease, token) = state.attach_stream(&parent);

        assert!(state.mark_stream_live(&token));
        state.release();
        assert!(token.is_cancelled());
        assert!(!parent.is_cancelled());
        assert_eq!(state.state(), ConnectionState::Disconnected);

        // A stream that finishes opening after release stays down
        assert!(!state.mark_stream_live(&token));
        assert!(!state.is_connected());
        state.detach_stream(lease);
    }

    #[test]
    fn test_parent_cancel_reaches_stream_token() {
        let state = ConnectorState::new(Provider::Alpaca);
        let parent = CancellationToken::new();
        let (first, _) = state.attach_stream(&parent);
        let (_, token) = state.attach_stream(&parent);

        // Stale lease does not drop the newer registration
        state.detach_stream(first);
        parent.cancel();
        assert!(token.is_cancelled());
        assert!(!state.mark_stream_live(&token));
    }

    #[test]
    fn test_bounded_limit() {
        assert_eq!(bounded_limit(Provider::Binance, 0, 1000), None);
        assert_eq!(bounded_limit(Provider::Binance, 50, 1000), Some(50));
        assert_eq!(bounded_limit(Provider::Alpaca, 20_000, 10_000), Some(10_000));
    }

    #[test]
    fn test_monotonic_guard() {
        let mut guard = MonotonicGuard::default();
        let now = Utc::now();
        let symbol = Symbol::new("BTC-USD");

        let fresh = PriceUpdate::new(symbol.clone(), Provider::Binance, 1.0, now);
        let stale = PriceUpdate::new(symbol.clone(), Provider::Binance, 2.0, now - Duration::seconds(1));
        let same = PriceUpdate::new(symbol, Provider::Binance, 3.0, now);

        assert!(guard.admit(&fresh));
        assert!(!guard.admit(&stale));
        assert!(guard.admit(&same));
    }
}
