//! Price update routing: cache write followed by callback fan-out

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::cache::PriceCache;
use super::types::{PriceUpdate, Provider};
use crate::exchanges::connector::OnMessage;

/// Subscriber invoked for every accepted price update
pub type UpdateCallback = Arc<dyn Fn(PriceUpdate) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as an [`UpdateCallback`]
pub fn callback<F, Fut>(f: F) -> UpdateCallback
where
    F: Fn(PriceUpdate) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |update| Box::pin(f(update)))
}

/// Handle returned on callback registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallbackId(Uuid);

impl CallbackId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-provider feed counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedStatistics {
    pub messages_received: u64,
    pub messages_rejected: u64,
    pub callback_failures: u64,
    pub last_update: Option<DateTime<Utc>>,
}

/// Single mutation point for the price cache.
///
/// Callbacks run sequentially in registration order; a failing or panicking
/// callback is logged and the rest still run.
#[derive(Clone)]
pub(crate) struct UpdateRouter {
    cache: Arc<PriceCache>,
    callbacks: Arc<RwLock<Vec<(CallbackId, UpdateCallback)>>>,
    stats: Arc<DashMap<Provider, FeedStatistics>>,
}

impl UpdateRouter {
    pub fn new() -> Self {
        Self {
            cache: Arc::new(PriceCache::new()),
            callbacks: Arc::new(RwLock::new(Vec::new())),
            stats: Arc::new(DashMap::new()),
        }
    }

    pub fn cache(&self) -> &PriceCache {
        &self.cache
    }

    pub fn register(&self, callback: UpdateCallback) -> CallbackId {
        let id = CallbackId::new();
        self.callbacks.write().push((id, callback));
        id
    }

    pub fn unregister(&self, id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.read().len()
    }

    pub fn statistics(&self) -> Vec<(Provider, FeedStatistics)> {
        let mut stats: Vec<_> = self
            .stats
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        stats.sort_by_key(|(provider, _)| *provider);
        stats
    }

    /// Returns `false` when the update was discarded
    pub async fn handle_price_update(&self, update: PriceUpdate) -> bool {
        if update.symbol.is_empty() {
            debug!(provider = %update.provider, "discarding update without symbol");
            self.stats.entry(update.provider).or_default().messages_rejected += 1;
            return false;
        }

        {
            let mut stats = self.stats.entry(update.provider).or_default();
            stats.messages_received += 1;
            stats.last_update = Some(update.timestamp);
        }

        self.cache.insert(update.clone());

        let callbacks: Vec<(CallbackId, UpdateCallback)> = self.callbacks.read().clone();
        for (id, callback) in callbacks {
            let delivery = {
                let update = update.clone();
                async move { callback(update).await }
            };

            match AssertUnwindSafe(delivery).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(callback = %id, symbol = %update.symbol, error = %e, "update callback failed");
                    self.stats.entry(update.provider).or_default().callback_failures += 1;
                }
                Err(_) => {
                    error!(callback = %id, symbol = %update.symbol, "update callback panicked");
                    self.stats.entry(update.provider).or_default().callback_failures += 1;
                }
            }
        }

        true
    }

    /// Message sink for one connector's stream.
    ///
    /// Updates tagged with a different provider are rejected.
    pub fn sink_for(&self, provider: Provider) -> OnMessage {
        let router = self.clone();
        Arc::new(move |update: PriceUpdate| {
            let router = router.clone();
            Box::pin(async move {
                if update.provider != provider {
                    warn!(
                        expected = %provider,
                        actual = %update.provider,
                        symbol = %update.symbol,
                        "discarding update with mismatched provider tag"
                    );
                    router.stats.entry(provider).or_default().messages_rejected += 1;
                    return;
                }
                router.handle_price_update(update).await;
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::types::Symbol;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn update(symbol: &str, price: f64) -> PriceUpdate {
        PriceUpdate::new(Symbol::new(symbol), Provider::Binance, price, Utc::now())
    }

    #[tokio::test]
    async fn test_cache_written_before_callbacks() {
        let router = UpdateRouter::new();
        let observer = router.clone();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();

        router.register(callback(move |u: PriceUpdate| {
            let cached = observer.cache().get(&u.symbol).map(|c| c.price);
            sink.lock().push(cached);
            async { Ok(()) }
        }));

        assert!(router.handle_price_update(update("BTC-USD", 42_000.0)).await);
        assert_eq!(*seen.lock(), vec![Some(42_000.0)]);
    }

    #[tokio::test]
    async fn test_callbacks_run_in_registration_order() {
        let router = UpdateRouter::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            router.register(callback(move |_u: PriceUpdate| {
                let order = order.clone();
                async move {
                    order.lock().push(tag);
                    Ok(())
                }
            }));
        }

        router.handle_price_update(update("ETH-USD", 3_000.0)).await;
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_failing_callbacks_are_isolated() {
        let router = UpdateRouter::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        router.register(callback(|_u: PriceUpdate| async { Err(anyhow::anyhow!("subscriber down")) }));
        router.register(callback(|u: PriceUpdate| async move {
            assert!(u.price < 0.0, "subscriber bug");
            Ok(())
        }));
        let counter = delivered.clone();
        router.register(callback(move |_u: PriceUpdate| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));

        assert!(router.handle_price_update(update("SOL-USD", 150.0)).await);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);

        let stats = router.statistics();
        assert_eq!(stats[0].1.callback_failures, 2);
        assert_eq!(stats[0].1.messages_received, 1);
    }

    #[tokio::test]
    async fn test_empty_symbol_is_discarded() {
        let router = UpdateRouter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        router.register(callback(move |_u: PriceUpdate| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        }));

        assert!(!router.handle_price_update(update("", 1.0)).await);
        assert!(router.cache().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sink_rejects_foreign_provider_tag() {
        let router = UpdateRouter::new();
        let sink = router.sink_for(Provider::Alpaca);

        sink(update("BTC-USD", 1.0)).await;
        assert!(router.cache().is_empty());

        let equity = PriceUpdate::new(Symbol::new("AAPL"), Provider::Alpaca, 190.0, Utc::now());
        sink(equity.clone()).await;
        assert_eq!(router.cache().get(&Symbol::new("AAPL")), Some(equity));
    }

    #[tokio::test]
    async fn test_unregister_stops_delivery() {
        let router = UpdateRouter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = router.register(callback(move |_u: PriceUpdate| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        }));

        router.handle_price_update(update("BTC-USD", 1.0)).await;
        assert!(router.unregister(id));
        assert!(!router.unregister(id));
        router.handle_price_update(update("BTC-USD", 2.0)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(router.callback_count(), 0);
    }
}
