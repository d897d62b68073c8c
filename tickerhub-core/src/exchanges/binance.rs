//! Binance crypto connector
//!
//! Live prices come from the `<pair>@ticker` rolling 24h stream; latest
//! price and klines come from the public REST API. No credentials needed.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connector::{bounded_limit, log_fetch, Connector, ConnectorState, MonotonicGuard, OnMessage};
use super::errors::{ConnectorError, ConnectorResult, HTTP_TIMEOUT};
use super::rate_limit::RateLimiter;
use super::websocket::{self, Inbound, StreamSession, WsStream};
use crate::config::{BinanceConfig, Settings, StreamConfig};
use crate::market_data::classifier::{canonical_from_alias, resolve_alias, DEFAULT_CRYPTO_SYMBOLS};
use crate::market_data::{Bar, BarSeries, PriceUpdate, Provider, ProviderStatus, Symbol, Timeframe};

const MAX_KLINES: u32 = 1000;
const DEFAULT_LOOKBACK_DAYS: i64 = 30;

/// 24h rolling ticker event
#[derive(Deserialize, Debug, Clone)]
struct BinanceTicker {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    last_price: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "P")]
    price_change_percent: String,
    #[serde(rename = "b", default)]
    best_bid: Option<String>,
    #[serde(rename = "B", default)]
    best_bid_qty: Option<String>,
    #[serde(rename = "a", default)]
    best_ask: Option<String>,
    #[serde(rename = "A", default)]
    best_ask_qty: Option<String>,
}

#[derive(Deserialize, Debug)]
struct TickerPrice {
    price: String,
}

pub struct BinanceConnector {
    config: BinanceConfig,
    stream: StreamConfig,
    http: reqwest::Client,
    limiter: RateLimiter,
    state: ConnectorState,
    socket: Mutex<Option<WsStream>>,
    request_id: AtomicU64,
}

impl BinanceConnector {
    pub fn new(config: BinanceConfig, stream: StreamConfig, requests_per_minute: u32) -> ConnectorResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| ConnectorError::Configuration(e.to_string()))?;

        Ok(Self {
            config,
            stream,
            http,
            limiter: RateLimiter::per_minute(requests_per_minute),
            state: ConnectorState::new(Provider::Binance),
            socket: Mutex::new(None),
            request_id: AtomicU64::new(1),
        })
    }

    pub fn from_settings(settings: &Settings) -> ConnectorResult<Self> {
        Self::new(
            settings.binance.clone(),
            settings.stream.clone(),
            settings.rate_limits.binance_per_minute,
        )
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> ConnectorResult<T> {
        self.limiter.acquire().await;

        let url = format!("{}{}", self.config.rest_url.trim_end_matches('/'), path);
        let response = self.http.get(&url).query(query).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ConnectorError::Api { status: status.as_u16(), message });
        }

        Ok(response.json::<T>().await?)
    }

    async fn ping(&self) -> ConnectorResult<()> {
        let _: Value = self.get_json("/api/v3/ping", &[]).await?;
        Ok(())
    }

    async fn fetch_latest(&self, symbol: &Symbol) -> ConnectorResult<Option<PriceUpdate>> {
        let Some(alias) = resolve_alias(symbol, Provider::Binance) else {
            return Ok(None);
        };

        let ticker: TickerPrice = self
            .get_json("/api/v3/ticker/price", &[("symbol", alias.to_uppercase())])
            .await?;
        let price = parse_decimal(&ticker.price, "price")?;

        Ok(Some(PriceUpdate::new(symbol.normalized(), Provider::Binance, price, Utc::now())))
    }

    async fn fetch_klines(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: u32,
    ) -> ConnectorResult<Option<BarSeries>> {
        let Some(limit) = bounded_limit(Provider::Binance, limit, MAX_KLINES) else {
            return Ok(None);
        };
        let Some(alias) = resolve_alias(symbol, Provider::Binance) else {
            return Ok(None);
        };

        let start = start.unwrap_or_else(|| Utc::now() - ChronoDuration::days(DEFAULT_LOOKBACK_DAYS));
        let mut query = vec![
            ("symbol", alias.to_uppercase()),
            ("interval", interval(timeframe).to_string()),
            ("limit", limit.to_string()),
            ("startTime", start.timestamp_millis().to_string()),
        ];
        if let Some(end) = end {
            query.push(("endTime", end.timestamp_millis().to_string()));
        }

        let rows: Vec<Vec<Value>> = self.get_json("/api/v3/klines", &query).await?;
        let bars = rows
            .iter()
            .filter_map(|row| match parse_kline(row) {
                Ok(bar) => Some(bar),
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "skipping malformed kline");
                    None
                }
            })
            .collect();

        Ok(BarSeries::non_empty(symbol.normalized(), timeframe, bars))
    }

    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Diff the wanted streams against what the socket carries and send the delta
    async fn sync_subscriptions(&self, socket: &mut WsStream, streamed: &mut BTreeSet<String>) -> ConnectorResult<()> {
        let desired: BTreeSet<String> = self
            .state
            .subscriptions()
            .iter()
            .filter_map(|symbol| resolve_alias(symbol, Provider::Binance))
            .map(|alias| format!("{}@ticker", alias))
            .collect();

        let added: Vec<&String> = desired.difference(streamed).collect();
        let removed: Vec<&String> = streamed.difference(&desired).collect();

        if !added.is_empty() {
            let request = json!({ "method": "SUBSCRIBE", "params": added, "id": self.next_request_id() });
            websocket::send_json(socket, &request).await?;
            info!(provider = "binance", streams = added.len(), "subscribed");
        }
        if !removed.is_empty() {
            let request = json!({ "method": "UNSUBSCRIBE", "params": removed, "id": self.next_request_id() });
            websocket::send_json(socket, &request).await?;
            info!(provider = "binance", streams = removed.len(), "unsubscribed");
        }

        *streamed = desired;
        Ok(())
    }

    async fn dispatch(&self, text: &str, on_message: &OnMessage, guard: &mut MonotonicGuard) {
        match parse_ticker_event(text) {
            Ok(Some(update)) => {
                if guard.admit(&update) {
                    on_message(update).await;
                }
            }
            Ok(None) => {}
            Err(ConnectorError::Api { message, .. }) => {
                warn!(provider = "binance", error = %message, "stream request rejected");
                self.state.record_error(message);
            }
            Err(e) => debug!(provider = "binance", error = %e, "ignoring unparseable frame"),
        }
    }
}

#[async_trait]
impl StreamSession for BinanceConnector {
    fn state(&self) -> &ConnectorState {
        &self.state
    }

    fn stream_config(&self) -> &StreamConfig {
        &self.stream
    }

    async fn open_stream(&self) -> ConnectorResult<WsStream> {
        if let Some(socket) = self.socket.lock().await.take() {
            return Ok(socket);
        }
        websocket::open(&self.config.stream_url, self.stream.connect_timeout).await
    }

    async fn pump(
        &self,
        mut socket: WsStream,
        on_message: &OnMessage,
        cancel: &CancellationToken,
        guard: &mut MonotonicGuard,
    ) -> ConnectorResult<()> {
        let mut streamed = BTreeSet::new();
        self.sync_subscriptions(&mut socket, &mut streamed).await?;

        let mut ping = tokio::time::interval(self.stream.ping_interval);
        ping.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    websocket::close_quietly(socket).await;
                    return Ok(());
                }
                _ = self.state.subscriptions_changed() => {
                    self.sync_subscriptions(&mut socket, &mut streamed).await?;
                }
                _ = ping.tick() => {
                    websocket::send_ping(&mut socket).await?;
                }
                frame = websocket::next_frame(&mut socket) => {
                    if let Inbound::Text(text) = frame? {
                        self.dispatch(&text, on_message, guard).await;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Connector for BinanceConnector {
    fn provider(&self) -> Provider {
        Provider::Binance
    }

    async fn connect(&self) -> bool {
        if self.state.is_connected() {
            return true;
        }

        let session = async {
            self.ping().await?;
            websocket::open(&self.config.stream_url, self.stream.connect_timeout).await
        };

        match session.await {
            Ok(socket) => {
                *self.socket.lock().await = Some(socket);
                self.state.mark_connected();
                info!(provider = "binance", "connected");
                true
            }
            Err(e) => {
                warn!(provider = "binance", error = %e, "connect failed");
                self.state.mark_disconnected(Some(e.to_string()));
                false
            }
        }
    }

    async fn disconnect(&self) {
        self.state.release();
        if let Some(socket) = self.socket.lock().await.take() {
            websocket::close_quietly(socket).await;
        }
        info!(provider = "binance", "disconnected");
    }

    async fn subscribe(&self, symbols: &[Symbol]) {
        let (servable, rejected): (Vec<Symbol>, Vec<Symbol>) = symbols
            .iter()
            .map(Symbol::normalized)
            .partition(|s| resolve_alias(s, Provider::Binance).is_some());

        if !rejected.is_empty() {
            warn!(provider = "binance", symbols = ?rejected, "no Binance pair for symbols");
        }
        self.state.add_subscriptions(&servable);
    }

    async fn unsubscribe(&self, symbols: &[Symbol]) {
        let symbols: Vec<Symbol> = symbols.iter().map(Symbol::normalized).collect();
        self.state.remove_subscriptions(&symbols);
    }

    fn subscriptions(&self) -> BTreeSet<Symbol> {
        self.state.subscriptions()
    }

    async fn get_latest_price(&self, symbol: &Symbol) -> Option<PriceUpdate> {
        let result = self.fetch_latest(symbol).await;
        log_fetch(&self.state, "latest_price", symbol, result)
    }

    async fn get_historical_data(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Option<BarSeries> {
        let result = self.fetch_klines(symbol, timeframe, start, end, limit).await;
        log_fetch(&self.state, "historical_data", symbol, result)
    }

    async fn run_stream(&self, on_message: OnMessage, cancel: CancellationToken) -> ConnectorResult<()> {
        websocket::run_with_reconnect(self, on_message, cancel).await
    }

    fn status(&self) -> ProviderStatus {
        self.state.status(Provider::Binance.name())
    }

    fn supported_symbols(&self) -> Vec<Symbol> {
        DEFAULT_CRYPTO_SYMBOLS.iter().map(|s| Symbol::new(*s)).collect()
    }
}

fn interval(timeframe: Timeframe) -> &'static str {
    match timeframe {
        Timeframe::OneMinute => "1m",
        Timeframe::FiveMinutes => "5m",
        Timeframe::FifteenMinutes => "15m",
        Timeframe::OneHour => "1h",
        Timeframe::FourHours => "4h",
        Timeframe::OneDay => "1d",
    }
}

fn parse_decimal(raw: &str, field: &str) -> ConnectorResult<f64> {
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ConnectorError::Parse(format!("invalid {}: {:?}", field, raw)))
}

fn millis_to_utc(millis: i64) -> ConnectorResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| ConnectorError::Parse(format!("invalid timestamp: {}", millis)))
}

/// Normalize one stream frame. Acks and other event types yield `None`.
fn parse_ticker_event(text: &str) -> ConnectorResult<Option<PriceUpdate>> {
    let value: Value = serde_json::from_str(text)?;

    if let Some(error) = value.get("error") {
        return Err(ConnectorError::Api { status: 400, message: error.to_string() });
    }

    // Combined streams wrap the event as {"stream": ..., "data": {...}}
    let payload = value.get("data").unwrap_or(&value);
    if payload.get("e").and_then(Value::as_str) != Some("24hrTicker") {
        return Ok(None);
    }

    let ticker: BinanceTicker = serde_json::from_value(payload.clone())?;
    let Some(symbol) = canonical_from_alias(&ticker.symbol, Provider::Binance) else {
        debug!(pair = %ticker.symbol, "ticker for non-USDT pair");
        return Ok(None);
    };

    let price = parse_decimal(&ticker.last_price, "last price")?;
    if price <= 0.0 {
        return Ok(None);
    }

    let mut update = PriceUpdate::new(symbol, Provider::Binance, price, millis_to_utc(ticker.event_time)?)
        .with_volume(parse_decimal(&ticker.volume, "volume")?)
        .with_change_24h(parse_decimal(&ticker.price_change_percent, "price change")?);

    let side = |raw: &Option<String>| raw.as_deref().and_then(|v| v.parse::<f64>().ok());
    if let (Some(bid), Some(ask)) = (side(&ticker.best_bid), side(&ticker.best_ask)) {
        if bid > 0.0 && ask > 0.0 {
            update = update.with_quote(bid, ask, side(&ticker.best_bid_qty), side(&ticker.best_ask_qty));
        }
    }

    Ok(Some(update))
}

/// `[openTime, "open", "high", "low", "close", "volume", closeTime, ...]`
fn parse_kline(row: &[Value]) -> ConnectorResult<Bar> {
    let open_time = row
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| ConnectorError::Parse("kline missing open time".to_string()))?;
    let field = |index: usize, name: &str| -> ConnectorResult<f64> {
        let raw = row
            .get(index)
            .and_then(Value::as_str)
            .ok_or_else(|| ConnectorError::Parse(format!("kline missing {}", name)))?;
        parse_decimal(raw, name)
    };

    Bar::new(
        millis_to_utc(open_time)?,
        field(1, "open")?,
        field(2, "high")?,
        field(3, "low")?,
        field(4, "close")?,
        field(5, "volume")?,
    )
    .map_err(|e| ConnectorError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::ConnectionState;
    use futures_util::future::BoxFuture;
    use futures_util::SinkExt;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    fn connector() -> BinanceConnector {
        BinanceConnector::new(BinanceConfig::default(), StreamConfig::default(), 0).unwrap()
    }

    /// Connector whose REST calls would fail fast and record an error
    fn offline_connector() -> BinanceConnector {
        let config = BinanceConfig {
            rest_url: "http://127.0.0.1:9".to_string(),
            ..BinanceConfig::default()
        };
        BinanceConnector::new(config, StreamConfig::default(), 0).unwrap()
    }

    fn streaming_connector(stream_url: String) -> Arc<BinanceConnector> {
        let config = BinanceConfig { stream_url, ..BinanceConfig::default() };
        Arc::new(BinanceConnector::new(config, StreamConfig::default(), 0).unwrap())
    }

    /// Local ticker feed: completes the handshake after `handshake_delay`,
    /// then pushes a BTCUSDT ticker every 10ms until the client goes away
    async fn ticker_feed(handshake_delay: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                tokio::spawn(async move {
                    tokio::time::sleep(handshake_delay).await;
                    let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                        return;
                    };
                    let mut event_time: i64 = 1_700_000_000_000;
                    loop {
                        event_time += 1;
                        let frame = format!(
                            r#"{{"e":"24hrTicker","E":{},"s":"BTCUSDT","c":"64000.5","v":"12.0","P":"1.2"}}"#,
                            event_time
                        );
                        if ws.send(Message::Text(frame)).await.is_err() {
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                });
            }
        });

        format!("ws://{}", addr)
    }

    fn counting_sink(received: Arc<AtomicUsize>) -> OnMessage {
        Arc::new(move |_update: PriceUpdate| -> BoxFuture<'static, ()> {
            received.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        })
    }

    async fn wait_for(received: &AtomicUsize, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while received.load(Ordering::SeqCst) < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("feed never delivered");
    }

    #[test]
    fn test_parse_ticker_event() {
        let frame = r#"{
            "e": "24hrTicker", "E": 1672515782136, "s": "BTCUSDT",
            "p": "120.00", "P": "0.725", "w": "16500.00", "c": "16569.01",
            "Q": "0.014", "b": "16569.00", "B": "1.20", "a": "16569.02", "A": "0.80",
            "o": "16449.01", "h": "16600.00", "l": "16400.00", "v": "18151.04"
        }"#;

        let update = parse_ticker_event(frame).unwrap().unwrap();
        assert_eq!(update.symbol, Symbol::new("BTC-USD"));
        assert_eq!(update.provider, Provider::Binance);
        assert!((update.price - 16569.01).abs() < 1e-9);
        assert_eq!(update.bid, Some(16569.00));
        assert_eq!(update.ask, Some(16569.02));
        assert_eq!(update.bid_size, Some(1.20));
        assert_eq!(update.volume, Some(18151.04));
        assert_eq!(update.change_24h, Some(0.725));
        assert_eq!(update.timestamp.timestamp_millis(), 1672515782136);
    }

    #[test]
    fn test_parse_combined_stream_wrapper() {
        let frame = r#"{"stream":"ethusdt@ticker","data":{"e":"24hrTicker","E":1,"s":"ETHUSDT","c":"1200.5","v":"10","P":"-1.5"}}"#;
        let update = parse_ticker_event(frame).unwrap().unwrap();
        assert_eq!(update.symbol, Symbol::new("ETH-USD"));
        assert_eq!(update.bid, None);
        assert_eq!(update.change_24h, Some(-1.5));
    }

    #[test]
    fn test_acks_and_other_events_are_skipped() {
        assert!(parse_ticker_event(r#"{"result":null,"id":1}"#).unwrap().is_none());
        assert!(parse_ticker_event(r#"{"e":"trade","s":"BTCUSDT"}"#).unwrap().is_none());
        assert!(parse_ticker_event(r#"{"e":"24hrTicker","E":1,"s":"ETHBTC","c":"0.07","v":"1","P":"0"}"#)
            .unwrap()
            .is_none());
        assert!(matches!(
            parse_ticker_event(r#"{"error":{"code":2,"msg":"Invalid request"},"id":3}"#),
            Err(ConnectorError::Api { .. })
        ));
        assert!(parse_ticker_event("not json").is_err());
    }

    #[test]
    fn test_parse_kline_row() {
        let row: Vec<Value> = serde_json::from_str(
            r#"[1499040000000,"0.01634790","0.80000000","0.01575800","0.01577100","148976.11427815",1499644799999,"2434.19055334",308,"1756.87402397","28.46694368","0"]"#,
        )
        .unwrap();

        let bar = parse_kline(&row).unwrap();
        assert_eq!(bar.timestamp.timestamp_millis(), 1499040000000);
        assert!((bar.high - 0.8).abs() < 1e-12);
        assert!((bar.volume - 148976.11427815).abs() < 1e-6);

        let broken: Vec<Value> = serde_json::from_str(r#"[1499040000000,"1.0","0.5","0.9","1.0","1"]"#).unwrap();
        assert!(parse_kline(&broken).is_err());
    }

    #[test]
    fn test_interval_mapping() {
        assert_eq!(interval(Timeframe::OneMinute), "1m");
        assert_eq!(interval(Timeframe::FourHours), "4h");
        assert_eq!(interval(Timeframe::OneDay), "1d");
    }

    #[tokio::test]
    async fn test_subscriptions_filter_unservable_symbols() {
        let connector = connector();
        connector
            .subscribe(&[Symbol::new("BTC-USD"), Symbol::new("AAPL"), Symbol::new("eth-usd")])
            .await;
        connector.subscribe(&[Symbol::new("BTC-USD")]).await;

        let subscribed: Vec<Symbol> = connector.subscriptions().into_iter().collect();
        assert_eq!(subscribed, vec![Symbol::new("BTC-USD"), Symbol::new("ETH-USD")]);

        connector.unsubscribe(&[Symbol::new("BTC-USD"), Symbol::new("SOL-USD")]).await;
        assert_eq!(connector.subscriptions().len(), 1);
    }

    #[tokio::test]
    async fn test_unservable_symbol_needs_no_request() {
        let connector = connector();
        assert!(connector.get_latest_price(&Symbol::new("AAPL")).await.is_none());
        assert!(connector
            .get_historical_data(&Symbol::new("AAPL"), Timeframe::OneDay, None, None, 10)
            .await
            .is_none());
        assert_eq!(connector.status().last_error, None);
    }

    #[tokio::test]
    async fn test_initial_status_and_disconnect() {
        let connector = connector();
        let status = connector.status();
        assert_eq!(status.name, "binance");
        assert_eq!(status.state, ConnectionState::Uninitialized);
        assert!(!connector.is_connected());

        connector.disconnect().await;
        assert_eq!(connector.status().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_zero_bar_limit_needs_no_request() {
        let connector = offline_connector();
        let bars = connector
            .get_historical_data(&Symbol::new("BTC-USD"), Timeframe::OneDay, None, None, 0)
            .await;
        assert!(bars.is_none());
        assert_eq!(connector.status().last_error, None);
    }

    #[tokio::test]
    async fn test_disconnect_stops_live_stream() {
        let connector = streaming_connector(ticker_feed(Duration::ZERO).await);
        connector.subscribe(&[Symbol::new("BTC-USD")]).await;

        let received = Arc::new(AtomicUsize::new(0));
        let stream = {
            let connector = connector.clone();
            let sink = counting_sink(received.clone());
            tokio::spawn(async move { connector.run_stream(sink, CancellationToken::new()).await })
        };

        wait_for(&received, 3).await;
        assert!(connector.is_connected());

        connector.disconnect().await;
        let at_disconnect = received.load(Ordering::SeqCst);

        let result = tokio::time::timeout(Duration::from_secs(5), stream)
            .await
            .expect("stream kept running after disconnect")
            .unwrap();
        assert!(result.is_ok());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(received.load(Ordering::SeqCst), at_disconnect);
        assert!(!connector.is_connected());
        assert_eq!(connector.status().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_shutdown_while_stream_opens_stays_disconnected() {
        // Handshake completes well after cancel and disconnect
        let connector = streaming_connector(ticker_feed(Duration::from_millis(400)).await);
        connector.subscribe(&[Symbol::new("BTC-USD")]).await;

        let received = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let stream = {
            let connector = connector.clone();
            let sink = counting_sink(received.clone());
            let cancel = cancel.clone();
            tokio::spawn(async move { connector.run_stream(sink, cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        connector.disconnect().await;

        let result = tokio::time::timeout(Duration::from_secs(2), stream)
            .await
            .expect("stream ignored cancellation while opening")
            .unwrap();
        assert!(result.is_ok());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!connector.is_connected());
        assert_eq!(connector.status().state, ConnectionState::Disconnected);
        assert_eq!(received.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_stream_reports_disconnected() {
        let connector = streaming_connector(ticker_feed(Duration::ZERO).await);
        connector.subscribe(&[Symbol::new("BTC-USD")]).await;

        let received = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let stream = {
            let connector = connector.clone();
            let sink = counting_sink(received.clone());
            let cancel = cancel.clone();
            tokio::spawn(async move { connector.run_stream(sink, cancel).await })
        };

        wait_for(&received, 1).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), stream).await.unwrap().unwrap();

        assert!(result.is_ok());
        assert!(!connector.is_connected());
    }
}
