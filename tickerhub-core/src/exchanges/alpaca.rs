//! Alpaca equity connector
//!
//! Stream: authenticated market-data WebSocket carrying quote (`q`) and
//! trade (`t`) messages in JSON arrays. REST: latest quote/trade and bars
//! from the data API. Quotes are priced at the bid/ask midpoint.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connector::{bounded_limit, log_fetch, Connector, ConnectorState, MonotonicGuard, OnMessage};
use super::errors::{ConnectorError, ConnectorResult, HTTP_TIMEOUT};
use super::rate_limit::RateLimiter;
use super::websocket::{self, Inbound, StreamSession, WsStream};
use crate::config::{AlpacaConfig, Settings, StreamConfig};
use crate::market_data::classifier::{canonical_from_alias, resolve_alias, DEFAULT_EQUITY_SYMBOLS};
use crate::market_data::{Bar, BarSeries, PriceUpdate, Provider, ProviderStatus, Symbol, Timeframe};

const MAX_BARS: u32 = 10_000;
const DEFAULT_LOOKBACK_DAYS: i64 = 30;

#[derive(Deserialize, Debug, Clone, PartialEq)]
struct QuoteMessage {
    #[serde(rename = "S")]
    symbol: String,
    #[serde(rename = "bp")]
    bid_price: f64,
    #[serde(rename = "bs", default)]
    bid_size: f64,
    #[serde(rename = "ap")]
    ask_price: f64,
    #[serde(rename = "as", default)]
    ask_size: f64,
    #[serde(rename = "t")]
    timestamp: DateTime<Utc>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
struct TradeMessage {
    #[serde(rename = "S")]
    symbol: String,
    #[serde(rename = "p")]
    price: f64,
    #[serde(rename = "s", default)]
    size: f64,
    #[serde(rename = "t")]
    timestamp: DateTime<Utc>,
}

/// One element of a stream frame
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "T")]
enum StreamMessage {
    #[serde(rename = "success")]
    Success { msg: String },
    #[serde(rename = "error")]
    Error { code: i64, msg: String },
    #[serde(rename = "subscription")]
    Subscription {
        #[serde(default)]
        trades: Vec<String>,
        #[serde(default)]
        quotes: Vec<String>,
    },
    #[serde(rename = "q")]
    Quote(QuoteMessage),
    #[serde(rename = "t")]
    Trade(TradeMessage),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    Connected,
    Authenticated,
}

#[derive(Deserialize, Debug)]
struct RestQuote {
    #[serde(rename = "bp")]
    bid_price: f64,
    #[serde(rename = "bs", default)]
    bid_size: f64,
    #[serde(rename = "ap")]
    ask_price: f64,
    #[serde(rename = "as", default)]
    ask_size: f64,
    #[serde(rename = "t")]
    timestamp: DateTime<Utc>,
}

#[derive(Deserialize, Debug)]
struct LatestQuoteResponse {
    quote: RestQuote,
}

#[derive(Deserialize, Debug)]
struct RestTrade {
    #[serde(rename = "p")]
    price: f64,
    #[serde(rename = "s", default)]
    size: f64,
    #[serde(rename = "t")]
    timestamp: DateTime<Utc>,
}

#[derive(Deserialize, Debug)]
struct LatestTradeResponse {
    trade: RestTrade,
}

#[derive(Deserialize, Debug)]
struct RestBar {
    #[serde(rename = "t")]
    timestamp: DateTime<Utc>,
    #[serde(rename = "o")]
    open: f64,
    #[serde(rename = "h")]
    high: f64,
    #[serde(rename = "l")]
    low: f64,
    #[serde(rename = "c")]
    close: f64,
    #[serde(rename = "v")]
    volume: f64,
}

#[derive(Deserialize, Debug)]
struct BarsResponse {
    #[serde(default)]
    bars: Option<Vec<RestBar>>,
}

pub struct AlpacaConnector {
    config: AlpacaConfig,
    stream: StreamConfig,
    http: reqwest::Client,
    limiter: RateLimiter,
    state: ConnectorState,
    socket: Mutex<Option<WsStream>>,
}

impl AlpacaConnector {
    /// Fails when the API key or secret is missing
    pub fn new(config: AlpacaConfig, stream: StreamConfig, requests_per_minute: u32) -> ConnectorResult<Self> {
        if !config.has_credentials() {
            return Err(ConnectorError::Configuration(
                "Alpaca API key and secret are required".to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| ConnectorError::Configuration(e.to_string()))?;

        Ok(Self {
            config,
            stream,
            http,
            limiter: RateLimiter::per_minute(requests_per_minute),
            state: ConnectorState::new(Provider::Alpaca),
            socket: Mutex::new(None),
        })
    }

    pub fn from_settings(settings: &Settings) -> ConnectorResult<Self> {
        Self::new(
            settings.alpaca.clone(),
            settings.stream.clone(),
            settings.rate_limits.alpaca_per_minute,
        )
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> ConnectorResult<T> {
        self.limiter.acquire().await;

        let url = format!("{}{}", self.config.data_url.trim_end_matches('/'), path);
        let response = self
            .http
            .get(&url)
            .header("APCA-API-KEY-ID", &self.config.api_key)
            .header("APCA-API-SECRET-KEY", &self.config.secret_key)
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => ConnectorError::Authentication { reason: message },
                429 => ConnectorError::RateLimit,
                code => ConnectorError::Api { status: code, message },
            });
        }

        Ok(response.json::<T>().await?)
    }

    /// Open the socket and complete the auth handshake
    async fn open_authenticated(&self) -> ConnectorResult<WsStream> {
        let mut socket = websocket::open(&self.config.stream_url, self.stream.connect_timeout).await?;
        let deadline = self.stream.auth_timeout;

        websocket::await_text(&mut socket, deadline, |text| {
            Ok(handshake_event(text)?.filter(|step| *step == Handshake::Connected))
        })
        .await?;

        let auth = json!({
            "action": "auth",
            "key": self.config.api_key,
            "secret": self.config.secret_key,
        });
        websocket::send_json(&mut socket, &auth).await?;

        websocket::await_text(&mut socket, deadline, |text| {
            Ok(handshake_event(text)?.filter(|step| *step == Handshake::Authenticated))
        })
        .await?;

        info!(provider = "alpaca", feed = %self.config.feed, "authenticated");
        Ok(socket)
    }

    async fn fetch_latest(&self, symbol: &Symbol) -> ConnectorResult<Option<PriceUpdate>> {
        let Some(alias) = resolve_alias(symbol, Provider::Alpaca) else {
            return Ok(None);
        };
        let feed = [("feed", self.config.feed.clone())];

        let latest: LatestQuoteResponse = self
            .get_json(&format!("/v2/stocks/{}/quotes/latest", alias), &feed)
            .await?;
        let quote = latest.quote;
        if quote.bid_price > 0.0 && quote.ask_price > 0.0 {
            let mid = (quote.bid_price + quote.ask_price) / 2.0;
            return Ok(Some(
                PriceUpdate::new(symbol.normalized(), Provider::Alpaca, mid, quote.timestamp).with_quote(
                    quote.bid_price,
                    quote.ask_price,
                    Some(quote.bid_size),
                    Some(quote.ask_size),
                ),
            ));
        }

        // One-sided book (e.g. outside market hours): use the last trade
        debug!(symbol = %symbol, "one-sided quote, falling back to latest trade");
        let latest: LatestTradeResponse = self
            .get_json(&format!("/v2/stocks/{}/trades/latest", alias), &feed)
            .await?;
        let trade = latest.trade;
        if trade.price <= 0.0 {
            return Ok(None);
        }

        Ok(Some(
            PriceUpdate::new(symbol.normalized(), Provider::Alpaca, trade.price, trade.timestamp)
                .with_volume(trade.size),
        ))
    }

    async fn fetch_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: u32,
    ) -> ConnectorResult<Option<BarSeries>> {
        let Some(limit) = bounded_limit(Provider::Alpaca, limit, MAX_BARS) else {
            return Ok(None);
        };
        let Some(alias) = resolve_alias(symbol, Provider::Alpaca) else {
            return Ok(None);
        };

        let start = start.unwrap_or_else(|| Utc::now() - ChronoDuration::days(DEFAULT_LOOKBACK_DAYS));
        let mut query = vec![
            ("timeframe", timeframe_label(timeframe).to_string()),
            ("start", start.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("limit", limit.to_string()),
            ("adjustment", "raw".to_string()),
            ("feed", self.config.feed.clone()),
        ];
        if let Some(end) = end {
            query.push(("end", end.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }

        let response: BarsResponse = self
            .get_json(&format!("/v2/stocks/{}/bars", alias), &query)
            .await?;

        let bars = response
            .bars
            .unwrap_or_default()
            .into_iter()
            .filter_map(|b| match Bar::new(b.timestamp, b.open, b.high, b.low, b.close, b.volume) {
                Ok(bar) => Some(bar),
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "skipping malformed bar");
                    None
                }
            })
            .collect();

        Ok(BarSeries::non_empty(symbol.normalized(), timeframe, bars))
    }

    async fn sync_subscriptions(&self, socket: &mut WsStream, streamed: &mut BTreeSet<String>) -> ConnectorResult<()> {
        let desired: BTreeSet<String> = self
            .state
            .subscriptions()
            .iter()
            .filter_map(|symbol| resolve_alias(symbol, Provider::Alpaca))
            .collect();

        let added: Vec<&String> = desired.difference(streamed).collect();
        let removed: Vec<&String> = streamed.difference(&desired).collect();

        if !added.is_empty() {
            let request = json!({ "action": "subscribe", "trades": added, "quotes": added });
            websocket::send_json(socket, &request).await?;
        }
        if !removed.is_empty() {
            let request = json!({ "action": "unsubscribe", "trades": removed, "quotes": removed });
            websocket::send_json(socket, &request).await?;
        }

        *streamed = desired;
        Ok(())
    }

    async fn dispatch(&self, text: &str, on_message: &OnMessage, guard: &mut MonotonicGuard) {
        for message in parse_frame(text) {
            match message {
                StreamMessage::Quote(_) | StreamMessage::Trade(_) => {
                    if let Some(update) = to_price_update(message) {
                        if guard.admit(&update) {
                            on_message(update).await;
                        }
                    }
                }
                StreamMessage::Error { code, msg } => {
                    warn!(provider = "alpaca", code, error = %msg, "stream error");
                    self.state.record_error(format!("{} ({})", msg, code));
                }
                StreamMessage::Subscription { trades, quotes } => {
                    info!(provider = "alpaca", trades = trades.len(), quotes = quotes.len(), "subscription confirmed");
                }
                StreamMessage::Success { .. } | StreamMessage::Other => {}
            }
        }
    }
}

#[async_trait]
impl StreamSession for AlpacaConnector {
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
        self.open_authenticated().await
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
impl Connector for AlpacaConnector {
    fn provider(&self) -> Provider {
        Provider::Alpaca
    }

    async fn connect(&self) -> bool {
        if self.state.is_connected() {
            return true;
        }

        match self.open_authenticated().await {
            Ok(socket) => {
                *self.socket.lock().await = Some(socket);
                self.state.mark_connected();
                info!(provider = "alpaca", "connected");
                true
            }
            Err(e) => {
                warn!(provider = "alpaca", error = %e, "connect failed");
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
        info!(provider = "alpaca", "disconnected");
    }

    async fn subscribe(&self, symbols: &[Symbol]) {
        let (servable, rejected): (Vec<Symbol>, Vec<Symbol>) = symbols
            .iter()
            .map(Symbol::normalized)
            .partition(|s| resolve_alias(s, Provider::Alpaca).is_some());

        if !rejected.is_empty() {
            warn!(provider = "alpaca", symbols = ?rejected, "symbols not listed on Alpaca");
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
        let result = self.fetch_bars(symbol, timeframe, start, end, limit).await;
        log_fetch(&self.state, "historical_data", symbol, result)
    }

    async fn run_stream(&self, on_message: OnMessage, cancel: CancellationToken) -> ConnectorResult<()> {
        websocket::run_with_reconnect(self, on_message, cancel).await
    }

    fn status(&self) -> ProviderStatus {
        self.state.status(Provider::Alpaca.name())
    }

    fn supported_symbols(&self) -> Vec<Symbol> {
        DEFAULT_EQUITY_SYMBOLS.iter().map(|s| Symbol::new(*s)).collect()
    }
}

fn timeframe_label(timeframe: Timeframe) -> &'static str {
    match timeframe {
        Timeframe::OneMinute => "1Min",
        Timeframe::FiveMinutes => "5Min",
        Timeframe::FifteenMinutes => "15Min",
        Timeframe::OneHour => "1Hour",
        Timeframe::FourHours => "4Hour",
        Timeframe::OneDay => "1Day",
    }
}

/// Decode a frame element by element so one odd message does not drop the batch
fn parse_frame(text: &str) -> Vec<StreamMessage> {
    let elements = match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(elements)) => elements,
        Ok(single @ Value::Object(_)) => vec![single],
        Ok(_) => return Vec::new(),
        Err(e) => {
            debug!(provider = "alpaca", error = %e, "ignoring unparseable frame");
            return Vec::new();
        }
    };

    elements
        .into_iter()
        .filter_map(|element| match serde_json::from_value::<StreamMessage>(element) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!(provider = "alpaca", error = %e, "ignoring malformed message");
                None
            }
        })
        .collect()
}

fn handshake_event(text: &str) -> ConnectorResult<Option<Handshake>> {
    for message in parse_frame(text) {
        match message {
            StreamMessage::Success { msg } if msg == "connected" => return Ok(Some(Handshake::Connected)),
            StreamMessage::Success { msg } if msg == "authenticated" => return Ok(Some(Handshake::Authenticated)),
            StreamMessage::Error { code, msg } => {
                return Err(match code {
                    401..=403 => ConnectorError::Authentication { reason: format!("{} ({})", msg, code) },
                    _ => ConnectorError::Connection { message: format!("{} ({})", msg, code) },
                });
            }
            _ => {}
        }
    }
    Ok(None)
}

/// Quote → midpoint price; trade → trade price. One-sided quotes are dropped.
fn to_price_update(message: StreamMessage) -> Option<PriceUpdate> {
    match message {
        StreamMessage::Quote(q) => {
            if !(q.bid_price > 0.0 && q.ask_price > 0.0) {
                return None;
            }
            let symbol = canonical_from_alias(&q.symbol, Provider::Alpaca)?;
            let mid = (q.bid_price + q.ask_price) / 2.0;
            Some(
                PriceUpdate::new(symbol, Provider::Alpaca, mid, q.timestamp).with_quote(
                    q.bid_price,
                    q.ask_price,
                    Some(q.bid_size),
                    Some(q.ask_size),
                ),
            )
        }
        StreamMessage::Trade(t) => {
            if t.price <= 0.0 {
                return None;
            }
            let symbol = canonical_from_alias(&t.symbol, Provider::Alpaca)?;
            Some(PriceUpdate::new(symbol, Provider::Alpaca, t.price, t.timestamp).with_volume(t.size))
        }
        _ => None,
    }
}
