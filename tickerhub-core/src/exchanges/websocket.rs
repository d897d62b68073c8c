//! WebSocket plumbing shared by the streaming connectors

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::connector::{ConnectorState, MonotonicGuard, OnMessage};
use super::errors::{ConnectorError, ConnectorResult, ErrorKind};
use super::reconnect::{Backoff, ReconnectConfig, ReconnectPolicy};
use crate::config::StreamConfig;
use crate::market_data::PriceUpdate;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What a single read from the socket produced
#[derive(Debug)]
pub enum Inbound {
    Text(String),
    /// Control frames and binary payloads, handled by tungstenite
    Ignored,
}

pub async fn open(url: &str, connect_timeout: Duration) -> ConnectorResult<WsStream> {
    let url = Url::parse(url)?;

    match timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((socket, response))) => {
            info!(url = %url, status = %response.status(), "WebSocket connected");
            Ok(socket)
        }
        Ok(Err(e)) => Err(ConnectorError::Connection { message: e.to_string() }),
        Err(_) => Err(ConnectorError::Timeout { seconds: connect_timeout.as_secs() }),
    }
}

pub async fn send_json<T: Serialize>(socket: &mut WsStream, payload: &T) -> ConnectorResult<()> {
    let text = serde_json::to_string(payload)?;
    debug!(payload = %text, "sending control frame");
    socket.send(Message::Text(text)).await?;
    Ok(())
}

pub async fn send_ping(socket: &mut WsStream) -> ConnectorResult<()> {
    socket.send(Message::Ping(Vec::new())).await?;
    Ok(())
}

/// Read the next frame; a closed socket is an error so the caller reconnects
pub async fn next_frame(socket: &mut WsStream) -> ConnectorResult<Inbound> {
    match socket.next().await {
        Some(Ok(Message::Text(text))) => Ok(Inbound::Text(text)),
        Some(Ok(Message::Close(frame))) => Err(ConnectorError::Connection {
            message: match frame {
                Some(frame) => format!("closed by server: {} {}", frame.code, frame.reason),
                None => "closed by server".to_string(),
            },
        }),
        Some(Ok(_)) => Ok(Inbound::Ignored),
        Some(Err(e)) => Err(e.into()),
        None => Err(ConnectorError::Connection { message: "stream ended".to_string() }),
    }
}

/// Read text frames until `accept` yields a value or the deadline passes
pub async fn await_text<T, F>(socket: &mut WsStream, deadline: Duration, mut accept: F) -> ConnectorResult<T>
where
    F: FnMut(&str) -> ConnectorResult<Option<T>>,
{
    let wait = async {
        loop {
            if let Inbound::Text(text) = next_frame(socket).await? {
                if let Some(value) = accept(&text)? {
                    return Ok::<T, ConnectorError>(value);
                }
            }
        }
    };

    match timeout(deadline, wait).await {
        Ok(result) => result,
        Err(_) => Err(ConnectorError::Timeout { seconds: deadline.as_secs() }),
    }
}

pub async fn close_quietly(mut socket: WsStream) {
    if let Err(e) = socket.close(None).await {
        debug!(error = %e, "error while closing WebSocket");
    }
}

/// One provider's live session: how to open it and how to drain it
#[async_trait]
pub(crate) trait StreamSession: Send + Sync {
    fn state(&self) -> &ConnectorState;

    fn stream_config(&self) -> &StreamConfig;

    /// Socket ready for data (authenticated where the provider needs it)
    async fn open_stream(&self) -> ConnectorResult<WsStream>;

    /// Sync subscriptions and forward updates until cancelled or the socket fails
    async fn pump(
        &self,
        socket: WsStream,
        on_message: &OnMessage,
        cancel: &CancellationToken,
        guard: &mut MonotonicGuard,
    ) -> ConnectorResult<()>;
}

/// Receive loop with reconnect-and-backoff around a [`StreamSession`]
///
/// The loop runs on a child of `cancel` registered with the connector state,
/// so `disconnect` stops it too. Once stopped, no further update reaches
/// `on_message` and the connector reports disconnected.
pub(crate) async fn run_with_reconnect<S>(
    session: &S,
    on_message: OnMessage,
    cancel: CancellationToken,
) -> ConnectorResult<()>
where
    S: StreamSession + ?Sized,
{
    let state = session.state();
    let (lease, cancel) = state.attach_stream(&cancel);
    let on_message = gated(on_message, cancel.clone());

    let result = reconnect_loop(session, &on_message, &cancel).await;

    state.detach_stream(lease);
    if result.is_ok() {
        state.mark_disconnected(None);
    }
    result
}

/// Drop updates once `cancel` fires, even from a frame already in flight
fn gated(on_message: OnMessage, cancel: CancellationToken) -> OnMessage {
    Arc::new(move |update: PriceUpdate| -> BoxFuture<'static, ()> {
        if cancel.is_cancelled() {
            return Box::pin(async {});
        }
        on_message(update)
    })
}

async fn reconnect_loop<S>(
    session: &S,
    on_message: &OnMessage,
    cancel: &CancellationToken,
) -> ConnectorResult<()>
where
    S: StreamSession + ?Sized,
{
    let state = session.state();
    let provider = state.provider();
    let mut policy = ReconnectPolicy::new(ReconnectConfig::from(session.stream_config()));
    let mut guard = MonotonicGuard::default();

    loop {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            opened = session.open_stream() => opened,
        };

        let outcome = match opened {
            Ok(socket) => {
                if !state.mark_stream_live(cancel) {
                    debug!(provider = %provider, "stream cancelled while opening");
                    close_quietly(socket).await;
                    return Ok(());
                }
                policy.reset();
                info!(provider = %provider, "stream live");
                session.pump(socket, on_message, cancel, &mut guard).await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                info!(provider = %provider, "stream stopped");
                return Ok(());
            }
            Err(e) => {
                state.mark_disconnected(Some(e.to_string()));
                if e.kind() == ErrorKind::Fatal {
                    error!(provider = %provider, error = %e, "stream failed permanently");
                    return Err(e);
                }
                warn!(provider = %provider, error = %e, "stream interrupted");
            }
        }

        match policy.wait(cancel).await {
            Backoff::Retry => {
                info!(provider = %provider, attempt = policy.attempt_count(), "reconnecting stream");
            }
            Backoff::Cancelled => return Ok(()),
            Backoff::Exhausted => {
                error!(provider = %provider, "max reconnect attempts reached, giving up");
                return Err(ConnectorError::ReconnectExhausted {
                    attempts: policy.attempt_count(),
                });
            }
        }
    }
}
