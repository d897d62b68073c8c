//! Connector error types

use std::time::Duration;
use thiserror::Error;

/// Request timeout for every REST client the connectors build
pub(crate) const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Result alias for connector operations
pub type ConnectorResult<T> = Result<T, ConnectorError>;

#[derive(Error, Debug, Clone)]
pub enum ConnectorError {
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Authentication failed: {reason}")]
    Authentication { reason: String },

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Timeout after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Not connected")]
    NotConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Recoverable,
    Fatal,
    RateLimit,
}

impl ConnectorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimit => ErrorKind::RateLimit,
            Self::Api { status: 429, .. } => ErrorKind::RateLimit,
            Self::Authentication { .. }
            | Self::Configuration(_)
            | Self::ReconnectExhausted { .. } => ErrorKind::Fatal,
            Self::Api { status, .. } if (400..500).contains(status) => ErrorKind::Fatal,
            _ => ErrorKind::Recoverable,
        }
    }

    pub fn should_retry(&self) -> bool {
        matches!(self.kind(), ErrorKind::Recoverable)
    }
}

impl From<serde_json::Error> for ConnectorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ConnectorError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

impl From<url::ParseError> for ConnectorError {
    fn from(err: url::ParseError) -> Self {
        Self::Configuration(format!("invalid url: {}", err))
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout { seconds: HTTP_TIMEOUT.as_secs() }
        } else if err.is_connect() {
            Self::Connection { message: err.to_string() }
        } else if err.is_decode() {
            Self::Parse(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Api { status: status.as_u16(), message: err.to_string() }
        } else {
            Self::Network { message: err.to_string() }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ConnectorError::WebSocket("reset".into()).should_retry());
        assert!(ConnectorError::Api { status: 503, message: "down".into() }.should_retry());
        assert_eq!(
            ConnectorError::Api { status: 429, message: "slow down".into() }.kind(),
            ErrorKind::RateLimit
        );
        assert_eq!(
            ConnectorError::Authentication { reason: "bad key".into() }.kind(),
            ErrorKind::Fatal
        );
        assert!(!ConnectorError::Api { status: 404, message: "no such symbol".into() }.should_retry());
        assert!(!ConnectorError::ReconnectExhausted { attempts: 3 }.should_retry());
    }

    #[test]
    fn test_parse_error_conversion() {
        let err: ConnectorError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, ConnectorError::Parse(_)));
    }

    #[tokio::test]
    async fn test_request_timeout_reports_client_deadline() {
        // Accepts the connection and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let err: ConnectorError = client
            .get(format!("http://{}/api/v3/ping", addr))
            .send()
            .await
            .unwrap_err()
            .into();

        match &err {
            ConnectorError::Timeout { seconds } => assert_eq!(*seconds, HTTP_TIMEOUT.as_secs()),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(err.to_string(), "Timeout after 10 seconds");
        assert!(err.should_retry());
        server.abort();
    }
}
