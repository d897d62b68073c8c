//! Read-only HTTP status API
//!
//! Exposes provider health and the latest cached prices as JSON.

use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::market_data::{DataOrchestrator, Symbol};

pub struct StatusApiServer {
    orchestrator: Arc<DataOrchestrator>,
    port: u16,
}

impl StatusApiServer {
    pub fn new(orchestrator: Arc<DataOrchestrator>, port: u16) -> Self {
        Self { orchestrator, port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serve until the orchestrator shuts down
    pub async fn start(&self) {
        let shutdown = self.orchestrator.shutdown_token();
        let (addr, server) = warp::serve(routes(self.orchestrator.clone()))
            .bind_with_graceful_shutdown(([127, 0, 0, 1], self.port), async move {
                shutdown.cancelled().await
            });

        tracing::info!(%addr, "status API listening");
        server.await;
        tracing::info!("status API stopped");
    }
}

/// Every status route, with CORS and JSON error replies
pub fn routes(
    orchestrator: Arc<DataOrchestrator>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let health = warp::path!("health")
        .and(warp::get())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(get_health);

    let providers = warp::path!("api" / "v1" / "providers")
        .and(warp::get())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(get_providers);

    let prices = warp::path!("api" / "v1" / "prices")
        .and(warp::get())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(get_prices);

    let price = warp::path!("api" / "v1" / "prices" / String)
        .and(warp::get())
        .and(with_orchestrator(orchestrator))
        .and_then(get_price);

    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(vec!["content-type"])
        .allow_methods(vec!["GET", "OPTIONS"]);

    health
        .or(providers)
        .or(prices)
        .or(price)
        .with(cors)
        .recover(handle_rejection)
}

fn with_orchestrator(
    orchestrator: Arc<DataOrchestrator>,
) -> impl Filter<Extract = (Arc<DataOrchestrator>,), Error = Infallible> + Clone {
    warp::any().map(move || orchestrator.clone())
}

async fn get_health(orchestrator: Arc<DataOrchestrator>) -> Result<impl Reply, Rejection> {
    let providers = orchestrator.get_provider_status();
    let status = if providers.values().any(|connected| *connected) {
        "ok"
    } else {
        "degraded"
    };

    Ok(warp::reply::json(&json!({
        "status": status,
        "providers": providers,
        "timestamp": chrono::Utc::now()
    })))
}

async fn get_providers(orchestrator: Arc<DataOrchestrator>) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&orchestrator.provider_health()))
}

async fn get_prices(orchestrator: Arc<DataOrchestrator>) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&orchestrator.get_all_prices()))
}

/// Cached price only; never triggers a provider pull
async fn get_price(symbol: String, orchestrator: Arc<DataOrchestrator>) -> Result<impl Reply, Rejection> {
    let symbol = Symbol::new(symbol).normalized();
    let reply = match orchestrator.cached_price(&symbol) {
        Some(update) => warp::reply::with_status(warp::reply::json(&update), StatusCode::OK),
        None => warp::reply::with_status(
            warp::reply::json(&json!({ "error": "unavailable", "symbol": symbol })),
            StatusCode::NOT_FOUND,
        ),
    };
    Ok(reply)
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (code, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Endpoint not found")
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
    } else {
        tracing::error!("Unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    };

    let json = warp::reply::json(&json!({
        "error": message,
        "code": code.as_u16()
    }));
    Ok(warp::reply::with_status(json, code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::exchanges::ConnectorRegistry;
    use crate::market_data::{PriceUpdate, Provider, SymbolClassifier};
    use chrono::Utc;
    use serde_json::Value;

    fn orchestrator() -> Arc<DataOrchestrator> {
        Arc::new(DataOrchestrator::with_registry(
            Settings::default(),
            ConnectorRegistry::new(),
            SymbolClassifier::new(),
        ))
    }

    fn body(response: &warp::http::Response<warp::hyper::body::Bytes>) -> Value {
        serde_json::from_slice(response.body()).unwrap()
    }

    #[tokio::test]
    async fn test_health_degraded_without_providers() {
        let response = warp::test::request().path("/health").reply(&routes(orchestrator())).await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = body(&response);
        assert_eq!(json["status"], "degraded");
        assert!(json["providers"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_price_routes() {
        let orchestrator = orchestrator();
        orchestrator.price_sink(Provider::Binance)(PriceUpdate::new(
            Symbol::new("ETH-USD"),
            Provider::Binance,
            3_100.5,
            Utc::now(),
        ))
        .await;
        let api = routes(orchestrator);

        let response = warp::test::request().path("/api/v1/prices").reply(&api).await;
        assert_eq!(body(&response)["ETH-USD"]["price"], 3_100.5);

        let response = warp::test::request().path("/api/v1/prices/eth-usd").reply(&api).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(&response)["provider"], "binance");

        let response = warp::test::request().path("/api/v1/prices/AAPL").reply(&api).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body(&response)["error"], "unavailable");
    }

    #[tokio::test]
    async fn test_providers_and_unknown_paths() {
        let api = routes(orchestrator());

        let response = warp::test::request().path("/api/v1/providers").reply(&api).await;
        assert_eq!(body(&response), Value::Array(Vec::new()));

        let response = warp::test::request().path("/api/v1/orders").reply(&api).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
