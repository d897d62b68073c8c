//! TickerHub service
//!
//! `tickerhub`                           stream the watchlist until Ctrl+C
//! `tickerhub quote <SYMBOL>`            print price and recent history
//! `tickerhub analyze <SYMBOL> [TF]`     print indicators and signals

use anyhow::{bail, Result};
use serde_json::json;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tickerhub_core::{callback, DataOrchestrator, PriceUpdate, Settings, StatusApiServer, Symbol, ToolRegistry};

#[derive(Debug)]
enum Command {
    Run,
    Quote(Symbol),
    Analyze(Symbol, String),
}

fn parse_command(mut args: impl Iterator<Item = String>) -> Result<Command> {
    match args.next().as_deref() {
        None | Some("run") => Ok(Command::Run),
        Some("quote") => match args.next() {
            Some(symbol) => Ok(Command::Quote(Symbol::new(symbol))),
            None => bail!("usage: tickerhub quote <SYMBOL>"),
        },
        Some("analyze") => match args.next() {
            Some(symbol) => Ok(Command::Analyze(
                Symbol::new(symbol),
                args.next().unwrap_or_else(|| "1D".to_string()),
            )),
            None => bail!("usage: tickerhub analyze <SYMBOL> [TIMEFRAME]"),
        },
        Some(other) => bail!("unknown command '{}', expected run, quote or analyze", other),
    }
}

fn init_logging(settings: &Settings) {
    // RUST_LOG wins over LOG_LEVEL
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::from_env()?;
    init_logging(&settings);

    let command = parse_command(std::env::args().skip(1))?;
    let orchestrator = Arc::new(DataOrchestrator::new(settings));

    let connected = orchestrator.initialize().await;
    info!(connected, status = ?orchestrator.get_provider_status(), "providers initialized");

    let outcome = match command {
        Command::Run => run(orchestrator.clone()).await,
        Command::Quote(symbol) => {
            let tools = ToolRegistry::with_market_tools(orchestrator.clone());
            print_json(tools.dispatch("price_lookup", json!({ "symbol": symbol })).await)
        }
        Command::Analyze(symbol, timeframe) => {
            let tools = ToolRegistry::with_market_tools(orchestrator.clone());
            let args = json!({ "symbol": symbol, "timeframe": timeframe });
            print_json(tools.dispatch("technical_analysis", args).await)
        }
    };

    if !orchestrator.is_shut_down() {
        orchestrator.shutdown().await;
    }
    outcome
}

fn print_json(value: serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Ctrl+C, or a shutdown started elsewhere
async fn wait_for_stop(orchestrator: &DataOrchestrator) {
    let shutdown = orchestrator.shutdown_token();
    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "failed to listen for Ctrl+C");
            }
            info!("🛑 Shutdown signal received");
        }
        _ = shutdown.cancelled() => {
            info!("🛑 Orchestrator shut down");
        }
    }
}

async fn run(orchestrator: Arc<DataOrchestrator>) -> Result<()> {
    let watchlist = orchestrator.settings().watchlist.clone();
    orchestrator.subscribe_symbols(&watchlist).await;
    info!(subscriptions = ?orchestrator.subscriptions(), "📈 watchlist subscribed");

    orchestrator.register_update_callback(callback(|update: PriceUpdate| async move {
        info!(
            symbol = %update.symbol,
            provider = %update.provider,
            price = update.price,
            spread = ?update.spread(),
            "price update"
        );
        Ok(())
    }));

    let api_task = orchestrator.settings().status_api_port.map(|port| {
        let server = StatusApiServer::new(orchestrator.clone(), port);
        tokio::spawn(async move { server.start().await })
    });

    let streams = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.start_streams().await })
    };

    info!("📊 Streaming. Press Ctrl+C to stop.");
    wait_for_stop(&orchestrator).await;

    orchestrator.shutdown().await;
    if let Err(e) = streams.await {
        warn!(error = %e, "stream supervisor ended abnormally");
    }
    if let Some(api_task) = api_task {
        if let Err(e) = api_task.await {
            warn!(error = %e, "status API task ended abnormally");
        }
    }

    for (provider, stats) in orchestrator.feed_statistics() {
        info!(
            %provider,
            received = stats.messages_received,
            rejected = stats.messages_rejected,
            callback_failures = stats.callback_failures,
            "feed statistics"
        );
    }
    info!("✅ Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn test_parse_command() {
        assert!(matches!(parse_command(args(&[])).unwrap(), Command::Run));
        assert!(matches!(parse_command(args(&["quote", "AAPL"])).unwrap(), Command::Quote(s) if s.as_str() == "AAPL"));
        assert!(matches!(
            parse_command(args(&["analyze", "BTC-USD"])).unwrap(),
            Command::Analyze(s, tf) if s.as_str() == "BTC-USD" && tf == "1D"
        ));
        tokio_test::assert_ok!(parse_command(args(&["run"])));
        tokio_test::assert_err!(parse_command(args(&["quote"])));
        tokio_test::assert_err!(parse_command(args(&["trade"])));
    }

    #[tokio::test]
    async fn test_stop_follows_orchestrator_shutdown() {
        let orchestrator = DataOrchestrator::new(Settings::default());
        orchestrator.shutdown().await;

        let stopped = tokio::time::timeout(std::time::Duration::from_secs(1), wait_for_stop(&orchestrator)).await;
        tokio_test::assert_ok!(stopped);
    }
}
