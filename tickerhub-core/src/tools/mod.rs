//! Function-calling tools over the orchestrator
//!
//! Each tool takes JSON arguments and returns JSON. The registry turns every
//! failure into an `{"error": ...}` object so callers always get a value back.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::indicators::{self, IndicatorKind, Signal};
use crate::market_data::{BarSeries, DataOrchestrator, Symbol, Timeframe};

/// Lookback and bar cap for indicator calculations
pub const ANALYSIS_LOOKBACK_DAYS: i64 = 100;
pub const ANALYSIS_BAR_LIMIT: u32 = 100;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("No data available for {0}")]
    NoData(Symbol),

    #[error("Failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments object
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, args: Value) -> Result<Value, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: BTreeMap::new() }
    }

    /// `price_lookup` and `technical_analysis` bound to one orchestrator
    pub fn with_market_tools(orchestrator: Arc<DataOrchestrator>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PriceLookupTool::new(orchestrator.clone())));
        registry.register(Arc::new(TechnicalAnalysisTool::new(orchestrator)));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.to_definition()).collect()
    }

    /// Run a tool by name. Never fails; errors come back as `{"error": ...}`.
    pub async fn dispatch(&self, name: &str, args: Value) -> Value {
        let result = match self.get(name) {
            Some(tool) => tool.execute(args).await,
            None => Err(ToolError::UnknownTool(name.to_string())),
        };

        result.unwrap_or_else(|e| {
            warn!(tool = name, error = %e, "tool call failed");
            json!({ "error": e.to_string() })
        })
    }
}

fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    // Tools without arguments may be called with null
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

fn default_timeframe() -> String {
    Timeframe::OneDay.as_str().to_string()
}

fn timeframe_schema() -> Value {
    let labels: Vec<&str> = Timeframe::ALL.iter().map(Timeframe::as_str).collect();
    json!({
        "type": "string",
        "description": "Bar timeframe",
        "enum": labels,
        "default": "1D"
    })
}

// ----------------------------------------------------------------------------
// price_lookup
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PriceLookupArgs {
    symbol: String,
    #[serde(default = "default_timeframe")]
    timeframe: String,
    #[serde(default = "default_days_back")]
    days_back: u32,
}

fn default_days_back() -> u32 {
    30
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoricalSummary {
    pub latest_close: f64,
    pub period_high: f64,
    pub period_low: f64,
    pub period_avg: f64,
    pub total_volume: f64,
    pub data_points: usize,
}

impl HistoricalSummary {
    pub fn from_series(series: &BarSeries) -> Option<Self> {
        let latest = series.last()?;
        let bars = series.bars();
        Some(Self {
            latest_close: latest.close,
            period_high: bars.iter().map(|b| b.high).fold(f64::MIN, f64::max),
            period_low: bars.iter().map(|b| b.low).fold(f64::MAX, f64::min),
            period_avg: bars.iter().map(|b| b.close).sum::<f64>() / bars.len() as f64,
            total_volume: bars.iter().map(|b| b.volume).sum(),
            data_points: bars.len(),
        })
    }
}

#[derive(Debug, Serialize)]
struct PriceLookupResult {
    symbol: Symbol,
    current_price: Option<f64>,
    historical_summary: Option<HistoricalSummary>,
}

/// Current price plus a summary of recent bars
pub struct PriceLookupTool {
    orchestrator: Arc<DataOrchestrator>,
}

impl PriceLookupTool {
    pub fn new(orchestrator: Arc<DataOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl Tool for PriceLookupTool {
    fn name(&self) -> &str {
        "price_lookup"
    }

    fn description(&self) -> &str {
        "Get current or historical price data for a stock or cryptocurrency symbol"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "symbol": {
                    "type": "string",
                    "description": "Stock symbol (e.g. AAPL) or crypto pair (e.g. BTC-USD)"
                },
                "timeframe": timeframe_schema(),
                "days_back": {
                    "type": "integer",
                    "description": "Days of history to summarize",
                    "default": 30
                }
            },
            "required": ["symbol"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: PriceLookupArgs = parse_args(args)?;
        let symbol = Symbol::new(args.symbol).normalized();
        if symbol.is_empty() {
            return Err(ToolError::InvalidArguments("symbol must not be empty".into()));
        }
        debug!(%symbol, timeframe = %args.timeframe, days_back = args.days_back, "price lookup");

        let current_price = self.orchestrator.get_latest_price(&symbol).await.map(|u| u.price);
        let start = Utc::now() - Duration::days(i64::from(args.days_back));
        let history = self
            .orchestrator
            .get_historical_data(&symbol, &args.timeframe, Some(start), None, args.days_back)
            .await;

        let result = PriceLookupResult {
            historical_summary: history.as_ref().and_then(HistoricalSummary::from_series),
            symbol,
            current_price,
        };
        Ok(serde_json::to_value(result)?)
    }
}

// ----------------------------------------------------------------------------
// technical_analysis
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TechnicalAnalysisArgs {
    symbol: String,
    #[serde(default = "default_timeframe")]
    timeframe: String,
    #[serde(default = "default_indicators")]
    indicators: Vec<String>,
}

fn default_indicators() -> Vec<String> {
    vec!["all".to_string()]
}

#[derive(Debug, Serialize)]
struct TechnicalAnalysisResult {
    symbol: Symbol,
    timeframe: Timeframe,
    indicators: BTreeMap<String, Option<f64>>,
    signals: BTreeMap<String, Signal>,
    current_price: f64,
}

/// Latest indicator values and signals over roughly 100 bars
pub struct TechnicalAnalysisTool {
    orchestrator: Arc<DataOrchestrator>,
}

impl TechnicalAnalysisTool {
    pub fn new(orchestrator: Arc<DataOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl Tool for TechnicalAnalysisTool {
    fn name(&self) -> &str {
        "technical_analysis"
    }

    fn description(&self) -> &str {
        "Calculate technical indicators (RSI, MACD, Bollinger Bands, moving averages, ATR, stochastic) for a symbol"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "symbol": {
                    "type": "string",
                    "description": "Stock or crypto symbol to analyze"
                },
                "timeframe": timeframe_schema(),
                "indicators": {
                    "type": "array",
                    "items": {
                        "type": "string",
                        "enum": ["rsi", "macd", "bollinger", "sma", "ema", "atr", "stochastic", "all"]
                    },
                    "default": ["all"]
                }
            },
            "required": ["symbol"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: TechnicalAnalysisArgs = parse_args(args)?;
        let symbol = Symbol::new(args.symbol).normalized();
        let timeframe = Timeframe::from_label(&args.timeframe);
        let start = Utc::now() - Duration::days(ANALYSIS_LOOKBACK_DAYS);

        let series = self
            .orchestrator
            .get_historical_data(&symbol, timeframe, Some(start), None, ANALYSIS_BAR_LIMIT)
            .await
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ToolError::NoData(symbol.clone()))?;
        let current_price = series.last().map(|b| b.close).ok_or_else(|| ToolError::NoData(symbol.clone()))?;

        let set = indicators::compute(&series, &IndicatorKind::resolve(&args.indicators));
        let signals = indicators::generate_signals(&set);
        let latest = set.into_iter().map(|(name, s)| (name, s.latest)).collect();

        let result = TechnicalAnalysisResult {
            symbol,
            timeframe,
            indicators: latest,
            signals,
            current_price,
        };
        Ok(serde_json::to_value(result)?)
    }
}
