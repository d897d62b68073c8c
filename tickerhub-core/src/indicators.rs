//! Technical indicators over bar series
//!
//! Every series is aligned with the input bars: position `i` holds the value
//! as of bar `i`, or `None` while there is not enough history.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::market_data::{Bar, BarSeries};

pub const RSI_PERIOD: usize = 14;
pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;
pub const BOLLINGER_PERIOD: usize = 20;
pub const BOLLINGER_STD_DEV: f64 = 2.0;
pub const SMA_PERIODS: [usize; 3] = [20, 50, 200];
pub const EMA_PERIODS: [usize; 2] = [12, 26];
pub const ATR_PERIOD: usize = 14;
pub const STOCH_K: usize = 14;
pub const STOCH_SMOOTH: usize = 3;
pub const STOCH_D: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSeries {
    pub latest: Option<f64>,
    pub series: Vec<Option<f64>>,
}

impl IndicatorSeries {
    fn from_series(series: Vec<Option<f64>>) -> Self {
        let latest = series.last().copied().flatten();
        Self { latest, series }
    }
}

pub type IndicatorSet = BTreeMap<String, IndicatorSeries>;

/// Indicator families that can be requested by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorKind {
    Rsi,
    Macd,
    Bollinger,
    Sma,
    Ema,
    Atr,
    Stochastic,
}

impl IndicatorKind {
    pub const ALL: [IndicatorKind; 7] = [
        IndicatorKind::Rsi,
        IndicatorKind::Macd,
        IndicatorKind::Bollinger,
        IndicatorKind::Sma,
        IndicatorKind::Ema,
        IndicatorKind::Atr,
        IndicatorKind::Stochastic,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "rsi" => Some(IndicatorKind::Rsi),
            "macd" => Some(IndicatorKind::Macd),
            "bollinger" | "bbands" | "bb" => Some(IndicatorKind::Bollinger),
            "sma" => Some(IndicatorKind::Sma),
            "ema" => Some(IndicatorKind::Ema),
            "atr" => Some(IndicatorKind::Atr),
            "stochastic" | "stoch" => Some(IndicatorKind::Stochastic),
            _ => None,
        }
    }

    /// Resolve requested names; "all" expands to every family, unknown names are skipped
    pub fn resolve<S: AsRef<str>>(names: &[S]) -> Vec<IndicatorKind> {
        if names.is_empty() || names.iter().any(|n| n.as_ref().eq_ignore_ascii_case("all")) {
            return Self::ALL.to_vec();
        }
        let mut kinds = Vec::new();
        for kind in names.iter().filter_map(|n| Self::from_name(n.as_ref())) {
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        kinds
    }
}

/// Every indicator family. Empty input gives an empty set.
pub fn compute_all(series: &BarSeries) -> IndicatorSet {
    compute(series, &IndicatorKind::ALL)
}

pub fn compute(series: &BarSeries, kinds: &[IndicatorKind]) -> IndicatorSet {
    let mut set = IndicatorSet::new();
    if series.is_empty() {
        return set;
    }

    let closes = series.closes();
    let mut put = |name: &str, values: Vec<Option<f64>>| {
        set.insert(name.to_string(), IndicatorSeries::from_series(values));
    };

    for kind in kinds {
        match kind {
            IndicatorKind::Rsi => put("rsi", rsi(&closes, RSI_PERIOD)),
            IndicatorKind::Macd => {
                let (line, signal, histogram) = macd(&closes, MACD_FAST, MACD_SLOW, MACD_SIGNAL);
                put("macd", line);
                put("macd_signal", signal);
                put("macd_histogram", histogram);
            }
            IndicatorKind::Bollinger => {
                let (upper, middle, lower) = bollinger(&closes, BOLLINGER_PERIOD, BOLLINGER_STD_DEV);
                put("bb_upper", upper);
                put("bb_middle", middle);
                put("bb_lower", lower);
            }
            IndicatorKind::Sma => {
                for period in SMA_PERIODS {
                    put(&format!("sma_{}", period), sma(&closes, period));
                }
            }
            IndicatorKind::Ema => {
                for period in EMA_PERIODS {
                    put(&format!("ema_{}", period), ema(&closes, period));
                }
            }
            IndicatorKind::Atr => put("atr", atr(series.bars(), ATR_PERIOD)),
            IndicatorKind::Stochastic => {
                let (k, d) = stochastic(series.bars(), STOCH_K, STOCH_SMOOTH, STOCH_D);
                put("stoch_k", k);
                put("stoch_d", d);
            }
        }
    }

    set
}

pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let wrapped: Vec<Option<f64>> = values.iter().copied().map(Some).collect();
    sma_of(&wrapped, period)
}

/// Window mean over an optional series; any gap in the window yields `None`
fn sma_of(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            if period == 0 || i + 1 < period {
                return None;
            }
            let window = &values[i + 1 - period..=i];
            let sum: Option<f64> = window.iter().copied().sum();
            sum.map(|s| s / period as f64)
        })
        .collect()
}

/// Exponential average seeded with the simple average of the first `period` values
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let wrapped: Vec<Option<f64>> = values.iter().copied().map(Some).collect();
    ema_of(&wrapped, period)
}

/// EMA over the values following the leading `None`s
fn ema_of(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 {
        return out;
    }
    let Some(offset) = values.iter().position(Option::is_some) else {
        return out;
    };

    let defined: Vec<f64> = values[offset..].iter().map_while(|v| *v).collect();
    if defined.len() < period {
        return out;
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let mut current = defined[..period].iter().sum::<f64>() / period as f64;
    out[offset + period - 1] = Some(current);
    for (i, value) in defined.iter().enumerate().skip(period) {
        current = alpha * value + (1.0 - alpha) * current;
        out[offset + i] = Some(current);
    }
    out
}

/// Wilder RSI
pub fn rsi(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() <= period {
        return out;
    }

    let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let mut avg_gain = changes[..period].iter().map(|c| c.max(0.0)).sum::<f64>() / period as f64;
    let mut avg_loss = changes[..period].iter().map(|c| (-c).max(0.0)).sum::<f64>() / period as f64;
    out[period] = Some(rsi_value(avg_gain, avg_loss));

    let n = period as f64;
    for (i, change) in changes.iter().enumerate().skip(period) {
        avg_gain = (avg_gain * (n - 1.0) + change.max(0.0)) / n;
        avg_loss = (avg_loss * (n - 1.0) + (-change).max(0.0)) / n;
        out[i + 1] = Some(rsi_value(avg_gain, avg_loss));
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        if avg_gain == 0.0 {
            50.0
        } else {
            100.0
        }
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

/// (macd line, signal line, histogram)
pub fn macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>) {
    let fast_ema = ema(closes, fast);
    let slow_ema = ema(closes, slow);

    let line: Vec<Option<f64>> = fast_ema
        .iter()
        .zip(&slow_ema)
        .map(|(f, s)| Some((*f)? - (*s)?))
        .collect();
    let signal_line = ema_of(&line, signal);
    let histogram = line
        .iter()
        .zip(&signal_line)
        .map(|(m, s)| Some((*m)? - (*s)?))
        .collect();

    (line, signal_line, histogram)
}

/// (upper, middle, lower) using population standard deviation
pub fn bollinger(closes: &[f64], period: usize, std_devs: f64) -> (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>) {
    let middle = sma(closes, period);
    let mut upper = vec![None; closes.len()];
    let mut lower = vec![None; closes.len()];

    for (i, mean) in middle.iter().enumerate() {
        if let Some(mean) = mean {
            let window = &closes[i + 1 - period..=i];
            let variance = window.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / period as f64;
            let band = std_devs * variance.sqrt();
            upper[i] = Some(mean + band);
            lower[i] = Some(mean - band);
        }
    }

    (upper, middle, lower)
}

/// Wilder average true range
pub fn atr(bars: &[Bar], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; bars.len()];
    if period == 0 || bars.len() < period {
        return out;
    }

    let true_ranges: Vec<f64> = bars
        .iter()
        .enumerate()
        .map(|(i, bar)| match i.checked_sub(1).map(|p| bars[p].close) {
            Some(prev_close) => (bar.high - bar.low)
                .max((bar.high - prev_close).abs())
                .max((bar.low - prev_close).abs()),
            None => bar.high - bar.low,
        })
        .collect();

    let n = period as f64;
    let mut current = true_ranges[..period].iter().sum::<f64>() / n;
    out[period - 1] = Some(current);
    for (i, tr) in true_ranges.iter().enumerate().skip(period) {
        current = (current * (n - 1.0) + tr) / n;
        out[i] = Some(current);
    }
    out
}

/// Slow stochastic: (%K smoothed, %D)
pub fn stochastic(bars: &[Bar], k_period: usize, smooth: usize, d_period: usize) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    let raw: Vec<Option<f64>> = (0..bars.len())
        .map(|i| {
            if k_period == 0 || i + 1 < k_period {
                return None;
            }
            let window = &bars[i + 1 - k_period..=i];
            let highest = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
            let lowest = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
            let range = highest - lowest;
            Some(if range > 0.0 {
                100.0 * (bars[i].close - lowest) / range
            } else {
                50.0
            })
        })
        .collect();

    let k = sma_of(&raw, smooth);
    let d = sma_of(&k, d_period);
    (k, d)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Signal {
    Overbought,
    Oversold,
    Neutral,
    Bullish,
    Bearish,
}

/// RSI above 70 is overbought and below 30 oversold; MACD above its signal
/// line is bullish; Bollinger is reported neutral.
pub fn generate_signals(indicators: &IndicatorSet) -> BTreeMap<String, Signal> {
    let latest = |name: &str| indicators.get(name).and_then(|s| s.latest);
    let mut signals = BTreeMap::new();

    if let Some(rsi) = latest("rsi") {
        let signal = if rsi > 70.0 {
            Signal::Overbought
        } else if rsi < 30.0 {
            Signal::Oversold
        } else {
            Signal::Neutral
        };
        signals.insert("rsi".to_string(), signal);
    }

    if let (Some(line), Some(signal_line)) = (latest("macd"), latest("macd_signal")) {
        let signal = if line > signal_line { Signal::Bullish } else { Signal::Bearish };
        signals.insert("macd".to_string(), signal);
    }

    if latest("bb_middle").is_some() {
        signals.insert("bollinger".to_string(), Signal::Neutral);
    }

    signals
}
