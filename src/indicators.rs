//! Technical indicators over a close-price series.
//!
//! Every series function returns one entry per input value; `None` marks
//! positions where the indicator is not yet defined (warm-up window).

use serde::Serialize;

pub const SMA_WINDOW: usize = 50;
pub const EMA_SPAN: usize = 20;
pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;
pub const RSI_WINDOW: usize = 14;

/// Simple moving average over a trailing window.
pub fn sma(values: &[f64], window: usize) -> Vec<Option<f64>> {
    if window == 0 {
        return vec![None; values.len()];
    }
    let mut out = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for (i, v) in values.iter().enumerate() {
        sum += v;
        if i >= window {
            sum -= values[i - window];
        }
        out.push((i + 1 >= window).then(|| sum / window as f64));
    }
    out
}

/// Recursive exponential moving average seeded with the first value,
/// `alpha = 2 / (span + 1)`.
pub fn ema(values: &[f64], span: usize) -> Vec<f64> {
    let alpha = 2.0 / (span as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut prev: Option<f64> = None;
    for &v in values {
        let next = match prev {
            None => v,
            Some(p) => alpha * v + (1.0 - alpha) * p,
        };
        out.push(next);
        prev = Some(next);
    }
    out
}

/// MACD line and its signal line.
pub fn macd(values: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let fast = ema(values, MACD_FAST);
    let slow = ema(values, MACD_SLOW);
    let line: Vec<f64> = fast.iter().zip(&slow).map(|(f, s)| f - s).collect();
    let signal = ema(&line, MACD_SIGNAL);
    (line, signal)
}

/// Relative strength index from rolling-mean gains and losses.
pub fn rsi(values: &[f64], window: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if window == 0 || values.len() <= window {
        return out;
    }
    let deltas: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    for i in window..values.len() {
        // deltas[i - 1] is the change into values[i].
        let recent = &deltas[i - window..i];
        let gain = recent.iter().filter(|d| **d > 0.0).sum::<f64>() / window as f64;
        let loss = -recent.iter().filter(|d| **d < 0.0).sum::<f64>() / window as f64;
        out[i] = match (gain, loss) {
            (g, l) if l == 0.0 && g == 0.0 => None,
            (_, l) if l == 0.0 => Some(100.0),
            (g, l) => Some(100.0 - 100.0 / (1.0 + g / l)),
        };
    }
    out
}

/// Latest value of every indicator the technical stage reports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IndicatorSnapshot {
    pub sma50: Option<f64>,
    pub ema20: f64,
    pub macd: f64,
    pub signal_line: f64,
    pub rsi: Option<f64>,
    pub last_close: f64,
    pub bars: usize,
}

impl IndicatorSnapshot {
    /// `None` for an empty series.
    pub fn from_closes(closes: &[f64]) -> Option<Self> {
        let last_close = *closes.last()?;
        let (macd_line, signal) = macd(closes);
        Some(Self {
            sma50: sma(closes, SMA_WINDOW).last().copied().flatten(),
            ema20: *ema(closes, EMA_SPAN).last()?,
            macd: *macd_line.last()?,
            signal_line: *signal.last()?,
            rsi: rsi(closes, RSI_WINDOW).last().copied().flatten(),
            last_close,
            bars: closes.len(),
        })
    }
}

/// Two decimals, or "n/a" when undefined.
pub fn fmt_value(v: Option<f64>) -> String {
    match v {
        Some(x) if x.is_finite() => format!("{x:.2}"),
        _ => "n/a".to_string(),
    }
}
