//! Technical indicators over candle series
//!
//! All functions take data oldest first and return `None` when the series
//! is too short.

use exchange_gateway::Candle;
use rust_decimal::prelude::*;
use serde::Serialize;

pub fn closes(candles: &[Candle]) -> Vec<Decimal> {
    candles.iter().map(|c| c.close).collect()
}

/// Simple moving average of the last `period` values
pub fn sma(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period {
        return None;
    }
    let sum: Decimal = values[values.len() - period..].iter().sum();
    Some(sum / Decimal::from(period))
}

/// EMA series seeded with the SMA of the first `period` values.
/// Element `i` of the result corresponds to `values[period - 1 + i]`.
fn ema_series(values: &[Decimal], period: usize) -> Option<Vec<Decimal>> {
    if period == 0 || values.len() < period {
        return None;
    }
    let multiplier = Decimal::from(2) / (Decimal::from(period) + Decimal::ONE);
    let seed: Decimal = values[..period].iter().sum::<Decimal>() / Decimal::from(period);

    let mut series = Vec::with_capacity(values.len() - period + 1);
    series.push(seed);
    let mut ema = seed;
    for value in &values[period..] {
        ema = (*value - ema) * multiplier + ema;
        series.push(ema);
    }
    Some(series)
}

/// Latest exponential moving average
pub fn ema(values: &[Decimal], period: usize) -> Option<Decimal> {
    ema_series(values, period).and_then(|s| s.last().copied())
}

/// Relative strength index with Wilder smoothing, 0..=100
pub fn rsi(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() <= period {
        return None;
    }
    let hundred = Decimal::from(100);
    let p = Decimal::from(period);

    let mut gain = Decimal::ZERO;
    let mut loss = Decimal::ZERO;
    for w in values[..=period].windows(2) {
        let change = w[1] - w[0];
        if change > Decimal::ZERO {
            gain += change;
        } else {
            loss -= change;
        }
    }
    let mut avg_gain = gain / p;
    let mut avg_loss = loss / p;

    for w in values[period..].windows(2) {
        let change = w[1] - w[0];
        let (g, l) = if change > Decimal::ZERO {
            (change, Decimal::ZERO)
        } else {
            (Decimal::ZERO, -change)
        };
        avg_gain = (avg_gain * (p - Decimal::ONE) + g) / p;
        avg_loss = (avg_loss * (p - Decimal::ONE) + l) / p;
    }

    if avg_loss.is_zero() {
        return Some(if avg_gain.is_zero() {
            Decimal::from(50)
        } else {
            hundred
        });
    }
    let rs = avg_gain / avg_loss;
    Some(hundred - hundred / (Decimal::ONE + rs))
}

/// Average true range with Wilder smoothing
pub fn atr(candles: &[Candle], period: usize) -> Option<Decimal> {
    if period == 0 || candles.len() <= period {
        return None;
    }
    let true_ranges: Vec<Decimal> = candles
        .windows(2)
        .map(|w| {
            let (prev, cur) = (&w[0], &w[1]);
            (cur.high - cur.low)
                .max((cur.high - prev.close).abs())
                .max((cur.low - prev.close).abs())
        })
        .collect();

    let p = Decimal::from(period);
    let mut value: Decimal = true_ranges[..period].iter().sum::<Decimal>() / p;
    for tr in &true_ranges[period..] {
        value = (value * (p - Decimal::ONE) + *tr) / p;
    }
    Some(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Macd {
    pub macd: Decimal,
    pub signal: Decimal,
    pub histogram: Decimal,
}

/// MACD line, signal line and histogram
pub fn macd(values: &[Decimal], fast: usize, slow: usize, signal: usize) -> Option<Macd> {
    if fast >= slow {
        return None;
    }
    let fast_series = ema_series(values, fast)?;
    let slow_series = ema_series(values, slow)?;
    // Align the fast series with the slow one
    let offset = slow - fast;
    let line: Vec<Decimal> = slow_series
        .iter()
        .zip(&fast_series[offset..])
        .map(|(s, f)| *f - *s)
        .collect();
    let signal_line = ema(&line, signal)?;
    let macd = *line.last()?;
    Some(Macd {
        macd,
        signal: signal_line,
        histogram: macd - signal_line,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bollinger {
    pub upper: Decimal,
    pub middle: Decimal,
    pub lower: Decimal,
}

/// Bollinger bands using the population standard deviation
pub fn bollinger(values: &[Decimal], period: usize, width: Decimal) -> Option<Bollinger> {
    let middle = sma(values, period)?;
    let window = &values[values.len() - period..];
    let variance: Decimal = window
        .iter()
        .map(|v| (*v - middle) * (*v - middle))
        .sum::<Decimal>()
        / Decimal::from(period);
    let deviation = variance.sqrt()?;
    Some(Bollinger {
        upper: middle + deviation * width,
        middle,
        lower: middle - deviation * width,
    })
}

/// Last volume relative to the average of the `period` volumes before it
pub fn volume_ratio(candles: &[Candle], period: usize) -> Option<Decimal> {
    if period == 0 || candles.len() <= period {
        return None;
    }
    let last = candles.last()?.volume;
    let prior = &candles[candles.len() - 1 - period..candles.len() - 1];
    let avg: Decimal = prior.iter().map(|c| c.volume).sum::<Decimal>() / Decimal::from(period);
    if avg.is_zero() {
        return None;
    }
    Some(last / avg)
}

/// Everything the prompt and the technical engines look at
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndicatorSnapshot {
    pub last_close: Option<Decimal>,
    pub sma_20: Option<Decimal>,
    pub ema_12: Option<Decimal>,
    pub ema_26: Option<Decimal>,
    pub rsi_14: Option<Decimal>,
    pub atr_14: Option<Decimal>,
    pub macd: Option<Macd>,
    pub bollinger: Option<Bollinger>,
    pub volume_ratio: Option<Decimal>,
}

impl IndicatorSnapshot {
    pub fn compute(candles: &[Candle]) -> Self {
        let closes = closes(candles);
        let round = |d: Decimal| d.round_dp(6);
        Self {
            last_close: closes.last().copied(),
            sma_20: sma(&closes, 20).map(round),
            ema_12: ema(&closes, 12).map(round),
            ema_26: ema(&closes, 26).map(round),
            rsi_14: rsi(&closes, 14).map(|v| v.round_dp(2)),
            atr_14: atr(candles, 14).map(round),
            macd: macd(&closes, 12, 26, 9),
            bollinger: bollinger(&closes, 20, Decimal::from(2)),
            volume_ratio: volume_ratio(candles, 20).map(|v| v.round_dp(2)),
        }
    }
}
