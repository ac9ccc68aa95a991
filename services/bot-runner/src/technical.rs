//! Technical engines used when no LLM answer is available
//!
//! - Trend: EMA 12/26 crossover, stronger right after the cross
//! - Mean reversion: RSI 14 outside 30/70
//! - Breakout: close beyond the prior 20-bar range, volume confirmed

use control_plane::models::AlgorithmMode;
use exchange_gateway::Candle;
use rust_decimal::prelude::*;

use crate::indicators::{atr, closes, ema, rsi, volume_ratio};
use crate::signal::SignalAction;

/// Output of a technical engine before it becomes a `TradeSignal`
#[derive(Debug, Clone, PartialEq)]
pub struct TechnicalView {
    pub action: SignalAction,
    pub confidence: f64,
    pub reasoning: String,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

impl TechnicalView {
    fn hold(reasoning: impl Into<String>) -> Self {
        Self {
            action: SignalAction::Hold,
            confidence: 0.0,
            reasoning: reasoning.into(),
            stop_loss: None,
            take_profit: None,
        }
    }

    /// ATR-based protective levels: 2 ATR stop, 3 ATR target
    fn with_atr_levels(mut self, candles: &[Candle]) -> Self {
        let (Some(last), Some(range)) = (candles.last(), atr(candles, 14)) else {
            return self;
        };
        let price = last.close;
        let (sl, tp) = match self.action {
            SignalAction::Buy => (price - range * Decimal::TWO, price + range * Decimal::from(3)),
            SignalAction::Sell => (price + range * Decimal::TWO, price - range * Decimal::from(3)),
            SignalAction::Hold => return self,
        };
        self.stop_loss = (sl > Decimal::ZERO).then_some(sl);
        self.take_profit = (tp > Decimal::ZERO).then_some(tp);
        self
    }
}

pub trait TechnicalAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;

    fn mode(&self) -> AlgorithmMode;

    fn evaluate(&self, candles: &[Candle]) -> TechnicalView;
}

pub fn for_mode(mode: AlgorithmMode) -> Box<dyn TechnicalAlgorithm> {
    match mode {
        AlgorithmMode::Trend => Box::new(TrendFollowing),
        AlgorithmMode::MeanReversion => Box::new(MeanReversion),
        AlgorithmMode::Breakout => Box::new(Breakout),
    }
}

fn to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

pub struct TrendFollowing;

impl TechnicalAlgorithm for TrendFollowing {
    fn name(&self) -> &'static str {
        "trend"
    }

    fn mode(&self) -> AlgorithmMode {
        AlgorithmMode::Trend
    }

    fn evaluate(&self, candles: &[Candle]) -> TechnicalView {
        let closes = closes(candles);
        let (Some(fast), Some(slow)) = (ema(&closes, 12), ema(&closes, 26)) else {
            return TechnicalView::hold("not enough candles for EMA 12/26");
        };
        if slow.is_zero() {
            return TechnicalView::hold("zero price");
        }

        let prev = &closes[..closes.len() - 1];
        let crossed = match (ema(prev, 12), ema(prev, 26)) {
            (Some(pf), Some(ps)) => (pf > ps) != (fast > slow),
            _ => false,
        };

        let spread = to_f64((fast - slow).abs() / slow);
        let mut confidence = 0.55 + (spread * 10.0).min(0.3);
        if crossed {
            confidence += 0.1;
        }

        let action = if fast > slow {
            SignalAction::Buy
        } else if fast < slow {
            SignalAction::Sell
        } else {
            return TechnicalView::hold("EMA 12 equals EMA 26");
        };

        TechnicalView {
            action,
            confidence: confidence.min(0.95),
            reasoning: format!(
                "EMA12 {} EMA26 ({:.2}% apart{})",
                if fast > slow { "above" } else { "below" },
                spread * 100.0,
                if crossed { ", fresh cross" } else { "" }
            ),
            stop_loss: None,
            take_profit: None,
        }
        .with_atr_levels(candles)
    }
}

pub struct MeanReversion;

impl TechnicalAlgorithm for MeanReversion {
    fn name(&self) -> &'static str {
        "mean_reversion"
    }

    fn mode(&self) -> AlgorithmMode {
        AlgorithmMode::MeanReversion
    }

    fn evaluate(&self, candles: &[Candle]) -> TechnicalView {
        let Some(value) = rsi(&closes(candles), 14) else {
            return TechnicalView::hold("not enough candles for RSI 14");
        };
        let value = to_f64(value);

        let (action, distance) = if value < 30.0 {
            (SignalAction::Buy, 30.0 - value)
        } else if value > 70.0 {
            (SignalAction::Sell, value - 70.0)
        } else {
            return TechnicalView::hold(format!("RSI {:.1} inside 30/70", value));
        };

        TechnicalView {
            action,
            confidence: (0.5 + distance / 60.0).min(0.95),
            reasoning: format!(
                "RSI {:.1} {}",
                value,
                if action == SignalAction::Buy { "oversold" } else { "overbought" }
            ),
            stop_loss: None,
            take_profit: None,
        }
        .with_atr_levels(candles)
    }
}

/// Bars forming the range
const BREAKOUT_PERIOD: usize = 20;

pub struct Breakout;

impl TechnicalAlgorithm for Breakout {
    fn name(&self) -> &'static str {
        "breakout"
    }

    fn mode(&self) -> AlgorithmMode {
        AlgorithmMode::Breakout
    }

    fn evaluate(&self, candles: &[Candle]) -> TechnicalView {
        if candles.len() <= BREAKOUT_PERIOD {
            return TechnicalView::hold("not enough candles for a 20-bar range");
        }
        let Some(last) = candles.last() else {
            return TechnicalView::hold("no candles");
        };
        let range = &candles[candles.len() - 1 - BREAKOUT_PERIOD..candles.len() - 1];
        let high = range.iter().map(|c| c.high).max().unwrap_or(last.close);
        let low = range.iter().map(|c| c.low).min().unwrap_or(last.close);

        let action = if last.close > high {
            SignalAction::Buy
        } else if last.close < low {
            SignalAction::Sell
        } else {
            return TechnicalView::hold(format!("close inside range {}-{}", low, high));
        };

        let volume = volume_ratio(candles, BREAKOUT_PERIOD).map(to_f64).unwrap_or(1.0);
        let confirmed = volume >= 1.5;

        TechnicalView {
            action,
            confidence: if confirmed { 0.75 } else { 0.6 },
            reasoning: format!(
                "close {} broke {} {} (volume x{:.1})",
                last.close,
                if action == SignalAction::Buy { "above" } else { "below" },
                if action == SignalAction::Buy { high } else { low },
                volume
            ),
            stop_loss: None,
            take_profit: None,
        }
        .with_atr_levels(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn candles(closes: &[i64]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| Candle {
                open_time: start + Duration::hours(i as i64),
                open: Decimal::from(*c),
                high: Decimal::from(*c + 1),
                low: Decimal::from(*c - 1),
                close: Decimal::from(*c),
                volume: Decimal::from(100),
            })
            .collect()
    }

    #[test]
    fn test_trend_follows_direction() {
        let up: Vec<i64> = (100..160).collect();
        let view = TrendFollowing.evaluate(&candles(&up));
        assert_eq!(view.action, SignalAction::Buy);
        assert!(view.confidence >= 0.55);
        let sl = view.stop_loss.unwrap();
        let tp = view.take_profit.unwrap();
        assert!(sl < Decimal::from(159) && tp > Decimal::from(159));

        let down: Vec<i64> = (100..160).rev().collect();
        assert_eq!(TrendFollowing.evaluate(&candles(&down)).action, SignalAction::Sell);
    }

    #[test]
    fn test_trend_needs_history() {
        let view = TrendFollowing.evaluate(&candles(&[1, 2, 3]));
        assert_eq!(view.action, SignalAction::Hold);
        assert_eq!(view.confidence, 0.0);
    }

    #[test]
    fn test_mean_reversion_fades_extremes() {
        let falling: Vec<i64> = (100..140).rev().collect();
        assert_eq!(MeanReversion.evaluate(&candles(&falling)).action, SignalAction::Buy);
        let rising: Vec<i64> = (100..140).collect();
        let view = MeanReversion.evaluate(&candles(&rising));
        assert_eq!(view.action, SignalAction::Sell);
        assert!(view.stop_loss.unwrap() > Decimal::from(139));

        let flat = vec![100; 40];
        assert_eq!(MeanReversion.evaluate(&candles(&flat)).action, SignalAction::Hold);
    }

    #[test]
    fn test_breakout_above_range() {
        let mut series = vec![100; 30];
        series.push(110);
        let mut data = candles(&series);
        if let Some(last) = data.last_mut() {
            last.volume = Decimal::from(200);
        }
        let view = Breakout.evaluate(&data);
        assert_eq!(view.action, SignalAction::Buy);
        assert_eq!(view.confidence, 0.75);

        let mut series = vec![100; 30];
        series.push(90);
        assert_eq!(Breakout.evaluate(&candles(&series)).action, SignalAction::Sell);
        assert_eq!(Breakout.evaluate(&candles(&vec![100; 30])).action, SignalAction::Hold);
    }

    #[test]
    fn test_for_mode() {
        assert_eq!(for_mode(AlgorithmMode::Breakout).name(), "breakout");
        assert_eq!(for_mode(AlgorithmMode::Trend).mode(), AlgorithmMode::Trend);
    }
}
