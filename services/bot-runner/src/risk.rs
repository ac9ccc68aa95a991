//! Risk gating between a signal and the exchange
//!
//! Rules run in a fixed order and the first failure wins, so the rejection
//! reason recorded for a signal is stable.

use control_plane::models::Subscription;
use exchange_gateway::{PositionSide, SymbolRules};
use rust_decimal::prelude::*;
use serde::Serialize;

use crate::signal::TradeSignal;

/// Per-subscription limits
#[derive(Debug, Clone, PartialEq)]
pub struct RiskLimits {
    pub leverage: u32,
    pub position_size_pct: Decimal,
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,
    pub max_daily_loss_usd: Decimal,
    pub max_concurrent_positions: usize,
    pub max_trades_per_day: i64,
    pub min_confidence: f64,
}

fn pct(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or_default()
}

impl From<&Subscription> for RiskLimits {
    fn from(sub: &Subscription) -> Self {
        Self {
            leverage: sub.leverage.max(1) as u32,
            position_size_pct: pct(sub.position_size_pct),
            stop_loss_pct: pct(sub.stop_loss_pct),
            take_profit_pct: pct(sub.take_profit_pct),
            max_daily_loss_usd: sub.max_daily_loss_usd,
            max_concurrent_positions: sub.max_concurrent_positions.max(0) as usize,
            max_trades_per_day: sub.max_trades_per_day.max(0) as i64,
            min_confidence: sub.min_confidence,
        }
    }
}

/// Everything one evaluation looks at
#[derive(Debug, Clone)]
pub struct RiskInputs<'a> {
    pub signal: &'a TradeSignal,
    /// Price the entry is sized at
    pub price: Decimal,
    pub limits: &'a RiskLimits,
    pub rules: &'a SymbolRules,
    /// Realised PnL of trades closed today (negative is a loss)
    pub realized_pnl_today: Decimal,
    pub trades_today: i64,
    /// Symbols with an open position
    pub open_symbols: &'a [String],
    pub available_balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderPlan {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub margin: Decimal,
    pub notional: Decimal,
    pub leverage: u32,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RiskRejection {
    #[error("signal is HOLD")]
    NotActionable,

    #[error("confidence {confidence:.2} below minimum {min:.2}")]
    LowConfidence { confidence: f64, min: f64 },

    #[error("daily loss {loss} reached limit {limit}")]
    DailyLossLimit { loss: Decimal, limit: Decimal },

    #[error("{count} trades today, limit is {limit}")]
    TradeLimit { count: i64, limit: i64 },

    #[error("position already open on {0}")]
    PositionOpen(String),

    #[error("{open} positions open, limit is {limit}")]
    TooManyPositions { open: usize, limit: usize },

    #[error("no available balance")]
    NoBalance,

    #[error("invalid price {0}")]
    InvalidPrice(Decimal),

    #[error("quantity {quantity} below minimum {min}")]
    QuantityTooSmall { quantity: Decimal, min: Decimal },

    #[error("notional {notional} below minimum {min}")]
    NotionalTooSmall { notional: Decimal, min: Decimal },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Approved(OrderPlan),
    Rejected(RiskRejection),
}

impl RiskDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, RiskDecision::Approved(_))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RiskManager;

impl RiskManager {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(&self, inputs: &RiskInputs<'_>) -> RiskDecision {
        match self.check(inputs) {
            Ok(plan) => RiskDecision::Approved(plan),
            Err(rejection) => RiskDecision::Rejected(rejection),
        }
    }

    fn check(&self, inputs: &RiskInputs<'_>) -> Result<OrderPlan, RiskRejection> {
        let signal = inputs.signal;
        let limits = inputs.limits;

        let side = signal
            .action
            .position_side()
            .ok_or(RiskRejection::NotActionable)?;

        if signal.confidence < limits.min_confidence {
            return Err(RiskRejection::LowConfidence {
                confidence: signal.confidence,
                min: limits.min_confidence,
            });
        }

        let loss = (-inputs.realized_pnl_today).max(Decimal::ZERO);
        if loss >= limits.max_daily_loss_usd {
            return Err(RiskRejection::DailyLossLimit {
                loss,
                limit: limits.max_daily_loss_usd,
            });
        }

        if inputs.trades_today >= limits.max_trades_per_day {
            return Err(RiskRejection::TradeLimit {
                count: inputs.trades_today,
                limit: limits.max_trades_per_day,
            });
        }

        if inputs.open_symbols.iter().any(|s| s == &signal.symbol) {
            return Err(RiskRejection::PositionOpen(signal.symbol.clone()));
        }

        if inputs.open_symbols.len() >= limits.max_concurrent_positions {
            return Err(RiskRejection::TooManyPositions {
                open: inputs.open_symbols.len(),
                limit: limits.max_concurrent_positions,
            });
        }

        if inputs.available_balance <= Decimal::ZERO {
            return Err(RiskRejection::NoBalance);
        }
        if inputs.price <= Decimal::ZERO {
            return Err(RiskRejection::InvalidPrice(inputs.price));
        }

        let hundred = Decimal::ONE_HUNDRED;
        let margin = inputs.available_balance * limits.position_size_pct / hundred;
        let notional = margin * Decimal::from(limits.leverage);
        let quantity = inputs.rules.round_quantity(notional / inputs.price);

        if quantity < inputs.rules.min_qty || quantity.is_zero() {
            return Err(RiskRejection::QuantityTooSmall {
                quantity,
                min: inputs.rules.min_qty,
            });
        }
        let notional = quantity * inputs.price;
        if notional < inputs.rules.min_notional {
            return Err(RiskRejection::NotionalTooSmall {
                notional,
                min: inputs.rules.min_notional,
            });
        }

        let (stop_loss, take_profit) = protective_levels(inputs.price, side, signal, limits);

        Ok(OrderPlan {
            symbol: signal.symbol.clone(),
            side,
            quantity,
            entry_price: inputs.price,
            margin,
            notional,
            leverage: limits.leverage,
            stop_loss: inputs.rules.round_price(stop_loss),
            take_profit: inputs.rules.round_price(take_profit),
        })
    }
}

/// SL/TP from the signal when on the correct side of price, else from the
/// subscription percentages
fn protective_levels(
    price: Decimal,
    side: PositionSide,
    signal: &TradeSignal,
    limits: &RiskLimits,
) -> (Decimal, Decimal) {
    let hundred = Decimal::ONE_HUNDRED;
    let dir = side.direction();

    let default_sl = price * (Decimal::ONE - dir * limits.stop_loss_pct / hundred);
    let default_tp = price * (Decimal::ONE + dir * limits.take_profit_pct / hundred);

    let stop_loss = signal
        .stop_loss
        .filter(|sl| *sl > Decimal::ZERO && (price - *sl) * dir > Decimal::ZERO)
        .unwrap_or(default_sl);
    let take_profit = signal
        .take_profit
        .filter(|tp| *tp > Decimal::ZERO && (*tp - price) * dir > Decimal::ZERO)
        .unwrap_or(default_tp);

    (stop_loss, take_profit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{SignalAction, SignalSource};
    use chrono::Utc;

    fn d(v: &str) -> Decimal {
        Decimal::from_str(v).unwrap()
    }

    fn limits() -> RiskLimits {
        RiskLimits {
            leverage: 5,
            position_size_pct: d("10"),
            stop_loss_pct: d("2"),
            take_profit_pct: d("4"),
            max_daily_loss_usd: d("100"),
            max_concurrent_positions: 2,
            max_trades_per_day: 5,
            min_confidence: 0.6,
        }
    }

    fn rules() -> SymbolRules {
        SymbolRules {
            symbol: "BTCUSDT".to_string(),
            step_size: d("0.001"),
            min_qty: d("0.001"),
            min_notional: d("5"),
            tick_size: d("0.1"),
        }
    }

    fn signal(action: SignalAction, confidence: f64) -> TradeSignal {
        TradeSignal {
            symbol: "BTCUSDT".to_string(),
            action,
            confidence,
            reasoning: String::new(),
            price: d("50000"),
            stop_loss: None,
            take_profit: None,
            source: SignalSource::Technical,
            generated_at: Utc::now(),
        }
    }

    fn evaluate(signal: &TradeSignal, tweak: impl FnOnce(&mut RiskInputs<'_>)) -> RiskDecision {
        evaluate_with_open(signal, &[], tweak)
    }

    fn evaluate_with_open(
        signal: &TradeSignal,
        open_symbols: &[String],
        tweak: impl FnOnce(&mut RiskInputs<'_>),
    ) -> RiskDecision {
        let limits = limits();
        let rules = rules();
        let mut inputs = RiskInputs {
            signal,
            price: d("50000"),
            limits: &limits,
            rules: &rules,
            realized_pnl_today: Decimal::ZERO,
            trades_today: 0,
            open_symbols,
            available_balance: d("1000"),
        };
        tweak(&mut inputs);
        RiskManager::new().evaluate(&inputs)
    }

    #[test]
    fn test_long_sizing_and_default_levels() {
        let RiskDecision::Approved(plan) = evaluate(&signal(SignalAction::Buy, 0.8), |_| {}) else {
            panic!("expected approval");
        };
        // 1000 * 10% = 100 margin, x5 = 500 notional, / 50000 = 0.01
        assert_eq!(plan.quantity, d("0.01"));
        assert_eq!(plan.margin, d("100"));
        assert_eq!(plan.notional, d("500"));
        assert_eq!(plan.side, PositionSide::Long);
        assert_eq!(plan.stop_loss, d("49000"));
        assert_eq!(plan.take_profit, d("52000"));
    }

    #[test]
    fn test_short_uses_signal_levels_when_valid() {
        let mut s = signal(SignalAction::Sell, 0.9);
        s.stop_loss = Some(d("51234.56"));
        s.take_profit = Some(d("60000"));
        let RiskDecision::Approved(plan) = evaluate(&s, |_| {}) else {
            panic!("expected approval");
        };
        assert_eq!(plan.side, PositionSide::Short);
        assert_eq!(plan.stop_loss, d("51234.6"));
        // Take profit above price is wrong for a short
        assert_eq!(plan.take_profit, d("48000"));
    }

    #[test]
    fn test_rules_in_order() {
        let hold = signal(SignalAction::Hold, 0.99);
        assert_eq!(
            evaluate(&hold, |_| {}),
            RiskDecision::Rejected(RiskRejection::NotActionable)
        );

        let weak = signal(SignalAction::Buy, 0.5);
        assert!(matches!(
            evaluate(&weak, |_| {}),
            RiskDecision::Rejected(RiskRejection::LowConfidence { .. })
        ));

        let buy = signal(SignalAction::Buy, 0.8);
        assert!(matches!(
            evaluate(&buy, |i| i.realized_pnl_today = d("-100")),
            RiskDecision::Rejected(RiskRejection::DailyLossLimit { .. })
        ));
        assert!(evaluate(&buy, |i| i.realized_pnl_today = d("250")).is_approved());

        assert!(matches!(
            evaluate(&buy, |i| i.trades_today = 5),
            RiskDecision::Rejected(RiskRejection::TradeLimit { count: 5, limit: 5 })
        ));

        let open = vec!["BTCUSDT".to_string()];
        assert_eq!(
            evaluate_with_open(&buy, &open, |_| {}),
            RiskDecision::Rejected(RiskRejection::PositionOpen("BTCUSDT".to_string()))
        );

        let others = vec!["ETHUSDT".to_string(), "SOLUSDT".to_string()];
        assert!(matches!(
            evaluate_with_open(&buy, &others, |_| {}),
            RiskDecision::Rejected(RiskRejection::TooManyPositions { open: 2, limit: 2 })
        ));

        assert_eq!(
            evaluate(&buy, |i| i.available_balance = Decimal::ZERO),
            RiskDecision::Rejected(RiskRejection::NoBalance)
        );
    }

    #[test]
    fn test_minimums() {
        let buy = signal(SignalAction::Buy, 0.8);
        // 1 * 10% * 5 = 0.5 notional -> 0.00001 BTC rounds to zero
        assert!(matches!(
            evaluate(&buy, |i| i.available_balance = d("1")),
            RiskDecision::Rejected(RiskRejection::QuantityTooSmall { .. })
        ));
        // 0.001 BTC at 3000 = 3 USDT notional
        assert!(matches!(
            evaluate(&buy, |i| {
                i.available_balance = d("6");
                i.price = d("3000");
            }),
            RiskDecision::Rejected(RiskRejection::NotionalTooSmall { .. })
        ));
    }
}
