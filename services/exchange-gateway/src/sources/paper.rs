//! Simulated futures account for paper trading.
//!
//! Market data comes from an optional live source (public endpoints only) or
//! from candles/prices fed in directly. Fills happen at the current ticker
//! price and protective brackets are checked in [`PaperExchange::mark_to_market`].

use crate::health::HealthTracker;
use crate::types::*;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info};

const VENUE: &str = "paper";
const DEFAULT_LEVERAGE: u32 = 1;

#[derive(Debug, Clone)]
struct PaperPosition {
    side: PositionSide,
    quantity: Decimal,
    entry_price: Decimal,
    leverage: u32,
    stop_loss: Option<Decimal>,
    take_profit: Option<Decimal>,
}

impl PaperPosition {
    fn margin(&self) -> Decimal {
        self.quantity * self.entry_price / Decimal::from(self.leverage.max(1))
    }

    fn pnl_at(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.quantity * self.side.direction()
    }
}

#[derive(Debug, Default)]
struct PaperState {
    wallet_balance: Decimal,
    positions: HashMap<String, PaperPosition>,
    leverage: HashMap<String, u32>,
    prices: HashMap<String, Decimal>,
    candles: HashMap<String, Vec<Candle>>,
    next_order_id: u64,
}

impl PaperState {
    fn used_margin(&self) -> Decimal {
        self.positions.values().map(|p| p.margin()).sum()
    }

    fn next_id(&mut self) -> String {
        self.next_order_id += 1;
        format!("paper-{}", self.next_order_id)
    }
}

/// A position closed by a stop-loss or take-profit trigger
#[derive(Debug, Clone, PartialEq)]
pub struct PaperFill {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub exit_price: Decimal,
    pub realized_pnl: Decimal,
}

pub struct PaperExchange {
    market: Option<Arc<dyn ExchangeClient>>,
    state: RwLock<PaperState>,
    fee_rate: Decimal,
    health_tracker: HealthTracker,
}

impl PaperExchange {
    pub fn new(starting_balance: Decimal) -> Self {
        Self {
            market: None,
            state: RwLock::new(PaperState {
                wallet_balance: starting_balance,
                ..Default::default()
            }),
            fee_rate: Decimal::ZERO,
            health_tracker: HealthTracker::new(),
        }
    }

    /// Use a live venue for candles, tickers and symbol rules
    pub fn with_market(mut self, market: Arc<dyn ExchangeClient>) -> Self {
        self.market = Some(market);
        self
    }

    /// Taker fee charged on every fill, as a fraction of notional
    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.state
            .write()
            .await
            .prices
            .insert(symbol.to_uppercase(), price);
    }

    pub async fn set_candles(&self, symbol: &str, candles: Vec<Candle>) {
        self.state
            .write()
            .await
            .candles
            .insert(symbol.to_uppercase(), candles);
    }

    async fn current_price(&self, symbol: &str) -> Result<Decimal> {
        let symbol = symbol.to_uppercase();
        {
            let state = self.state.read().await;
            if let Some(price) = state.prices.get(&symbol) {
                return Ok(*price);
            }
            if self.market.is_none() {
                return state
                    .candles
                    .get(&symbol)
                    .and_then(|c| c.last())
                    .map(|c| c.close)
                    .ok_or(ExchangeError::UnknownSymbol(symbol));
            }
        }

        match &self.market {
            Some(market) => Ok(market.get_ticker(&symbol).await?.price),
            None => Err(ExchangeError::UnknownSymbol(symbol)),
        }
    }

    /// Close positions whose stop-loss or take-profit has been crossed
    pub async fn mark_to_market(&self) -> Result<Vec<PaperFill>> {
        let symbols: Vec<String> = {
            let state = self.state.read().await;
            state.positions.keys().cloned().collect()
        };

        let mut fills = Vec::new();
        for symbol in symbols {
            let price = self.current_price(&symbol).await?;
            let mut state = self.state.write().await;
            let Some(position) = state.positions.get(&symbol).cloned() else {
                continue;
            };

            let stop_hit = position.stop_loss.map_or(false, |sl| match position.side {
                PositionSide::Long => price <= sl,
                PositionSide::Short => price >= sl,
            });
            let target_hit = position.take_profit.map_or(false, |tp| match position.side {
                PositionSide::Long => price >= tp,
                PositionSide::Short => price <= tp,
            });
            if !stop_hit && !target_hit {
                continue;
            }

            let exit_price = if stop_hit {
                position.stop_loss.unwrap_or(price)
            } else {
                position.take_profit.unwrap_or(price)
            };
            let pnl = position.pnl_at(exit_price);
            let fee = position.quantity * exit_price * self.fee_rate;
            state.wallet_balance += pnl - fee;
            state.positions.remove(&symbol);

            info!(
                "Paper {} {:?} closed at {} ({}), pnl {}",
                symbol,
                position.side,
                exit_price,
                if stop_hit { "stop-loss" } else { "take-profit" },
                pnl
            );
            fills.push(PaperFill {
                symbol,
                side: position.side,
                quantity: position.quantity,
                exit_price,
                realized_pnl: pnl - fee,
            });
        }

        Ok(fills)
    }
}

#[async_trait::async_trait]
impl ExchangeClient for PaperExchange {
    fn exchange(&self) -> Exchange {
        Exchange::Paper
    }

    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: TimeFrame,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        if let Some(market) = &self.market {
            return market.get_candles(symbol, timeframe, limit).await;
        }

        let state = self.state.read().await;
        let candles = state
            .candles
            .get(&symbol.to_uppercase())
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))?;
        let start = candles.len().saturating_sub(limit);
        Ok(candles[start..].to_vec())
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        let price = self.current_price(symbol).await?;
        Ok(Ticker {
            symbol: symbol.to_uppercase(),
            price,
            timestamp: Utc::now(),
        })
    }

    async fn get_symbol_rules(&self, symbol: &str) -> Result<SymbolRules> {
        match &self.market {
            Some(market) => market.get_symbol_rules(symbol).await,
            None => Ok(SymbolRules::permissive(&symbol.to_uppercase())),
        }
    }

    async fn get_balance(&self) -> Result<Balance> {
        let state = self.state.read().await;
        let available = (state.wallet_balance - state.used_margin()).max(Decimal::ZERO);
        Ok(Balance {
            asset: "USDT".to_string(),
            wallet_balance: state.wallet_balance,
            available_balance: available,
        })
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        let snapshot: Vec<(String, PaperPosition)> = {
            let state = self.state.read().await;
            state
                .positions
                .iter()
                .map(|(s, p)| (s.clone(), p.clone()))
                .collect()
        };

        let mut positions = Vec::with_capacity(snapshot.len());
        for (symbol, p) in snapshot {
            let mark = self.current_price(&symbol).await.unwrap_or(p.entry_price);
            positions.push(Position {
                symbol,
                side: p.side,
                quantity: p.quantity,
                entry_price: p.entry_price,
                mark_price: mark,
                unrealized_pnl: p.pnl_at(mark),
                leverage: p.leverage,
            });
        }
        Ok(positions)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        if leverage == 0 || leverage > 125 {
            return Err(ExchangeError::Rejected(format!(
                "leverage {} out of range",
                leverage
            )));
        }
        self.state
            .write()
            .await
            .leverage
            .insert(symbol.to_uppercase(), leverage);
        Ok(())
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        let started = Instant::now();
        if order.quantity <= Decimal::ZERO {
            return Err(ExchangeError::Rejected("quantity must be positive".to_string()));
        }
        if !matches!(order.order_type, OrderType::Market) {
            return Err(ExchangeError::Rejected(
                "standalone conditional orders are not simulated; use place_bracket".to_string(),
            ));
        }

        let symbol = order.symbol.to_uppercase();
        let price = self.current_price(&symbol).await?;
        let mut state = self.state.write().await;
        let leverage = state
            .leverage
            .get(&symbol)
            .copied()
            .unwrap_or(DEFAULT_LEVERAGE);
        let fee = order.quantity * price * self.fee_rate;
        let order_side = PositionSide::from(order.side);

        match state.positions.get(&symbol).cloned() {
            // Reducing or closing an existing position
            Some(existing) if existing.side != order_side => {
                let closed_qty = order.quantity.min(existing.quantity);
                let pnl = (price - existing.entry_price) * closed_qty * existing.side.direction();
                state.wallet_balance += pnl - fee;

                let remaining = existing.quantity - closed_qty;
                if remaining.is_zero() {
                    state.positions.remove(&symbol);
                } else if let Some(p) = state.positions.get_mut(&symbol) {
                    p.quantity = remaining;
                }
                debug!("Paper reduce {} by {} at {}, pnl {}", symbol, closed_qty, price, pnl);
            }
            _ if order.reduce_only => {
                return Err(ExchangeError::Rejected(format!(
                    "reduce-only order for {} would increase position",
                    symbol
                )));
            }
            existing => {
                let required = order.quantity * price / Decimal::from(leverage) + fee;
                let available = state.wallet_balance - state.used_margin();
                if required > available {
                    return Err(ExchangeError::InsufficientBalance {
                        required,
                        available,
                    });
                }

                state.wallet_balance -= fee;
                let position = match existing {
                    Some(mut p) => {
                        let total = p.quantity + order.quantity;
                        p.entry_price =
                            (p.entry_price * p.quantity + price * order.quantity) / total;
                        p.quantity = total;
                        p
                    }
                    None => PaperPosition {
                        side: order_side,
                        quantity: order.quantity,
                        entry_price: price,
                        leverage,
                        stop_loss: None,
                        take_profit: None,
                    },
                };
                state.positions.insert(symbol.clone(), position);
                debug!("Paper open {:?} {} {} at {}", order_side, order.quantity, symbol, price);
            }
        }

        let id = state.next_id();
        drop(state);
        self.health_tracker
            .record_success(started.elapsed().as_millis() as u64);

        Ok(OrderAck {
            exchange_order_id: id,
            client_order_id: order.client_order_id.clone(),
            symbol,
            status: "FILLED".to_string(),
            avg_price: Some(price),
            executed_qty: order.quantity,
        })
    }

    async fn place_bracket(&self, bracket: &BracketRequest) -> Result<Vec<OrderAck>> {
        let symbol = bracket.symbol.to_uppercase();
        let mut state = self.state.write().await;
        let position = state
            .positions
            .get_mut(&symbol)
            .filter(|p| p.side == bracket.position_side)
            .ok_or_else(|| {
                ExchangeError::Rejected(format!("no {:?} position on {}", bracket.position_side, symbol))
            })?;

        position.stop_loss = bracket.stop_loss;
        position.take_profit = bracket.take_profit;

        let mut acks = Vec::new();
        let legs = [bracket.stop_loss, bracket.take_profit];
        for _ in legs.iter().flatten() {
            let id = state.next_id();
            acks.push(OrderAck {
                exchange_order_id: id,
                client_order_id: None,
                symbol: symbol.clone(),
                status: "NEW".to_string(),
                avg_price: None,
                executed_qty: Decimal::ZERO,
            });
        }
        Ok(acks)
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        if let Some(p) = self
            .state
            .write()
            .await
            .positions
            .get_mut(&symbol.to_uppercase())
        {
            p.stop_loss = None;
            p.take_profit = None;
        }
        Ok(())
    }

    async fn health(&self) -> SourceHealth {
        match &self.market {
            Some(market) => {
                let mut health = market.health().await;
                health.source = format!("{}+{}", VENUE, health.source);
                health
            }
            None => self.health_tracker.snapshot(VENUE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_open_and_close_long() {
        let paper = PaperExchange::new(dec("1000"));
        paper.set_price("BTCUSDT", dec("100")).await;
        paper.set_leverage("BTCUSDT", 5).await.unwrap();

        paper
            .place_order(&OrderRequest::market("BTCUSDT", Side::Buy, dec("10")))
            .await
            .unwrap();

        let balance = paper.get_balance().await.unwrap();
        assert_eq!(balance.available_balance, dec("800"));

        paper.set_price("BTCUSDT", dec("110")).await;
        let positions = paper.get_positions().await.unwrap();
        assert_eq!(positions[0].unrealized_pnl, dec("100"));

        let mut close = OrderRequest::market("BTCUSDT", Side::Sell, dec("10"));
        close.reduce_only = true;
        paper.place_order(&close).await.unwrap();

        assert!(paper.get_positions().await.unwrap().is_empty());
        assert_eq!(paper.get_balance().await.unwrap().wallet_balance, dec("1100"));
    }

    #[tokio::test]
    async fn test_insufficient_margin_rejected() {
        let paper = PaperExchange::new(dec("100"));
        paper.set_price("ETHUSDT", dec("2000")).await;

        let err = paper
            .place_order(&OrderRequest::market("ETHUSDT", Side::Buy, dec("1")))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientBalance { .. }));
    }

    #[tokio::test]
    async fn test_reduce_only_without_position_rejected() {
        let paper = PaperExchange::new(dec("1000"));
        paper.set_price("ETHUSDT", dec("10")).await;

        let mut order = OrderRequest::market("ETHUSDT", Side::Sell, dec("1"));
        order.reduce_only = true;
        assert!(paper.place_order(&order).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_loss_triggers_on_mark() {
        let paper = PaperExchange::new(dec("1000"));
        paper.set_price("SOLUSDT", dec("50")).await;
        paper.set_leverage("SOLUSDT", 2).await.unwrap();
        paper
            .place_order(&OrderRequest::market("SOLUSDT", Side::Sell, dec("4")))
            .await
            .unwrap();
        paper
            .place_bracket(&BracketRequest {
                symbol: "SOLUSDT".to_string(),
                position_side: PositionSide::Short,
                quantity: dec("4"),
                stop_loss: Some(dec("55")),
                take_profit: Some(dec("40")),
            })
            .await
            .unwrap();

        paper.set_price("SOLUSDT", dec("52")).await;
        assert!(paper.mark_to_market().await.unwrap().is_empty());

        paper.set_price("SOLUSDT", dec("56")).await;
        let fills = paper.mark_to_market().await.unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].exit_price, dec("55"));
        assert_eq!(fills[0].realized_pnl, dec("-20"));
        assert_eq!(paper.get_balance().await.unwrap().wallet_balance, dec("980"));
    }

    #[tokio::test]
    async fn test_candles_from_feed() {
        let paper = PaperExchange::new(dec("1000"));
        let candles: Vec<Candle> = (0..5)
            .map(|i| Candle {
                open_time: Utc::now(),
                open: Decimal::from(i),
                high: Decimal::from(i + 1),
                low: Decimal::from(i),
                close: Decimal::from(i),
                volume: Decimal::ONE,
            })
            .collect();
        paper.set_candles("BTCUSDT", candles).await;

        let last_two = paper
            .get_candles("btcusdt", TimeFrame::Hour1, 2)
            .await
            .unwrap();
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[1].close, Decimal::from(4));
        assert_eq!(paper.get_ticker("BTCUSDT").await.unwrap().price, Decimal::from(4));
    }
}
