//! Trade reconciliation
//!
//! A trade the database still holds as open, on a symbol where the exchange
//! reports no position, was closed outside the runner (stop-loss,
//! take-profit, liquidation or a manual close). It is closed at the current
//! ticker price.

use chrono::Utc;
use exchange_gateway::{ExchangeClient, PositionSide};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::{parse_side, RunStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosedTrade {
    pub trade_id: Uuid,
    pub symbol: String,
    pub exit_price: Decimal,
    pub realized_pnl: Decimal,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub closed: Vec<ClosedTrade>,
    /// Symbols of open trades that still have a position
    pub still_open: Vec<String>,
}

/// (exit − entry) × qty × direction
pub fn realized_pnl(
    side: PositionSide,
    entry_price: Decimal,
    exit_price: Decimal,
    quantity: Decimal,
) -> Decimal {
    (exit_price - entry_price) * quantity * side.direction()
}

pub async fn reconcile(
    store: &dyn RunStore,
    exchange: &dyn ExchangeClient,
    subscription_id: Uuid,
) -> anyhow::Result<ReconcileReport> {
    let open = store.open_trades(subscription_id).await?;
    let mut report = ReconcileReport {
        checked: open.len(),
        ..Default::default()
    };
    if open.is_empty() {
        return Ok(report);
    }

    // Venues report flat positions with zero size; those count as closed
    let live: HashSet<String> = exchange
        .get_positions()
        .await?
        .into_iter()
        .filter(|p| !p.quantity.is_zero())
        .map(|p| p.symbol.to_uppercase())
        .collect();

    for trade in open {
        if live.contains(&trade.symbol.to_uppercase()) {
            report.still_open.push(trade.symbol);
            continue;
        }

        let Some(side) = parse_side(&trade.side) else {
            warn!(trade_id = %trade.id, "Open trade has unknown side '{}'", trade.side);
            continue;
        };
        let exit_price = match exchange.get_ticker(&trade.symbol).await {
            Ok(ticker) => ticker.price,
            Err(e) => {
                warn!(
                    trade_id = %trade.id,
                    symbol = %trade.symbol,
                    "No price to close trade at, retrying next run: {}",
                    e
                );
                continue;
            }
        };

        let pnl = realized_pnl(side, trade.entry_price, exit_price, trade.quantity);
        // False when another run closed it first
        if store
            .close_trade(trade.id, exit_price, pnl, Utc::now())
            .await?
        {
            info!(
                subscription_id = %subscription_id,
                trade_id = %trade.id,
                symbol = %trade.symbol,
                exit_price = %exit_price,
                realized_pnl = %pnl,
                "Closed trade with no exchange position"
            );
            report.closed.push(ClosedTrade {
                trade_id: trade.id,
                symbol: trade.symbol,
                exit_price,
                realized_pnl: pnl,
            });
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryRunStore, NewTrade};
    use control_plane::models::TradeStatus;
    use exchange_gateway::{Exchange, OrderRequest, PaperExchange, Side};

    #[test]
    fn test_pnl_direction() {
        let (entry, exit, qty) = (Decimal::from(100), Decimal::from(110), Decimal::from(2));
        assert_eq!(realized_pnl(PositionSide::Long, entry, exit, qty), Decimal::from(20));
        assert_eq!(realized_pnl(PositionSide::Short, entry, exit, qty), Decimal::from(-20));
    }

    fn open_trade(subscription_id: Uuid, symbol: &str, side: PositionSide) -> NewTrade {
        NewTrade {
            subscription_id,
            signal_id: None,
            exchange: Exchange::Paper,
            symbol: symbol.to_string(),
            side,
            quantity: Decimal::ONE,
            entry_price: Decimal::from(100),
            stop_loss: None,
            take_profit: None,
            leverage: 1,
            status: TradeStatus::Open,
            exchange_order_id: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_closes_only_trades_without_position() {
        let store = MemoryRunStore::new();
        let sub = Uuid::new_v4();
        store
            .record_trade(&open_trade(sub, "BTCUSDT", PositionSide::Long))
            .await
            .unwrap();
        store
            .record_trade(&open_trade(sub, "ETHUSDT", PositionSide::Short))
            .await
            .unwrap();

        let paper = PaperExchange::new(Decimal::from(10_000));
        paper.set_price("BTCUSDT", Decimal::from(100)).await;
        paper.set_price("ETHUSDT", Decimal::from(90)).await;
        // Only BTC is still held on the exchange
        paper
            .place_order(&OrderRequest::market("BTCUSDT", Side::Buy, Decimal::ONE))
            .await
            .unwrap();

        let report = reconcile(&store, &paper, sub).await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.still_open, vec!["BTCUSDT".to_string()]);
        assert_eq!(report.closed.len(), 1);
        assert_eq!(report.closed[0].symbol, "ETHUSDT");
        // Short from 100 to 90
        assert_eq!(report.closed[0].realized_pnl, Decimal::from(10));

        let open = store.open_trades(sub).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn test_nothing_open_skips_exchange() {
        let store = MemoryRunStore::new();
        // No prices configured: any exchange call would fail
        let paper = PaperExchange::new(Decimal::ZERO);
        let report = reconcile(&store, &paper, Uuid::new_v4()).await.unwrap();
        assert_eq!(report.checked, 0);
    }
}
