//! Persistence used by the scheduler and the workflow

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use control_plane::airdrop;
use control_plane::models::{
    bigdecimal_from_decimal, decimal_from_bigdecimal, Bot, BotDb, BotStatus, ExchangeCredential,
    PointsAction, SignalRecord, Subscription, SubscriptionDb, SubscriptionStatus, Trade, TradeDb,
    TradeStatus,
};
use exchange_gateway::{Exchange, PositionSide};
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::signal::TradeSignal;

/// Longest error text stored on a subscription
const MAX_ERROR_LEN: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueSubscription {
    pub id: Uuid,
    pub execution_interval_secs: i32,
}

/// Everything a run needs, loaded in one go
#[derive(Debug, Clone)]
pub struct RunContext {
    pub subscription: Subscription,
    pub bot: Bot,
    /// The user's active credentials, oldest first
    pub credentials: Vec<ExchangeCredential>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTrade {
    pub subscription_id: Uuid,
    pub signal_id: Option<Uuid>,
    pub exchange: Exchange,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub leverage: u32,
    pub status: TradeStatus,
    pub exchange_order_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Ok,
    Error(String),
}

impl RunStatus {
    /// Value stored in `last_run_status`
    pub fn label(&self) -> String {
        match self {
            RunStatus::Ok => "ok".to_string(),
            RunStatus::Error(e) => format!("error: {}", clip(e)),
        }
    }

    pub fn error(&self) -> Option<String> {
        match self {
            RunStatus::Ok => None,
            RunStatus::Error(e) => Some(clip(e)),
        }
    }
}

fn clip(text: &str) -> String {
    text.chars().take(MAX_ERROR_LEN).collect()
}

pub fn side_str(side: PositionSide) -> &'static str {
    match side {
        PositionSide::Long => "long",
        PositionSide::Short => "short",
    }
}

pub fn parse_side(side: &str) -> Option<PositionSide> {
    match side {
        "long" => Some(PositionSide::Long),
        "short" => Some(PositionSide::Short),
        _ => None,
    }
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Mark active or paused subscriptions past `expires_at` as expired
    async fn expire_lapsed(&self, now: DateTime<Utc>) -> anyhow::Result<u64>;

    async fn due_subscriptions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> anyhow::Result<Vec<DueSubscription>>;

    /// Push `next_run_at` forward; false when another worker got there first
    async fn claim_run(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    async fn load_context(&self, subscription_id: Uuid) -> anyhow::Result<Option<RunContext>>;

    async fn open_trades(&self, subscription_id: Uuid) -> anyhow::Result<Vec<Trade>>;

    async fn realized_pnl_since(
        &self,
        subscription_id: Uuid,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Decimal>;

    /// Trades opened since `since`, failed attempts excluded
    async fn trades_since(&self, subscription_id: Uuid, since: DateTime<Utc>)
        -> anyhow::Result<i64>;

    async fn record_signal(
        &self,
        subscription_id: Uuid,
        signal: &TradeSignal,
    ) -> anyhow::Result<Uuid>;

    async fn mark_signal_executed(&self, signal_id: Uuid) -> anyhow::Result<()>;

    async fn record_trade(&self, trade: &NewTrade) -> anyhow::Result<Uuid>;

    async fn close_trade(
        &self,
        trade_id: Uuid,
        exit_price: Decimal,
        realized_pnl: Decimal,
        closed_at: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    async fn record_run_result(
        &self,
        subscription_id: Uuid,
        status: &RunStatus,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Idempotent per (user, action, reference)
    async fn award_points(
        &self,
        user_id: Uuid,
        action: PointsAction,
        reference: &str,
        points: i64,
    ) -> anyhow::Result<bool>;
}

pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn expire_lapsed(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'expired', updated_at = NOW()
            WHERE status IN ('active', 'paused') AND expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn due_subscriptions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> anyhow::Result<Vec<DueSubscription>> {
        let rows: Vec<(Uuid, i32)> = sqlx::query_as(
            r#"
            SELECT s.id, s.execution_interval_secs
            FROM subscriptions s
            JOIN bots b ON b.id = s.bot_id
            WHERE s.status = 'active'
              AND b.status = 'published'
              AND s.expires_at > $1
              AND (s.next_run_at IS NULL OR s.next_run_at <= $1)
            ORDER BY s.next_run_at ASC NULLS FIRST
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, execution_interval_secs)| DueSubscription {
                id,
                execution_interval_secs,
            })
            .collect())
    }

    async fn claim_run(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET next_run_at = $2, updated_at = NOW()
            WHERE id = $1
              AND status = 'active'
              AND (next_run_at IS NULL OR next_run_at <= $3)
            "#,
        )
        .bind(subscription_id)
        .bind(next_run_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn load_context(&self, subscription_id: Uuid) -> anyhow::Result<Option<RunContext>> {
        let Some(sub) =
            sqlx::query_as::<_, SubscriptionDb>("SELECT * FROM subscriptions WHERE id = $1")
                .bind(subscription_id)
                .fetch_optional(&self.pool)
                .await?
        else {
            return Ok(None);
        };

        let bot = sqlx::query_as::<_, BotDb>("SELECT * FROM bots WHERE id = $1")
            .bind(sub.bot_id)
            .fetch_one(&self.pool)
            .await?;

        let credentials = sqlx::query_as::<_, ExchangeCredential>(
            r#"
            SELECT * FROM exchange_credentials
            WHERE user_id = $1 AND is_active
            ORDER BY created_at ASC
            "#,
        )
        .bind(sub.user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(RunContext {
            subscription: sub.into(),
            bot: bot.into(),
            credentials,
        }))
    }

    async fn open_trades(&self, subscription_id: Uuid) -> anyhow::Result<Vec<Trade>> {
        let trades = sqlx::query_as::<_, TradeDb>(
            "SELECT * FROM trades WHERE subscription_id = $1 AND status = 'open' ORDER BY opened_at",
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(trades.into_iter().map(Into::into).collect())
    }

    async fn realized_pnl_since(
        &self,
        subscription_id: Uuid,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Decimal> {
        let total: bigdecimal::BigDecimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(realized_pnl), 0)
            FROM trades
            WHERE subscription_id = $1 AND status = 'closed' AND closed_at >= $2
            "#,
        )
        .bind(subscription_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(decimal_from_bigdecimal(total))
    }

    async fn trades_since(
        &self,
        subscription_id: Uuid,
        since: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM trades
            WHERE subscription_id = $1 AND status <> 'failed' AND opened_at >= $2
            "#,
        )
        .bind(subscription_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn record_signal(
        &self,
        subscription_id: Uuid,
        signal: &TradeSignal,
    ) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO signals (id, subscription_id, symbol, action, confidence, reasoning,
                                 price, stop_loss, take_profit, source, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(id)
        .bind(subscription_id)
        .bind(&signal.symbol)
        .bind(signal.action.as_str())
        .bind(signal.confidence)
        .bind(&signal.reasoning)
        .bind(bigdecimal_from_decimal(signal.price))
        .bind(signal.stop_loss.map(bigdecimal_from_decimal))
        .bind(signal.take_profit.map(bigdecimal_from_decimal))
        .bind(signal.source.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn mark_signal_executed(&self, signal_id: Uuid) -> anyhow::Result<()> {
        sqlx::query("UPDATE signals SET executed = TRUE WHERE id = $1")
            .bind(signal_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_trade(&self, trade: &NewTrade) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO trades (id, subscription_id, signal_id, exchange, symbol, side, quantity,
                                entry_price, stop_loss, take_profit, leverage, status,
                                exchange_order_id, error, opened_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NOW())
            "#,
        )
        .bind(id)
        .bind(trade.subscription_id)
        .bind(trade.signal_id)
        .bind(trade.exchange.as_str())
        .bind(&trade.symbol)
        .bind(side_str(trade.side))
        .bind(bigdecimal_from_decimal(trade.quantity))
        .bind(bigdecimal_from_decimal(trade.entry_price))
        .bind(trade.stop_loss.map(bigdecimal_from_decimal))
        .bind(trade.take_profit.map(bigdecimal_from_decimal))
        .bind(trade.leverage as i32)
        .bind(trade.status)
        .bind(&trade.exchange_order_id)
        .bind(&trade.error)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn close_trade(
        &self,
        trade_id: Uuid,
        exit_price: Decimal,
        realized_pnl: Decimal,
        closed_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE trades
            SET status = 'closed', exit_price = $2, realized_pnl = $3, closed_at = $4
            WHERE id = $1 AND status = 'open'
            "#,
        )
        .bind(trade_id)
        .bind(bigdecimal_from_decimal(exit_price))
        .bind(bigdecimal_from_decimal(realized_pnl))
        .bind(closed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_run_result(
        &self,
        subscription_id: Uuid,
        status: &RunStatus,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET last_run_at = $2, last_run_status = $3, last_error = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(subscription_id)
        .bind(at)
        .bind(status.label())
        .bind(status.error())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn award_points(
        &self,
        user_id: Uuid,
        action: PointsAction,
        reference: &str,
        points: i64,
    ) -> anyhow::Result<bool> {
        Ok(airdrop::award_points(&self.pool, user_id, action, reference, points).await?)
    }
}

#[derive(Default)]
struct MemoryState {
    subscriptions: HashMap<Uuid, Subscription>,
    bots: HashMap<Uuid, Bot>,
    credentials: Vec<ExchangeCredential>,
    signals: Vec<SignalRecord>,
    trades: Vec<Trade>,
    points: HashMap<(Uuid, &'static str, String), i64>,
}

/// In-process store for tests and local dry runs
#[derive(Clone, Default)]
pub struct MemoryRunStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_bot(&self, bot: Bot) {
        self.state.lock().await.bots.insert(bot.id, bot);
    }

    pub async fn insert_subscription(&self, subscription: Subscription) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.id, subscription);
    }

    pub async fn insert_credential(&self, credential: ExchangeCredential) {
        self.state.lock().await.credentials.push(credential);
    }

    pub async fn insert_trade(&self, trade: Trade) {
        self.state.lock().await.trades.push(trade);
    }

    pub async fn subscription(&self, id: Uuid) -> Option<Subscription> {
        self.state.lock().await.subscriptions.get(&id).cloned()
    }

    pub async fn signals(&self) -> Vec<SignalRecord> {
        self.state.lock().await.signals.clone()
    }

    pub async fn trades(&self) -> Vec<Trade> {
        self.state.lock().await.trades.clone()
    }

    pub async fn points_total(&self, user_id: Uuid) -> i64 {
        self.state
            .lock()
            .await
            .points
            .iter()
            .filter(|((user, _, _), _)| *user == user_id)
            .map(|(_, points)| *points)
            .sum()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn expire_lapsed(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut state = self.state.lock().await;
        let mut expired = 0;
        for sub in state.subscriptions.values_mut() {
            if matches!(
                sub.status,
                SubscriptionStatus::Active | SubscriptionStatus::Paused
            ) && sub.expires_at <= now
            {
                sub.status = SubscriptionStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn due_subscriptions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> anyhow::Result<Vec<DueSubscription>> {
        let state = self.state.lock().await;
        let mut due: Vec<&Subscription> = state
            .subscriptions
            .values()
            .filter(|s| {
                s.status == SubscriptionStatus::Active
                    && s.expires_at > now
                    && s.next_run_at.map_or(true, |t| t <= now)
                    && state
                        .bots
                        .get(&s.bot_id)
                        .is_some_and(|b| b.status == BotStatus::Published)
            })
            .collect();
        // NULLS FIRST, then oldest
        due.sort_by_key(|s| (s.next_run_at.is_some(), s.next_run_at));
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|s| DueSubscription {
                id: s.id,
                execution_interval_secs: s.execution_interval_secs,
            })
            .collect())
    }

    async fn claim_run(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        let Some(sub) = state.subscriptions.get_mut(&subscription_id) else {
            return Ok(false);
        };
        if sub.status != SubscriptionStatus::Active || sub.next_run_at.is_some_and(|t| t > now) {
            return Ok(false);
        }
        sub.next_run_at = Some(next_run_at);
        Ok(true)
    }

    async fn load_context(&self, subscription_id: Uuid) -> anyhow::Result<Option<RunContext>> {
        let state = self.state.lock().await;
        let Some(subscription) = state.subscriptions.get(&subscription_id).cloned() else {
            return Ok(None);
        };
        let bot = state
            .bots
            .get(&subscription.bot_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("bot {} not found", subscription.bot_id))?;
        let credentials = state
            .credentials
            .iter()
            .filter(|c| c.user_id == subscription.user_id && c.is_active)
            .cloned()
            .collect();
        Ok(Some(RunContext {
            subscription,
            bot,
            credentials,
        }))
    }

    async fn open_trades(&self, subscription_id: Uuid) -> anyhow::Result<Vec<Trade>> {
        let state = self.state.lock().await;
        Ok(state
            .trades
            .iter()
            .filter(|t| t.subscription_id == subscription_id && t.status == TradeStatus::Open)
            .cloned()
            .collect())
    }

    async fn realized_pnl_since(
        &self,
        subscription_id: Uuid,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Decimal> {
        let state = self.state.lock().await;
        Ok(state
            .trades
            .iter()
            .filter(|t| {
                t.subscription_id == subscription_id
                    && t.status == TradeStatus::Closed
                    && t.closed_at.is_some_and(|c| c >= since)
            })
            .filter_map(|t| t.realized_pnl)
            .sum())
    }

    async fn trades_since(
        &self,
        subscription_id: Uuid,
        since: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let state = self.state.lock().await;
        Ok(state
            .trades
            .iter()
            .filter(|t| {
                t.subscription_id == subscription_id
                    && t.status != TradeStatus::Failed
                    && t.opened_at >= since
            })
            .count() as i64)
    }

    async fn record_signal(
        &self,
        subscription_id: Uuid,
        signal: &TradeSignal,
    ) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        self.state.lock().await.signals.push(SignalRecord {
            id,
            subscription_id,
            symbol: signal.symbol.clone(),
            action: signal.action.as_str().to_string(),
            confidence: signal.confidence,
            reasoning: signal.reasoning.clone(),
            price: signal.price,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            source: signal.source.as_str().to_string(),
            executed: false,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn mark_signal_executed(&self, signal_id: Uuid) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if let Some(signal) = state.signals.iter_mut().find(|s| s.id == signal_id) {
            signal.executed = true;
        }
        Ok(())
    }

    async fn record_trade(&self, trade: &NewTrade) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        self.state.lock().await.trades.push(Trade {
            id,
            subscription_id: trade.subscription_id,
            signal_id: trade.signal_id,
            exchange: trade.exchange.as_str().to_string(),
            symbol: trade.symbol.clone(),
            side: side_str(trade.side).to_string(),
            quantity: trade.quantity,
            entry_price: trade.entry_price,
            exit_price: None,
            stop_loss: trade.stop_loss,
            take_profit: trade.take_profit,
            leverage: trade.leverage as i32,
            realized_pnl: None,
            status: trade.status,
            exchange_order_id: trade.exchange_order_id.clone(),
            error: trade.error.clone(),
            opened_at: Utc::now(),
            closed_at: None,
        });
        Ok(id)
    }

    async fn close_trade(
        &self,
        trade_id: Uuid,
        exit_price: Decimal,
        realized_pnl: Decimal,
        closed_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        match state
            .trades
            .iter_mut()
            .find(|t| t.id == trade_id && t.status == TradeStatus::Open)
        {
            Some(trade) => {
                trade.status = TradeStatus::Closed;
                trade.exit_price = Some(exit_price);
                trade.realized_pnl = Some(realized_pnl);
                trade.closed_at = Some(closed_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_run_result(
        &self,
        subscription_id: Uuid,
        status: &RunStatus,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if let Some(sub) = state.subscriptions.get_mut(&subscription_id) {
            sub.last_run_at = Some(at);
            sub.last_run_status = Some(status.label());
            sub.last_error = status.error();
        }
        Ok(())
    }

    async fn award_points(
        &self,
        user_id: Uuid,
        action: PointsAction,
        reference: &str,
        points: i64,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        let key = (user_id, action.as_str(), reference.to_string());
        if state.points.contains_key(&key) {
            return Ok(false);
        }
        state.points.insert(key, points);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_labels() {
        assert_eq!(RunStatus::Ok.label(), "ok");
        assert_eq!(RunStatus::Ok.error(), None);
        let failed = RunStatus::Error("no credentials".to_string());
        assert_eq!(failed.label(), "error: no credentials");
        assert_eq!(failed.error().as_deref(), Some("no credentials"));
        let long = RunStatus::Error("x".repeat(2000));
        assert_eq!(long.error().unwrap().len(), MAX_ERROR_LEN);
    }

    #[test]
    fn test_side_strings() {
        assert_eq!(parse_side(side_str(PositionSide::Short)), Some(PositionSide::Short));
        assert_eq!(parse_side("sideways"), None);
    }

    #[tokio::test]
    async fn test_memory_points_are_idempotent() {
        let store = MemoryRunStore::new();
        let user = Uuid::new_v4();
        assert!(store
            .award_points(user, PointsAction::TradeExecuted, "trade-1", 5)
            .await
            .unwrap());
        assert!(!store
            .award_points(user, PointsAction::TradeExecuted, "trade-1", 5)
            .await
            .unwrap());
        assert_eq!(store.points_total(user).await, 5);
    }
}
