//! One run of a subscription: `run_bot_logic` and the multi-pair futures
//! workflow behind it

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use control_plane::airdrop::TRADE_EXECUTED_POINTS;
use control_plane::models::{BotType, PointsAction, SubscriptionStatus, TradeStatus};
use control_plane::observability::{metrics, Logger, MetricsCollector};
use control_plane::SecretsManager;
use exchange_gateway::{
    BinanceFuturesClient, BracketRequest, Exchange, ExchangeClient, OrderAck, OrderRequest,
    PaperExchange, PAPER_STARTING_BALANCE,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::credentials::{self, ResolvedCredential};
use crate::intent::{IntentRegistry, IntentState};
use crate::notifier::{Notification, Notifier};
use crate::reconciler;
use crate::risk::{OrderPlan, RiskDecision, RiskInputs, RiskLimits, RiskManager};
use crate::signal::{SignalGenerator, TradeSignal};
use crate::store::{NewTrade, RunContext, RunStatus, RunStore};

/// Builds the exchange client a run trades on
#[async_trait]
pub trait ExchangeFactory: Send + Sync {
    async fn connect(
        &self,
        subscription_id: Uuid,
        resolved: &ResolvedCredential,
    ) -> anyhow::Result<Arc<dyn ExchangeClient>>;

    /// Drop any per-subscription state once the subscription has ended
    async fn release(&self, _subscription_id: Uuid) {}
}

struct PaperAccount {
    exchange: Arc<PaperExchange>,
    last_used: Instant,
}

/// Live venues through `exchange_gateway::connect`. Paper accounts are kept
/// per subscription so balances and positions carry over between runs, until
/// the subscription ends or the account sits idle past `evict_idle`.
#[derive(Default)]
pub struct LiveExchangeFactory {
    paper: Mutex<HashMap<Uuid, PaperAccount>>,
}

impl LiveExchangeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    async fn paper_account(&self, subscription_id: Uuid) -> anyhow::Result<Arc<PaperExchange>> {
        let mut accounts = self.paper.lock().await;
        if let Some(account) = accounts.get_mut(&subscription_id) {
            account.last_used = Instant::now();
            return Ok(account.exchange.clone());
        }
        let market = Arc::new(BinanceFuturesClient::new(None, false)?);
        let exchange = Arc::new(
            PaperExchange::new(Decimal::from(PAPER_STARTING_BALANCE)).with_market(market),
        );
        accounts.insert(
            subscription_id,
            PaperAccount {
                exchange: exchange.clone(),
                last_used: Instant::now(),
            },
        );
        Ok(exchange)
    }

    /// Paper accounts currently held in memory
    pub async fn paper_accounts(&self) -> usize {
        self.paper.lock().await.len()
    }

    /// Drops paper accounts no run has touched within `max_idle`
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut accounts = self.paper.lock().await;
        let before = accounts.len();
        accounts.retain(|_, account| account.last_used.elapsed() < max_idle);
        let evicted = before - accounts.len();
        if evicted > 0 {
            debug!(evicted, "Evicted idle paper accounts");
        }
        evicted
    }
}

#[async_trait]
impl ExchangeFactory for LiveExchangeFactory {
    async fn connect(
        &self,
        subscription_id: Uuid,
        resolved: &ResolvedCredential,
    ) -> anyhow::Result<Arc<dyn ExchangeClient>> {
        if resolved.exchange != Exchange::Paper {
            return Ok(exchange_gateway::connect(
                resolved.exchange,
                resolved.credentials.clone(),
                resolved.testnet,
            )?);
        }

        let account = self.paper_account(subscription_id).await?;
        // Let simulated brackets fire before the run looks at positions
        match account.mark_to_market().await {
            Ok(fills) => {
                for fill in fills {
                    debug!(subscription_id = %subscription_id, symbol = %fill.symbol, "Paper bracket filled");
                }
            }
            Err(e) => warn!(subscription_id = %subscription_id, "Paper mark-to-market failed: {}", e),
        }
        Ok(account)
    }

    async fn release(&self, subscription_id: Uuid) {
        if self.paper.lock().await.remove(&subscription_id).is_some() {
            debug!(subscription_id = %subscription_id, "Paper account released");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolNote {
    pub symbol: String,
    pub reason: String,
}

impl SymbolNote {
    fn new(symbol: &str, reason: impl ToString) -> Self {
        Self {
            symbol: symbol.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// What a run did
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkflowReport {
    pub exchange: Option<Exchange>,
    pub reconciled: usize,
    pub signals: usize,
    pub notified: usize,
    pub selected: usize,
    pub executed: usize,
    pub rejected: Vec<SymbolNote>,
    pub failed: Vec<SymbolNote>,
    /// Pairs skipped because market data or the signal failed
    pub pair_errors: Vec<SymbolNote>,
}

/// A recorded signal waiting for selection
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Position of the pair in the subscription
    pub index: usize,
    pub signal_id: Uuid,
    pub signal: TradeSignal,
}

/// Actionable candidates at or above `min_confidence` on pairs without a
/// position, best first, capped at the free position slots
pub fn select_candidates(
    candidates: &[Candidate],
    min_confidence: f64,
    open_symbols: &[String],
    max_concurrent_positions: usize,
) -> Vec<Candidate> {
    let mut eligible: Vec<Candidate> = candidates
        .iter()
        .filter(|c| {
            c.signal.action.is_actionable()
                && c.signal.confidence >= min_confidence
                && !open_symbols.iter().any(|s| s == &c.signal.symbol)
        })
        .cloned()
        .collect();

    eligible.sort_by(|a, b| {
        b.signal
            .confidence
            .partial_cmp(&a.signal.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.index.cmp(&b.index))
    });
    eligible.truncate(max_concurrent_positions.saturating_sub(open_symbols.len()));
    eligible
}

/// Client order id for the entry of a signal
pub fn entry_client_order_id(signal_id: Uuid) -> String {
    format!("sig-{}", signal_id.simple())
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc())
        .unwrap_or(now)
}

/// Shared services of every run
pub struct Workflow {
    pub store: Arc<dyn RunStore>,
    pub exchanges: Arc<dyn ExchangeFactory>,
    pub signals: Arc<SignalGenerator>,
    pub notifier: Arc<dyn Notifier>,
    pub secrets: SecretsManager,
    pub intents: Arc<Mutex<IntentRegistry>>,
    pub risk: RiskManager,
    pub metrics: MetricsCollector,
}

impl Workflow {
    pub fn new(
        store: Arc<dyn RunStore>,
        exchanges: Arc<dyn ExchangeFactory>,
        signals: Arc<SignalGenerator>,
        notifier: Arc<dyn Notifier>,
        secrets: SecretsManager,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            store,
            exchanges,
            signals,
            notifier,
            secrets,
            intents: Arc::new(Mutex::new(IntentRegistry::new())),
            risk: RiskManager::new(),
            metrics,
        }
    }

    /// Run a subscription once and record the outcome on it
    pub async fn run_bot_logic(&self, subscription_id: Uuid) -> anyhow::Result<WorkflowReport> {
        let started = Instant::now();
        let result = self.execute(subscription_id).await;

        let status = match &result {
            Ok(_) => RunStatus::Ok,
            Err(e) => RunStatus::Error(format!("{:#}", e)),
        };
        if let Err(e) = self
            .store
            .record_run_result(subscription_id, &status, Utc::now())
            .await
        {
            warn!(subscription_id = %subscription_id, "Failed to record run result: {}", e);
        }

        self.metrics
            .histogram(metrics::RUN_DURATION_MS, started.elapsed().as_millis() as f64)
            .await;
        if result.is_err() {
            self.metrics.increment(metrics::RUNS_FAILED, 1).await;
        }
        Logger::run_event(&subscription_id.to_string(), "run", &status.label());

        result
    }

    async fn execute(&self, subscription_id: Uuid) -> anyhow::Result<WorkflowReport> {
        let Some(ctx) = self.store.load_context(subscription_id).await? else {
            self.exchanges.release(subscription_id).await;
            anyhow::bail!("subscription {} not found", subscription_id);
        };

        if ctx.subscription.status != SubscriptionStatus::Active {
            info!(
                subscription_id = %subscription_id,
                "Subscription is {:?}, nothing to do",
                ctx.subscription.status
            );
            // Paused subscriptions keep their paper account for when they resume
            if matches!(
                ctx.subscription.status,
                SubscriptionStatus::Expired | SubscriptionStatus::Cancelled
            ) {
                self.exchanges.release(subscription_id).await;
            }
            return Ok(WorkflowReport::default());
        }

        let resolved = credentials::resolve(&ctx, &self.secrets)?;
        let exchange = self.exchanges.connect(subscription_id, &resolved).await?;

        let mut report = WorkflowReport {
            exchange: Some(resolved.exchange),
            ..Default::default()
        };

        let reconciled = reconciler::reconcile(self.store.as_ref(), exchange.as_ref(), subscription_id).await?;
        report.reconciled = reconciled.closed.len();
        if !reconciled.closed.is_empty() {
            self.metrics
                .increment(metrics::TRADES_RECONCILED, reconciled.closed.len() as u64)
                .await;
        }
        for closed in &reconciled.closed {
            self.notifier
                .notify(&Notification::TradeClosed {
                    bot_name: ctx.bot.name.clone(),
                    subscription_id,
                    symbol: closed.symbol.clone(),
                    exit_price: closed.exit_price,
                    realized_pnl: closed.realized_pnl,
                })
                .await;
        }

        match ctx.bot.bot_type {
            BotType::SignalsFutures => {
                self.run_signals_workflow(&ctx, exchange.as_ref(), &mut report)
                    .await
            }
            BotType::Futures => {
                self.run_advanced_futures_workflow(&ctx, exchange.as_ref(), &mut report)
                    .await?
            }
        }

        info!(
            subscription_id = %subscription_id,
            exchange = ?report.exchange,
            signals = report.signals,
            selected = report.selected,
            executed = report.executed,
            rejected = report.rejected.len(),
            failed = report.failed.len(),
            "Run finished"
        );
        Ok(report)
    }

    /// Candles and a recorded signal for every pair. A failing pair is
    /// skipped.
    async fn analyze_pairs(
        &self,
        ctx: &RunContext,
        exchange: &dyn ExchangeClient,
        report: &mut WorkflowReport,
    ) -> Vec<Candidate> {
        let sub = &ctx.subscription;
        let strategy = &ctx.bot.strategy;
        let mut candidates = Vec::with_capacity(sub.trading_pairs.len());

        for (index, symbol) in sub.trading_pairs.iter().enumerate() {
            let candles = match exchange
                .get_candles(symbol, sub.timeframe, strategy.lookback as usize)
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    warn!(subscription_id = %sub.id, symbol = %symbol, "Candles unavailable: {}", e);
                    report.pair_errors.push(SymbolNote::new(symbol, e));
                    continue;
                }
            };

            let signal = match self
                .signals
                .generate(strategy, symbol, sub.timeframe, &candles)
                .await
            {
                Ok(s) => s,
                Err(e) => {
                    warn!(subscription_id = %sub.id, symbol = %symbol, "No signal: {}", e);
                    report.pair_errors.push(SymbolNote::new(symbol, e));
                    continue;
                }
            };

            let signal_id = match self.store.record_signal(sub.id, &signal).await {
                Ok(id) => id,
                Err(e) => {
                    warn!(subscription_id = %sub.id, symbol = %symbol, "Failed to record signal: {}", e);
                    report.pair_errors.push(SymbolNote::new(symbol, e));
                    continue;
                }
            };

            debug!(
                subscription_id = %sub.id,
                symbol = %symbol,
                action = signal.action.as_str(),
                confidence = signal.confidence,
                source = signal.source.as_str(),
                "Signal recorded"
            );
            report.signals += 1;
            candidates.push(Candidate {
                index,
                signal_id,
                signal,
            });
        }

        candidates
    }

    /// Analysis-only bots: record and announce, never trade
    async fn run_signals_workflow(
        &self,
        ctx: &RunContext,
        exchange: &dyn ExchangeClient,
        report: &mut WorkflowReport,
    ) {
        let candidates = self.analyze_pairs(ctx, exchange, report).await;
        for candidate in candidates.into_iter().filter(|c| c.signal.action.is_actionable()) {
            self.notifier
                .notify(&Notification::Signal {
                    bot_name: ctx.bot.name.clone(),
                    subscription_id: ctx.subscription.id,
                    signal: candidate.signal,
                })
                .await;
            report.notified += 1;
        }
    }

    pub async fn run_advanced_futures_workflow(
        &self,
        ctx: &RunContext,
        exchange: &dyn ExchangeClient,
        report: &mut WorkflowReport,
    ) -> anyhow::Result<()> {
        let sub = &ctx.subscription;
        let limits = RiskLimits::from(sub);

        let candidates = self.analyze_pairs(ctx, exchange, report).await;

        // Positions on the exchange plus anything the database still holds open
        let mut open_symbols: Vec<String> = exchange
            .get_positions()
            .await?
            .into_iter()
            .filter(|p| !p.quantity.is_zero())
            .map(|p| p.symbol.to_uppercase())
            .collect();
        for trade in self.store.open_trades(sub.id).await? {
            let symbol = trade.symbol.to_uppercase();
            if !open_symbols.contains(&symbol) {
                open_symbols.push(symbol);
            }
        }

        let selected = select_candidates(
            &candidates,
            limits.min_confidence,
            &open_symbols,
            limits.max_concurrent_positions,
        );
        report.selected = selected.len();

        for candidate in selected {
            let symbol = candidate.signal.symbol.clone();
            match self
                .enter(ctx, exchange, &limits, &candidate, &open_symbols)
                .await
            {
                Ok(Entry::Opened) => {
                    report.executed += 1;
                    open_symbols.push(symbol.to_uppercase());
                }
                Ok(Entry::Rejected(reason)) => {
                    self.metrics.increment(metrics::TRADE_BLOCKED, 1).await;
                    info!(subscription_id = %sub.id, symbol = %symbol, "Entry rejected: {}", reason);
                    report.rejected.push(SymbolNote::new(&symbol, reason));
                }
                Ok(Entry::Failed(error)) => {
                    report.failed.push(SymbolNote::new(&symbol, error));
                }
                Err(e) => {
                    warn!(subscription_id = %sub.id, symbol = %symbol, "Entry aborted: {:#}", e);
                    report.failed.push(SymbolNote::new(&symbol, format!("{:#}", e)));
                }
            }
        }

        Ok(())
    }

    async fn enter(
        &self,
        ctx: &RunContext,
        exchange: &dyn ExchangeClient,
        limits: &RiskLimits,
        candidate: &Candidate,
        open_symbols: &[String],
    ) -> anyhow::Result<Entry> {
        let sub = &ctx.subscription;
        let signal = &candidate.signal;
        let symbol = signal.symbol.as_str();

        let since = start_of_day(Utc::now());
        let realized_pnl_today = self.store.realized_pnl_since(sub.id, since).await?;
        let trades_today = self.store.trades_since(sub.id, since).await?;
        let balance = exchange.get_balance().await?;
        let rules = exchange.get_symbol_rules(symbol).await?;
        let price = exchange.get_ticker(symbol).await?.price;

        let inputs = RiskInputs {
            signal,
            price,
            limits,
            rules: &rules,
            realized_pnl_today,
            trades_today,
            open_symbols,
            available_balance: balance.available_balance,
        };
        let plan = match self.risk.evaluate(&inputs) {
            RiskDecision::Approved(plan) => plan,
            RiskDecision::Rejected(rejection) => return Ok(Entry::Rejected(rejection.to_string())),
        };

        let intent_id = match self.intents.lock().await.begin(
            sub.id,
            symbol,
            plan.side,
            candidate.signal_id,
        ) {
            Ok(id) => id,
            Err(existing) => {
                return Ok(Entry::Rejected(format!(
                    "equivalent entry {} already in progress",
                    existing
                )))
            }
        };

        let ack = match self.place_entry(exchange, &plan, candidate.signal_id).await {
            Ok(ack) => ack,
            Err(e) => {
                let error = e.to_string();
                warn!(subscription_id = %sub.id, symbol, "Entry order failed: {}", error);
                self.metrics.increment(metrics::TRADE_FAILED, 1).await;
                self.update_intent(intent_id, IntentState::Failed { error: error.clone() })
                    .await;
                self.store
                    .record_trade(&NewTrade {
                        subscription_id: sub.id,
                        signal_id: Some(candidate.signal_id),
                        exchange: exchange.exchange(),
                        symbol: symbol.to_string(),
                        side: plan.side,
                        quantity: plan.quantity,
                        entry_price: plan.entry_price,
                        stop_loss: Some(plan.stop_loss),
                        take_profit: Some(plan.take_profit),
                        leverage: plan.leverage,
                        status: TradeStatus::Failed,
                        exchange_order_id: None,
                        error: Some(error.clone()),
                    })
                    .await?;
                self.notifier
                    .notify(&Notification::TradeFailed {
                        bot_name: ctx.bot.name.clone(),
                        subscription_id: sub.id,
                        symbol: symbol.to_string(),
                        error: error.clone(),
                    })
                    .await;
                return Ok(Entry::Failed(error));
            }
        };

        let quantity = if ack.executed_qty > Decimal::ZERO {
            ack.executed_qty
        } else {
            plan.quantity
        };
        let entry_price = ack.avg_price.filter(|p| *p > Decimal::ZERO).unwrap_or(plan.entry_price);

        // The position is live from here on, so a bracket failure is noted
        // on the trade rather than failing it
        let bracket_error = match exchange
            .place_bracket(&BracketRequest {
                symbol: symbol.to_string(),
                position_side: plan.side,
                quantity,
                stop_loss: Some(plan.stop_loss),
                take_profit: Some(plan.take_profit),
            })
            .await
        {
            Ok(_) => None,
            Err(e) => {
                warn!(subscription_id = %sub.id, symbol, "Protective bracket failed: {}", e);
                Some(format!("bracket failed: {}", e))
            }
        };

        let trade_id = self
            .store
            .record_trade(&NewTrade {
                subscription_id: sub.id,
                signal_id: Some(candidate.signal_id),
                exchange: exchange.exchange(),
                symbol: symbol.to_string(),
                side: plan.side,
                quantity,
                entry_price,
                stop_loss: Some(plan.stop_loss),
                take_profit: Some(plan.take_profit),
                leverage: plan.leverage,
                status: TradeStatus::Open,
                exchange_order_id: Some(ack.exchange_order_id.clone()),
                error: bracket_error,
            })
            .await?;

        self.store.mark_signal_executed(candidate.signal_id).await?;
        self.update_intent(
            intent_id,
            IntentState::Filled {
                exchange_order_id: ack.exchange_order_id.clone(),
            },
        )
        .await;

        match self
            .store
            .award_points(
                sub.user_id,
                PointsAction::TradeExecuted,
                &trade_id.to_string(),
                TRADE_EXECUTED_POINTS,
            )
            .await
        {
            Ok(true) => self.metrics.increment(metrics::POINTS_AWARDED, 1).await,
            Ok(false) => {}
            Err(e) => warn!(subscription_id = %sub.id, "Failed to award trade points: {}", e),
        }
        self.metrics.increment(metrics::TRADE_EXECUTED, 1).await;

        info!(
            subscription_id = %sub.id,
            trade_id = %trade_id,
            symbol,
            side = ?plan.side,
            quantity = %quantity,
            entry_price = %entry_price,
            "Position opened"
        );
        self.notifier
            .notify(&Notification::TradeOpened {
                bot_name: ctx.bot.name.clone(),
                subscription_id: sub.id,
                exchange: exchange.exchange(),
                symbol: symbol.to_string(),
                side: plan.side,
                quantity,
                entry_price,
                stop_loss: plan.stop_loss,
                take_profit: plan.take_profit,
            })
            .await;

        Ok(Entry::Opened)
    }

    async fn place_entry(
        &self,
        exchange: &dyn ExchangeClient,
        plan: &OrderPlan,
        signal_id: Uuid,
    ) -> Result<OrderAck, exchange_gateway::ExchangeError> {
        exchange.set_leverage(&plan.symbol, plan.leverage).await?;
        let order = OrderRequest::market(&plan.symbol, plan.side.entry_side(), plan.quantity)
            .with_client_order_id(entry_client_order_id(signal_id));
        exchange.place_order(&order).await
    }

    async fn update_intent(&self, id: Uuid, state: IntentState) {
        let mut intents = self.intents.lock().await;
        if let Err(e) = intents.update_state(id, state) {
            warn!("{}", e);
        }
        intents.cleanup();
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Entry {
    Opened,
    Rejected(String),
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{SignalAction, SignalSource};

    fn candidate(index: usize, symbol: &str, action: SignalAction, confidence: f64) -> Candidate {
        Candidate {
            index,
            signal_id: Uuid::new_v4(),
            signal: TradeSignal {
                symbol: symbol.to_string(),
                action,
                confidence,
                reasoning: String::new(),
                price: Decimal::ONE,
                stop_loss: None,
                take_profit: None,
                source: SignalSource::Technical,
                generated_at: Utc::now(),
            },
        }
    }

    fn symbols(selected: &[Candidate]) -> Vec<&str> {
        selected.iter().map(|c| c.signal.symbol.as_str()).collect()
    }

    #[test]
    fn test_selection_priority() {
        let candidates = vec![
            candidate(0, "BTCUSDT", SignalAction::Buy, 0.7),
            candidate(1, "ETHUSDT", SignalAction::Sell, 0.9),
            candidate(2, "SOLUSDT", SignalAction::Buy, 0.7),
            candidate(3, "XRPUSDT", SignalAction::Hold, 0.99),
            candidate(4, "ADAUSDT", SignalAction::Buy, 0.5),
        ];
        let selected = select_candidates(&candidates, 0.6, &[], 5);
        // Confidence first, then subscription order
        assert_eq!(symbols(&selected), vec!["ETHUSDT", "BTCUSDT", "SOLUSDT"]);
    }

    #[test]
    fn test_selection_respects_open_positions_and_slots() {
        let candidates = vec![
            candidate(0, "BTCUSDT", SignalAction::Buy, 0.9),
            candidate(1, "ETHUSDT", SignalAction::Buy, 0.8),
            candidate(2, "SOLUSDT", SignalAction::Buy, 0.7),
        ];
        let open = vec!["BTCUSDT".to_string()];
        let selected = select_candidates(&candidates, 0.6, &open, 2);
        assert_eq!(symbols(&selected), vec!["ETHUSDT"]);

        let full = vec!["A".to_string(), "B".to_string()];
        assert!(select_candidates(&candidates, 0.6, &full, 2).is_empty());
    }

    #[test]
    fn test_client_order_id_fits_venue_limits() {
        let id = entry_client_order_id(Uuid::new_v4());
        assert!(id.starts_with("sig-"));
        assert_eq!(id.len(), 36);
    }

    #[test]
    fn test_start_of_day() {
        let now = DateTime::parse_from_rfc3339("2024-03-05T17:45:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(start_of_day(now).to_rfc3339(), "2024-03-05T00:00:00+00:00");
    }

    #[tokio::test]
    async fn test_paper_account_persists_until_released() {
        let factory = LiveExchangeFactory::new();
        let id = Uuid::new_v4();
        let first = factory.connect(id, &ResolvedCredential::paper()).await.unwrap();
        let second = factory.connect(id, &ResolvedCredential::paper()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        factory
            .connect(Uuid::new_v4(), &ResolvedCredential::paper())
            .await
            .unwrap();
        assert_eq!(factory.paper_accounts().await, 2);

        factory.release(id).await;
        assert_eq!(factory.paper_accounts().await, 1);
        // Releasing twice is harmless
        factory.release(id).await;
        assert_eq!(factory.paper_accounts().await, 1);
    }

    #[tokio::test]
    async fn test_idle_paper_accounts_are_evicted() {
        let factory = LiveExchangeFactory::new();
        factory
            .connect(Uuid::new_v4(), &ResolvedCredential::paper())
            .await
            .unwrap();
        assert_eq!(factory.evict_idle(Duration::from_secs(3600)).await, 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(factory.evict_idle(Duration::from_millis(10)).await, 1);
        assert_eq!(factory.paper_accounts().await, 0);
    }
}
