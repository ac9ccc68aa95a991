use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

// Re-export types from the exchange gateway
pub use exchange_gateway::types::{Exchange, TimeFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "user_role", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    User,
    Developer,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::User => "user",
            UserRole::Developer => "developer",
            UserRole::Admin => "admin",
        }
    }

    pub fn can_publish(&self) -> bool {
        matches!(self, UserRole::Developer | UserRole::Admin)
    }
}

/// Bot type
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "bot_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BotType {
    /// Trades futures positions
    Futures,
    /// Analysis and notification only, never places orders
    SignalsFutures,
}

/// Bot status
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "bot_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    Draft,
    Published,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "subscription_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    PendingPayment,
    Active,
    Paused,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "trade_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Open,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "invoice_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Void,
}

/// Technical engine used when no LLM answer is available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmMode {
    Trend,
    MeanReversion,
    Breakout,
}

impl Default for AlgorithmMode {
    fn default() -> Self {
        AlgorithmMode::Trend
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Gemini,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Anthropic => "anthropic",
            LlmProvider::Gemini => "gemini",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "gpt-4o-mini",
            LlmProvider::Anthropic => "claude-3-5-haiku-latest",
            LlmProvider::Gemini => "gemini-1.5-flash",
        }
    }
}

fn default_lookback() -> u32 {
    100
}

fn default_min_confidence() -> f64 {
    0.6
}

/// Strategy stored on a bot as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default)]
    pub timeframe: TimeFrame,
    /// Candles fed to the signal step
    #[serde(default = "default_lookback")]
    pub lookback: u32,
    #[serde(default)]
    pub llm_provider: Option<LlmProvider>,
    #[serde(default)]
    pub llm_model: Option<String>,
    #[serde(default)]
    pub prompt_preamble: Option<String>,
    #[serde(default)]
    pub fallback_mode: AlgorithmMode,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            timeframe: TimeFrame::default(),
            lookback: default_lookback(),
            llm_provider: None,
            llm_model: None,
            prompt_preamble: None,
            fallback_mode: AlgorithmMode::default(),
            min_confidence: default_min_confidence(),
        }
    }
}

impl StrategyConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(30..=1000).contains(&self.lookback) {
            return Err("lookback must be between 30 and 1000 candles".to_string());
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err("min_confidence must be between 0 and 1".to_string());
        }
        if let Some(preamble) = &self.prompt_preamble {
            if preamble.len() > 4000 {
                return Err("prompt_preamble is limited to 4000 characters".to_string());
            }
        }
        if self.llm_model.is_some() && self.llm_provider.is_none() {
            return Err("llm_model requires llm_provider".to_string());
        }
        Ok(())
    }

    /// Model name used for the configured provider
    pub fn model(&self) -> Option<String> {
        self.llm_provider.map(|p| {
            self.llm_model
                .clone()
                .unwrap_or_else(|| p.default_model().to_string())
        })
    }
}

/// Point-earning actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointsAction {
    SubscriptionCreated,
    BotPublished,
    InvoicePaid,
    TradeExecuted,
    AdminAdjustment,
}

impl PointsAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PointsAction::SubscriptionCreated => "subscription_created",
            PointsAction::BotPublished => "bot_published",
            PointsAction::InvoicePaid => "invoice_paid",
            PointsAction::TradeExecuted => "trade_executed",
            PointsAction::AdminAdjustment => "admin_adjustment",
        }
    }
}

/// User entity
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub role: UserRole,
    pub oauth_provider: String,
    #[serde(skip_serializing)]
    pub oauth_subject: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Bot DB model (uses BigDecimal for SQLx compatibility)
#[derive(Debug, Clone, FromRow)]
pub struct BotDb {
    pub id: Uuid,
    pub developer_id: Uuid,
    pub name: String,
    pub description: String,
    pub bot_type: BotType,
    pub supported_exchanges: Vec<String>,
    pub strategy: Json<StrategyConfig>,
    pub price_per_month: BigDecimal,
    pub status: BotStatus,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Bot API model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bot {
    pub id: Uuid,
    pub developer_id: Uuid,
    pub name: String,
    pub description: String,
    pub bot_type: BotType,
    pub supported_exchanges: Vec<Exchange>,
    pub strategy: StrategyConfig,
    pub price_per_month: Decimal,
    pub status: BotStatus,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bot {
    pub fn is_free(&self) -> bool {
        self.price_per_month.is_zero()
    }

    pub fn supports(&self, exchange: Exchange) -> bool {
        self.supported_exchanges.contains(&exchange)
    }
}

impl From<BotDb> for Bot {
    fn from(db: BotDb) -> Self {
        Self {
            id: db.id,
            developer_id: db.developer_id,
            name: db.name,
            description: db.description,
            bot_type: db.bot_type,
            // Unknown names were rejected on write; skip anything stale
            supported_exchanges: db
                .supported_exchanges
                .iter()
                .filter_map(|e| e.parse().ok())
                .collect(),
            strategy: db.strategy.0,
            price_per_month: decimal_from_bigdecimal(db.price_per_month),
            status: db.status,
            published_at: db.published_at,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BotDoc {
    pub bot_id: Uuid,
    pub title: String,
    pub content_markdown: String,
    pub updated_at: DateTime<Utc>,
}

/// Exchange credential row; never serialized to clients
#[derive(Debug, Clone, FromRow)]
pub struct ExchangeCredential {
    pub id: Uuid,
    pub user_id: Uuid,
    pub exchange: String,
    pub label: String,
    pub encrypted_api_key: String,
    pub encrypted_api_secret: String,
    pub api_key_hint: String,
    pub is_testnet: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Credential as shown to its owner
#[derive(Debug, Clone, Serialize)]
pub struct CredentialView {
    pub id: Uuid,
    pub exchange: String,
    pub label: String,
    pub api_key: String,
    pub is_testnet: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<ExchangeCredential> for CredentialView {
    fn from(c: ExchangeCredential) -> Self {
        Self {
            id: c.id,
            exchange: c.exchange,
            label: c.label,
            api_key: c.api_key_hint,
            is_testnet: c.is_testnet,
            is_active: c.is_active,
            created_at: c.created_at,
        }
    }
}

/// Mask an API key as `abcd…wxyz`
pub fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}…{}", head, tail)
}

/// Subscription DB model
#[derive(Debug, Clone, FromRow)]
pub struct SubscriptionDb {
    pub id: Uuid,
    pub user_id: Uuid,
    pub bot_id: Uuid,
    pub credential_id: Option<Uuid>,
    pub trading_pairs: Vec<String>,
    pub timeframe: String,
    pub leverage: i32,
    pub position_size_pct: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub max_daily_loss_usd: BigDecimal,
    pub max_concurrent_positions: i32,
    pub max_trades_per_day: i32,
    pub min_confidence: f64,
    pub execution_interval_secs: i32,
    pub is_testnet: bool,
    pub status: SubscriptionStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<String>,
    pub last_error: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Subscription API model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub bot_id: Uuid,
    pub credential_id: Option<Uuid>,
    pub trading_pairs: Vec<String>,
    pub timeframe: TimeFrame,
    pub leverage: i32,
    pub position_size_pct: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub max_daily_loss_usd: Decimal,
    pub max_concurrent_positions: i32,
    pub max_trades_per_day: i32,
    pub min_confidence: f64,
    pub execution_interval_secs: i32,
    pub is_testnet: bool,
    pub status: SubscriptionStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<String>,
    pub last_error: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SubscriptionDb> for Subscription {
    fn from(db: SubscriptionDb) -> Self {
        Self {
            id: db.id,
            user_id: db.user_id,
            bot_id: db.bot_id,
            credential_id: db.credential_id,
            trading_pairs: db.trading_pairs,
            timeframe: db.timeframe.parse().unwrap_or_default(),
            leverage: db.leverage,
            position_size_pct: db.position_size_pct,
            stop_loss_pct: db.stop_loss_pct,
            take_profit_pct: db.take_profit_pct,
            max_daily_loss_usd: decimal_from_bigdecimal(db.max_daily_loss_usd),
            max_concurrent_positions: db.max_concurrent_positions,
            max_trades_per_day: db.max_trades_per_day,
            min_confidence: db.min_confidence,
            execution_interval_secs: db.execution_interval_secs,
            is_testnet: db.is_testnet,
            status: db.status,
            next_run_at: db.next_run_at,
            last_run_at: db.last_run_at,
            last_run_status: db.last_run_status,
            last_error: db.last_error,
            expires_at: db.expires_at,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}

/// Signal DB model
#[derive(Debug, Clone, FromRow)]
pub struct SignalRecordDb {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub symbol: String,
    pub action: String,
    pub confidence: f64,
    pub reasoning: String,
    pub price: BigDecimal,
    pub stop_loss: Option<BigDecimal>,
    pub take_profit: Option<BigDecimal>,
    pub source: String,
    pub executed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalRecord {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub symbol: String,
    pub action: String,
    pub confidence: f64,
    pub reasoning: String,
    pub price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub source: String,
    pub executed: bool,
    pub created_at: DateTime<Utc>,
}

impl From<SignalRecordDb> for SignalRecord {
    fn from(db: SignalRecordDb) -> Self {
        Self {
            id: db.id,
            subscription_id: db.subscription_id,
            symbol: db.symbol,
            action: db.action,
            confidence: db.confidence,
            reasoning: db.reasoning,
            price: decimal_from_bigdecimal(db.price),
            stop_loss: db.stop_loss.map(decimal_from_bigdecimal),
            take_profit: db.take_profit.map(decimal_from_bigdecimal),
            source: db.source,
            executed: db.executed,
            created_at: db.created_at,
        }
    }
}

/// Trade DB model
#[derive(Debug, Clone, FromRow)]
pub struct TradeDb {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub signal_id: Option<Uuid>,
    pub exchange: String,
    pub symbol: String,
    pub side: String,
    pub quantity: BigDecimal,
    pub entry_price: BigDecimal,
    pub exit_price: Option<BigDecimal>,
    pub stop_loss: Option<BigDecimal>,
    pub take_profit: Option<BigDecimal>,
    pub leverage: i32,
    pub realized_pnl: Option<BigDecimal>,
    pub status: TradeStatus,
    pub exchange_order_id: Option<String>,
    pub error: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trade {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub signal_id: Option<Uuid>,
    pub exchange: String,
    pub symbol: String,
    /// `long` or `short`
    pub side: String,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub leverage: i32,
    pub realized_pnl: Option<Decimal>,
    pub status: TradeStatus,
    pub exchange_order_id: Option<String>,
    pub error: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl From<TradeDb> for Trade {
    fn from(db: TradeDb) -> Self {
        Self {
            id: db.id,
            subscription_id: db.subscription_id,
            signal_id: db.signal_id,
            exchange: db.exchange,
            symbol: db.symbol,
            side: db.side,
            quantity: decimal_from_bigdecimal(db.quantity),
            entry_price: decimal_from_bigdecimal(db.entry_price),
            exit_price: db.exit_price.map(decimal_from_bigdecimal),
            stop_loss: db.stop_loss.map(decimal_from_bigdecimal),
            take_profit: db.take_profit.map(decimal_from_bigdecimal),
            leverage: db.leverage,
            realized_pnl: db.realized_pnl.map(decimal_from_bigdecimal),
            status: db.status,
            exchange_order_id: db.exchange_order_id,
            error: db.error,
            opened_at: db.opened_at,
            closed_at: db.closed_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct InvoiceDb {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub amount_usd: BigDecimal,
    pub months: i32,
    pub status: InvoiceStatus,
    pub external_payment_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Invoice {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub amount_usd: Decimal,
    pub months: i32,
    pub status: InvoiceStatus,
    pub external_payment_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl From<InvoiceDb> for Invoice {
    fn from(db: InvoiceDb) -> Self {
        Self {
            id: db.id,
            user_id: db.user_id,
            subscription_id: db.subscription_id,
            amount_usd: decimal_from_bigdecimal(db.amount_usd),
            months: db.months,
            status: db.status,
            external_payment_id: db.external_payment_id,
            created_at: db.created_at,
            paid_at: db.paid_at,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PointsEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub action: String,
    pub points: i64,
    pub reference_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct LeaderboardEntry {
    pub user_id: Uuid,
    pub display_name: Option<String>,
    pub points: i64,
}

/// Platform configuration row
#[derive(Debug, Clone, FromRow)]
pub struct PlatformConfig {
    pub key: String,
    pub value: String,
    pub encrypted: bool,
    pub description: String,
    pub category: String,
    pub updated_at: DateTime<Utc>,
}

// Helper conversions between BigDecimal and Decimal
pub fn decimal_from_bigdecimal(bd: BigDecimal) -> Decimal {
    bd.to_string().parse().unwrap_or_default()
}

pub fn bigdecimal_from_decimal(d: Decimal) -> BigDecimal {
    d.to_string().parse().unwrap_or_default()
}

// Request types for API

#[derive(Debug, Default, Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Pagination {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(50).clamp(1, 100)
    }

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateMeRequest {
    #[validate(length(min = 1, max = 64))]
    pub display_name: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateBotRequest {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[validate(length(max = 2000))]
    #[serde(default)]
    pub description: String,
    pub bot_type: BotType,
    pub supported_exchanges: Vec<String>,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub price_per_month: Decimal,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateBotRequest {
    #[validate(length(min = 1, max = 100))]
    pub name: Option<String>,
    #[validate(length(max = 2000))]
    pub description: Option<String>,
    pub supported_exchanges: Option<Vec<String>>,
    pub strategy: Option<StrategyConfig>,
    pub price_per_month: Option<Decimal>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpsertDocsRequest {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[validate(length(max = 100000))]
    pub content_markdown: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateCredentialRequest {
    pub exchange: String,
    #[validate(length(max = 64))]
    #[serde(default)]
    pub label: String,
    #[validate(length(min = 8, max = 256))]
    pub api_key: String,
    #[validate(length(min = 8, max = 256))]
    pub api_secret: String,
    #[serde(default)]
    pub is_testnet: bool,
}

fn default_leverage() -> i32 {
    1
}
fn default_position_size_pct() -> f64 {
    5.0
}
fn default_stop_loss_pct() -> f64 {
    2.0
}
fn default_take_profit_pct() -> f64 {
    4.0
}
fn default_max_daily_loss() -> Decimal {
    Decimal::from(100)
}
fn default_max_concurrent() -> i32 {
    3
}
fn default_max_trades() -> i32 {
    10
}
fn default_interval() -> i32 {
    3600
}

/// Risk parameters chosen by the subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct RiskParams {
    #[validate(range(min = 1, max = 125))]
    #[serde(default = "default_leverage")]
    pub leverage: i32,
    #[validate(range(min = 0.1, max = 100.0))]
    #[serde(default = "default_position_size_pct")]
    pub position_size_pct: f64,
    #[validate(range(min = 0.1, max = 50.0))]
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    #[validate(range(min = 0.1, max = 500.0))]
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss_usd: Decimal,
    #[validate(range(min = 1, max = 20))]
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_positions: i32,
    #[validate(range(min = 1, max = 100))]
    #[serde(default = "default_max_trades")]
    pub max_trades_per_day: i32,
    #[validate(range(min = 0.0, max = 1.0))]
    pub min_confidence: Option<f64>,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            leverage: default_leverage(),
            position_size_pct: default_position_size_pct(),
            stop_loss_pct: default_stop_loss_pct(),
            take_profit_pct: default_take_profit_pct(),
            max_daily_loss_usd: default_max_daily_loss(),
            max_concurrent_positions: default_max_concurrent(),
            max_trades_per_day: default_max_trades(),
            min_confidence: None,
        }
    }
}

fn default_months() -> i32 {
    1
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSubscriptionRequest {
    pub bot_id: Uuid,
    pub trading_pairs: Vec<String>,
    /// Runs against the paper exchange when omitted and the bot supports it
    pub credential_id: Option<Uuid>,
    #[serde(default)]
    pub timeframe: Option<TimeFrame>,
    #[validate]
    #[serde(default)]
    pub risk: RiskParams,
    #[validate(range(min = 60, max = 86400))]
    #[serde(default = "default_interval")]
    pub execution_interval_secs: i32,
    #[serde(default)]
    pub is_testnet: bool,
    #[validate(range(min = 1, max = 12))]
    #[serde(default = "default_months")]
    pub months: i32,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateSubscriptionRequest {
    pub trading_pairs: Option<Vec<String>>,
    pub credential_id: Option<Uuid>,
    pub timeframe: Option<TimeFrame>,
    #[validate]
    pub risk: Option<RiskParams>,
    #[validate(range(min = 60, max = 86400))]
    pub execution_interval_secs: Option<i32>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RenewRequest {
    #[validate(range(min = 1, max = 12))]
    #[serde(default = "default_months")]
    pub months: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AdminPointsRequest {
    pub user_id: Uuid,
    pub points: i64,
    #[validate(length(min = 1, max = 200))]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateConfigValueRequest {
    pub value: String,
    pub encrypted: Option<bool>,
    pub description: Option<String>,
    pub category: Option<String>,
}

/// Normalise trading pairs: trim, upper-case, drop duplicates keeping order
pub fn normalize_pairs(pairs: &[String]) -> Result<Vec<String>, String> {
    let mut out: Vec<String> = Vec::with_capacity(pairs.len());
    for pair in pairs {
        let p = pair.trim().to_uppercase();
        if p.is_empty() {
            continue;
        }
        if !p.chars().all(|c| c.is_ascii_alphanumeric()) || p.len() > 20 {
            return Err(format!("invalid trading pair: {}", pair));
        }
        if !out.contains(&p) {
            out.push(p);
        }
    }
    if out.is_empty() || out.len() > 20 {
        return Err("between 1 and 20 trading pairs are required".to_string());
    }
    Ok(out)
}

// Response types for API

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: i64,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub subscription: Subscription,
    pub invoice: Option<Invoice>,
}

#[derive(Debug, Serialize)]
pub struct PointsResponse {
    pub balance: i64,
    pub history: Vec<PointsEntry>,
}

#[derive(Debug, Serialize)]
pub struct AdminStats {
    pub users: i64,
    pub bots: i64,
    pub published_bots: i64,
    pub active_subscriptions: i64,
    pub open_trades: i64,
    pub points_issued: i64,
}

#[derive(Debug, Serialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    pub encrypted: bool,
    pub description: String,
    pub category: String,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_pairs() {
        let pairs = vec![
            " btcusdt".to_string(),
            "ETHUSDT".to_string(),
            "BTCUSDT".to_string(),
        ];
        assert_eq!(
            normalize_pairs(&pairs).unwrap(),
            vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
        );
        assert!(normalize_pairs(&[]).is_err());
        assert!(normalize_pairs(&["BTC/USDT".to_string()]).is_err());
        let too_many: Vec<String> = (0..21).map(|i| format!("COIN{}USDT", i)).collect();
        assert!(normalize_pairs(&too_many).is_err());
    }

    #[test]
    fn test_mask_api_key() {
        assert_eq!(mask_api_key("abcdEFGH1234wxyz"), "abcd…wxyz");
        assert_eq!(mask_api_key("short"), "****");
    }

    #[test]
    fn test_strategy_defaults_and_validation() {
        let strategy: StrategyConfig = serde_json::from_str(r#"{"llm_provider":"openai"}"#).unwrap();
        assert_eq!(strategy.lookback, 100);
        assert_eq!(strategy.fallback_mode, AlgorithmMode::Trend);
        assert_eq!(strategy.model().as_deref(), Some("gpt-4o-mini"));
        assert!(strategy.validate().is_ok());

        let bad = StrategyConfig {
            lookback: 5,
            ..StrategyConfig::default()
        };
        assert!(bad.validate().is_err());

        let orphan_model = StrategyConfig {
            llm_model: Some("x".to_string()),
            ..StrategyConfig::default()
        };
        assert!(orphan_model.validate().is_err());
    }

    #[test]
    fn test_risk_params_validation() {
        let mut risk = RiskParams::default();
        assert!(risk.validate().is_ok());
        risk.leverage = 200;
        assert!(risk.validate().is_err());
        risk.leverage = 10;
        risk.min_confidence = Some(1.5);
        assert!(risk.validate().is_err());
    }

    #[test]
    fn test_decimal_conversion_roundtrip() {
        let d: Decimal = "1234.5678".parse().unwrap();
        assert_eq!(decimal_from_bigdecimal(bigdecimal_from_decimal(d)), d);
    }
}
