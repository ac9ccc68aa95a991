use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported trading venues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exchange {
    Binance,
    Bybit,
    Paper,
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Bybit => "bybit",
            Exchange::Paper => "paper",
        }
    }

    /// Paper trading runs without API keys
    pub fn requires_credentials(&self) -> bool {
        !matches!(self, Exchange::Paper)
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = ExchangeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binance" | "binance_futures" | "binanceusdm" => Ok(Exchange::Binance),
            "bybit" | "bybit_linear" => Ok(Exchange::Bybit),
            "paper" => Ok(Exchange::Paper),
            other => Err(ExchangeError::UnsupportedExchange(other.to_string())),
        }
    }
}

/// Candle intervals supported by every venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeFrame {
    #[serde(rename = "1m")]
    Minute1,
    #[serde(rename = "5m")]
    Minute5,
    #[serde(rename = "15m")]
    Minute15,
    #[serde(rename = "30m")]
    Minute30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "1d")]
    Day1,
}

impl TimeFrame {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFrame::Minute1 => "1m",
            TimeFrame::Minute5 => "5m",
            TimeFrame::Minute15 => "15m",
            TimeFrame::Minute30 => "30m",
            TimeFrame::Hour1 => "1h",
            TimeFrame::Hour4 => "4h",
            TimeFrame::Day1 => "1d",
        }
    }

    pub fn to_seconds(&self) -> i64 {
        match self {
            TimeFrame::Minute1 => 60,
            TimeFrame::Minute5 => 300,
            TimeFrame::Minute15 => 900,
            TimeFrame::Minute30 => 1800,
            TimeFrame::Hour1 => 3600,
            TimeFrame::Hour4 => 14400,
            TimeFrame::Day1 => 86400,
        }
    }

    /// Interval code used by Bybit v5 kline endpoint
    pub fn bybit_interval(&self) -> &'static str {
        match self {
            TimeFrame::Minute1 => "1",
            TimeFrame::Minute5 => "5",
            TimeFrame::Minute15 => "15",
            TimeFrame::Minute30 => "30",
            TimeFrame::Hour1 => "60",
            TimeFrame::Hour4 => "240",
            TimeFrame::Day1 => "D",
        }
    }
}

impl Default for TimeFrame {
    fn default() -> Self {
        TimeFrame::Hour1
    }
}

impl fmt::Display for TimeFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeFrame {
    type Err = ExchangeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1m" => Ok(TimeFrame::Minute1),
            "5m" => Ok(TimeFrame::Minute5),
            "15m" => Ok(TimeFrame::Minute15),
            "30m" => Ok(TimeFrame::Minute30),
            "1h" | "60m" => Ok(TimeFrame::Hour1),
            "4h" => Ok(TimeFrame::Hour4),
            "1d" | "d" => Ok(TimeFrame::Day1),
            other => Err(ExchangeError::InvalidResponse(format!(
                "unsupported timeframe: {}",
                other
            ))),
        }
    }
}

/// OHLCV candle, oldest first when returned in a Vec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_binance(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn as_bybit(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_binance())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Side of the order that opens this position
    pub fn entry_side(&self) -> Side {
        match self {
            PositionSide::Long => Side::Buy,
            PositionSide::Short => Side::Sell,
        }
    }

    /// Side of the order that closes this position
    pub fn exit_side(&self) -> Side {
        self.entry_side().opposite()
    }

    /// +1 for long, -1 for short
    pub fn direction(&self) -> Decimal {
        match self {
            PositionSide::Long => Decimal::ONE,
            PositionSide::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl From<Side> for PositionSide {
    fn from(side: Side) -> Self {
        match side {
            Side::Buy => PositionSide::Long,
            Side::Sell => PositionSide::Short,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderType {
    Market,
    StopMarket { stop_price: Decimal },
    TakeProfitMarket { stop_price: Decimal },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub reduce_only: bool,
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: Side, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            reduce_only: false,
            client_order_id: None,
        }
    }

    pub fn with_client_order_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = Some(id.into());
        self
    }
}

/// Protective stop-loss / take-profit attached to an open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketRequest {
    pub symbol: String,
    pub position_side: PositionSide,
    pub quantity: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub exchange_order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub status: String,
    pub avg_price: Option<Decimal>,
    pub executed_qty: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    /// Absolute size in base asset
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub wallet_balance: Decimal,
    pub available_balance: Decimal,
}

/// Per-symbol trading filters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolRules {
    pub symbol: String,
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
    pub tick_size: Decimal,
}

impl SymbolRules {
    /// Permissive rules used when a venue does not publish filters
    pub fn permissive(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            step_size: Decimal::new(1, 3),
            min_qty: Decimal::new(1, 3),
            min_notional: Decimal::from(5),
            tick_size: Decimal::new(1, 2),
        }
    }

    /// Round a quantity down to the step size
    pub fn round_quantity(&self, quantity: Decimal) -> Decimal {
        if self.step_size <= Decimal::ZERO {
            return quantity;
        }
        ((quantity / self.step_size).floor() * self.step_size).normalize()
    }

    /// Round a price to the nearest tick
    pub fn round_price(&self, price: Decimal) -> Decimal {
        if self.tick_size <= Decimal::ZERO {
            return price;
        }
        ((price / self.tick_size).round() * self.tick_size).normalize()
    }
}

/// Venue health/status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceHealth {
    pub source: String,
    pub is_healthy: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub success_rate: f64,
    pub avg_latency_ms: u64,
}

/// Error types for exchange access
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("{venue} API error {code}: {message}")]
    Api {
        venue: String,
        code: i64,
        message: String,
    },

    #[error("rate limit exceeded on {venue}")]
    RateLimited {
        venue: String,
        retry_after: Option<u64>,
    },

    #[error("invalid response format: {0}")]
    InvalidResponse(String),

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("unsupported exchange: {0}")]
    UnsupportedExchange(String),

    #[error("missing API credentials for {0}")]
    MissingCredentials(Exchange),

    #[error("insufficient balance: need {required}, have {available}")]
    InsufficientBalance {
        required: Decimal,
        available: Decimal,
    },

    #[error("order rejected: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        ExchangeError::Http(e.to_string())
    }
}

/// Result type for exchange operations
pub type Result<T> = std::result::Result<T, ExchangeError>;

/// Parse a decimal string field from a venue payload
pub fn parse_decimal(value: &str, field: &str) -> Result<Decimal> {
    if value.is_empty() {
        return Ok(Decimal::ZERO);
    }
    Decimal::from_str(value)
        .map_err(|e| ExchangeError::InvalidResponse(format!("{}={:?}: {}", field, value, e)))
}

/// Uniform interface over every supported venue
#[async_trait::async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Venue this client talks to
    fn exchange(&self) -> Exchange;

    /// Historical candles, oldest first
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: TimeFrame,
        limit: usize,
    ) -> Result<Vec<Candle>>;

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker>;

    async fn get_symbol_rules(&self, symbol: &str) -> Result<SymbolRules>;

    /// Quote-asset (USDT) balance of the futures wallet
    async fn get_balance(&self) -> Result<Balance>;

    /// Open (non-zero) positions
    async fn get_positions(&self) -> Result<Vec<Position>>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()>;

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck>;

    /// Attach reduce-only stop-loss / take-profit to a position
    async fn place_bracket(&self, bracket: &BracketRequest) -> Result<Vec<OrderAck>>;

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()>;

    async fn health(&self) -> SourceHealth;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_parsing() {
        assert_eq!("Binance".parse::<Exchange>().unwrap(), Exchange::Binance);
        assert_eq!("bybit_linear".parse::<Exchange>().unwrap(), Exchange::Bybit);
        assert!("kraken".parse::<Exchange>().is_err());
        assert!(!Exchange::Paper.requires_credentials());
    }

    #[test]
    fn test_timeframe_codes() {
        assert_eq!("4h".parse::<TimeFrame>().unwrap(), TimeFrame::Hour4);
        assert_eq!(TimeFrame::Hour1.bybit_interval(), "60");
        assert_eq!(TimeFrame::Day1.bybit_interval(), "D");
        assert_eq!(TimeFrame::Minute15.to_seconds(), 900);
        let json = serde_json::to_string(&TimeFrame::Minute5).unwrap();
        assert_eq!(json, "\"5m\"");
    }

    #[test]
    fn test_symbol_rules_rounding() {
        let rules = SymbolRules {
            symbol: "BTCUSDT".to_string(),
            step_size: Decimal::new(1, 3),
            min_qty: Decimal::new(1, 3),
            min_notional: Decimal::from(100),
            tick_size: Decimal::new(1, 1),
        };
        assert_eq!(
            rules.round_quantity(Decimal::new(123456, 5)),
            Decimal::new(1234, 3)
        );
        assert_eq!(
            rules.round_price(Decimal::new(6543217, 2)),
            Decimal::new(654322, 1)
        );
    }

    #[test]
    fn test_position_side_mapping() {
        assert_eq!(PositionSide::from(Side::Sell), PositionSide::Short);
        assert_eq!(PositionSide::Short.exit_side(), Side::Buy);
        assert_eq!(PositionSide::Long.direction(), Decimal::ONE);
    }
}
