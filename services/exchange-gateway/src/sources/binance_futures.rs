//! Binance USDⓈ-M futures REST client

use crate::credentials::ApiCredentials;
use crate::health::HealthTracker;
use crate::signer::{binance_signed_query, build_query};
use crate::types::*;
use chrono::{TimeZone, Utc};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, warn};

pub const BINANCE_FUTURES_MAINNET: &str = "https://fapi.binance.com";
pub const BINANCE_FUTURES_TESTNET: &str = "https://testnet.binancefuture.com";

const VENUE: &str = "binance";
const QUOTE_ASSET: &str = "USDT";

pub struct BinanceFuturesClient {
    client: Client,
    base_url: String,
    credentials: Option<ApiCredentials>,
    rate_limiter: Semaphore,
    last_request: Mutex<Instant>,
    rules_cache: RwLock<HashMap<String, SymbolRules>>,
    health_tracker: HealthTracker,
}

impl BinanceFuturesClient {
    /// Per-request timeout
    const REQUEST_TIMEOUT_SECS: u64 = 10;
    /// Minimum spacing between requests from one client
    const MIN_SPACING_MS: u64 = 50;

    pub fn new(credentials: Option<ApiCredentials>, testnet: bool) -> Result<Self> {
        let base_url = if testnet {
            BINANCE_FUTURES_TESTNET
        } else {
            BINANCE_FUTURES_MAINNET
        };
        Self::with_base_url(credentials, base_url)
    }

    pub fn with_base_url(credentials: Option<ApiCredentials>, base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            rate_limiter: Semaphore::new(4),
            last_request: Mutex::new(Instant::now() - Duration::from_secs(1)),
            rules_cache: RwLock::new(HashMap::new()),
            health_tracker: HealthTracker::new(),
        })
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let url = if params.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, build_query(params))
        };
        self.execute(Method::GET, url, false).await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or(ExchangeError::MissingCredentials(Exchange::Binance))?;
        let query = binance_signed_query(credentials, params, Utc::now().timestamp_millis());
        let url = format!("{}{}?{}", self.base_url, path, query);
        self.execute(method, url, true).await
    }

    /// Rate-limited request with timeout, error mapping and health tracking
    async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        url: String,
        signed: bool,
    ) -> Result<T> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| ExchangeError::Http(e.to_string()))?;

        {
            let mut last = self.last_request.lock().await;
            let elapsed = last.elapsed();
            let spacing = Duration::from_millis(Self::MIN_SPACING_MS);
            if elapsed < spacing {
                tokio::time::sleep(spacing - elapsed).await;
            }
            *last = Instant::now();
        }

        let started = Instant::now();
        let mut request = self.client.request(method, &url);
        if signed {
            if let Some(credentials) = &self.credentials {
                request = request.header("X-MBX-APIKEY", credentials.api_key());
            }
        }

        let response = match tokio::time::timeout(
            Duration::from_secs(Self::REQUEST_TIMEOUT_SECS),
            request.send(),
        )
        .await
        {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                self.health_tracker.record_failure(&e.to_string());
                return Err(e.into());
            }
            Err(_) => {
                let msg = format!("request timed out after {}s", Self::REQUEST_TIMEOUT_SECS);
                self.health_tracker.record_failure(&msg);
                return Err(ExchangeError::Http(msg));
            }
        };

        let status = response.status();
        if status.as_u16() == 429 || status.as_u16() == 418 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            warn!("Binance rate limited (status {}), retry after {:?}s", status, retry_after);
            self.health_tracker.record_failure("rate limited");
            return Err(ExchangeError::RateLimited {
                venue: VENUE.to_string(),
                retry_after,
            });
        }

        let body = response.text().await.map_err(|e| {
            self.health_tracker.record_failure(&e.to_string());
            ExchangeError::from(e)
        })?;

        if !status.is_success() {
            let err = match serde_json::from_str::<ApiErrorBody>(&body) {
                Ok(api) => ExchangeError::Api {
                    venue: VENUE.to_string(),
                    code: api.code,
                    message: api.msg,
                },
                Err(_) => ExchangeError::Http(format!("status {}: {}", status, body)),
            };
            self.health_tracker.record_failure(&err.to_string());
            return Err(err);
        }

        self.health_tracker
            .record_success(started.elapsed().as_millis() as u64);

        serde_json::from_str::<T>(&body).map_err(|e| {
            ExchangeError::InvalidResponse(format!("{}: {}", e, truncate(&body, 200)))
        })
    }

    async fn load_rules(&self) -> Result<()> {
        let info: ExchangeInfo = self.public_get("/fapi/v1/exchangeInfo", &[]).await?;
        let mut cache = self.rules_cache.write().await;
        for symbol in info.symbols {
            cache.insert(symbol.symbol.clone(), symbol.to_rules()?);
        }
        debug!("Cached {} Binance symbol filters", cache.len());
        Ok(())
    }

    fn order_params(order: &OrderRequest, close_position: bool) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("symbol", order.symbol.clone()),
            ("side", order.side.as_binance().to_string()),
        ];

        match order.order_type {
            OrderType::Market => {
                params.push(("type", "MARKET".to_string()));
                params.push(("newOrderRespType", "RESULT".to_string()));
            }
            OrderType::StopMarket { stop_price } => {
                params.push(("type", "STOP_MARKET".to_string()));
                params.push(("stopPrice", stop_price.normalize().to_string()));
                params.push(("workingType", "MARK_PRICE".to_string()));
            }
            OrderType::TakeProfitMarket { stop_price } => {
                params.push(("type", "TAKE_PROFIT_MARKET".to_string()));
                params.push(("stopPrice", stop_price.normalize().to_string()));
                params.push(("workingType", "MARK_PRICE".to_string()));
            }
        }

        if close_position {
            params.push(("closePosition", "true".to_string()));
        } else {
            params.push(("quantity", order.quantity.normalize().to_string()));
            if order.reduce_only {
                params.push(("reduceOnly", "true".to_string()));
            }
        }

        if let Some(id) = &order.client_order_id {
            params.push(("newClientOrderId", id.clone()));
        }
        params
    }

    async fn submit(&self, order: &OrderRequest, close_position: bool) -> Result<OrderAck> {
        let params = Self::order_params(order, close_position);
        let resp: OrderResponse = self.signed(Method::POST, "/fapi/v1/order", &params).await?;
        resp.into_ack()
    }
}

#[async_trait::async_trait]
impl ExchangeClient for BinanceFuturesClient {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: TimeFrame,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let rows: Vec<Vec<serde_json::Value>> = self
            .public_get(
                "/fapi/v1/klines",
                &[
                    ("symbol", symbol.to_uppercase()),
                    ("interval", timeframe.as_str().to_string()),
                    ("limit", limit.clamp(1, 1500).to_string()),
                ],
            )
            .await?;

        rows.iter().map(|row| parse_kline(row)).collect()
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        let resp: TickerResponse = self
            .public_get("/fapi/v1/ticker/price", &[("symbol", symbol.to_uppercase())])
            .await?;

        Ok(Ticker {
            symbol: resp.symbol,
            price: parse_decimal(&resp.price, "price")?,
            timestamp: resp
                .time
                .and_then(|t| Utc.timestamp_millis_opt(t).single())
                .unwrap_or_else(Utc::now),
        })
    }

    async fn get_symbol_rules(&self, symbol: &str) -> Result<SymbolRules> {
        let symbol = symbol.to_uppercase();
        if let Some(rules) = self.rules_cache.read().await.get(&symbol) {
            return Ok(rules.clone());
        }

        self.load_rules().await?;
        self.rules_cache
            .read()
            .await
            .get(&symbol)
            .cloned()
            .ok_or(ExchangeError::UnknownSymbol(symbol))
    }

    async fn get_balance(&self) -> Result<Balance> {
        let balances: Vec<BalanceResponse> =
            self.signed(Method::GET, "/fapi/v2/balance", &[]).await?;

        let usdt = balances
            .into_iter()
            .find(|b| b.asset == QUOTE_ASSET)
            .ok_or_else(|| ExchangeError::InvalidResponse("no USDT balance".to_string()))?;

        Ok(Balance {
            asset: usdt.asset,
            wallet_balance: parse_decimal(&usdt.balance, "balance")?,
            available_balance: parse_decimal(&usdt.available_balance, "availableBalance")?,
        })
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        let rows: Vec<PositionRiskResponse> =
            self.signed(Method::GET, "/fapi/v2/positionRisk", &[]).await?;

        let mut positions = Vec::new();
        for row in rows {
            let amount = parse_decimal(&row.position_amt, "positionAmt")?;
            if amount.is_zero() {
                continue;
            }
            positions.push(Position {
                symbol: row.symbol,
                side: if amount > Decimal::ZERO {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                },
                quantity: amount.abs(),
                entry_price: parse_decimal(&row.entry_price, "entryPrice")?,
                mark_price: parse_decimal(&row.mark_price, "markPrice")?,
                unrealized_pnl: parse_decimal(&row.unrealized_profit, "unRealizedProfit")?,
                leverage: row.leverage.parse().unwrap_or(1),
            });
        }
        Ok(positions)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let _: serde_json::Value = self
            .signed(
                Method::POST,
                "/fapi/v1/leverage",
                &[
                    ("symbol", symbol.to_uppercase()),
                    ("leverage", leverage.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        self.submit(order, false).await
    }

    async fn place_bracket(&self, bracket: &BracketRequest) -> Result<Vec<OrderAck>> {
        let exit_side = bracket.position_side.exit_side();
        let mut acks = Vec::new();

        if let Some(stop_loss) = bracket.stop_loss {
            let order = OrderRequest {
                symbol: bracket.symbol.clone(),
                side: exit_side,
                order_type: OrderType::StopMarket {
                    stop_price: stop_loss,
                },
                quantity: bracket.quantity,
                reduce_only: true,
                client_order_id: None,
            };
            acks.push(self.submit(&order, true).await?);
        }

        if let Some(take_profit) = bracket.take_profit {
            let order = OrderRequest {
                symbol: bracket.symbol.clone(),
                side: exit_side,
                order_type: OrderType::TakeProfitMarket {
                    stop_price: take_profit,
                },
                quantity: bracket.quantity,
                reduce_only: true,
                client_order_id: None,
            };
            acks.push(self.submit(&order, true).await?);
        }

        Ok(acks)
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        let _: serde_json::Value = self
            .signed(
                Method::DELETE,
                "/fapi/v1/allOpenOrders",
                &[("symbol", symbol.to_uppercase())],
            )
            .await?;
        Ok(())
    }

    async fn health(&self) -> SourceHealth {
        self.health_tracker.snapshot(VENUE)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Kline rows are `[openTime, open, high, low, close, volume, closeTime, ...]`
fn parse_kline(row: &[serde_json::Value]) -> Result<Candle> {
    if row.len() < 6 {
        return Err(ExchangeError::InvalidResponse(format!(
            "kline row has {} fields",
            row.len()
        )));
    }

    let open_ms = row[0]
        .as_i64()
        .ok_or_else(|| ExchangeError::InvalidResponse("kline open time".to_string()))?;
    let field = |idx: usize, name: &str| -> Result<Decimal> {
        let s = row[idx]
            .as_str()
            .ok_or_else(|| ExchangeError::InvalidResponse(format!("kline {}", name)))?;
        parse_decimal(s, name)
    };

    Ok(Candle {
        open_time: Utc
            .timestamp_millis_opt(open_ms)
            .single()
            .ok_or_else(|| ExchangeError::InvalidResponse("kline timestamp".to_string()))?,
        open: field(1, "open")?,
        high: field(2, "high")?,
        low: field(3, "low")?,
        close: field(4, "close")?,
        volume: field(5, "volume")?,
    })
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    symbol: String,
    price: String,
    time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    filters: Vec<serde_json::Value>,
}

impl SymbolInfo {
    fn to_rules(&self) -> Result<SymbolRules> {
        let mut rules = SymbolRules::permissive(&self.symbol);
        for filter in &self.filters {
            let get = |key: &str| filter.get(key).and_then(|v| v.as_str());
            match filter.get("filterType").and_then(|v| v.as_str()) {
                Some("LOT_SIZE") => {
                    if let Some(step) = get("stepSize") {
                        rules.step_size = parse_decimal(step, "stepSize")?;
                    }
                    if let Some(min) = get("minQty") {
                        rules.min_qty = parse_decimal(min, "minQty")?;
                    }
                }
                Some("PRICE_FILTER") => {
                    if let Some(tick) = get("tickSize") {
                        rules.tick_size = parse_decimal(tick, "tickSize")?;
                    }
                }
                Some("MIN_NOTIONAL") => {
                    if let Some(notional) = get("notional") {
                        rules.min_notional = parse_decimal(notional, "notional")?;
                    }
                }
                _ => {}
            }
        }
        Ok(rules)
    }
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    asset: String,
    balance: String,
    #[serde(rename = "availableBalance")]
    available_balance: String,
}

#[derive(Debug, Deserialize)]
struct PositionRiskResponse {
    symbol: String,
    #[serde(rename = "positionAmt")]
    position_amt: String,
    #[serde(rename = "entryPrice")]
    entry_price: String,
    #[serde(rename = "markPrice")]
    mark_price: String,
    #[serde(rename = "unRealizedProfit")]
    unrealized_profit: String,
    #[serde(default = "default_leverage")]
    leverage: String,
}

fn default_leverage() -> String {
    "1".to_string()
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(rename = "orderId")]
    order_id: i64,
    #[serde(rename = "clientOrderId")]
    client_order_id: Option<String>,
    symbol: String,
    status: String,
    #[serde(rename = "avgPrice")]
    avg_price: Option<String>,
    #[serde(rename = "executedQty")]
    executed_qty: Option<String>,
}

impl OrderResponse {
    fn into_ack(self) -> Result<OrderAck> {
        let avg_price = match self.avg_price.as_deref() {
            Some(p) => Some(parse_decimal(p, "avgPrice")?).filter(|p| !p.is_zero()),
            None => None,
        };
        let executed_qty = match self.executed_qty.as_deref() {
            Some(q) => parse_decimal(q, "executedQty")?,
            None => Decimal::ZERO,
        };

        Ok(OrderAck {
            exchange_order_id: self.order_id.to_string(),
            client_order_id: self.client_order_id,
            symbol: self.symbol,
            status: self.status,
            avg_price,
            executed_qty,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kline_row() {
        let row: Vec<serde_json::Value> = serde_json::from_str(
            r#"[1700000000000,"35000.10","35100.00","34900.50","35050.00","123.456",1700003599999,"0",10,"0","0","0"]"#,
        )
        .unwrap();
        let candle = parse_kline(&row).unwrap();
        assert_eq!(candle.open_time.timestamp_millis(), 1700000000000);
        assert_eq!(candle.close, "35050.00".parse::<Decimal>().unwrap());
        assert_eq!(candle.volume, "123.456".parse::<Decimal>().unwrap());
    }

    #[test]
    fn test_parse_kline_rejects_short_row() {
        let row: Vec<serde_json::Value> = serde_json::from_str("[1700000000000]").unwrap();
        assert!(parse_kline(&row).is_err());
    }

    #[test]
    fn test_symbol_filters() {
        let info: SymbolInfo = serde_json::from_str(
            r#"{"symbol":"BTCUSDT","filters":[
                {"filterType":"PRICE_FILTER","tickSize":"0.10","minPrice":"556.80"},
                {"filterType":"LOT_SIZE","stepSize":"0.001","minQty":"0.001"},
                {"filterType":"MIN_NOTIONAL","notional":"100"}
            ]}"#,
        )
        .unwrap();
        let rules = info.to_rules().unwrap();
        assert_eq!(rules.tick_size, "0.10".parse::<Decimal>().unwrap());
        assert_eq!(rules.step_size, "0.001".parse::<Decimal>().unwrap());
        assert_eq!(rules.min_notional, Decimal::from(100));
    }

    #[test]
    fn test_bracket_params_close_position() {
        let order = OrderRequest {
            symbol: "ETHUSDT".to_string(),
            side: Side::Sell,
            order_type: OrderType::StopMarket {
                stop_price: "1800.5".parse().unwrap(),
            },
            quantity: Decimal::ONE,
            reduce_only: true,
            client_order_id: None,
        };
        let params = BinanceFuturesClient::order_params(&order, true);
        assert!(params.contains(&("type", "STOP_MARKET".to_string())));
        assert!(params.contains(&("closePosition", "true".to_string())));
        assert!(!params.iter().any(|(k, _)| *k == "quantity"));
    }
}
