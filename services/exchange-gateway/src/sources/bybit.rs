//! Bybit v5 linear perpetuals REST client

use crate::credentials::ApiCredentials;
use crate::health::HealthTracker;
use crate::signer::{build_query, bybit_sign};
use crate::types::*;
use chrono::{TimeZone, Utc};
use reqwest::{Client, Method};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, warn};

pub const BYBIT_MAINNET: &str = "https://api.bybit.com";
pub const BYBIT_TESTNET: &str = "https://api-testnet.bybit.com";

const VENUE: &str = "bybit";
const CATEGORY: &str = "linear";
/// Leverage already at the requested value
const LEVERAGE_NOT_MODIFIED: i64 = 110043;
/// Too many visits
const RATE_LIMIT_CODE: i64 = 10006;

pub struct BybitClient {
    client: Client,
    base_url: String,
    credentials: Option<ApiCredentials>,
    rate_limiter: Semaphore,
    last_request: Mutex<Instant>,
    rules_cache: RwLock<HashMap<String, SymbolRules>>,
    health_tracker: HealthTracker,
}

enum Payload {
    Query(Vec<(&'static str, String)>),
    Body(serde_json::Value),
}

impl BybitClient {
    const REQUEST_TIMEOUT_SECS: u64 = 10;
    const MIN_SPACING_MS: u64 = 50;

    pub fn new(credentials: Option<ApiCredentials>, testnet: bool) -> Result<Self> {
        let base_url = if testnet { BYBIT_TESTNET } else { BYBIT_MAINNET };
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

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: Vec<(&'static str, String)>,
        signed: bool,
    ) -> Result<T> {
        let envelope = self
            .execute(Method::GET, path, Payload::Query(params), signed)
            .await?;
        Self::unwrap_result(envelope)
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> Result<T> {
        let envelope = self
            .execute(Method::POST, path, Payload::Body(body), true)
            .await?;
        Self::unwrap_result(envelope)
    }

    fn unwrap_result<T: DeserializeOwned>(envelope: Envelope) -> Result<T> {
        if envelope.ret_code == RATE_LIMIT_CODE {
            return Err(ExchangeError::RateLimited {
                venue: VENUE.to_string(),
                retry_after: None,
            });
        }
        if envelope.ret_code != 0 {
            return Err(ExchangeError::Api {
                venue: VENUE.to_string(),
                code: envelope.ret_code,
                message: envelope.ret_msg,
            });
        }
        serde_json::from_value(envelope.result)
            .map_err(|e| ExchangeError::InvalidResponse(format!("bybit result: {}", e)))
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        payload: Payload,
        signed: bool,
    ) -> Result<Envelope> {
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

        let (url, body) = match payload {
            Payload::Query(params) if params.is_empty() => {
                (format!("{}{}", self.base_url, path), None)
            }
            Payload::Query(params) => {
                let query = build_query(&params);
                (format!("{}{}?{}", self.base_url, path, query), Some(query))
            }
            Payload::Body(value) => (format!("{}{}", self.base_url, path), Some(value.to_string())),
        };
        let is_post = method == Method::POST;

        let mut request = self.client.request(method, &url);
        if signed {
            let credentials = self
                .credentials
                .as_ref()
                .ok_or(ExchangeError::MissingCredentials(Exchange::Bybit))?;
            let payload_str = body.clone().unwrap_or_default();
            let signature = bybit_sign(credentials, &payload_str, Utc::now().timestamp_millis());
            request = request
                .header("X-BAPI-API-KEY", signature.api_key)
                .header("X-BAPI-TIMESTAMP", signature.timestamp)
                .header("X-BAPI-RECV-WINDOW", signature.recv_window)
                .header("X-BAPI-SIGN", signature.sign);
        }
        if is_post {
            request = request
                .header("Content-Type", "application/json")
                .body(body.unwrap_or_else(|| "{}".to_string()));
        }

        let started = Instant::now();
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
        if status.as_u16() == 429 || status.as_u16() == 403 {
            warn!("Bybit rate limited (status {})", status);
            self.health_tracker.record_failure("rate limited");
            return Err(ExchangeError::RateLimited {
                venue: VENUE.to_string(),
                retry_after: None,
            });
        }

        let text = response.text().await.map_err(|e| {
            self.health_tracker.record_failure(&e.to_string());
            ExchangeError::from(e)
        })?;

        if !status.is_success() {
            let msg = format!("status {}: {}", status, text);
            self.health_tracker.record_failure(&msg);
            return Err(ExchangeError::Http(msg));
        }

        let envelope: Envelope = serde_json::from_str(&text)
            .map_err(|e| ExchangeError::InvalidResponse(format!("bybit envelope: {}", e)))?;

        // Venue-level errors still count as a reachable venue
        self.health_tracker
            .record_success(started.elapsed().as_millis() as u64);
        Ok(envelope)
    }

    async fn create_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        let mut body = json!({
            "category": CATEGORY,
            "symbol": order.symbol.to_uppercase(),
            "side": order.side.as_bybit(),
            "orderType": "Market",
            "qty": order.quantity.normalize().to_string(),
            "reduceOnly": order.reduce_only,
        });

        match order.order_type {
            OrderType::Market => {}
            OrderType::StopMarket { stop_price } | OrderType::TakeProfitMarket { stop_price } => {
                // 1 = trigger when price rises to trigger, 2 = when it falls
                let rising = matches!(
                    (order.order_type, order.side),
                    (OrderType::StopMarket { .. }, Side::Buy)
                        | (OrderType::TakeProfitMarket { .. }, Side::Sell)
                );
                body["triggerPrice"] = json!(stop_price.normalize().to_string());
                body["triggerDirection"] = json!(if rising { 1 } else { 2 });
                body["triggerBy"] = json!("MarkPrice");
            }
        }
        if let Some(id) = &order.client_order_id {
            body["orderLinkId"] = json!(id);
        }

        let result: CreateOrderResult = self.post("/v5/order/create", body).await?;
        Ok(OrderAck {
            exchange_order_id: result.order_id,
            client_order_id: Some(result.order_link_id).filter(|s| !s.is_empty()),
            symbol: order.symbol.to_uppercase(),
            status: "NEW".to_string(),
            avg_price: None,
            executed_qty: order.quantity,
        })
    }
}

#[async_trait::async_trait]
impl ExchangeClient for BybitClient {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: TimeFrame,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let result: ListResult<Vec<String>> = self
            .get(
                "/v5/market/kline",
                vec![
                    ("category", CATEGORY.to_string()),
                    ("symbol", symbol.to_uppercase()),
                    ("interval", timeframe.bybit_interval().to_string()),
                    ("limit", limit.clamp(1, 1000).to_string()),
                ],
                false,
            )
            .await?;

        // Bybit returns newest first
        let mut candles = result
            .list
            .iter()
            .map(|row| parse_kline(row))
            .collect::<Result<Vec<_>>>()?;
        candles.reverse();
        Ok(candles)
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        let symbol = symbol.to_uppercase();
        let result: ListResult<TickerRow> = self
            .get(
                "/v5/market/tickers",
                vec![("category", CATEGORY.to_string()), ("symbol", symbol.clone())],
                false,
            )
            .await?;

        let row = result
            .list
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.clone()))?;

        Ok(Ticker {
            symbol: row.symbol,
            price: parse_decimal(&row.last_price, "lastPrice")?,
            timestamp: Utc::now(),
        })
    }

    async fn get_symbol_rules(&self, symbol: &str) -> Result<SymbolRules> {
        let symbol = symbol.to_uppercase();
        if let Some(rules) = self.rules_cache.read().await.get(&symbol) {
            return Ok(rules.clone());
        }

        let result: ListResult<InstrumentRow> = self
            .get(
                "/v5/market/instruments-info",
                vec![("category", CATEGORY.to_string()), ("symbol", symbol.clone())],
                false,
            )
            .await?;

        let row = result
            .list
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.clone()))?;

        let mut rules = SymbolRules::permissive(&symbol);
        rules.step_size = parse_decimal(&row.lot_size_filter.qty_step, "qtyStep")?;
        rules.min_qty = parse_decimal(&row.lot_size_filter.min_order_qty, "minOrderQty")?;
        if let Some(min_notional) = &row.lot_size_filter.min_notional_value {
            rules.min_notional = parse_decimal(min_notional, "minNotionalValue")?;
        }
        rules.tick_size = parse_decimal(&row.price_filter.tick_size, "tickSize")?;

        debug!("Cached Bybit rules for {}", symbol);
        self.rules_cache
            .write()
            .await
            .insert(symbol, rules.clone());
        Ok(rules)
    }

    async fn get_balance(&self) -> Result<Balance> {
        let result: ListResult<WalletRow> = self
            .get(
                "/v5/account/wallet-balance",
                vec![("accountType", "UNIFIED".to_string())],
                true,
            )
            .await?;

        let wallet = result
            .list
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::InvalidResponse("empty wallet list".to_string()))?;

        Ok(Balance {
            asset: "USDT".to_string(),
            wallet_balance: parse_decimal(&wallet.total_wallet_balance, "totalWalletBalance")?,
            available_balance: parse_decimal(
                &wallet.total_available_balance,
                "totalAvailableBalance",
            )?,
        })
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        let result: ListResult<PositionRow> = self
            .get(
                "/v5/position/list",
                vec![
                    ("category", CATEGORY.to_string()),
                    ("settleCoin", "USDT".to_string()),
                ],
                true,
            )
            .await?;

        let mut positions = Vec::new();
        for row in result.list {
            let size = parse_decimal(&row.size, "size")?;
            if size.is_zero() {
                continue;
            }
            let side = match row.side.as_str() {
                "Buy" => PositionSide::Long,
                "Sell" => PositionSide::Short,
                _ => continue,
            };
            positions.push(Position {
                symbol: row.symbol,
                side,
                quantity: size.abs(),
                entry_price: parse_decimal(&row.avg_price, "avgPrice")?,
                mark_price: parse_decimal(&row.mark_price, "markPrice")?,
                unrealized_pnl: parse_decimal(&row.unrealised_pnl, "unrealisedPnl")?,
                leverage: row
                    .leverage
                    .parse::<Decimal>()
                    .ok()
                    .and_then(|d| d.trunc().to_u32())
                    .unwrap_or(1),
            });
        }
        Ok(positions)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol.to_uppercase(),
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });

        match self.post::<serde_json::Value>("/v5/position/set-leverage", body).await {
            Ok(_) => Ok(()),
            Err(ExchangeError::Api { code, .. }) if code == LEVERAGE_NOT_MODIFIED => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        self.create_order(order).await
    }

    async fn place_bracket(&self, bracket: &BracketRequest) -> Result<Vec<OrderAck>> {
        if bracket.stop_loss.is_none() && bracket.take_profit.is_none() {
            return Ok(Vec::new());
        }

        let mut body = json!({
            "category": CATEGORY,
            "symbol": bracket.symbol.to_uppercase(),
            "tpslMode": "Full",
            "positionIdx": 0,
        });
        if let Some(sl) = bracket.stop_loss {
            body["stopLoss"] = json!(sl.normalize().to_string());
            body["slTriggerBy"] = json!("MarkPrice");
        }
        if let Some(tp) = bracket.take_profit {
            body["takeProfit"] = json!(tp.normalize().to_string());
            body["tpTriggerBy"] = json!("MarkPrice");
        }

        let _: serde_json::Value = self.post("/v5/position/trading-stop", body).await?;
        Ok(vec![OrderAck {
            exchange_order_id: format!("tpsl-{}", bracket.symbol.to_uppercase()),
            client_order_id: None,
            symbol: bracket.symbol.to_uppercase(),
            status: "NEW".to_string(),
            avg_price: None,
            executed_qty: Decimal::ZERO,
        }])
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol.to_uppercase(),
        });
        let _: serde_json::Value = self.post("/v5/order/cancel-all", body).await?;
        Ok(())
    }

    async fn health(&self) -> SourceHealth {
        self.health_tracker.snapshot(VENUE)
    }
}

/// Rows are `[startTime, open, high, low, close, volume, turnover]`, all strings
fn parse_kline(row: &[String]) -> Result<Candle> {
    if row.len() < 6 {
        return Err(ExchangeError::InvalidResponse(format!(
            "kline row has {} fields",
            row.len()
        )));
    }
    let open_ms: i64 = row[0]
        .parse()
        .map_err(|_| ExchangeError::InvalidResponse(format!("kline start {:?}", row[0])))?;

    Ok(Candle {
        open_time: Utc
            .timestamp_millis_opt(open_ms)
            .single()
            .ok_or_else(|| ExchangeError::InvalidResponse("kline timestamp".to_string()))?,
        open: parse_decimal(&row[1], "open")?,
        high: parse_decimal(&row[2], "high")?,
        low: parse_decimal(&row[3], "low")?,
        close: parse_decimal(&row[4], "close")?,
        volume: parse_decimal(&row[5], "volume")?,
    })
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ListResult<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerRow {
    symbol: String,
    last_price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentRow {
    lot_size_filter: LotSizeFilter,
    price_filter: PriceFilter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LotSizeFilter {
    qty_step: String,
    min_order_qty: String,
    min_notional_value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriceFilter {
    tick_size: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletRow {
    total_wallet_balance: String,
    total_available_balance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRow {
    symbol: String,
    side: String,
    size: String,
    avg_price: String,
    mark_price: String,
    unrealised_pnl: String,
    #[serde(default)]
    leverage: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrderResult {
    order_id: String,
    #[serde(default)]
    order_link_id: String,
}
