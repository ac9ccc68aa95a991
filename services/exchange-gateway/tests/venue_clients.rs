//! HTTP-level tests for the venue clients against a local mock server

use exchange_gateway::{
    ApiCredentials, BinanceFuturesClient, BracketRequest, BybitClient, ExchangeClient,
    ExchangeError, OrderRequest, PositionSide, Side, TimeFrame,
};
use rust_decimal::Decimal;
use serde_json::json;
use wiremock::matchers::{header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn creds() -> ApiCredentials {
    ApiCredentials::new("test-key", "test-secret")
}

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

#[tokio::test]
async fn binance_klines_are_parsed_oldest_first() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/klines"))
        .and(query_param("symbol", "BTCUSDT"))
        .and(query_param("interval", "15m"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            [1700000000000i64, "100.0", "101.0", "99.0", "100.5", "10", 1700000899999i64, "0", 1, "0", "0", "0"],
            [1700000900000i64, "100.5", "102.0", "100.0", "101.5", "12", 1700001799999i64, "0", 1, "0", "0", "0"]
        ])))
        .mount(&server)
        .await;

    let client = BinanceFuturesClient::with_base_url(None, &server.uri()).unwrap();
    let candles = client
        .get_candles("btcusdt", TimeFrame::Minute15, 2)
        .await
        .unwrap();

    assert_eq!(candles.len(), 2);
    assert!(candles[0].open_time < candles[1].open_time);
    assert_eq!(candles[1].close, dec("101.5"));
}

#[tokio::test]
async fn binance_signed_order_carries_key_and_signature() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/order"))
        .and(header_exists("X-MBX-APIKEY"))
        .and(query_param("symbol", "ETHUSDT"))
        .and(query_param("side", "BUY"))
        .and(query_param("type", "MARKET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "orderId": 42,
            "clientOrderId": "run-1",
            "symbol": "ETHUSDT",
            "status": "FILLED",
            "avgPrice": "2000.50",
            "executedQty": "0.5"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = BinanceFuturesClient::with_base_url(Some(creds()), &server.uri()).unwrap();
    let ack = client
        .place_order(
            &OrderRequest::market("ETHUSDT", Side::Buy, dec("0.5")).with_client_order_id("run-1"),
        )
        .await
        .unwrap();

    assert_eq!(ack.exchange_order_id, "42");
    assert_eq!(ack.avg_price, Some(dec("2000.50")));
    assert_eq!(ack.executed_qty, dec("0.5"));

    let requests = server.received_requests().await.unwrap();
    let query = requests[0].url.query().unwrap_or_default().to_string();
    assert!(query.contains("timestamp="));
    assert!(query.contains("&signature="));
    assert!(query.contains("newClientOrderId=run-1"));
}

#[tokio::test]
async fn binance_api_error_is_mapped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/order"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "code": -2019,
            "msg": "Margin is insufficient."
        })))
        .mount(&server)
        .await;

    let client = BinanceFuturesClient::with_base_url(Some(creds()), &server.uri()).unwrap();
    let err = client
        .place_order(&OrderRequest::market("ETHUSDT", Side::Buy, dec("1")))
        .await
        .unwrap_err();

    match err {
        ExchangeError::Api { code, message, .. } => {
            assert_eq!(code, -2019);
            assert!(message.contains("Margin"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(client.health().await.last_error.is_some());
}

#[tokio::test]
async fn binance_rate_limit_reports_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/ticker/price"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
        .mount(&server)
        .await;

    let client = BinanceFuturesClient::with_base_url(None, &server.uri()).unwrap();
    let err = client.get_ticker("BTCUSDT").await.unwrap_err();
    assert!(matches!(
        err,
        ExchangeError::RateLimited {
            retry_after: Some(7),
            ..
        }
    ));
}

#[tokio::test]
async fn binance_signed_call_without_credentials_fails_fast() {
    let server = MockServer::start().await;
    let client = BinanceFuturesClient::with_base_url(None, &server.uri()).unwrap();

    let err = client.get_balance().await.unwrap_err();
    assert!(matches!(err, ExchangeError::MissingCredentials(_)));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn binance_positions_skip_flat_symbols() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fapi/v2/positionRisk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"symbol":"BTCUSDT","positionAmt":"-0.010","entryPrice":"60000","markPrice":"59000","unRealizedProfit":"10","leverage":"10"},
            {"symbol":"ETHUSDT","positionAmt":"0.000","entryPrice":"0","markPrice":"2000","unRealizedProfit":"0","leverage":"5"}
        ])))
        .mount(&server)
        .await;

    let client = BinanceFuturesClient::with_base_url(Some(creds()), &server.uri()).unwrap();
    let positions = client.get_positions().await.unwrap();

    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].side, PositionSide::Short);
    assert_eq!(positions[0].quantity, dec("0.010"));
    assert_eq!(positions[0].leverage, 10);
}

#[tokio::test]
async fn binance_bracket_places_both_legs() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/order"))
        .and(query_param("closePosition", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "orderId": 7,
            "symbol": "BTCUSDT",
            "status": "NEW"
        })))
        .expect(2)
        .mount(&server)
        .await;

    let client = BinanceFuturesClient::with_base_url(Some(creds()), &server.uri()).unwrap();
    let acks = client
        .place_bracket(&BracketRequest {
            symbol: "BTCUSDT".to_string(),
            position_side: PositionSide::Long,
            quantity: dec("0.01"),
            stop_loss: Some(dec("58000")),
            take_profit: Some(dec("65000")),
        })
        .await
        .unwrap();
    assert_eq!(acks.len(), 2);
}

#[tokio::test]
async fn bybit_klines_are_reversed_to_oldest_first() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v5/market/kline"))
        .and(query_param("category", "linear"))
        .and(query_param("interval", "60"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "retCode": 0,
            "retMsg": "OK",
            "result": {
                "symbol": "BTCUSDT",
                "category": "linear",
                "list": [
                    ["1700003600000", "101", "103", "100", "102", "5", "510"],
                    ["1700000000000", "100", "101", "99", "101", "4", "400"]
                ]
            }
        })))
        .mount(&server)
        .await;

    let client = BybitClient::with_base_url(None, &server.uri()).unwrap();
    let candles = client
        .get_candles("BTCUSDT", TimeFrame::Hour1, 2)
        .await
        .unwrap();

    assert_eq!(candles[0].open_time.timestamp_millis(), 1700000000000);
    assert_eq!(candles[1].close, dec("102"));
}

#[tokio::test]
async fn bybit_signed_request_sends_auth_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v5/account/wallet-balance"))
        .and(header_exists("X-BAPI-API-KEY"))
        .and(header_exists("X-BAPI-SIGN"))
        .and(header_exists("X-BAPI-TIMESTAMP"))
        .and(header_exists("X-BAPI-RECV-WINDOW"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "retCode": 0,
            "retMsg": "OK",
            "result": {"list": [{
                "totalWalletBalance": "1500.25",
                "totalAvailableBalance": "1200"
            }]}
        })))
        .mount(&server)
        .await;

    let client = BybitClient::with_base_url(Some(creds()), &server.uri()).unwrap();
    let balance = client.get_balance().await.unwrap();
    assert_eq!(balance.wallet_balance, dec("1500.25"));
    assert_eq!(balance.available_balance, dec("1200"));
}

#[tokio::test]
async fn bybit_leverage_not_modified_is_ok() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v5/position/set-leverage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "retCode": 110043,
            "retMsg": "leverage not modified",
            "result": {}
        })))
        .mount(&server)
        .await;

    let client = BybitClient::with_base_url(Some(creds()), &server.uri()).unwrap();
    client.set_leverage("BTCUSDT", 5).await.unwrap();
}

#[tokio::test]
async fn bybit_symbol_rules_from_instrument_filters() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v5/market/instruments-info"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "retCode": 0,
            "retMsg": "OK",
            "result": {"category": "linear", "list": [{
                "symbol": "ETHUSDT",
                "lotSizeFilter": {"qtyStep": "0.01", "minOrderQty": "0.01", "minNotionalValue": "5"},
                "priceFilter": {"tickSize": "0.01", "minPrice": "0.01"}
            }]}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = BybitClient::with_base_url(None, &server.uri()).unwrap();
    let rules = client.get_symbol_rules("ETHUSDT").await.unwrap();
    // second call served from cache
    let again = client.get_symbol_rules("ETHUSDT").await.unwrap();

    assert_eq!(rules, again);
    assert_eq!(rules.step_size, dec("0.01"));
    assert_eq!(rules.round_quantity(dec("1.239")), dec("1.23"));
}
