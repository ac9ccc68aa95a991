//! HMAC-SHA256 request signing for Binance and Bybit.

use crate::credentials::ApiCredentials;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Default receive window sent with signed requests (ms)
pub const RECV_WINDOW_MS: u64 = 5000;

/// Hex-encoded HMAC-SHA256 of `message` keyed by `secret`
pub fn hmac_sha256_hex(secret: &str, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Join key/value pairs into a query string, preserving order
pub fn build_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Binance USDⓈ-M signing: `recvWindow` and `timestamp` are appended,
/// then the whole query string is signed and `signature` appended last.
pub fn binance_signed_query(
    credentials: &ApiCredentials,
    params: &[(&str, String)],
    timestamp_ms: i64,
) -> String {
    let mut all: Vec<(&str, String)> = params.to_vec();
    all.push(("recvWindow", RECV_WINDOW_MS.to_string()));
    all.push(("timestamp", timestamp_ms.to_string()));

    let query = build_query(&all);
    let signature = hmac_sha256_hex(credentials.expose_secret(), &query);
    format!("{}&signature={}", query, signature)
}

/// Bybit v5 signing headers for a request whose payload is either the
/// query string (GET) or the raw JSON body (POST).
#[derive(Debug, Clone, PartialEq)]
pub struct BybitSignature {
    pub api_key: String,
    pub timestamp: String,
    pub recv_window: String,
    pub sign: String,
}

pub fn bybit_sign(credentials: &ApiCredentials, payload: &str, timestamp_ms: i64) -> BybitSignature {
    let timestamp = timestamp_ms.to_string();
    let recv_window = RECV_WINDOW_MS.to_string();
    let message = format!(
        "{}{}{}{}",
        timestamp,
        credentials.api_key(),
        recv_window,
        payload
    );

    BybitSignature {
        api_key: credentials.api_key().to_string(),
        sign: hmac_sha256_hex(credentials.expose_secret(), &message),
        timestamp,
        recv_window,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_known_vector() {
        // Published Binance signed-endpoint example
        let signature = hmac_sha256_hex(
            "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j",
            "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559",
        );
        assert_eq!(
            signature,
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_binance_query_layout() {
        let creds = ApiCredentials::new("key", "secret");
        let query = binance_signed_query(
            &creds,
            &[("symbol", "BTCUSDT".to_string()), ("leverage", "5".to_string())],
            1000,
        );

        let (unsigned, signature) = query.split_once("&signature=").unwrap();
        assert_eq!(unsigned, "symbol=BTCUSDT&leverage=5&recvWindow=5000&timestamp=1000");
        assert_eq!(signature, hmac_sha256_hex("secret", unsigned));
    }

    #[test]
    fn test_bybit_sign_covers_payload() {
        let creds = ApiCredentials::new("key", "secret");
        let a = bybit_sign(&creds, "category=linear&symbol=BTCUSDT", 1700000000000);
        let b = bybit_sign(&creds, "category=linear&symbol=ETHUSDT", 1700000000000);

        assert_eq!(a.timestamp, "1700000000000");
        assert_eq!(a.recv_window, "5000");
        assert_eq!(
            a.sign,
            hmac_sha256_hex("secret", "1700000000000key5000category=linear&symbol=BTCUSDT")
        );
        assert_ne!(a.sign, b.sign);
    }
}
