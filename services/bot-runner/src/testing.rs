//! Fixtures shared by unit and integration tests

use chrono::{Duration, TimeZone, Utc};
use control_plane::models::{
    Bot, BotStatus, BotType, ExchangeCredential, StrategyConfig, Subscription,
    SubscriptionStatus,
};
use exchange_gateway::{Candle, Exchange, TimeFrame};
use rust_decimal::Decimal;
use uuid::Uuid;

/// A published, free futures bot on `exchanges`
pub fn bot(exchanges: &[Exchange]) -> Bot {
    Bot {
        id: Uuid::new_v4(),
        developer_id: Uuid::new_v4(),
        name: "Test Bot".to_string(),
        description: String::new(),
        bot_type: BotType::Futures,
        supported_exchanges: exchanges.to_vec(),
        strategy: StrategyConfig::default(),
        price_per_month: Decimal::ZERO,
        status: BotStatus::Published,
        published_at: Some(Utc::now()),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// Active subscription on `bot` for a fresh user, trading BTCUSDT hourly
pub fn subscription(bot: &Bot) -> Subscription {
    Subscription {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        bot_id: bot.id,
        credential_id: None,
        trading_pairs: vec!["BTCUSDT".to_string()],
        timeframe: TimeFrame::Hour1,
        leverage: 5,
        position_size_pct: 10.0,
        stop_loss_pct: 2.0,
        take_profit_pct: 4.0,
        max_daily_loss_usd: Decimal::from(100),
        max_concurrent_positions: 3,
        max_trades_per_day: 10,
        min_confidence: 0.6,
        execution_interval_secs: 3600,
        is_testnet: false,
        status: SubscriptionStatus::Active,
        next_run_at: None,
        last_run_at: None,
        last_run_status: None,
        last_error: None,
        expires_at: Utc::now() + Duration::days(30),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// Active credential with plaintext `key` / `secret`
pub fn credential(user_id: Uuid, exchange: Exchange, is_testnet: bool) -> ExchangeCredential {
    ExchangeCredential {
        id: Uuid::new_v4(),
        user_id,
        exchange: exchange.as_str().to_string(),
        label: String::new(),
        encrypted_api_key: "key".to_string(),
        encrypted_api_secret: "secret".to_string(),
        api_key_hint: "****".to_string(),
        is_testnet,
        is_active: true,
        created_at: Utc::now(),
    }
}

/// Hourly candles closing at `closes`, each with a 2-point range
pub fn candles(closes: &[i64]) -> Vec<Candle> {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_else(Utc::now);
    closes
        .iter()
        .enumerate()
        .map(|(i, c)| Candle {
            open_time: start + Duration::hours(i as i64),
            open: Decimal::from(*c),
            high: Decimal::from(*c + 1),
            low: Decimal::from(*c - 1),
            close: Decimal::from(*c),
            volume: Decimal::from(100),
        })
        .collect()
}

/// `n` candles rising by one per bar from `start`
pub fn rising(start: i64, n: i64) -> Vec<Candle> {
    candles(&(start..start + n).collect::<Vec<_>>())
}
