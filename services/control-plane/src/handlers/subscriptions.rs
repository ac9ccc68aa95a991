//! Subscription handlers: renting a bot and managing the rental

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use super::billing::{extend_period, insert_invoice};
use super::bots::load_published_bot;
use crate::{
    airdrop,
    config::{get_config_i64_or, keys},
    error::{ApiError, ApiResult},
    middleware::AuthContext,
    models::*,
    observability::metrics,
    AppState,
};

/// Statuses that count against the per-user limit and keep a credential in use
const LIVE_STATUSES: &str = "('active', 'paused', 'pending_payment')";

async fn load_subscription(
    state: &AppState,
    auth: &AuthContext,
    subscription_id: Uuid,
) -> ApiResult<SubscriptionDb> {
    sqlx::query_as::<_, SubscriptionDb>(
        "SELECT * FROM subscriptions WHERE id = $1 AND user_id = $2",
    )
    .bind(subscription_id)
    .bind(auth.user_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or(ApiError::NotFound("subscription"))
}

/// Check the credential a subscription should trade with.
///
/// Returns the credential id and the testnet flag the subscription runs
/// with. Without a credential the bot must support paper trading.
async fn resolve_binding(
    state: &AppState,
    auth: &AuthContext,
    bot: &Bot,
    credential_id: Option<Uuid>,
    requested_testnet: bool,
) -> ApiResult<(Option<Uuid>, bool)> {
    let Some(credential_id) = credential_id else {
        if bot.supports(Exchange::Paper) {
            return Ok((None, requested_testnet));
        }
        return Err(ApiError::Unprocessable(
            "this bot needs exchange credentials; it does not support paper trading".to_string(),
        ));
    };

    let credential = sqlx::query_as::<_, ExchangeCredential>(
        "SELECT * FROM exchange_credentials WHERE id = $1 AND user_id = $2 AND is_active",
    )
    .bind(credential_id)
    .bind(auth.user_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or(ApiError::NotFound("credential"))?;

    let exchange: Exchange = credential
        .exchange
        .parse()
        .map_err(|_| ApiError::Unprocessable(format!("unsupported exchange: {}", credential.exchange)))?;
    if !bot.supports(exchange) {
        return Err(ApiError::Unprocessable(format!(
            "bot does not support {}",
            exchange
        )));
    }

    Ok((Some(credential.id), credential.is_testnet))
}

fn check_risk(risk: &RiskParams) -> ApiResult<()> {
    if risk.max_daily_loss_usd <= Decimal::ZERO {
        return Err(ApiError::Unprocessable(
            "max_daily_loss_usd must be positive".to_string(),
        ));
    }
    Ok(())
}

fn pairs(raw: &[String]) -> ApiResult<Vec<String>> {
    normalize_pairs(raw).map_err(ApiError::Unprocessable)
}

/// Where a new subscription starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialState {
    pub status: SubscriptionStatus,
    pub expires_at: DateTime<Utc>,
    pub invoice_amount: Option<Decimal>,
}

pub fn initial_state(price_per_month: Decimal, months: i32, now: DateTime<Utc>) -> InitialState {
    if price_per_month.is_zero() {
        return InitialState {
            status: SubscriptionStatus::Active,
            expires_at: extend_period(now, months),
            invoice_amount: None,
        };
    }
    // Period starts once the invoice is paid
    InitialState {
        status: SubscriptionStatus::PendingPayment,
        expires_at: now,
        invoice_amount: Some(price_per_month * Decimal::from(months)),
    }
}

/// POST /subscriptions
pub async fn create_subscription(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<CreateSubscriptionRequest>,
) -> ApiResult<Json<SubscriptionResponse>> {
    req.validate()?;
    check_risk(&req.risk)?;
    let trading_pairs = pairs(&req.trading_pairs)?;
    let bot = load_published_bot(&state, req.bot_id).await?;

    let limit = get_config_i64_or(&state.db, keys::MAX_SUBSCRIPTIONS_PER_USER, 10).await;
    let live: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM subscriptions WHERE user_id = $1 AND status IN {}",
        LIVE_STATUSES
    ))
    .bind(auth.user_id)
    .fetch_one(&state.db)
    .await?;
    if live >= limit {
        return Err(ApiError::Forbidden(format!(
            "subscription limit of {} reached",
            limit
        )));
    }

    let (credential_id, is_testnet) =
        resolve_binding(&state, &auth, &bot, req.credential_id, req.is_testnet).await?;

    let start = initial_state(bot.price_per_month, req.months, Utc::now());
    let timeframe = req.timeframe.unwrap_or(bot.strategy.timeframe);
    let min_confidence = req.risk.min_confidence.unwrap_or(bot.strategy.min_confidence);

    let mut tx = state.db.begin().await?;

    let row = sqlx::query_as::<_, SubscriptionDb>(
        r#"
        INSERT INTO subscriptions (
            id, user_id, bot_id, credential_id, trading_pairs, timeframe, leverage,
            position_size_pct, stop_loss_pct, take_profit_pct, max_daily_loss_usd,
            max_concurrent_positions, max_trades_per_day, min_confidence,
            execution_interval_secs, is_testnet, status, expires_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(auth.user_id)
    .bind(bot.id)
    .bind(credential_id)
    .bind(&trading_pairs)
    .bind(timeframe.as_str())
    .bind(req.risk.leverage)
    .bind(req.risk.position_size_pct)
    .bind(req.risk.stop_loss_pct)
    .bind(req.risk.take_profit_pct)
    .bind(bigdecimal_from_decimal(req.risk.max_daily_loss_usd))
    .bind(req.risk.max_concurrent_positions)
    .bind(req.risk.max_trades_per_day)
    .bind(min_confidence)
    .bind(req.execution_interval_secs)
    .bind(is_testnet)
    .bind(start.status)
    .bind(start.expires_at)
    .fetch_one(&mut *tx)
    .await?;

    let invoice = match start.invoice_amount {
        Some(amount) => {
            Some(insert_invoice(&mut tx, auth.user_id, row.id, amount, req.months).await?)
        }
        None => None,
    };

    let awarded = airdrop::award_points(
        &mut *tx,
        auth.user_id,
        PointsAction::SubscriptionCreated,
        &row.id.to_string(),
        airdrop::SUBSCRIPTION_CREATED_POINTS,
    )
    .await?;

    tx.commit().await?;

    state.metrics.increment(metrics::SUBSCRIPTION_CREATED, 1).await;
    if awarded {
        state.metrics.increment(metrics::POINTS_AWARDED, 1).await;
    }
    info!(
        subscription_id = %row.id,
        bot_id = %bot.id,
        user_id = %auth.user_id,
        "subscription created"
    );

    Ok(Json(SubscriptionResponse {
        subscription: row.into(),
        invoice,
    }))
}

/// GET /subscriptions
pub async fn list_subscriptions(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<ListResponse<Subscription>>> {
    let rows = sqlx::query_as::<_, SubscriptionDb>(
        r#"
        SELECT * FROM subscriptions
        WHERE user_id = $1
        ORDER BY created_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(auth.user_id)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&state.db)
    .await?;

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions WHERE user_id = $1")
        .bind(auth.user_id)
        .fetch_one(&state.db)
        .await?;

    Ok(Json(ListResponse {
        items: rows.into_iter().map(Subscription::from).collect(),
        total,
    }))
}

/// GET /subscriptions/{id}
pub async fn get_subscription(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(subscription_id): Path<Uuid>,
) -> ApiResult<Json<Subscription>> {
    Ok(Json(
        load_subscription(&state, &auth, subscription_id).await?.into(),
    ))
}

/// PATCH /subscriptions/{id}
pub async fn update_subscription(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(subscription_id): Path<Uuid>,
    Json(req): Json<UpdateSubscriptionRequest>,
) -> ApiResult<Json<Subscription>> {
    req.validate()?;
    let current = load_subscription(&state, &auth, subscription_id).await?;
    if matches!(
        current.status,
        SubscriptionStatus::Cancelled | SubscriptionStatus::Expired
    ) {
        return Err(ApiError::Conflict(
            "subscription is no longer running".to_string(),
        ));
    }

    let trading_pairs = req.trading_pairs.as_deref().map(pairs).transpose()?;
    if let Some(risk) = &req.risk {
        check_risk(risk)?;
    }

    let (credential_id, is_testnet) = match req.credential_id {
        Some(id) => {
            let bot: Bot = sqlx::query_as::<_, BotDb>("SELECT * FROM bots WHERE id = $1")
                .bind(current.bot_id)
                .fetch_one(&state.db)
                .await?
                .into();
            let (id, testnet) = resolve_binding(&state, &auth, &bot, Some(id), current.is_testnet).await?;
            (id, Some(testnet))
        }
        None => (current.credential_id, None),
    };

    let risk = req.risk.as_ref();
    let row = sqlx::query_as::<_, SubscriptionDb>(
        r#"
        UPDATE subscriptions SET
            trading_pairs = COALESCE($2, trading_pairs),
            credential_id = $3,
            is_testnet = COALESCE($4, is_testnet),
            timeframe = COALESCE($5, timeframe),
            leverage = COALESCE($6, leverage),
            position_size_pct = COALESCE($7, position_size_pct),
            stop_loss_pct = COALESCE($8, stop_loss_pct),
            take_profit_pct = COALESCE($9, take_profit_pct),
            max_daily_loss_usd = COALESCE($10, max_daily_loss_usd),
            max_concurrent_positions = COALESCE($11, max_concurrent_positions),
            max_trades_per_day = COALESCE($12, max_trades_per_day),
            min_confidence = COALESCE($13, min_confidence),
            execution_interval_secs = COALESCE($14, execution_interval_secs),
            updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(subscription_id)
    .bind(trading_pairs)
    .bind(credential_id)
    .bind(is_testnet)
    .bind(req.timeframe.map(|t| t.as_str()))
    .bind(risk.map(|r| r.leverage))
    .bind(risk.map(|r| r.position_size_pct))
    .bind(risk.map(|r| r.stop_loss_pct))
    .bind(risk.map(|r| r.take_profit_pct))
    .bind(risk.map(|r| bigdecimal_from_decimal(r.max_daily_loss_usd)))
    .bind(risk.map(|r| r.max_concurrent_positions))
    .bind(risk.map(|r| r.max_trades_per_day))
    .bind(risk.and_then(|r| r.min_confidence))
    .bind(req.execution_interval_secs)
    .fetch_one(&state.db)
    .await?;

    Ok(Json(row.into()))
}

/// POST /subscriptions/{id}/pause
pub async fn pause_subscription(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(subscription_id): Path<Uuid>,
) -> ApiResult<Json<Subscription>> {
    let current = load_subscription(&state, &auth, subscription_id).await?;
    match current.status {
        SubscriptionStatus::Paused => return Ok(Json(current.into())),
        SubscriptionStatus::Active => {}
        _ => {
            return Err(ApiError::Conflict(
                "only active subscriptions can be paused".to_string(),
            ))
        }
    }

    let row = sqlx::query_as::<_, SubscriptionDb>(
        "UPDATE subscriptions SET status = 'paused', updated_at = NOW() WHERE id = $1 RETURNING *",
    )
    .bind(subscription_id)
    .fetch_one(&state.db)
    .await?;

    Ok(Json(row.into()))
}

/// POST /subscriptions/{id}/resume
pub async fn resume_subscription(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(subscription_id): Path<Uuid>,
) -> ApiResult<Json<Subscription>> {
    let current = load_subscription(&state, &auth, subscription_id).await?;
    match current.status {
        SubscriptionStatus::Active => return Ok(Json(current.into())),
        SubscriptionStatus::Paused => {}
        _ => {
            return Err(ApiError::Conflict(
                "only paused subscriptions can be resumed".to_string(),
            ))
        }
    }
    if current.expires_at <= Utc::now() {
        return Err(ApiError::Conflict(
            "subscription period has ended; renew it first".to_string(),
        ));
    }

    // Due on the next scheduler tick
    let row = sqlx::query_as::<_, SubscriptionDb>(
        r#"
        UPDATE subscriptions SET status = 'active', next_run_at = NULL, updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(subscription_id)
    .fetch_one(&state.db)
    .await?;

    Ok(Json(row.into()))
}

/// POST /subscriptions/{id}/cancel
pub async fn cancel_subscription(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(subscription_id): Path<Uuid>,
) -> ApiResult<Json<Subscription>> {
    let current = load_subscription(&state, &auth, subscription_id).await?;
    if current.status == SubscriptionStatus::Cancelled {
        return Ok(Json(current.into()));
    }

    let mut tx = state.db.begin().await?;

    let row = sqlx::query_as::<_, SubscriptionDb>(
        "UPDATE subscriptions SET status = 'cancelled', updated_at = NOW() WHERE id = $1 RETURNING *",
    )
    .bind(subscription_id)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE invoices SET status = 'void' WHERE subscription_id = $1 AND status = 'pending'",
    )
    .bind(subscription_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    info!(subscription_id = %subscription_id, "subscription cancelled");
    Ok(Json(row.into()))
}

/// POST /subscriptions/{id}/renew
///
/// Paid bots get a pending invoice that extends the period once paid.
/// Free bots are extended immediately.
pub async fn renew_subscription(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(subscription_id): Path<Uuid>,
    Json(req): Json<RenewRequest>,
) -> ApiResult<Json<SubscriptionResponse>> {
    req.validate()?;
    let current = load_subscription(&state, &auth, subscription_id).await?;
    if current.status == SubscriptionStatus::Cancelled {
        return Err(ApiError::Conflict(
            "cancelled subscriptions cannot be renewed".to_string(),
        ));
    }
    let bot = load_published_bot(&state, current.bot_id).await?;

    if bot.is_free() {
        let base = current.expires_at.max(Utc::now());
        let row = sqlx::query_as::<_, SubscriptionDb>(
            r#"
            UPDATE subscriptions SET
                expires_at = $2,
                status = CASE WHEN status IN ('expired', 'pending_payment') THEN 'active' ELSE status END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(subscription_id)
        .bind(extend_period(base, req.months))
        .fetch_one(&state.db)
        .await?;

        return Ok(Json(SubscriptionResponse {
            subscription: row.into(),
            invoice: None,
        }));
    }

    let mut tx = state.db.begin().await?;
    let amount = bot.price_per_month * Decimal::from(req.months);
    let invoice = insert_invoice(&mut tx, auth.user_id, subscription_id, amount, req.months).await?;
    tx.commit().await?;

    Ok(Json(SubscriptionResponse {
        subscription: current.into(),
        invoice: Some(invoice),
    }))
}

/// GET /subscriptions/{id}/trades
pub async fn list_trades(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(subscription_id): Path<Uuid>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<ListResponse<Trade>>> {
    load_subscription(&state, &auth, subscription_id).await?;

    let rows = sqlx::query_as::<_, TradeDb>(
        r#"
        SELECT * FROM trades
        WHERE subscription_id = $1
        ORDER BY opened_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(subscription_id)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&state.db)
    .await?;

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trades WHERE subscription_id = $1")
        .bind(subscription_id)
        .fetch_one(&state.db)
        .await?;

    Ok(Json(ListResponse {
        items: rows.into_iter().map(Trade::from).collect(),
        total,
    }))
}

/// GET /subscriptions/{id}/signals
pub async fn list_signals(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(subscription_id): Path<Uuid>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<ListResponse<SignalRecord>>> {
    load_subscription(&state, &auth, subscription_id).await?;

    let rows = sqlx::query_as::<_, SignalRecordDb>(
        r#"
        SELECT * FROM signals
        WHERE subscription_id = $1
        ORDER BY created_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(subscription_id)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&state.db)
    .await?;

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM signals WHERE subscription_id = $1")
        .bind(subscription_id)
        .fetch_one(&state.db)
        .await?;

    Ok(Json(ListResponse {
        items: rows.into_iter().map(SignalRecord::from).collect(),
        total,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_free_bot_starts_active_without_invoice() {
        let now = Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();
        let start = initial_state(Decimal::ZERO, 1, now);
        assert_eq!(start.status, SubscriptionStatus::Active);
        assert_eq!(start.expires_at, Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap());
        assert_eq!(start.invoice_amount, None);
    }

    #[test]
    fn test_paid_bot_waits_for_invoice() {
        let now = Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();
        let start = initial_state(Decimal::new(1999, 2), 3, now);
        assert_eq!(start.status, SubscriptionStatus::PendingPayment);
        assert_eq!(start.expires_at, now);
        assert_eq!(start.invoice_amount, Some(Decimal::new(5997, 2)));
    }

    #[test]
    fn test_risk_requires_positive_daily_loss() {
        let mut risk = RiskParams::default();
        assert!(check_risk(&risk).is_ok());
        risk.max_daily_loss_usd = Decimal::ZERO;
        assert!(matches!(check_risk(&risk), Err(ApiError::Unprocessable(_))));
    }

    #[test]
    fn test_pairs_maps_to_unprocessable() {
        assert!(matches!(pairs(&[]), Err(ApiError::Unprocessable(_))));
        assert_eq!(pairs(&["ethusdt".to_string()]).unwrap(), vec!["ETHUSDT"]);
    }
}
