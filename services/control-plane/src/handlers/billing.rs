//! Billing: invoices and the payment provider webhook
//!
//! The provider signs the raw request body with HMAC-SHA256 and sends the
//! hex digest in `X-Signature`.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    Extension, Json,
};
use chrono::{DateTime, Duration, Months, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::{Postgres, Transaction};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    airdrop,
    error::{ApiError, ApiResult},
    middleware::AuthContext,
    models::*,
    observability::metrics,
    AppState,
};

pub const SIGNATURE_HEADER: &str = "x-signature";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEvent {
    Paid,
    Void,
}

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub event: WebhookEvent,
    pub invoice_id: Uuid,
    #[serde(default)]
    pub payment_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub status: &'static str,
}

/// End of a billing period of `months` starting at `start`
pub fn extend_period(start: DateTime<Utc>, months: i32) -> DateTime<Utc> {
    let months = months.max(0) as u32;
    start
        .checked_add_months(Months::new(months))
        .unwrap_or_else(|| start + Duration::days(30 * i64::from(months)))
}

/// Constant-time check of a hex HMAC-SHA256 signature over `body`
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

pub(crate) async fn insert_invoice(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    subscription_id: Uuid,
    amount_usd: Decimal,
    months: i32,
) -> ApiResult<Invoice> {
    let row = sqlx::query_as::<_, InvoiceDb>(
        r#"
        INSERT INTO invoices (id, user_id, subscription_id, amount_usd, months, status)
        VALUES ($1, $2, $3, $4, $5, 'pending')
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(subscription_id)
    .bind(bigdecimal_from_decimal(amount_usd))
    .bind(months)
    .fetch_one(&mut **tx)
    .await?;

    Ok(row.into())
}

/// GET /billing/invoices
pub async fn list_invoices(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<ListResponse<Invoice>>> {
    let rows = sqlx::query_as::<_, InvoiceDb>(
        r#"
        SELECT * FROM invoices
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

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM invoices WHERE user_id = $1")
        .bind(auth.user_id)
        .fetch_one(&state.db)
        .await?;

    Ok(Json(ListResponse {
        items: rows.into_iter().map(Invoice::from).collect(),
        total,
    }))
}

/// POST /billing/webhook
pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    let Some(secret) = state.billing_webhook_secret.as_deref() else {
        warn!("Billing webhook called but BILLING_WEBHOOK_SECRET is not set");
        state.metrics.increment(metrics::WEBHOOK_REJECTED, 1).await;
        return Err(ApiError::Unauthorized);
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !verify_signature(secret, &body, signature) {
        warn!("Billing webhook rejected: bad signature");
        state.metrics.increment(metrics::WEBHOOK_REJECTED, 1).await;
        return Err(ApiError::Unauthorized);
    }

    let payload: WebhookPayload = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid webhook payload: {}", e)))?;

    let status = match payload.event {
        WebhookEvent::Paid => mark_paid(&state, &payload).await?,
        WebhookEvent::Void => mark_void(&state, payload.invoice_id).await?,
    };

    Ok(Json(WebhookAck { status }))
}

/// What a `paid` event does to an invoice in `status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaidOutcome {
    Process,
    /// Replayed event; nothing changes and no points are awarded again
    Duplicate,
}

pub fn paid_outcome(status: InvoiceStatus) -> ApiResult<PaidOutcome> {
    match status {
        InvoiceStatus::Pending => Ok(PaidOutcome::Process),
        InvoiceStatus::Paid => Ok(PaidOutcome::Duplicate),
        InvoiceStatus::Void => Err(ApiError::Conflict("invoice has been voided".to_string())),
    }
}

/// Subscription state after a paid invoice of `months`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaidSubscription {
    pub status: SubscriptionStatus,
    pub expires_at: DateTime<Utc>,
    /// Run on the next scheduler tick
    pub reset_next_run: bool,
}

pub fn subscription_after_payment(
    status: SubscriptionStatus,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
    months: i32,
) -> PaidSubscription {
    // A lapsed period restarts today, a live one is extended from its end
    let expires_at = extend_period(expires_at.max(now), months);
    match status {
        SubscriptionStatus::PendingPayment | SubscriptionStatus::Expired => PaidSubscription {
            status: SubscriptionStatus::Active,
            expires_at,
            reset_next_run: true,
        },
        // Paused and cancelled subscriptions keep their status; the period still extends
        other => PaidSubscription {
            status: other,
            expires_at,
            reset_next_run: false,
        },
    }
}

/// Answer to a `void` event for an invoice that was not pending
pub fn void_outcome(status: Option<InvoiceStatus>) -> ApiResult<&'static str> {
    match status {
        None => Err(ApiError::NotFound("invoice")),
        Some(InvoiceStatus::Paid) => Err(ApiError::Conflict(
            "paid invoices cannot be voided".to_string(),
        )),
        Some(InvoiceStatus::Void) => Ok("duplicate"),
        // Lost a race with another event; report what happened to it
        Some(InvoiceStatus::Pending) => Ok("voided"),
    }
}

async fn mark_paid(state: &AppState, payload: &WebhookPayload) -> ApiResult<&'static str> {
    let mut tx = state.db.begin().await?;

    let invoice = sqlx::query_as::<_, InvoiceDb>("SELECT * FROM invoices WHERE id = $1 FOR UPDATE")
        .bind(payload.invoice_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ApiError::NotFound("invoice"))?;

    if paid_outcome(invoice.status)? == PaidOutcome::Duplicate {
        return Ok("duplicate");
    }

    let now = Utc::now();
    sqlx::query(
        r#"
        UPDATE invoices SET status = 'paid', paid_at = $2, external_payment_id = $3
        WHERE id = $1
        "#,
    )
    .bind(invoice.id)
    .bind(now)
    .bind(&payload.payment_id)
    .execute(&mut *tx)
    .await?;

    let (status, expires_at): (SubscriptionStatus, DateTime<Utc>) = sqlx::query_as(
        "SELECT status, expires_at FROM subscriptions WHERE id = $1 FOR UPDATE",
    )
    .bind(invoice.subscription_id)
    .fetch_one(&mut *tx)
    .await?;
    let next = subscription_after_payment(status, expires_at, now, invoice.months);

    sqlx::query(
        r#"
        UPDATE subscriptions SET
            expires_at = $2,
            status = $3,
            next_run_at = CASE WHEN $4 THEN NULL ELSE next_run_at END,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(invoice.subscription_id)
    .bind(next.expires_at)
    .bind(next.status)
    .bind(next.reset_next_run)
    .execute(&mut *tx)
    .await?;

    // The ledger is unique on (user, action, invoice id), so a replay that
    // slips past the status check still awards nothing
    let amount = decimal_from_bigdecimal(invoice.amount_usd.clone());
    let awarded = airdrop::award_points(
        &mut *tx,
        invoice.user_id,
        PointsAction::InvoicePaid,
        &invoice.id.to_string(),
        airdrop::invoice_points(amount),
    )
    .await?;

    tx.commit().await?;

    state.metrics.increment(metrics::INVOICE_PAID, 1).await;
    if awarded {
        state.metrics.increment(metrics::POINTS_AWARDED, 1).await;
    }
    info!(
        invoice_id = %invoice.id,
        subscription_id = %invoice.subscription_id,
        amount_usd = %amount,
        status = ?next.status,
        "invoice paid"
    );
    Ok("processed")
}

async fn mark_void(state: &AppState, invoice_id: Uuid) -> ApiResult<&'static str> {
    let result = sqlx::query("UPDATE invoices SET status = 'void' WHERE id = $1 AND status = 'pending'")
        .bind(invoice_id)
        .execute(&state.db)
        .await?;

    if result.rows_affected() == 1 {
        info!(invoice_id = %invoice_id, "invoice voided");
        return Ok("voided");
    }

    let status: Option<InvoiceStatus> =
        sqlx::query_scalar("SELECT status FROM invoices WHERE id = $1")
            .bind(invoice_id)
            .fetch_optional(&state.db)
            .await?;
    if status == Some(InvoiceStatus::Paid) {
        warn!(invoice_id = %invoice_id, "void event for a paid invoice");
    }
    void_outcome(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_signature_verification() {
        let body = br#"{"event":"paid","invoice_id":"00000000-0000-0000-0000-000000000001"}"#;
        let sig = sign("whsec", body);
        assert!(verify_signature("whsec", body, &sig));
        assert!(!verify_signature("other", body, &sig));
        assert!(!verify_signature("whsec", b"tampered", &sig));
        assert!(!verify_signature("whsec", body, "not-hex"));
        assert!(!verify_signature("whsec", body, ""));
    }

    #[test]
    fn test_extend_period_by_calendar_months() {
        let start = Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();
        let end = extend_period(start, 1);
        // Clamped to the end of February
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap());
        assert_eq!(
            extend_period(start, 12),
            Utc.with_ymd_and_hms(2025, 1, 31, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_paid_event_is_processed_once() {
        assert_eq!(paid_outcome(InvoiceStatus::Pending).unwrap(), PaidOutcome::Process);
        // Replays stop before the points award
        assert_eq!(paid_outcome(InvoiceStatus::Paid).unwrap(), PaidOutcome::Duplicate);
        let err = paid_outcome(InvoiceStatus::Void).unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::CONFLICT);
    }

    #[test]
    fn test_payment_activates_pending_subscription() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap();
        let next = subscription_after_payment(SubscriptionStatus::PendingPayment, now, now, 1);
        assert_eq!(next.status, SubscriptionStatus::Active);
        assert_eq!(next.expires_at, Utc.with_ymd_and_hms(2024, 4, 10, 9, 0, 0).unwrap());
        assert!(next.reset_next_run);

        // Lapsed periods restart from now
        let lapsed = now - Duration::days(40);
        let next = subscription_after_payment(SubscriptionStatus::Expired, lapsed, now, 2);
        assert_eq!(next.status, SubscriptionStatus::Active);
        assert_eq!(next.expires_at, Utc.with_ymd_and_hms(2024, 5, 10, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_payment_extends_live_period_and_keeps_pause() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap();
        let ends = Utc.with_ymd_and_hms(2024, 3, 20, 9, 0, 0).unwrap();

        let active = subscription_after_payment(SubscriptionStatus::Active, ends, now, 1);
        assert_eq!(active.status, SubscriptionStatus::Active);
        assert_eq!(active.expires_at, Utc.with_ymd_and_hms(2024, 4, 20, 9, 0, 0).unwrap());
        assert!(!active.reset_next_run);

        let paused = subscription_after_payment(SubscriptionStatus::Paused, ends, now, 1);
        assert_eq!(paused.status, SubscriptionStatus::Paused);
        assert!(!paused.reset_next_run);
    }

    #[test]
    fn test_void_outcomes() {
        let paid = void_outcome(Some(InvoiceStatus::Paid)).unwrap_err();
        assert_eq!(paid.status(), axum::http::StatusCode::CONFLICT);
        assert_eq!(void_outcome(None).unwrap_err().status(), axum::http::StatusCode::NOT_FOUND);
        assert_eq!(void_outcome(Some(InvoiceStatus::Void)).unwrap(), "duplicate");
    }

    #[test]
    fn test_webhook_payload_parsing() {
        let payload: WebhookPayload = serde_json::from_str(
            r#"{"event":"void","invoice_id":"00000000-0000-0000-0000-000000000002"}"#,
        )
        .unwrap();
        assert_eq!(payload.event, WebhookEvent::Void);
        assert!(payload.payment_id.is_none());
    }
}
