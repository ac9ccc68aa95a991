//! Exchange credential handlers
//!
//! Keys and secrets are encrypted before they touch the database and are
//! never returned; listings show a masked key only.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::{
    config::{get_config_i64_or, keys},
    error::{ApiError, ApiResult},
    middleware::AuthContext,
    models::*,
    AppState,
};

/// GET /credentials
pub async fn list_credentials(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<ListResponse<CredentialView>>> {
    let rows = sqlx::query_as::<_, ExchangeCredential>(
        "SELECT * FROM exchange_credentials WHERE user_id = $1 AND is_active ORDER BY created_at DESC",
    )
    .bind(auth.user_id)
    .fetch_all(&state.db)
    .await?;

    let items: Vec<CredentialView> = rows.into_iter().map(CredentialView::from).collect();
    let total = items.len() as i64;
    Ok(Json(ListResponse { items, total }))
}

/// POST /credentials
pub async fn create_credential(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<CreateCredentialRequest>,
) -> ApiResult<Json<CredentialView>> {
    req.validate()?;

    let exchange: Exchange = req
        .exchange
        .parse()
        .map_err(|_| ApiError::Unprocessable(format!("unsupported exchange: {}", req.exchange)))?;
    if exchange == Exchange::Paper {
        return Err(ApiError::Unprocessable(
            "paper trading does not use credentials".to_string(),
        ));
    }

    let limit = get_config_i64_or(&state.db, keys::MAX_CREDENTIALS_PER_USER, 10).await;
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM exchange_credentials WHERE user_id = $1 AND is_active",
    )
    .bind(auth.user_id)
    .fetch_one(&state.db)
    .await?;
    if count >= limit {
        return Err(ApiError::Forbidden(format!(
            "credential limit of {} reached",
            limit
        )));
    }

    let api_key = req.api_key.trim();
    let api_secret = req.api_secret.trim();
    let encrypted_key = state.secrets.encrypt(api_key)?;
    let encrypted_secret = state.secrets.encrypt(api_secret)?;

    let credential = sqlx::query_as::<_, ExchangeCredential>(
        r#"
        INSERT INTO exchange_credentials (
            id, user_id, exchange, label, encrypted_api_key, encrypted_api_secret,
            api_key_hint, is_testnet
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(auth.user_id)
    .bind(exchange.as_str())
    .bind(req.label.trim())
    .bind(encrypted_key)
    .bind(encrypted_secret)
    .bind(mask_api_key(api_key))
    .bind(req.is_testnet)
    .fetch_one(&state.db)
    .await?;

    info!(
        "User {} added {} credential {}",
        auth.user_id, credential.exchange, credential.id
    );
    Ok(Json(credential.into()))
}

/// DELETE /credentials/{id}
///
/// Soft delete; rows stay so historical subscriptions keep their reference.
/// A credential referenced by a live subscription cannot be removed
pub fn check_deletable(live_subscriptions: i64) -> ApiResult<()> {
    if live_subscriptions > 0 {
        return Err(ApiError::Conflict(format!(
            "credential is used by {} subscription(s)",
            live_subscriptions
        )));
    }
    Ok(())
}

pub async fn delete_credential(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(credential_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM exchange_credentials WHERE id = $1 AND user_id = $2 AND is_active)",
    )
    .bind(credential_id)
    .bind(auth.user_id)
    .fetch_one(&state.db)
    .await?;
    if !exists {
        return Err(ApiError::NotFound("credential"));
    }

    let in_use: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM subscriptions
        WHERE credential_id = $1 AND status IN ('active', 'paused', 'pending_payment')
        "#,
    )
    .bind(credential_id)
    .fetch_one(&state.db)
    .await?;
    check_deletable(in_use)?;

    sqlx::query("UPDATE exchange_credentials SET is_active = FALSE WHERE id = $1")
        .bind(credential_id)
        .execute(&state.db)
        .await?;

    info!("User {} removed credential {}", auth.user_id, credential_id);
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_in_use_is_conflict() {
        let err = check_deletable(2).unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert!(err.to_string().contains("2 subscription"));
    }

    #[test]
    fn test_unused_credential_is_deletable() {
        assert!(check_deletable(0).is_ok());
    }
}
