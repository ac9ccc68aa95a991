//! Admin handlers: platform stats, users, points adjustments and
//! runtime configuration

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::{
    airdrop,
    error::{ApiError, ApiResult},
    middleware::AdminContext,
    models::*,
    observability::metrics,
    AppState,
};

const MASKED_VALUE: &str = "********";

fn to_entry(config: PlatformConfig) -> ConfigEntry {
    ConfigEntry {
        key: config.key,
        value: if config.encrypted && !config.value.is_empty() {
            MASKED_VALUE.to_string()
        } else {
            config.value
        },
        encrypted: config.encrypted,
        description: config.description,
        category: config.category,
        updated_at: config.updated_at,
    }
}

/// GET /admin/stats
pub async fn stats(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
) -> ApiResult<Json<AdminStats>> {
    info!("Admin {} reading platform stats", admin.admin_id);

    let (users, bots, published_bots, active_subscriptions, open_trades, points_issued): (
        i64,
        i64,
        i64,
        i64,
        i64,
        i64,
    ) = sqlx::query_as(
        r#"
        SELECT
            (SELECT COUNT(*) FROM users),
            (SELECT COUNT(*) FROM bots),
            (SELECT COUNT(*) FROM bots WHERE status = 'published'),
            (SELECT COUNT(*) FROM subscriptions WHERE status = 'active'),
            (SELECT COUNT(*) FROM trades WHERE status = 'open'),
            (SELECT COALESCE(SUM(points), 0)::BIGINT FROM points_ledger)
        "#,
    )
    .fetch_one(&state.db)
    .await?;

    Ok(Json(AdminStats {
        users,
        bots,
        published_bots,
        active_subscriptions,
        open_trades,
        points_issued,
    }))
}

/// GET /admin/users
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<ListResponse<User>>> {
    let items = sqlx::query_as::<_, User>(
        "SELECT * FROM users ORDER BY created_at DESC LIMIT $1 OFFSET $2",
    )
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&state.db)
    .await?;

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(&state.db)
        .await?;

    Ok(Json(ListResponse { items, total }))
}

/// POST /admin/points
///
/// Each adjustment is its own ledger entry; negative values deduct.
pub async fn adjust_points(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
    Json(req): Json<AdminPointsRequest>,
) -> ApiResult<Json<PointsResponse>> {
    req.validate()?;
    if req.points == 0 {
        return Err(ApiError::Unprocessable("points must be non-zero".to_string()));
    }

    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1)")
        .bind(req.user_id)
        .fetch_one(&state.db)
        .await?;
    if !exists {
        return Err(ApiError::NotFound("user"));
    }

    let reference = format!("admin:{}:{}", admin.admin_id, Uuid::new_v4());
    airdrop::award_points(
        &state.db,
        req.user_id,
        PointsAction::AdminAdjustment,
        &reference,
        req.points,
    )
    .await?;
    state.metrics.increment(metrics::POINTS_AWARDED, 1).await;

    info!(
        "Admin {} adjusted points for {} by {} ({})",
        admin.admin_id, req.user_id, req.points, req.reason
    );

    let balance = airdrop::balance(&state.db, req.user_id).await?;
    let history = airdrop::history(&state.db, req.user_id, 20, 0).await?;
    Ok(Json(PointsResponse { balance, history }))
}

/// GET /admin/config
pub async fn list_config(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<ConfigEntry>>> {
    let configs: Vec<PlatformConfig> =
        sqlx::query_as("SELECT * FROM platform_config ORDER BY category, key")
            .fetch_all(&state.db)
            .await?;

    Ok(Json(configs.into_iter().map(to_entry).collect()))
}

/// GET /admin/config/{key}
pub async fn get_config(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<Json<ConfigEntry>> {
    let config: PlatformConfig = sqlx::query_as("SELECT * FROM platform_config WHERE key = $1")
        .bind(&key)
        .fetch_optional(&state.db)
        .await?
        .ok_or(ApiError::NotFound("config key"))?;

    Ok(Json(to_entry(config)))
}

/// PUT /admin/config/{key}
///
/// Creates the key when missing. Values of encrypted keys are stored
/// encrypted and never echoed back.
pub async fn put_config(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
    Path(key): Path<String>,
    Json(req): Json<UpdateConfigValueRequest>,
) -> ApiResult<Json<ConfigEntry>> {
    let key = key.trim().to_ascii_lowercase();
    if key.is_empty() || key.len() > 100 {
        return Err(ApiError::Unprocessable("invalid config key".to_string()));
    }

    let current: Option<PlatformConfig> =
        sqlx::query_as("SELECT * FROM platform_config WHERE key = $1")
            .bind(&key)
            .fetch_optional(&state.db)
            .await?;

    let encrypted = req
        .encrypted
        .or(current.as_ref().map(|c| c.encrypted))
        .unwrap_or(false);
    let value = if encrypted && !req.value.is_empty() {
        state.secrets.encrypt(&req.value)?
    } else {
        req.value.clone()
    };

    let config: PlatformConfig = sqlx::query_as(
        r#"
        INSERT INTO platform_config (key, value, encrypted, description, category, updated_at)
        VALUES ($1, $2, $3, COALESCE($4, ''), COALESCE($5, 'general'), NOW())
        ON CONFLICT (key) DO UPDATE
        SET value = EXCLUDED.value,
            encrypted = EXCLUDED.encrypted,
            description = COALESCE($4, platform_config.description),
            category = COALESCE($5, platform_config.category),
            updated_at = NOW()
        RETURNING *
        "#,
    )
    .bind(&key)
    .bind(&value)
    .bind(encrypted)
    .bind(&req.description)
    .bind(&req.category)
    .fetch_one(&state.db)
    .await?;

    info!("Config '{}' updated by admin {}", key, admin.admin_id);
    Ok(Json(to_entry(config)))
}
