//! Bot handlers: public marketplace and developer management

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::{
    airdrop,
    error::{ApiError, ApiResult},
    middleware::AuthContext,
    models::*,
    observability::{metrics, Logger},
    AppState,
};

/// Validate exchange names and return them in canonical form, keeping order
fn canonical_exchanges(names: &[String]) -> ApiResult<Vec<String>> {
    let mut out: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let exchange: Exchange = name
            .parse()
            .map_err(|_| ApiError::Unprocessable(format!("unsupported exchange: {}", name)))?;
        let canonical = exchange.as_str().to_string();
        if !out.contains(&canonical) {
            out.push(canonical);
        }
    }
    Ok(out)
}

fn check_price(price: Decimal) -> ApiResult<()> {
    if price.is_sign_negative() {
        return Err(ApiError::Unprocessable(
            "price_per_month cannot be negative".to_string(),
        ));
    }
    Ok(())
}

/// Load a bot the caller may modify: its developer or an admin
async fn load_owned_bot(state: &AppState, auth: &AuthContext, bot_id: Uuid) -> ApiResult<BotDb> {
    let bot = sqlx::query_as::<_, BotDb>("SELECT * FROM bots WHERE id = $1")
        .bind(bot_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or(ApiError::NotFound("bot"))?;

    if bot.developer_id != auth.user_id && !auth.is_admin() {
        // Hide other developers' drafts entirely
        return Err(ApiError::NotFound("bot"));
    }
    Ok(bot)
}

pub(crate) async fn load_published_bot(state: &AppState, bot_id: Uuid) -> ApiResult<Bot> {
    sqlx::query_as::<_, BotDb>("SELECT * FROM bots WHERE id = $1 AND status = 'published'")
        .bind(bot_id)
        .fetch_optional(&state.db)
        .await?
        .map(Bot::from)
        .ok_or(ApiError::NotFound("bot"))
}

// Marketplace

/// GET /marketplace/bots
pub async fn list_marketplace(
    State(state): State<Arc<AppState>>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<ListResponse<Bot>>> {
    let rows = sqlx::query_as::<_, BotDb>(
        r#"
        SELECT * FROM bots
        WHERE status = 'published'
        ORDER BY published_at DESC, id
        LIMIT $1 OFFSET $2
        "#,
    )
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&state.db)
    .await?;

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bots WHERE status = 'published'")
        .fetch_one(&state.db)
        .await?;

    Ok(Json(ListResponse {
        items: rows.into_iter().map(Bot::from).collect(),
        total,
    }))
}

/// GET /marketplace/bots/{id}
pub async fn get_marketplace_bot(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<Uuid>,
) -> ApiResult<Json<Bot>> {
    Ok(Json(load_published_bot(&state, bot_id).await?))
}

/// GET /marketplace/bots/{id}/docs
pub async fn get_marketplace_docs(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<Uuid>,
) -> ApiResult<Json<BotDoc>> {
    load_published_bot(&state, bot_id).await?;

    let doc = sqlx::query_as::<_, BotDoc>("SELECT * FROM bot_docs WHERE bot_id = $1")
        .bind(bot_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or(ApiError::NotFound("documentation"))?;

    Ok(Json(doc))
}

// Developer routes

/// GET /dev/bots
pub async fn list_my_bots(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<ListResponse<Bot>>> {
    let rows = sqlx::query_as::<_, BotDb>(
        r#"
        SELECT * FROM bots
        WHERE developer_id = $1
        ORDER BY created_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(auth.user_id)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&state.db)
    .await?;

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bots WHERE developer_id = $1")
        .bind(auth.user_id)
        .fetch_one(&state.db)
        .await?;

    Ok(Json(ListResponse {
        items: rows.into_iter().map(Bot::from).collect(),
        total,
    }))
}

/// POST /dev/bots
pub async fn create_bot(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<CreateBotRequest>,
) -> ApiResult<Json<Bot>> {
    req.validate()?;
    req.strategy.validate().map_err(ApiError::Unprocessable)?;
    check_price(req.price_per_month)?;
    let exchanges = canonical_exchanges(&req.supported_exchanges)?;

    let bot = sqlx::query_as::<_, BotDb>(
        r#"
        INSERT INTO bots (
            id, developer_id, name, description, bot_type, supported_exchanges,
            strategy, price_per_month, status
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'draft')
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(auth.user_id)
    .bind(req.name.trim())
    .bind(&req.description)
    .bind(req.bot_type)
    .bind(&exchanges)
    .bind(sqlx::types::Json(&req.strategy))
    .bind(bigdecimal_from_decimal(req.price_per_month))
    .fetch_one(&state.db)
    .await?;

    state.metrics.increment(metrics::BOT_CREATED, 1).await;
    Logger::bot_event(&bot.id.to_string(), "created", &bot.name);

    Ok(Json(bot.into()))
}

/// GET /dev/bots/{id}
pub async fn get_my_bot(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(bot_id): Path<Uuid>,
) -> ApiResult<Json<Bot>> {
    Ok(Json(load_owned_bot(&state, &auth, bot_id).await?.into()))
}

/// PATCH /dev/bots/{id}
pub async fn update_bot(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(bot_id): Path<Uuid>,
    Json(req): Json<UpdateBotRequest>,
) -> ApiResult<Json<Bot>> {
    req.validate()?;
    let current = load_owned_bot(&state, &auth, bot_id).await?;

    if current.status == BotStatus::Archived {
        return Err(ApiError::Conflict("archived bots cannot be edited".to_string()));
    }

    if let Some(strategy) = &req.strategy {
        strategy.validate().map_err(ApiError::Unprocessable)?;
    }
    if let Some(price) = req.price_per_month {
        check_price(price)?;
    }
    let exchanges = match &req.supported_exchanges {
        Some(names) => {
            let exchanges = canonical_exchanges(names)?;
            if exchanges.is_empty() && current.status == BotStatus::Published {
                return Err(ApiError::Unprocessable(
                    "a published bot needs at least one supported exchange".to_string(),
                ));
            }
            Some(exchanges)
        }
        None => None,
    };

    let bot = sqlx::query_as::<_, BotDb>(
        r#"
        UPDATE bots SET
            name = COALESCE($2, name),
            description = COALESCE($3, description),
            supported_exchanges = COALESCE($4, supported_exchanges),
            strategy = COALESCE($5, strategy),
            price_per_month = COALESCE($6, price_per_month),
            updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(bot_id)
    .bind(req.name.as_deref().map(str::trim))
    .bind(req.description.as_deref())
    .bind(exchanges)
    .bind(req.strategy.as_ref().map(sqlx::types::Json))
    .bind(req.price_per_month.map(bigdecimal_from_decimal))
    .fetch_one(&state.db)
    .await?;

    Logger::bot_event(&bot.id.to_string(), "updated", &bot.name);
    Ok(Json(bot.into()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStep {
    Publish,
    /// Publishing again is a no-op and awards nothing
    AlreadyPublished,
}

pub fn publish_step(status: BotStatus) -> ApiResult<PublishStep> {
    match status {
        BotStatus::Draft => Ok(PublishStep::Publish),
        BotStatus::Published => Ok(PublishStep::AlreadyPublished),
        BotStatus::Archived => Err(ApiError::Conflict(
            "archived bots cannot be published".to_string(),
        )),
    }
}

/// POST /dev/bots/{id}/publish
pub async fn publish_bot(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(bot_id): Path<Uuid>,
) -> ApiResult<Json<Bot>> {
    let current = load_owned_bot(&state, &auth, bot_id).await?;

    if publish_step(current.status)? == PublishStep::AlreadyPublished {
        return Ok(Json(current.into()));
    }

    current
        .strategy
        .0
        .validate()
        .map_err(ApiError::Unprocessable)?;
    if current.supported_exchanges.is_empty() {
        return Err(ApiError::Unprocessable(
            "at least one supported exchange is required to publish".to_string(),
        ));
    }

    let mut tx = state.db.begin().await?;

    let bot = sqlx::query_as::<_, BotDb>(
        r#"
        UPDATE bots SET status = 'published', published_at = $2, updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(bot_id)
    .bind(Utc::now())
    .fetch_one(&mut *tx)
    .await?;

    let awarded = airdrop::award_points(
        &mut *tx,
        bot.developer_id,
        PointsAction::BotPublished,
        &bot.id.to_string(),
        airdrop::BOT_PUBLISHED_POINTS,
    )
    .await?;

    tx.commit().await?;

    if awarded {
        state.metrics.increment(metrics::POINTS_AWARDED, 1).await;
    }
    state.metrics.increment(metrics::BOT_PUBLISHED, 1).await;
    Logger::bot_event(&bot.id.to_string(), "published", &bot.name);
    info!("Bot {} published by {}", bot.id, auth.user_id);

    Ok(Json(bot.into()))
}

/// POST /dev/bots/{id}/archive
///
/// Existing subscriptions keep their period but the scheduler stops
/// running them, since only published bots are due.
pub async fn archive_bot(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(bot_id): Path<Uuid>,
) -> ApiResult<Json<Bot>> {
    load_owned_bot(&state, &auth, bot_id).await?;

    let bot = sqlx::query_as::<_, BotDb>(
        "UPDATE bots SET status = 'archived', updated_at = NOW() WHERE id = $1 RETURNING *",
    )
    .bind(bot_id)
    .fetch_one(&state.db)
    .await?;

    Logger::bot_event(&bot.id.to_string(), "archived", &bot.name);
    Ok(Json(bot.into()))
}

/// PUT /dev/bots/{id}/docs
pub async fn upsert_docs(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(bot_id): Path<Uuid>,
    Json(req): Json<UpsertDocsRequest>,
) -> ApiResult<Json<BotDoc>> {
    req.validate()?;
    load_owned_bot(&state, &auth, bot_id).await?;

    let doc = sqlx::query_as::<_, BotDoc>(
        r#"
        INSERT INTO bot_docs (bot_id, title, content_markdown, updated_at)
        VALUES ($1, $2, $3, NOW())
        ON CONFLICT (bot_id) DO UPDATE
        SET title = EXCLUDED.title,
            content_markdown = EXCLUDED.content_markdown,
            updated_at = NOW()
        RETURNING *
        "#,
    )
    .bind(bot_id)
    .bind(req.title.trim())
    .bind(&req.content_markdown)
    .fetch_one(&state.db)
    .await?;

    Ok(Json(doc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_transitions() {
        assert_eq!(publish_step(BotStatus::Draft).unwrap(), PublishStep::Publish);
        assert_eq!(
            publish_step(BotStatus::Published).unwrap(),
            PublishStep::AlreadyPublished
        );
        let err = publish_step(BotStatus::Archived).unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::CONFLICT);
    }

    #[test]
    fn test_canonical_exchanges() {
        let names = vec![
            "Binance".to_string(),
            "paper".to_string(),
            "binance".to_string(),
        ];
        assert_eq!(
            canonical_exchanges(&names).unwrap(),
            vec!["binance".to_string(), "paper".to_string()]
        );
        assert!(canonical_exchanges(&["kraken".to_string()]).is_err());
    }

    #[test]
    fn test_negative_price_rejected() {
        assert!(check_price(Decimal::from(-1)).is_err());
        assert!(check_price(Decimal::ZERO).is_ok());
    }
}
