//! Airdrop points endpoints

use axum::{
    extract::{Query, State},
    Extension, Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::{
    airdrop,
    error::ApiResult,
    middleware::AuthContext,
    models::{LeaderboardEntry, Pagination, PointsResponse},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct LeaderboardQuery {
    pub limit: Option<i64>,
}

/// GET /points
pub async fn get_points(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<PointsResponse>> {
    let balance = airdrop::balance(&state.db, auth.user_id).await?;
    let history = airdrop::history(&state.db, auth.user_id, page.limit(), page.offset()).await?;
    Ok(Json(PointsResponse { balance, history }))
}

/// GET /points/leaderboard
pub async fn leaderboard(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LeaderboardQuery>,
) -> ApiResult<Json<Vec<LeaderboardEntry>>> {
    let limit = query.limit.unwrap_or(airdrop::DEFAULT_LEADERBOARD_SIZE);
    Ok(Json(airdrop::leaderboard(&state.db, limit).await?))
}
