//! Current-user handlers

use axum::{extract::State, Extension, Json};
use std::sync::Arc;
use tracing::info;
use validator::Validate;

use crate::{
    error::{ApiError, ApiResult},
    middleware::AuthContext,
    models::*,
    AppState,
};

pub(crate) async fn load_user(state: &AppState, auth: &AuthContext) -> ApiResult<User> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(auth.user_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or(ApiError::NotFound("user"))
}

/// GET /me
pub async fn get_me(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<User>> {
    Ok(Json(load_user(&state, &auth).await?))
}

/// PATCH /me
pub async fn update_me(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<UpdateMeRequest>,
) -> ApiResult<Json<User>> {
    req.validate()?;

    let user = sqlx::query_as::<_, User>(
        "UPDATE users SET display_name = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
    )
    .bind(auth.user_id)
    .bind(req.display_name.trim())
    .fetch_optional(&state.db)
    .await?
    .ok_or(ApiError::NotFound("user"))?;

    Ok(Json(user))
}

/// POST /me/developer
///
/// Idempotent; admins keep their role. The caller needs a fresh token for
/// the new role to show up in its claims.
pub async fn become_developer(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<User>> {
    let user = sqlx::query_as::<_, User>(
        r#"
        UPDATE users SET role = 'developer', updated_at = NOW()
        WHERE id = $1 AND role = 'user'
        RETURNING *
        "#,
    )
    .bind(auth.user_id)
    .fetch_optional(&state.db)
    .await?;

    match user {
        Some(user) => {
            info!("User {} upgraded to developer", user.id);
            Ok(Json(user))
        }
        None => Ok(Json(load_user(&state, &auth).await?)),
    }
}
