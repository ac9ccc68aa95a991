//! OAuth login handlers

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    auth::{OAuthError, OAuthProfile, ProviderKind},
    error::{ApiError, ApiResult},
    models::User,
    observability::metrics,
    AppState,
};

#[derive(Debug, Serialize)]
pub struct ProvidersResponse {
    pub providers: Vec<ProviderKind>,
}

#[derive(Debug, Serialize)]
pub struct AuthorizeResponse {
    pub url: String,
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub struct CallbackRequest {
    pub code: String,
    pub state: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub user: User,
}

impl From<OAuthError> for ApiError {
    fn from(e: OAuthError) -> Self {
        match e {
            OAuthError::UnknownProvider(_) => ApiError::NotFound("OAuth provider"),
            OAuthError::NotConfigured(p) => {
                ApiError::BadRequest(format!("login with {} is not enabled", p))
            }
            OAuthError::MissingEmail => ApiError::BadRequest(e.to_string()),
            OAuthError::Http(_) | OAuthError::InvalidResponse(_) => {
                ApiError::Upstream(e.to_string())
            }
        }
    }
}

/// GET /auth/providers
pub async fn list_providers(State(state): State<Arc<AppState>>) -> Json<ProvidersResponse> {
    Json(ProvidersResponse {
        providers: state.oauth.configured(),
    })
}

/// GET /auth/{provider}/authorize
pub async fn authorize(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
) -> ApiResult<Json<AuthorizeResponse>> {
    let kind: ProviderKind = provider.parse()?;
    let provider = state.oauth.get(kind)?;

    let oauth_state = state
        .jwt
        .issue_state(kind.as_str())
        .map_err(|e| ApiError::Internal(e.into()))?;
    let url = provider.authorize_url(&oauth_state)?;

    Ok(Json(AuthorizeResponse {
        url,
        state: oauth_state,
    }))
}

/// POST /auth/{provider}/callback
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Json(req): Json<CallbackRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let kind: ProviderKind = provider.parse()?;
    let provider = state.oauth.get(kind)?;

    if !state.jwt.verify_state(&req.state, kind.as_str()) {
        warn!("OAuth callback for {} with invalid state", kind);
        return Err(ApiError::BadRequest("invalid or expired state".to_string()));
    }

    let access_token = provider.exchange_code(state.oauth.http(), &req.code).await?;
    let profile = provider
        .fetch_profile(state.oauth.http(), &access_token)
        .await?;

    let user = upsert_user(&state, kind, &profile).await?;
    let token = state
        .jwt
        .issue_access_token(&user)
        .map_err(|e| ApiError::Internal(e.into()))?;

    state.metrics.increment(metrics::LOGIN, 1).await;
    info!("User {} logged in via {}", user.id, kind);

    Ok(Json(LoginResponse {
        access_token: token,
        token_type: "Bearer",
        expires_in: state.jwt.ttl_secs(),
        user,
    }))
}

async fn upsert_user(
    state: &AppState,
    kind: ProviderKind,
    profile: &OAuthProfile,
) -> Result<User, sqlx::Error> {
    sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (id, email, display_name, role, oauth_provider, oauth_subject)
        VALUES ($1, $2, $3, 'user', $4, $5)
        ON CONFLICT (oauth_provider, oauth_subject) DO UPDATE
        SET email = EXCLUDED.email,
            display_name = COALESCE(users.display_name, EXCLUDED.display_name),
            updated_at = NOW()
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&profile.email)
    .bind(&profile.display_name)
    .bind(kind.as_str())
    .bind(&profile.subject)
    .fetch_one(&state.db)
    .await
}
