pub mod airdrop;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod secrets;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::Settings;
pub use db::Db;
pub use error::{ApiError, ApiResult};
pub use observability::{Logger, MetricsCollector};
pub use secrets::SecretsManager;

use auth::{JwtService, OAuthRegistry};
use middleware::RateLimiter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub secrets: SecretsManager,
    pub metrics: MetricsCollector,
    pub jwt: JwtService,
    pub oauth: OAuthRegistry,
    /// Authenticated callers, keyed by user
    pub rate_limiter: RateLimiter,
    /// Anonymous callers, keyed by client address
    pub public_rate_limiter: RateLimiter,
    pub billing_webhook_secret: Option<String>,
    /// Key anonymous callers by `X-Forwarded-For` instead of the peer address
    pub trust_forwarded_for: bool,
}

impl AppState {
    pub fn new(db: Db, settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            db,
            secrets: SecretsManager::from_hex_key(settings.secrets_encryption_key.as_deref())?,
            metrics: MetricsCollector::new(),
            jwt: JwtService::new(&settings.jwt_secret, settings.jwt_ttl_secs),
            oauth: OAuthRegistry::from_settings(settings)?,
            rate_limiter: RateLimiter::new(60, 100),
            public_rate_limiter: RateLimiter::new(60, 60),
            billing_webhook_secret: settings
                .billing_webhook_secret
                .clone()
                .filter(|s| !s.is_empty()),
            trust_forwarded_for: settings.trust_forwarded_for,
        })
    }
}

/// Build the API router
pub fn app(state: Arc<AppState>) -> Router {
    use handlers::{admin, auth as login, billing, bots, credentials, points, subscriptions, users};

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // No auth; limited per client address
    let public_routes = Router::new()
        .route("/v1/auth/providers", get(login::list_providers))
        .route("/v1/auth/{provider}/authorize", get(login::authorize))
        .route("/v1/auth/{provider}/callback", post(login::callback))
        .route("/v1/marketplace/bots", get(bots::list_marketplace))
        .route("/v1/marketplace/bots/{id}", get(bots::get_marketplace_bot))
        .route("/v1/marketplace/bots/{id}/docs", get(bots::get_marketplace_docs))
        .route("/v1/points/leaderboard", get(points::leaderboard))
        .route("/v1/billing/webhook", post(billing::payment_webhook))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::public_rate_limit_middleware,
        ))
        .with_state(state.clone());

    // Any signed-in user
    let user_routes = Router::new()
        .route("/v1/me", get(users::get_me).patch(users::update_me))
        .route("/v1/me/developer", post(users::become_developer))
        .route(
            "/v1/credentials",
            get(credentials::list_credentials).post(credentials::create_credential),
        )
        .route("/v1/credentials/{id}", delete(credentials::delete_credential))
        .route(
            "/v1/subscriptions",
            get(subscriptions::list_subscriptions).post(subscriptions::create_subscription),
        )
        .route(
            "/v1/subscriptions/{id}",
            get(subscriptions::get_subscription).patch(subscriptions::update_subscription),
        )
        .route("/v1/subscriptions/{id}/pause", post(subscriptions::pause_subscription))
        .route("/v1/subscriptions/{id}/resume", post(subscriptions::resume_subscription))
        .route("/v1/subscriptions/{id}/cancel", post(subscriptions::cancel_subscription))
        .route("/v1/subscriptions/{id}/renew", post(subscriptions::renew_subscription))
        .route("/v1/subscriptions/{id}/trades", get(subscriptions::list_trades))
        .route("/v1/subscriptions/{id}/signals", get(subscriptions::list_signals))
        .route("/v1/billing/invoices", get(billing::list_invoices))
        .route("/v1/points", get(points::get_points))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::rate_limit_middleware,
        ))
        .layer(from_fn_with_state(state.clone(), middleware::auth_middleware))
        .with_state(state.clone());

    // Bot authors
    let developer_routes = Router::new()
        .route("/v1/dev/bots", get(bots::list_my_bots).post(bots::create_bot))
        .route("/v1/dev/bots/{id}", get(bots::get_my_bot).patch(bots::update_bot))
        .route("/v1/dev/bots/{id}/publish", post(bots::publish_bot))
        .route("/v1/dev/bots/{id}/archive", post(bots::archive_bot))
        .route("/v1/dev/bots/{id}/docs", put(bots::upsert_docs))
        .layer(from_fn(middleware::developer_middleware))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::rate_limit_middleware,
        ))
        .layer(from_fn_with_state(state.clone(), middleware::auth_middleware))
        .with_state(state.clone());

    let admin_routes = Router::new()
        .route("/v1/admin/stats", get(admin::stats))
        .route("/v1/admin/users", get(admin::list_users))
        .route("/v1/admin/points", post(admin::adjust_points))
        .route("/v1/admin/config", get(admin::list_config))
        .route(
            "/v1/admin/config/{key}",
            get(admin::get_config).put(admin::put_config),
        )
        .layer(from_fn(middleware::admin_middleware))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::rate_limit_middleware,
        ))
        .layer(from_fn_with_state(state.clone(), middleware::auth_middleware))
        .with_state(state.clone());

    let health_routes = Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/health/detail", get(health::health_detail))
        .with_state(state);

    Router::new()
        .merge(health_routes)
        .merge(public_routes)
        .merge(user_routes)
        .merge(developer_routes)
        .merge(admin_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
