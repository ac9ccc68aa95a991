use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use control_plane::{
    config::{get_config_i64_or, keys},
    middleware::RateLimiter,
    AppState, Settings,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting bot marketplace control plane...");

    let settings = Settings::from_env()?;

    info!("Connecting to database...");
    let db = control_plane::db::init_db(&settings.database_url).await?;
    info!("Database connected");

    info!("Running migrations...");
    sqlx::migrate!("./migrations").run(&db).await?;
    info!("Migrations applied");

    let mut state = AppState::new(db.clone(), &settings)?;
    let per_minute =
        get_config_i64_or(&db, keys::RATE_LIMIT_REQUESTS_PER_MINUTE, 100).await;
    state.rate_limiter = RateLimiter::new(60, per_minute.clamp(1, 100_000) as u32);

    if !state.secrets.is_encryption_active() {
        tracing::warn!("SECRETS_ENCRYPTION_KEY not set; exchange credentials are stored in plaintext");
    }
    info!(
        "OAuth providers enabled: {:?}",
        state.oauth.configured()
    );

    let app = control_plane::app(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", settings.port)).await?;
    info!("Control plane listening on port {}", settings.port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
    })
    .await?;

    Ok(())
}
