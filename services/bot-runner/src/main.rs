use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bot_runner::{
    llm::LlmRegistry,
    notifier::{LogNotifier, NotifierConfig, WebhookNotifier},
    signal::RedisSignalCache,
    LiveExchangeFactory, Notifier, PgRunStore, RedisLockManager, RunnerSettings, Scheduler,
    SignalGenerator, Workflow,
};
use control_plane::{
    config::{get_config_decrypted, keys},
    MetricsCollector, SecretsManager,
};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
/// Paper accounts of subscriptions that stopped running
const PAPER_IDLE_TTL: Duration = Duration::from_secs(24 * 3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting bot runner...");

    let settings = RunnerSettings::from_env()?;

    // One connection per concurrent run plus headroom for the scheduler
    let db = control_plane::db::connect(
        &settings.database_url,
        settings.max_concurrent_runs as u32 + 2,
    )
    .await?;
    info!("Database connected");

    let secrets = SecretsManager::from_hex_key(settings.secrets_encryption_key.as_deref())?;
    if !secrets.is_encryption_active() {
        warn!("SECRETS_ENCRYPTION_KEY not set; credentials are read as plaintext");
    }

    let locks = Arc::new(RedisLockManager::new(&settings.redis_url).await?);
    let cache = Arc::new(RedisSignalCache::new(&settings.redis_url).await?);
    info!("Redis connected");

    let llms = LlmRegistry::from_settings(&settings)?;
    info!("LLM providers configured: {:?}", llms.configured());

    // Environment wins over platform config
    let notifier_config = NotifierConfig {
        discord_webhook_url: match settings.discord_webhook_url.clone() {
            Some(url) => Some(url),
            None => get_config_decrypted(&db, &secrets, keys::DISCORD_WEBHOOK_URL).await,
        },
        telegram_bot_token: settings.telegram_bot_token.clone(),
        telegram_chat_id: match settings.telegram_chat_id.clone() {
            Some(id) => Some(id),
            None => get_config_decrypted(&db, &secrets, keys::TELEGRAM_CHAT_ID).await,
        },
        telegram_api_base: None,
    };
    let notifier: Arc<dyn Notifier> = if notifier_config.is_empty() {
        info!("No notification channels configured, logging only");
        Arc::new(LogNotifier)
    } else {
        Arc::new(WebhookNotifier::new(notifier_config)?)
    };

    let metrics = MetricsCollector::new();
    let store = Arc::new(PgRunStore::new(db));
    let signals = Arc::new(SignalGenerator::new(
        llms,
        cache,
        settings.signal_cache_ttl(),
        metrics.clone(),
    ));

    let exchanges = Arc::new(LiveExchangeFactory::new());
    let workflow = Arc::new(Workflow::new(
        store.clone(),
        exchanges.clone(),
        signals,
        notifier,
        secrets,
        metrics.clone(),
    ));
    let intents = workflow.intents.clone();

    let scheduler = Scheduler::new(store, locks, workflow, settings.scheduler(), metrics);
    info!(
        "Scheduler tick {:?}, batch {}, max concurrent runs {}",
        scheduler.config().tick,
        scheduler.config().batch_size,
        scheduler.config().max_concurrent_runs
    );

    let mut tick = interval(scheduler.config().tick);
    let mut cleanup = interval(CLEANUP_INTERVAL);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(e) = scheduler.schedule_active_bots().await {
                    error!("Scheduler tick failed: {:#}", e);
                }
            }
            _ = cleanup.tick() => {
                intents.lock().await.cleanup();
                exchanges.evict_idle(PAPER_IDLE_TTL).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    let in_flight = scheduler.in_flight().await;
    if in_flight > 0 {
        info!("Waiting for {} running bots to finish", in_flight);
    }
    scheduler.drain().await;
    info!("Bot runner stopped");
    Ok(())
}
