//! Signal generation with caching
//!
//! The LLM is asked once per (model, symbol, timeframe, candle). Answers are
//! cached so every subscription on the same bot and market shares one call.
//! Any LLM failure falls back to the strategy's technical engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use control_plane::models::StrategyConfig;
use control_plane::observability::{metrics, MetricsCollector};
use exchange_gateway::{Candle, PositionSide, TimeFrame};
use redis::AsyncCommands;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::indicators::IndicatorSnapshot;
use crate::llm::{build_prompt, parse_reply, prompt::system_prompt, LlmRegistry};
use crate::technical;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "BUY",
            SignalAction::Sell => "SELL",
            SignalAction::Hold => "HOLD",
        }
    }

    pub fn is_actionable(&self) -> bool {
        !matches!(self, SignalAction::Hold)
    }

    /// Position a BUY or SELL would open
    pub fn position_side(&self) -> Option<PositionSide> {
        match self {
            SignalAction::Buy => Some(PositionSide::Long),
            SignalAction::Sell => Some(PositionSide::Short),
            SignalAction::Hold => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    Llm,
    Technical,
    Cache,
}

impl SignalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalSource::Llm => "llm",
            SignalSource::Technical => "technical",
            SignalSource::Cache => "cache",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    pub symbol: String,
    pub action: SignalAction,
    pub confidence: f64,
    pub reasoning: String,
    /// Close of the candle the signal was computed on
    pub price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub source: SignalSource,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("no candles for {0}")]
    NoCandles(String),
}

/// `signal:{provider}:{model}:{symbol}:{timeframe}:{last_candle_open_ms}`
pub fn cache_key(
    strategy: &StrategyConfig,
    symbol: &str,
    timeframe: TimeFrame,
    last_candle: &Candle,
) -> String {
    let (provider, model) = match (strategy.llm_provider, strategy.model()) {
        (Some(p), Some(m)) => (p.as_str().to_string(), m),
        _ => (
            "technical".to_string(),
            technical::for_mode(strategy.fallback_mode).name().to_string(),
        ),
    };
    format!(
        "signal:{}:{}:{}:{}:{}",
        provider,
        model,
        symbol,
        timeframe.as_str(),
        last_candle.open_time.timestamp_millis()
    )
}

#[async_trait]
pub trait SignalCache: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<TradeSignal>>;

    async fn put(&self, key: &str, signal: &TradeSignal, ttl: Duration) -> anyhow::Result<()>;
}

pub struct RedisSignalCache {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisSignalCache {
    pub async fn new(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl SignalCache for RedisSignalCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<TradeSignal>> {
        let value: Option<String> = self.conn.clone().get(key).await?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, signal: &TradeSignal, ttl: Duration) -> anyhow::Result<()> {
        let json = serde_json::to_string(signal)?;
        let _: () = self
            .conn
            .clone()
            .set_ex(key, json, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemorySignalCache {
    entries: Arc<Mutex<HashMap<String, (TradeSignal, Instant)>>>,
}

impl MemorySignalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|(_, expires)| *expires > now)
            .count()
    }
}

#[async_trait]
impl SignalCache for MemorySignalCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<TradeSignal>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(signal, _)| signal.clone()))
    }

    async fn put(&self, key: &str, signal: &TradeSignal, ttl: Duration) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, (_, expires)| *expires > now);
        entries.insert(key.to_string(), (signal.clone(), now + ttl));
        Ok(())
    }
}

pub struct SignalGenerator {
    llms: LlmRegistry,
    cache: Arc<dyn SignalCache>,
    cache_ttl: Duration,
    metrics: MetricsCollector,
}

impl SignalGenerator {
    pub fn new(
        llms: LlmRegistry,
        cache: Arc<dyn SignalCache>,
        cache_ttl: Duration,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            llms,
            cache,
            cache_ttl,
            metrics,
        }
    }

    pub async fn generate(
        &self,
        strategy: &StrategyConfig,
        symbol: &str,
        timeframe: TimeFrame,
        candles: &[Candle],
    ) -> Result<TradeSignal, SignalError> {
        let last = candles
            .last()
            .ok_or_else(|| SignalError::NoCandles(symbol.to_string()))?;
        let key = cache_key(strategy, symbol, timeframe, last);

        match self.cache.get(&key).await {
            Ok(Some(mut cached)) => {
                debug!(key = %key, "Signal cache hit");
                self.metrics.increment(metrics::SIGNAL_CACHE_HITS, 1).await;
                cached.source = SignalSource::Cache;
                return Ok(cached);
            }
            Ok(None) => {}
            Err(e) => warn!(key = %key, "Signal cache read failed: {}", e),
        }

        let signal = match self.ask_llm(strategy, symbol, timeframe, candles).await {
            Some(signal) => signal,
            None => self.technical(strategy, symbol, candles),
        };
        self.metrics.increment(metrics::SIGNALS_GENERATED, 1).await;

        if let Err(e) = self.cache.put(&key, &signal, self.cache_ttl).await {
            warn!(key = %key, "Signal cache write failed: {}", e);
        }
        Ok(signal)
    }

    async fn ask_llm(
        &self,
        strategy: &StrategyConfig,
        symbol: &str,
        timeframe: TimeFrame,
        candles: &[Candle],
    ) -> Option<TradeSignal> {
        let provider = strategy.llm_provider?;
        let model = strategy.model()?;
        let Some(client) = self.llms.get(provider) else {
            warn!(
                provider = provider.as_str(),
                "No API key for LLM provider, using technical fallback"
            );
            return None;
        };

        let indicators = IndicatorSnapshot::compute(candles);
        let prompt = build_prompt(symbol, timeframe, candles, &indicators);
        let system = system_prompt(strategy.prompt_preamble.as_deref());

        let reply = match client.complete(&model, &system, &prompt).await {
            Ok(raw) => parse_reply(&raw),
            Err(e) => Err(e),
        };

        match reply {
            Ok(reply) => Some(TradeSignal {
                symbol: symbol.to_string(),
                action: reply.action,
                confidence: reply.confidence,
                reasoning: reply.reasoning,
                price: indicators.last_close.unwrap_or_default(),
                stop_loss: reply.stop_loss,
                take_profit: reply.take_profit,
                source: SignalSource::Llm,
                generated_at: Utc::now(),
            }),
            Err(e) => {
                warn!(
                    provider = provider.as_str(),
                    model = %model,
                    symbol,
                    "LLM signal failed, using technical fallback: {}",
                    e
                );
                self.metrics.increment(metrics::LLM_FAILURES, 1).await;
                None
            }
        }
    }

    fn technical(&self, strategy: &StrategyConfig, symbol: &str, candles: &[Candle]) -> TradeSignal {
        let engine = technical::for_mode(strategy.fallback_mode);
        let view = engine.evaluate(candles);
        TradeSignal {
            symbol: symbol.to_string(),
            action: view.action,
            confidence: view.confidence,
            reasoning: format!("[{}] {}", engine.name(), view.reasoning),
            price: candles.last().map(|c| c.close).unwrap_or_default(),
            stop_loss: view.stop_loss,
            take_profit: view.take_profit,
            source: SignalSource::Technical,
            generated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmClient, LlmError};
    use chrono::TimeZone;
    use control_plane::models::{AlgorithmMode, LlmProvider};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedLlm {
        reply: Result<String, ()>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        fn provider(&self) -> LlmProvider {
            LlmProvider::OpenAi
        }

        async fn complete(&self, _: &str, _: &str, _: &str) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone().map_err(|_| LlmError::EmptyResponse)
        }
    }

    fn rising(n: i64) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| Candle {
                open_time: start + chrono::Duration::hours(i),
                open: Decimal::from(100 + i),
                high: Decimal::from(101 + i),
                low: Decimal::from(99 + i),
                close: Decimal::from(100 + i),
                volume: Decimal::from(10),
            })
            .collect()
    }

    fn llm_strategy() -> StrategyConfig {
        StrategyConfig {
            llm_provider: Some(LlmProvider::OpenAi),
            ..StrategyConfig::default()
        }
    }

    fn generator(llm: Arc<ScriptedLlm>, cache: MemorySignalCache) -> SignalGenerator {
        SignalGenerator::new(
            LlmRegistry::new().with_client(llm),
            Arc::new(cache),
            Duration::from_secs(60),
            MetricsCollector::new(),
        )
    }

    #[test]
    fn test_cache_key_format() {
        let candles = rising(3);
        let key = cache_key(&llm_strategy(), "BTCUSDT", TimeFrame::Hour1, &candles[2]);
        assert_eq!(key, "signal:openai:gpt-4o-mini:BTCUSDT:1h:1704074400000");

        let key = cache_key(&StrategyConfig::default(), "BTCUSDT", TimeFrame::Hour1, &candles[2]);
        assert!(key.starts_with("signal:technical:trend:"));
    }

    #[tokio::test]
    async fn test_llm_answer_is_cached() {
        let llm = Arc::new(ScriptedLlm {
            reply: Ok(r#"{"action":"SELL","confidence":0.9,"reasoning":"overextended"}"#.into()),
            calls: AtomicUsize::new(0),
        });
        let cache = MemorySignalCache::new();
        let signals = generator(llm.clone(), cache.clone());
        let candles = rising(40);

        let first = signals
            .generate(&llm_strategy(), "BTCUSDT", TimeFrame::Hour1, &candles)
            .await
            .unwrap();
        assert_eq!(first.action, SignalAction::Sell);
        assert_eq!(first.source, SignalSource::Llm);
        assert_eq!(first.price, Decimal::from(139));

        let second = signals
            .generate(&llm_strategy(), "BTCUSDT", TimeFrame::Hour1, &candles)
            .await
            .unwrap();
        assert_eq!(second.source, SignalSource::Cache);
        assert_eq!(second.action, SignalAction::Sell);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_llm_failure_falls_back_to_technical() {
        let llm = Arc::new(ScriptedLlm {
            reply: Err(()),
            calls: AtomicUsize::new(0),
        });
        let signals = generator(llm, MemorySignalCache::new());
        let strategy = StrategyConfig {
            fallback_mode: AlgorithmMode::Trend,
            ..llm_strategy()
        };

        let signal = signals
            .generate(&strategy, "ETHUSDT", TimeFrame::Hour1, &rising(60))
            .await
            .unwrap();
        assert_eq!(signal.source, SignalSource::Technical);
        assert_eq!(signal.action, SignalAction::Buy);
        assert!(signal.reasoning.starts_with("[trend]"));
        assert_eq!(signals.metrics.get_counter(metrics::LLM_FAILURES).await, 1);
    }

    #[tokio::test]
    async fn test_unparseable_reply_falls_back() {
        let llm = Arc::new(ScriptedLlm {
            reply: Ok("the market looks bullish".into()),
            calls: AtomicUsize::new(0),
        });
        let signals = generator(llm, MemorySignalCache::new());
        let signal = signals
            .generate(&llm_strategy(), "ETHUSDT", TimeFrame::Hour1, &rising(60))
            .await
            .unwrap();
        assert_eq!(signal.source, SignalSource::Technical);
    }

    #[tokio::test]
    async fn test_missing_candles_is_an_error() {
        let llm = Arc::new(ScriptedLlm {
            reply: Err(()),
            calls: AtomicUsize::new(0),
        });
        let signals = generator(llm, MemorySignalCache::new());
        assert!(signals
            .generate(&llm_strategy(), "ETHUSDT", TimeFrame::Hour1, &[])
            .await
            .is_err());
    }
}
