//! Observability: metrics collection and structured logging

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Metrics collector for tracking system health
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<RwLock<MetricsInner>>,
}

struct MetricsInner {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    histograms: HashMap<String, Vec<f64>>,
    start_time: Instant,
}

/// Samples kept per histogram
const HISTOGRAM_CAPACITY: usize = 1000;

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MetricsInner {
                counters: HashMap::new(),
                gauges: HashMap::new(),
                histograms: HashMap::new(),
                start_time: Instant::now(),
            })),
        }
    }

    /// Increment a counter
    pub async fn increment(&self, name: &str, value: u64) {
        let mut inner = self.inner.write().await;
        let counter = inner.counters.entry(name.to_string()).or_insert(0);
        *counter += value;
    }

    /// Set a gauge value
    pub async fn gauge(&self, name: &str, value: f64) {
        let mut inner = self.inner.write().await;
        inner.gauges.insert(name.to_string(), value);
    }

    /// Record a histogram value, keeping the most recent samples
    pub async fn histogram(&self, name: &str, value: f64) {
        let mut inner = self.inner.write().await;
        let samples = inner
            .histograms
            .entry(name.to_string())
            .or_insert_with(Vec::new);
        // Drop the oldest sample once full
        if samples.len() >= HISTOGRAM_CAPACITY {
            samples.remove(0);
        }
        samples.push(value);
    }

    /// Get all metrics as JSON-serializable format
    pub async fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.read().await;
        let histograms = inner
            .histograms
            .iter()
            .map(|(name, samples)| (name.clone(), HistogramSummary::from_samples(samples)))
            .collect();
        MetricsSnapshot {
            counters: inner.counters.clone(),
            gauges: inner.gauges.clone(),
            histograms,
            uptime_secs: inner.start_time.elapsed().as_secs(),
        }
    }

    /// Get specific counter
    pub async fn get_counter(&self, name: &str) -> u64 {
        let inner = self.inner.read().await;
        inner.counters.get(name).copied().unwrap_or(0)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HistogramSummary {
    pub count: usize,
    pub mean: f64,
    pub p95: f64,
    pub max: f64,
}

impl HistogramSummary {
    fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self {
                count: 0,
                mean: 0.0,
                p95: 0.0,
                max: 0.0,
            };
        }
        // NaN samples sort as equal rather than panicking
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        // Nearest-rank percentile
        let idx = ((sorted.len() as f64) * 0.95).ceil() as usize;
        Self {
            count: sorted.len(),
            mean: sorted.iter().sum::<f64>() / sorted.len() as f64,
            p95: sorted[idx.saturating_sub(1).min(sorted.len() - 1)],
            max: sorted[sorted.len() - 1],
        }
    }
}

/// Serializable metrics snapshot
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub histograms: HashMap<String, HistogramSummary>,
    pub uptime_secs: u64,
}

/// Structured logger for consistent log formatting
pub struct Logger;

impl Logger {
    /// Log bot lifecycle event
    pub fn bot_event(bot_id: &str, event_type: &str, details: &str) {
        tracing::info!(
            bot_id = %bot_id,
            event_type = %event_type,
            details = %details,
            "bot_event"
        );
    }

    /// Log the outcome of one subscription run
    pub fn run_event(subscription_id: &str, stage: &str, status: &str) {
        tracing::info!(
            subscription_id = %subscription_id,
            stage = %stage,
            status = %status,
            "run_event"
        );
    }
}

/// Predefined metric names
pub mod metrics {
    // Marketplace
    pub const BOT_CREATED: &str = "bot_created_total";
    pub const BOT_PUBLISHED: &str = "bot_published_total";
    pub const SUBSCRIPTION_CREATED: &str = "subscription_created_total";
    pub const INVOICE_PAID: &str = "invoice_paid_total";
    pub const LOGIN: &str = "login_total";
    pub const POINTS_AWARDED: &str = "points_awarded_total";

    // Scheduler
    pub const SCHEDULER_TICKS: &str = "scheduler_ticks_total";
    pub const SCHEDULER_SKIPPED_TICKS: &str = "scheduler_skipped_ticks_total";
    pub const RUNS_DISPATCHED: &str = "runs_dispatched_total";
    pub const RUNS_SKIPPED_LOCKED: &str = "runs_skipped_locked_total";
    pub const RUNS_DEFERRED: &str = "runs_deferred_total";
    pub const RUN_LOCKS_LOST: &str = "run_locks_lost_total";
    pub const RUNS_FAILED: &str = "runs_failed_total";
    pub const RUN_DURATION_MS: &str = "run_duration_ms";
    pub const SUBSCRIPTIONS_EXPIRED: &str = "subscriptions_expired_total";

    // Trading
    pub const SIGNALS_GENERATED: &str = "signals_generated_total";
    pub const SIGNAL_CACHE_HITS: &str = "signal_cache_hits_total";
    pub const LLM_FAILURES: &str = "llm_failures_total";
    pub const TRADE_EXECUTED: &str = "trade_executed_total";
    pub const TRADE_BLOCKED: &str = "trade_blocked_total";
    pub const TRADE_FAILED: &str = "trade_failed_total";
    pub const TRADES_RECONCILED: &str = "trades_reconciled_total";

    // API
    pub const RATE_LIMITED: &str = "rate_limited_total";
    pub const WEBHOOK_REJECTED: &str = "webhook_rejected_total";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_and_histograms() {
        let m = MetricsCollector::new();
        m.increment(metrics::RUNS_DISPATCHED, 2).await;
        m.increment(metrics::RUNS_DISPATCHED, 1).await;
        for v in 1..=100 {
            m.histogram(metrics::RUN_DURATION_MS, v as f64).await;
        }

        assert_eq!(m.get_counter(metrics::RUNS_DISPATCHED).await, 3);
        let snap = m.snapshot().await;
        let h = &snap.histograms[metrics::RUN_DURATION_MS];
        assert_eq!(h.count, 100);
        assert_eq!(h.p95, 95.0);
        assert_eq!(h.max, 100.0);
    }
}
