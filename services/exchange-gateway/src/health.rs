//! Lock-free request health tracking shared by the venue clients

use chrono::{TimeZone, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::types::SourceHealth;

pub struct HealthTracker {
    /// Millis since epoch of the last successful request
    last_success_ms: AtomicU64,
    /// Millis since epoch of the last failed request
    last_failure_ms: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    total_latency_ms: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            last_success_ms: AtomicU64::new(0),
            last_failure_ms: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn record_success(&self, latency_ms: u64) {
        let now_ms = Utc::now().timestamp_millis() as u64;
        self.last_success_ms.store(now_ms, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.success_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, error: &str) {
        let now_ms = Utc::now().timestamp_millis() as u64;
        self.last_failure_ms.store(now_ms, Ordering::Relaxed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(error.to_string());
        }
    }

    /// Healthy once a request succeeded and nothing failed since
    pub fn is_healthy(&self) -> bool {
        let last_success = self.last_success_ms.load(Ordering::Relaxed);
        let last_failure = self.last_failure_ms.load(Ordering::Relaxed);
        last_success > 0 && (last_failure == 0 || last_success >= last_failure)
    }

    pub fn success_rate(&self) -> f64 {
        let successes = self.success_count.load(Ordering::Relaxed);
        let failures = self.failure_count.load(Ordering::Relaxed);
        let total = successes + failures;
        if total == 0 {
            return 1.0;
        }
        successes as f64 / total as f64
    }

    pub fn snapshot(&self, source: &str) -> SourceHealth {
        let successes = self.success_count.load(Ordering::Relaxed);
        let last_success_ms = self.last_success_ms.load(Ordering::Relaxed);
        let last_success = if last_success_ms == 0 {
            None
        } else {
            Utc.timestamp_millis_opt(last_success_ms as i64).single()
        };

        SourceHealth {
            source: source.to_string(),
            is_healthy: self.is_healthy(),
            last_success,
            last_error: self.last_error.lock().ok().and_then(|e| e.clone()),
            success_rate: self.success_rate(),
            avg_latency_ms: if successes == 0 {
                0
            } else {
                self.total_latency_ms.load(Ordering::Relaxed) / successes
            },
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_tracker_is_not_healthy() {
        let tracker = HealthTracker::new();
        assert!(!tracker.is_healthy());
        assert_eq!(tracker.success_rate(), 1.0);
    }

    #[test]
    fn test_success_then_failure() {
        let tracker = HealthTracker::new();
        tracker.record_success(40);
        tracker.record_success(60);
        assert!(tracker.is_healthy());

        std::thread::sleep(std::time::Duration::from_millis(2));
        tracker.record_failure("timeout");
        let snapshot = tracker.snapshot("binance");
        assert!(!snapshot.is_healthy);
        assert_eq!(snapshot.avg_latency_ms, 50);
        assert_eq!(snapshot.last_error.as_deref(), Some("timeout"));
        assert!((snapshot.success_rate - 2.0 / 3.0).abs() < 1e-9);
    }
}
