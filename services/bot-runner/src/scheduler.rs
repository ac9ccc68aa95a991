//! Scheduler tick: pick the subscriptions that are due and dispatch one run
//! for each, never two at once for the same subscription
//!
//! A run holds its subscription lock from dispatch to completion. The lock is
//! only taken once a run slot is free, and a heartbeat keeps extending it
//! while the run is in progress.

use chrono::{Duration as ChronoDuration, Utc};
use control_plane::observability::{metrics, MetricsCollector};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::lock::{subscription_lock_key, LockGuard, LockManager, SCHEDULER_LOCK_KEY};
use crate::store::{DueSubscription, RunStore};
use crate::workflow::Workflow;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    /// Another replica held the scheduler lock
    pub skipped: bool,
    pub expired: u64,
    pub due: usize,
    pub dispatched: usize,
    pub skipped_locked: usize,
    /// Due but left for a later tick because every run slot was busy
    pub deferred: usize,
}

pub struct Scheduler {
    store: Arc<dyn RunStore>,
    locks: Arc<dyn LockManager>,
    workflow: Arc<Workflow>,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    runs: Mutex<JoinSet<()>>,
    metrics: MetricsCollector,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn RunStore>,
        locks: Arc<dyn LockManager>,
        workflow: Arc<Workflow>,
        config: SchedulerConfig,
        metrics: MetricsCollector,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_runs.max(1)));
        Self {
            store,
            locks,
            workflow,
            config,
            permits,
            runs: Mutex::new(JoinSet::new()),
            metrics,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// One scheduler tick. Runs are spawned and not awaited.
    pub async fn schedule_active_bots(&self) -> anyhow::Result<TickReport> {
        self.metrics.increment(metrics::SCHEDULER_TICKS, 1).await;
        self.reap_finished().await;

        let guard = match self
            .locks
            .acquire(SCHEDULER_LOCK_KEY, self.config.global_lock_ttl())
            .await?
        {
            Some(guard) => guard,
            None => {
                debug!("Scheduler lock held elsewhere, skipping tick");
                self.metrics.increment(metrics::SCHEDULER_SKIPPED_TICKS, 1).await;
                return Ok(TickReport {
                    skipped: true,
                    ..Default::default()
                });
            }
        };

        let result = self.dispatch_due().await;
        self.release(&guard).await;

        let report = result?;
        if report.due > 0 || report.expired > 0 {
            info!(
                due = report.due,
                dispatched = report.dispatched,
                skipped_locked = report.skipped_locked,
                deferred = report.deferred,
                expired = report.expired,
                "Scheduler tick"
            );
        }
        Ok(report)
    }

    async fn dispatch_due(&self) -> anyhow::Result<TickReport> {
        let now = Utc::now();
        let mut report = TickReport::default();

        report.expired = self.store.expire_lapsed(now).await?;
        if report.expired > 0 {
            self.metrics
                .increment(metrics::SUBSCRIPTIONS_EXPIRED, report.expired)
                .await;
        }

        let due = self
            .store
            .due_subscriptions(now, self.config.batch_size)
            .await?;
        report.due = due.len();

        for (index, subscription) in due.iter().enumerate() {
            // Untouched subscriptions stay due and are picked up next tick
            let permit = match self.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    report.deferred = due.len() - index;
                    self.metrics
                        .increment(metrics::RUNS_DEFERRED, report.deferred as u64)
                        .await;
                    debug!(deferred = report.deferred, "All run slots busy");
                    break;
                }
            };

            match self.dispatch(subscription, permit).await {
                Ok(true) => {
                    report.dispatched += 1;
                    self.metrics.increment(metrics::RUNS_DISPATCHED, 1).await;
                }
                Ok(false) => {
                    report.skipped_locked += 1;
                    self.metrics.increment(metrics::RUNS_SKIPPED_LOCKED, 1).await;
                }
                Err(e) => {
                    error!(subscription_id = %subscription.id, "Dispatch failed: {:#}", e);
                }
            }
        }

        Ok(report)
    }

    /// Lock, claim and spawn. Returns false when the subscription is
    /// already running or was claimed by someone else.
    async fn dispatch(
        &self,
        subscription: &DueSubscription,
        permit: OwnedSemaphorePermit,
    ) -> anyhow::Result<bool> {
        let key = subscription_lock_key(subscription.id);
        let guard = match self.locks.acquire(&key, self.config.run_lock_ttl).await? {
            Some(guard) => guard,
            None => {
                debug!(subscription_id = %subscription.id, "Run already in progress");
                return Ok(false);
            }
        };

        let now = Utc::now();
        let interval = i64::from(subscription.execution_interval_secs.max(1));
        let next_run_at = now + ChronoDuration::seconds(interval);
        let claimed = match self.store.claim_run(subscription.id, now, next_run_at).await {
            Ok(claimed) => claimed,
            Err(e) => {
                self.release(&guard).await;
                return Err(e);
            }
        };
        if !claimed {
            self.release(&guard).await;
            return Ok(false);
        }

        let run = RunTask {
            workflow: self.workflow.clone(),
            locks: self.locks.clone(),
            lock_ttl: self.config.run_lock_ttl,
            heartbeat: self.config.lock_heartbeat(),
            metrics: self.metrics.clone(),
        };
        let subscription_id = subscription.id;

        self.runs.lock().await.spawn(async move {
            run.run_one(subscription_id, guard).await;
            drop(permit);
        });
        Ok(true)
    }

    async fn release(&self, guard: &LockGuard) {
        if let Err(e) = self.locks.release(&guard.key, &guard.token).await {
            warn!("Failed to release {}: {}", guard.key, e);
        }
    }

    async fn reap_finished(&self) {
        let mut runs = self.runs.lock().await;
        while let Some(result) = runs.try_join_next() {
            if let Err(e) = result {
                error!("Run task panicked: {}", e);
            }
        }
    }

    /// Runs currently in flight
    pub async fn in_flight(&self) -> usize {
        self.runs.lock().await.len()
    }

    /// Wait for every spawned run to finish
    pub async fn drain(&self) {
        let mut runs = self.runs.lock().await;
        while let Some(result) = runs.join_next().await {
            if let Err(e) = result {
                error!("Run task panicked: {}", e);
            }
        }
    }
}

struct RunTask {
    workflow: Arc<Workflow>,
    locks: Arc<dyn LockManager>,
    lock_ttl: Duration,
    heartbeat: Duration,
    metrics: MetricsCollector,
}

impl RunTask {
    async fn run_one(self, subscription_id: Uuid, guard: LockGuard) {
        let run = self.workflow.run_bot_logic(subscription_id);
        tokio::pin!(run);

        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately
        heartbeat.tick().await;

        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                _ = heartbeat.tick() => self.extend(subscription_id, &guard).await,
            }
        };
        if let Err(e) = result {
            warn!(subscription_id = %subscription_id, "Run failed: {:#}", e);
        }

        if let Err(e) = self.locks.release(&guard.key, &guard.token).await {
            warn!(subscription_id = %subscription_id, "Failed to release run lock: {}", e);
        }
    }

    async fn extend(&self, subscription_id: Uuid, guard: &LockGuard) {
        match self.locks.extend(&guard.key, &guard.token, self.lock_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                self.metrics.increment(metrics::RUN_LOCKS_LOST, 1).await;
                error!(subscription_id = %subscription_id, "Run lock lost while running");
            }
            Err(e) => warn!(subscription_id = %subscription_id, "Failed to extend run lock: {}", e),
        }
    }
}
