//! Outbox Projector Background Task
//!
//! Polls the outbox table, publishes claimed rows through a [`Sink`] and
//! records each outcome. Any number of instances may run against the same
//! table: claims skip rows another instance holds, and every status update is
//! fenced on the claimant.
//!
//! # Lifecycle
//!
//! ```ignore
//! let projector = Arc::new(OutboxProjector::new(store, sink, ProjectorConfig::default()));
//! let handle = projector.start();
//!
//! // On shutdown
//! projector.stop();
//! let metrics = handle.await?;
//! ```
//!
//! # Scheduling
//!
//! - a full batch is followed by a short `busy_delay`, since more backlog is
//!   likely;
//! - a partial batch resets the idle delay to `idle_delay_min`;
//! - an empty cycle doubles the idle delay up to `idle_delay_max`.
//!
//! Every `reaper_interval` the loop also returns claims older than
//! `stale_after` to `pending`, recovering rows held by a crashed instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;
use warden_core::{
    ConfigError, OutboxRecord, OutboxStatus, ProjectorConfig, PublishError, WardenResult,
};

use crate::sink::Sink;
use crate::store::OutboxStore;

// ============================================================================
// METRICS
// ============================================================================

/// Counters for one projector instance.
#[derive(Debug, Default)]
pub struct ProjectorMetrics {
    /// Poll cycles run
    pub cycles: AtomicU64,
    /// Rows claimed
    pub claimed: AtomicU64,
    /// Rows marked published
    pub published: AtomicU64,
    /// Failed deliveries returned to pending
    pub retried: AtomicU64,
    /// Failed deliveries parked in error
    pub failed: AtomicU64,
    /// Stale claims returned to pending
    pub reaped: AtomicU64,
    /// Store errors and lost claims
    pub errors: AtomicU64,
}

impl ProjectorMetrics {
    pub fn snapshot(&self) -> ProjectorSnapshot {
        ProjectorSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of projector metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectorSnapshot {
    pub cycles: u64,
    pub claimed: u64,
    pub published: u64,
    pub retried: u64,
    pub failed: u64,
    pub reaped: u64,
    pub errors: u64,
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub published: usize,
    pub retried: usize,
    pub failed: usize,
    /// Rows whose claim was taken over before the outcome could be recorded.
    pub lost: usize,
}

// ============================================================================
// BACKOFF
// ============================================================================

/// Exponential idle delay, doubling from `min` up to `max`.
#[derive(Debug, Clone)]
pub(crate) struct IdleBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl IdleBackoff {
    pub(crate) fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
        }
    }

    /// The delay to sleep now; the next call returns double.
    pub(crate) fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.min;
    }
}

// ============================================================================
// PROJECTOR
// ============================================================================

/// Polling publisher for the outbox table.
pub struct OutboxProjector {
    instance_id: String,
    store: Arc<dyn OutboxStore>,
    sink: Arc<dyn Sink>,
    config: ProjectorConfig,
    metrics: ProjectorMetrics,
    shutdown: watch::Sender<bool>,
}

impl OutboxProjector {
    pub fn new(store: Arc<dyn OutboxStore>, sink: Arc<dyn Sink>, config: ProjectorConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            instance_id: format!("projector-{}", Uuid::now_v7()),
            store,
            sink,
            config,
            metrics: ProjectorMetrics::default(),
            shutdown,
        }
    }

    /// Override the claimant name written to `locked_by`. Must be unique per
    /// running instance.
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &ProjectorConfig {
        &self.config
    }

    pub fn metrics(&self) -> ProjectorSnapshot {
        self.metrics.snapshot()
    }

    /// Spawn the poll loop. It runs until [`stop`](Self::stop) is called and
    /// resolves to the final metrics.
    pub fn start(self: &Arc<Self>) -> JoinHandle<ProjectorSnapshot> {
        let projector = Arc::clone(self);
        tokio::spawn(async move { projector.run().await })
    }

    /// Ask the loop to exit. Takes effect between cycles.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn run(self: Arc<Self>) -> ProjectorSnapshot {
        let mut shutdown = self.shutdown.subscribe();
        let mut idle = IdleBackoff::new(self.config.idle_delay_min, self.config.idle_delay_max);
        let mut last_reap: Option<Instant> = None;
        let batch_size = self.config.batch_size;

        info!(
            instance = %self.instance_id,
            batch_size,
            max_retry = self.config.max_retry,
            "Outbox projector started"
        );

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            if last_reap.map_or(true, |at| at.elapsed() >= self.config.reaper_interval) {
                if let Err(e) = self.reap_stale().await {
                    error!(instance = %self.instance_id, error = %e, "Stale-claim reaper failed");
                }
                last_reap = Some(Instant::now());
            }

            let delay = match self.run_once(batch_size).await {
                Ok(report) if report.claimed >= batch_size => {
                    idle.reset();
                    self.config.busy_delay
                }
                Ok(report) if report.claimed > 0 => {
                    idle.reset();
                    idle.next()
                }
                Ok(_) => idle.next(),
                Err(e) => {
                    warn!(instance = %self.instance_id, error = %e, "Outbox poll failed");
                    idle.next()
                }
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let snapshot = self.metrics.snapshot();
        info!(
            instance = %self.instance_id,
            cycles = snapshot.cycles,
            published = snapshot.published,
            failed = snapshot.failed,
            errors = snapshot.errors,
            "Outbox projector stopped"
        );
        snapshot
    }

    /// Claim and deliver one batch.
    pub async fn run_once(&self, batch_size: usize) -> WardenResult<CycleReport> {
        self.metrics.cycles.fetch_add(1, Ordering::Relaxed);

        let claimed = match self.store.claim_pending(batch_size, &self.instance_id).await {
            Ok(claimed) => claimed,
            Err(e) => {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let mut report = CycleReport {
            claimed: claimed.len(),
            ..CycleReport::default()
        };
        if claimed.is_empty() {
            trace!(instance = %self.instance_id, "No pending outbox rows");
            return Ok(report);
        }
        self.metrics
            .claimed
            .fetch_add(claimed.len() as u64, Ordering::Relaxed);

        for record in claimed {
            self.deliver(record, &mut report).await;
        }

        debug!(
            instance = %self.instance_id,
            claimed = report.claimed,
            published = report.published,
            retried = report.retried,
            failed = report.failed,
            lost = report.lost,
            "Outbox cycle completed"
        );
        Ok(report)
    }

    /// Publish one claimed row and record the outcome. Never fails the cycle.
    async fn deliver(&self, record: OutboxRecord, report: &mut CycleReport) {
        let outcome: Result<(), PublishError> = match record.to_event() {
            Ok(event) => self.sink.publish(&event).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => match self.store.mark_published(record.id, &self.instance_id).await {
                Ok(true) => {
                    report.published += 1;
                    self.metrics.published.fetch_add(1, Ordering::Relaxed);
                }
                Ok(false) => {
                    report.lost += 1;
                    self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        instance = %self.instance_id,
                        outbox_id = record.id,
                        "Claim lost after publish; row will be delivered again"
                    );
                }
                Err(e) => {
                    self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        instance = %self.instance_id,
                        outbox_id = record.id,
                        error = %e,
                        "Failed to mark outbox row published"
                    );
                }
            },
            Err(publish_error) => {
                let reason = publish_error.to_string();
                match self
                    .store
                    .record_failure(record.id, &self.instance_id, &reason, self.config.max_retry)
                    .await
                {
                    Ok(Some(OutboxStatus::Error)) => {
                        report.failed += 1;
                        self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                        error!(
                            instance = %self.instance_id,
                            outbox_id = record.id,
                            event_type = %record.event_type,
                            attempts = record.deliver_attempts + 1,
                            error = %reason,
                            "Outbox row exhausted retries, parked in error"
                        );
                    }
                    Ok(Some(_)) => {
                        report.retried += 1;
                        self.metrics.retried.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            instance = %self.instance_id,
                            outbox_id = record.id,
                            event_type = %record.event_type,
                            attempts = record.deliver_attempts + 1,
                            error = %reason,
                            "Outbox delivery failed, will retry"
                        );
                    }
                    Ok(None) => {
                        report.lost += 1;
                        self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            instance = %self.instance_id,
                            outbox_id = record.id,
                            "Claim lost before failure could be recorded"
                        );
                    }
                    Err(e) => {
                        self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                        error!(
                            instance = %self.instance_id,
                            outbox_id = record.id,
                            error = %e,
                            "Failed to record outbox delivery failure"
                        );
                    }
                }
            }
        }
    }

    /// Return claims older than `stale_after` to `pending`.
    pub async fn reap_stale(&self) -> WardenResult<u64> {
        let stale_after =
            chrono::Duration::from_std(self.config.stale_after).map_err(|e| {
                ConfigError::InvalidValue {
                    field: "stale_after".to_string(),
                    value: format!("{:?}", self.config.stale_after),
                    reason: e.to_string(),
                }
            })?;
        let requeued = match self.store.requeue_stale(Utc::now() - stale_after).await {
            Ok(n) => n,
            Err(e) => {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        if requeued > 0 {
            self.metrics.reaped.fetch_add(requeued, Ordering::Relaxed);
            warn!(
                instance = %self.instance_id,
                requeued,
                "Returned stale outbox claims to pending"
            );
        }
        Ok(requeued)
    }
}

// ============================================================================
// TESTS
// ============================================================================
