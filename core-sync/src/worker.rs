//! # Sync Worker
//!
//! Drains the sync queue by handing claimed items to a [`TransferExecutor`].
//!
//! ## Overview
//!
//! One loop per direction ticks on a fixed interval. Each tick claims items
//! until the direction's tracked set reaches its concurrency limit or the
//! queue runs dry, spawning one task per item:
//!
//! ```text
//!   tick ──► dequeue ──► track(id) ──► spawn ──► perform_upload/download
//!                                                   │
//!                       ┌───────────────────────────┴──────────┐
//!                       ▼                                      ▼
//!                 mark_completed                          mark_failed
//!                       │                                      │
//!                 untrack + invalidate               untrack + invalidate
//!                 relay TrackDownloaded              (optional retry after backoff)
//! ```
//!
//! The tracked set is the only concurrency accounting; the SQL claim keeps
//! two loops from ever running the same item.
//!
//! Items a previous process left `in_progress` are reset to `pending` once per
//! worker, before its first dequeue. Both `start()` and a manual `tick()` go
//! through that recovery, so neither can claim work while stale claims remain.
//!
//! ## Lifecycle
//!
//! ```text
//!   Stopped ──start()──► Running ──pause()──► Paused
//!      ▲                   │  ▲                 │
//!      └──────stop()───────┘  └───resume()──────┘
//! ```

use core_runtime::config::SyncConfig;
use core_runtime::events::{
    CoreEvent, EventBus, Invalidation, InvalidationScope, InvalidationSource, WorkerEvent,
};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::RetryPolicy;
use crate::error::{Result, SyncError};
use crate::queue::{QueueItem, QueueItemId, SyncOperation, SyncQueue};
use crate::transfer::{self, TransferExecutor};

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    Stopped,
    Running,
    Paused,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Running => "running",
            WorkerState::Paused => "paused",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Loop timing and per-direction limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub max_concurrent_uploads: usize,
    pub max_concurrent_downloads: usize,
    pub tick_interval: Duration,
    pub dequeue_pacing: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 3,
            max_concurrent_downloads: 3,
            tick_interval: Duration::from_secs(1),
            dequeue_pacing: Duration::from_secs(1),
        }
    }
}

impl From<&SyncConfig> for WorkerSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_concurrent_uploads: config.max_concurrent_uploads,
            max_concurrent_downloads: config.max_concurrent_downloads,
            tick_interval: config.tick_interval,
            dequeue_pacing: config.dequeue_pacing,
        }
    }
}

impl WorkerSettings {
    fn limit(&self, operation: SyncOperation) -> usize {
        match operation {
            SyncOperation::Upload => self.max_concurrent_uploads,
            SyncOperation::Download => self.max_concurrent_downloads,
        }
    }
}

// =============================================================================
// Shared worker core
// =============================================================================

struct WorkerCore {
    queue: Arc<SyncQueue>,
    executor: Arc<dyn TransferExecutor>,
    events: EventBus,
    settings: WorkerSettings,
    retry: Option<RetryPolicy>,
    uploads: Mutex<HashSet<QueueItemId>>,
    downloads: Mutex<HashSet<QueueItemId>>,
    idle: Notify,
    state: watch::Sender<WorkerState>,
    shutdown: Mutex<CancellationToken>,
    /// Set once stale in-progress items have been reset
    recovered: AsyncMutex<bool>,
}

impl WorkerCore {
    fn tracked(&self, operation: SyncOperation) -> &Mutex<HashSet<QueueItemId>> {
        match operation {
            SyncOperation::Upload => &self.uploads,
            SyncOperation::Download => &self.downloads,
        }
    }

    fn tracked_len(&self, operation: SyncOperation) -> usize {
        self.tracked(operation)
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn track(&self, operation: SyncOperation, id: QueueItemId) {
        self.tracked(operation)
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);
    }

    fn untrack(&self, operation: SyncOperation, id: QueueItemId) {
        self.tracked(operation)
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        self.idle.notify_waiters();
    }

    fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    fn current_token(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_state(&self, next: WorkerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "Sync worker state changed");
            self.events.publish(CoreEvent::Worker(WorkerEvent::StateChanged {
                state: next.to_string(),
            }));
        }
    }

    /// Reset stale claims unless this worker already did.
    ///
    /// Held across the reset so a concurrent tick waits instead of claiming.
    async fn ensure_recovered(&self) -> Result<()> {
        let mut recovered = self.recovered.lock().await;
        if !*recovered {
            let reset = self.queue.reset_stale_in_progress().await?;
            info!(reset, "Recovered stale in-progress sync items");
            *recovered = true;
        }
        Ok(())
    }

    /// Claim and dispatch items for one direction; returns how many started
    async fn tick(self: &Arc<Self>, operation: SyncOperation) -> usize {
        if let Err(e) = self.ensure_recovered().await {
            error!(operation = %operation, error = %e, "Stale item recovery failed, skipping tick");
            return 0;
        }

        let token = self.current_token();
        let limit = self.settings.limit(operation);
        let mut dispatched = 0;

        loop {
            if self.state() == WorkerState::Paused || token.is_cancelled() {
                break;
            }
            if self.tracked_len(operation) >= limit {
                debug!(operation = %operation, limit, "Concurrency limit reached");
                break;
            }

            let item = match self.queue.dequeue(operation).await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e) => {
                    error!(operation = %operation, error = %e, "Failed to dequeue sync item");
                    break;
                }
            };

            self.track(operation, item.id);
            let core = Arc::clone(self);
            tokio::spawn(async move {
                core.run_item(item).await;
            });
            dispatched += 1;

            if !self.settings.dequeue_pacing.is_zero() {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.dequeue_pacing) => {}
                }
            }
        }

        dispatched
    }

    #[instrument(skip(self, item), fields(item_id = %item.id, operation = %item.operation))]
    async fn run_item(self: Arc<Self>, item: QueueItem) {
        let operation = item.operation;

        match transfer::execute(self.executor.as_ref(), &item).await {
            Ok(outcome) => {
                if let Err(e) = self.queue.mark_completed(item.id).await {
                    error!(error = %e, "Failed to mark sync item completed");
                }
                self.invalidate_item(&item, true);
                if let Some(event) = outcome.downloaded {
                    self.events.publish(CoreEvent::Transfer(event));
                }
                self.untrack(operation, item.id);
            }
            Err(transfer_error) => {
                let message = transfer_error.to_string();
                let recorded = match self.queue.mark_failed(item.id, &message).await {
                    Ok(recorded) => recorded,
                    Err(e) => {
                        error!(error = %e, "Failed to mark sync item failed");
                        false
                    }
                };
                self.invalidate_item(&item, false);
                if recorded {
                    self.schedule_retry(item.id, item.attempts.saturating_add(1));
                }
                self.untrack(operation, item.id);
            }
        }
    }

    /// A completed transfer changes library ids, so the projection goes too
    fn invalidate_item(&self, item: &QueueItem, completed: bool) {
        self.events.publish(CoreEvent::Invalidation(Invalidation::track(
            item.cloud_track_id.clone(),
            InvalidationSource::Worker,
        )));
        self.events
            .invalidate(InvalidationScope::QueueStats, InvalidationSource::Worker);
        if completed {
            self.events
                .invalidate(InvalidationScope::UnifiedTracks, InvalidationSource::Worker);
        }
    }

    fn schedule_retry(self: &Arc<Self>, id: QueueItemId, attempts: u32) {
        let Some(policy) = self.retry else {
            return;
        };
        if !policy.should_retry(attempts) {
            debug!(item_id = %id, attempts, "Retry budget exhausted");
            return;
        }

        let delay = policy.backoff.delay(attempts);
        let token = self.current_token();
        let queue = Arc::clone(&self.queue);
        debug!(item_id = %id, attempts, delay_ms = delay.as_millis() as u64, "Scheduling retry");

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    match queue.retry_item(id).await {
                        Ok(true) => info!(item_id = %id, attempts, "Re-queued failed sync item"),
                        Ok(false) => debug!(item_id = %id, "Item no longer failed, retry skipped"),
                        Err(e) => warn!(item_id = %id, error = %e, "Automatic retry failed"),
                    }
                }
            }
        });
    }

    async fn run_loop(self: Arc<Self>, operation: SyncOperation, token: CancellationToken) {
        let period = self.settings.tick_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(operation = %operation, "Sync loop started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if self.state() == WorkerState::Running {
                        self.tick(operation).await;
                    }
                }
            }
        }

        debug!(operation = %operation, "Sync loop stopped");
    }
}

// =============================================================================
// Sync Worker
// =============================================================================

/// Owned handle to the upload and download loops
pub struct SyncWorker {
    core: Arc<WorkerCore>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncWorker {
    pub fn new(
        queue: Arc<SyncQueue>,
        executor: Arc<dyn TransferExecutor>,
        settings: WorkerSettings,
        retry: Option<RetryPolicy>,
    ) -> Self {
        let events = queue.events().clone();
        let (state, _) = watch::channel(WorkerState::Stopped);

        Self {
            core: Arc::new(WorkerCore {
                queue,
                executor,
                events,
                settings,
                retry,
                uploads: Mutex::new(HashSet::new()),
                downloads: Mutex::new(HashSet::new()),
                idle: Notify::new(),
                state,
                shutdown: Mutex::new(CancellationToken::new()),
                recovered: AsyncMutex::new(false),
            }),
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(
        queue: Arc<SyncQueue>,
        executor: Arc<dyn TransferExecutor>,
        config: &SyncConfig,
    ) -> Self {
        Self::new(
            queue,
            executor,
            WorkerSettings::from(config),
            config.retry.as_ref().map(RetryPolicy::from),
        )
    }

    pub fn state(&self) -> WorkerState {
        self.core.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.core.state.subscribe()
    }

    /// Items currently executing in `operation`'s direction
    pub fn in_flight(&self, operation: SyncOperation) -> usize {
        self.core.tracked_len(operation)
    }

    /// Recover stale items on first use, then spawn both direction loops.
    ///
    /// A restart after `stop()` does not reset again: transfers that were in
    /// flight at the stop still hold their claims.
    pub async fn start(&self) -> Result<()> {
        let current = self.state();
        if current != WorkerState::Stopped {
            return Err(SyncError::InvalidStateTransition {
                from: current.to_string(),
                to: WorkerState::Running.to_string(),
            });
        }

        self.core.ensure_recovered().await?;

        let token = CancellationToken::new();
        *self
            .core
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = token.clone();

        self.core.set_state(WorkerState::Running);

        let handles: Vec<JoinHandle<()>> = SyncOperation::ALL
            .iter()
            .map(|&operation| {
                let core = Arc::clone(&self.core);
                let token = token.clone();
                tokio::spawn(core.run_loop(operation, token))
            })
            .collect();
        self.loops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);

        Ok(())
    }

    /// Stop claiming new items; in-flight transfers finish
    pub fn pause(&self) -> Result<()> {
        self.transition(WorkerState::Running, WorkerState::Paused)
    }

    pub fn resume(&self) -> Result<()> {
        self.transition(WorkerState::Paused, WorkerState::Running)
    }

    fn transition(&self, from: WorkerState, to: WorkerState) -> Result<()> {
        let current = self.state();
        if current != from {
            return Err(SyncError::InvalidStateTransition {
                from: current.to_string(),
                to: to.to_string(),
            });
        }
        self.core.set_state(to);
        Ok(())
    }

    /// Cancel both loops. In-flight transfers are left to finish.
    pub async fn stop(&self) {
        self.core.current_token().cancel();

        let handles: Vec<JoinHandle<()>> = self
            .loops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Sync loop ended abnormally");
            }
        }

        self.core.set_state(WorkerState::Stopped);
    }

    /// Run one tick for `operation`; a paused worker dispatches nothing.
    ///
    /// The first tick of a never-started worker recovers stale items first.
    pub async fn tick(&self, operation: SyncOperation) -> usize {
        if self.state() == WorkerState::Stopped {
            // Manual ticks get a live token even after a stop
            let mut shutdown = self.core.shutdown.lock().unwrap_or_else(|e| e.into_inner());
            if shutdown.is_cancelled() {
                *shutdown = CancellationToken::new();
            }
        }
        self.core.tick(operation).await
    }

    /// Wait until no transfer is executing in either direction
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.core.idle.notified();
            if self.in_flight(SyncOperation::Upload) == 0
                && self.in_flight(SyncOperation::Download) == 0
            {
                return;
            }
            notified.await;
        }
    }
}
