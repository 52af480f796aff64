//! # Invalidation
//!
//! Publishers and the single subscriber-side reconciliation for the
//! `CoreEvent::Invalidation` topic.
//!
//! ```text
//!   SyncWorker ───────────────┐
//!   SyncQueue (user ops) ─────┤
//!   TrackDownloadedRelay ─────┼──► EventBus ──► SyncViewCache::reconcile
//!   StatusPoller ─────────────┘
//! ```

use core_library::{FileExistenceProbe, LibrarySource, UnifiedTrack};
use core_runtime::events::{
    CoreEvent, EventBus, EventStream, Invalidation, InvalidationScope, InvalidationSource,
    TransferEvent,
};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::queue::QueueStats;
use crate::status::TrackSyncStatus;

/// Default number of cached track statuses
pub const DEFAULT_STATUS_CACHE_CAPACITY: usize = 512;

// =============================================================================
// Track downloaded relay
// =============================================================================

/// Turns `TrackDownloaded` notifications into cache invalidations
pub struct TrackDownloadedRelay {
    events: EventBus,
    library: Arc<dyn LibrarySource>,
    probe: Arc<FileExistenceProbe>,
}

impl TrackDownloadedRelay {
    pub fn new(
        events: EventBus,
        library: Arc<dyn LibrarySource>,
        probe: Arc<FileExistenceProbe>,
    ) -> Self {
        Self {
            events,
            library,
            probe,
        }
    }

    pub async fn handle(&self, event: &TransferEvent) -> Result<()> {
        let TransferEvent::TrackDownloaded {
            track_id,
            cloud_track_id,
            sync_folder_id,
            relative_path,
            ..
        } = event;

        // The new file must not be answered from a stale "absent" entry
        match self.library.find_cloud_folder(sync_folder_id).await? {
            Some(folder) => self.probe.invalidate(&folder.local_path_for(relative_path)),
            None => {
                warn!(
                    folder_id = %sync_folder_id,
                    "Downloaded into unknown folder, clearing probe cache"
                );
                self.probe.clear();
            }
        }

        let source = InvalidationSource::TrackDownloaded;
        self.events
            .publish(CoreEvent::Invalidation(Invalidation::track(track_id.clone(), source)));
        if cloud_track_id != track_id {
            self.events.publish(CoreEvent::Invalidation(Invalidation::track(
                cloud_track_id.clone(),
                source,
            )));
        }
        self.events.invalidate(InvalidationScope::UnifiedTracks, source);

        debug!(track_id = %track_id, relative_path = %relative_path, "Relayed track download");
        Ok(())
    }

    /// Listen on the bus until `token` is cancelled
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        let mut stream = EventStream::new(self.events.subscribe())
            .filter(|event| matches!(event, CoreEvent::Transfer(_)));

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = stream.recv() => event,
                };

                match event {
                    Ok(CoreEvent::Transfer(transfer)) => {
                        if let Err(e) = self.handle(&transfer).await {
                            warn!(error = %e, "Failed to relay track download");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Download relay lagged, invalidating everything");
                        self.probe.clear();
                        self.events
                            .invalidate(InvalidationScope::All, InvalidationSource::TrackDownloaded);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

// =============================================================================
// Status poller
// =============================================================================

/// Periodically tells consumers to refresh everything
pub struct StatusPoller {
    events: EventBus,
    interval: Duration,
}

impl StatusPoller {
    pub fn new(events: EventBus, interval: Duration) -> Self {
        Self { events, interval }
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = Instant::now() + self.interval;
            let mut ticker = tokio::time::interval_at(start, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.events.invalidate(InvalidationScope::All, InvalidationSource::Poll);
                    }
                }
            }
        })
    }
}

// =============================================================================
// View cache
// =============================================================================

/// Subscriber-side cache of the views a front-end keeps on screen
///
/// Read-through callers take [`generation`](Self::generation) before the
/// miss and hand it back to `put_*`. A value loaded across a reconcile is
/// discarded instead of resurrecting what the invalidation evicted.
pub struct SyncViewCache {
    generation: AtomicU64,
    track_statuses: Mutex<LruCache<String, Option<TrackSyncStatus>>>,
    unified_tracks: Mutex<Option<Vec<UnifiedTrack>>>,
    stats: Mutex<HashMap<Option<String>, QueueStats>>,
}

impl Default for SyncViewCache {
    fn default() -> Self {
        Self::new(DEFAULT_STATUS_CACHE_CAPACITY)
    }
}

impl SyncViewCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            generation: AtomicU64::new(0),
            track_statuses: Mutex::new(LruCache::new(capacity)),
            unified_tracks: Mutex::new(None),
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// Outer `None` is a miss; inner `None` is a cached "no status"
    pub fn track_status(&self, track_id: &str) -> Option<Option<TrackSyncStatus>> {
        self.track_statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(track_id)
            .cloned()
    }

    /// Bumped by every reconcile
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn is_current(&self, observed: u64) -> bool {
        self.generation.load(Ordering::Acquire) == observed
    }

    /// Returns false when a reconcile ran since `observed` and the value was dropped
    pub fn put_track_status(
        &self,
        observed: u64,
        track_id: impl Into<String>,
        status: Option<TrackSyncStatus>,
    ) -> bool {
        let mut statuses = self.track_statuses.lock().unwrap_or_else(|e| e.into_inner());
        if !self.is_current(observed) {
            return false;
        }
        statuses.put(track_id.into(), status);
        true
    }

    pub fn unified_tracks(&self) -> Option<Vec<UnifiedTrack>> {
        self.unified_tracks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn put_unified_tracks(&self, observed: u64, tracks: Vec<UnifiedTrack>) -> bool {
        let mut unified = self.unified_tracks.lock().unwrap_or_else(|e| e.into_inner());
        if !self.is_current(observed) {
            return false;
        }
        *unified = Some(tracks);
        true
    }

    pub fn stats(&self, folder_id: Option<&str>) -> Option<QueueStats> {
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&folder_id.map(String::from))
            .copied()
    }

    pub fn put_stats(&self, observed: u64, folder_id: Option<&str>, stats: QueueStats) -> bool {
        let mut cached = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        if !self.is_current(observed) {
            return false;
        }
        cached.insert(folder_id.map(String::from), stats);
        true
    }

    /// Drop whatever `invalidation` covers; returns the number of evicted entries
    pub fn reconcile(&self, invalidation: &Invalidation) -> usize {
        // Bump before evicting so an in-flight put either lands first and is
        // evicted, or sees the new generation and is dropped
        self.generation.fetch_add(1, Ordering::AcqRel);
        let evicted = match &invalidation.scope {
            InvalidationScope::TrackStatus { track_id } => self.evict_track(track_id),
            InvalidationScope::UnifiedTracks => self.evict_unified(),
            InvalidationScope::QueueStats => self.evict_stats(),
            InvalidationScope::All => {
                let tracks = {
                    let mut statuses =
                        self.track_statuses.lock().unwrap_or_else(|e| e.into_inner());
                    let len = statuses.len();
                    statuses.clear();
                    len
                };
                tracks + self.evict_unified() + self.evict_stats()
            }
        };

        debug!(
            scope = ?invalidation.scope,
            source = ?invalidation.source,
            evicted,
            "Reconciled view cache"
        );
        evicted
    }

    fn evict_track(&self, track_id: &str) -> usize {
        let removed = self
            .track_statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop(track_id);
        usize::from(removed.is_some())
    }

    fn evict_unified(&self) -> usize {
        let removed = self
            .unified_tracks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        usize::from(removed.is_some())
    }

    fn evict_stats(&self) -> usize {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        let len = stats.len();
        stats.clear();
        len
    }

    /// Reconcile every invalidation on `events` until `token` is cancelled
    pub fn spawn_reconciler(
        self: Arc<Self>,
        events: &EventBus,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let mut stream = EventStream::new(events.subscribe())
            .filter(|event| matches!(event, CoreEvent::Invalidation(_)));

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = stream.recv() => event,
                };

                match event {
                    Ok(CoreEvent::Invalidation(invalidation)) => {
                        self.reconcile(&invalidation);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "View cache lagged behind invalidations, clearing");
                        self.reconcile(&Invalidation::new(
                            InvalidationScope::All,
                            InvalidationSource::Poll,
                        ));
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
