//! The host-facing sync service.

use core_library::{
    filter_unified_tracks, sort_unified_tracks, unified_status, FileExistenceProbe,
    LibrarySource, SortBy, SortOrder, UnifiedLibrary, UnifiedStatus, UnifiedTrack,
};
use core_runtime::config::SyncConfig;
use core_runtime::events::{
    CoreEvent, EventBus, Invalidation, InvalidationScope, InvalidationSource,
};
use core_sync::{
    open_pool, CloudFolderSyncDetails, EnqueueRequest, QueueItem, QueueItemId, QueueStats,
    StatusPoller, SyncOperation, SyncQueue, SyncStatusTracker, SyncViewCache, SyncWorker,
    TrackDownloadedRelay, TrackSyncStatus, TransferExecutor, WorkerState,
};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};

/// Collaborators supplied by the host application.
pub struct CoreDependencies {
    pub library: Arc<dyn LibrarySource>,
    pub executor: Arc<dyn TransferExecutor>,
}

impl CoreDependencies {
    pub fn new(library: Arc<dyn LibrarySource>, executor: Arc<dyn TransferExecutor>) -> Self {
        Self { library, executor }
    }
}

/// Search and ordering applied to the unified track list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackQuery {
    pub search: Option<String>,
    pub sort: Option<(SortBy, SortOrder)>,
}

impl TrackQuery {
    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    pub fn sorted(mut self, sort_by: SortBy, sort_order: SortOrder) -> Self {
        self.sort = Some((sort_by, sort_order));
        self
    }
}

struct Background {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Primary facade exposed to host applications.
///
/// Owns the queue, the worker and the caches. Reads of track status,
/// queue stats and the unified list go through [`SyncViewCache`], which is
/// kept honest by the invalidation topic.
pub struct TrackSyncService {
    config: SyncConfig,
    events: EventBus,
    queue: Arc<SyncQueue>,
    worker: SyncWorker,
    tracker: SyncStatusTracker,
    library: UnifiedLibrary,
    view_cache: Arc<SyncViewCache>,
    listeners: Background,
    poller: Mutex<Option<Background>>,
}

impl TrackSyncService {
    /// Open the queue database and wire every component.
    ///
    /// The download relay and cache reconciler start listening immediately;
    /// the worker loops and status poller wait for [`start`](Self::start).
    pub async fn bootstrap(config: SyncConfig, deps: CoreDependencies) -> Result<Self> {
        config.validate()?;
        info!(config = ?config, "Bootstrapping track sync service");

        let events = EventBus::new(config.event_buffer_size);
        let pool = open_pool(&config.database_path)
            .await
            .map_err(CoreError::bootstrap("opening the queue database"))?;
        let queue = Arc::new(
            SyncQueue::new(pool, events.clone())
                .await
                .map_err(CoreError::bootstrap("preparing the queue schema"))?,
        );

        let probe = Arc::new(FileExistenceProbe::new(
            Arc::clone(&config.file_system),
            Arc::clone(&config.clock),
            config.probe_ttl,
        ));

        let worker = SyncWorker::from_config(Arc::clone(&queue), deps.executor, &config);
        let tracker = SyncStatusTracker::new(
            Arc::clone(&queue),
            Arc::clone(&deps.library),
            Arc::clone(&probe),
        );
        let library = UnifiedLibrary::new(Arc::clone(&deps.library), Arc::clone(&probe));
        let view_cache = Arc::new(SyncViewCache::default());

        let token = CancellationToken::new();
        let handles = vec![
            TrackDownloadedRelay::new(events.clone(), deps.library, probe).spawn(token.clone()),
            Arc::clone(&view_cache).spawn_reconciler(&events, token.clone()),
        ];

        Ok(Self {
            config,
            events,
            queue,
            worker,
            tracker,
            library,
            view_cache,
            listeners: Background { token, handles },
            poller: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Reconcile synchronously so the caller's next read is fresh
    fn invalidate_now(&self, scope: InvalidationScope) {
        self.view_cache
            .reconcile(&Invalidation::new(scope, InvalidationSource::User));
    }

    // =========================================================================
    // Worker lifecycle
    // =========================================================================

    /// Recover stale items, then start the worker loops and status poller
    pub async fn start(&self) -> Result<()> {
        self.worker.start().await?;
        self.invalidate_now(InvalidationScope::All);

        let token = self.listeners.token.child_token();
        let handle = StatusPoller::new(self.events.clone(), self.config.status_poll_interval)
            .spawn(token.clone());
        let previous = self
            .poller
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Background {
                token,
                handles: vec![handle],
            });
        if let Some(previous) = previous {
            previous.token.cancel();
        }

        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        Ok(self.worker.pause()?)
    }

    pub fn resume(&self) -> Result<()> {
        Ok(self.worker.resume()?)
    }

    /// Stop the worker loops and the poller; in-flight transfers finish
    pub async fn stop(&self) {
        self.worker.stop().await;

        let poller = self
            .poller
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(poller) = poller {
            poller.token.cancel();
            for handle in poller.handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Status poller ended abnormally");
                }
            }
        }
    }

    /// Stop everything, including the relay and the reconciler
    pub async fn shutdown(self) {
        self.stop().await;
        self.listeners.token.cancel();
        for handle in self.listeners.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Listener ended abnormally");
            }
        }
        info!("Track sync service shut down");
    }

    pub fn worker_state(&self) -> WorkerState {
        self.worker.state()
    }

    pub fn subscribe_worker(&self) -> watch::Receiver<WorkerState> {
        self.worker.subscribe()
    }

    /// Drive one worker tick by hand
    pub async fn tick(&self, operation: SyncOperation) -> usize {
        self.worker.tick(operation).await
    }

    /// Wait for in-flight transfers, then drop every cached view
    pub async fn wait_idle(&self) {
        self.worker.wait_idle().await;
        self.invalidate_now(InvalidationScope::All);
    }

    // =========================================================================
    // Queue operations
    // =========================================================================

    pub async fn enqueue_upload(
        &self,
        track_ids: Vec<String>,
        folder_id: &str,
        provider_type: &str,
        priority: Option<i32>,
    ) -> Result<Vec<QueueItem>> {
        let created = self
            .queue
            .enqueue_upload(track_ids, folder_id, provider_type, priority)
            .await?;
        self.after_enqueue(&created);
        Ok(created)
    }

    pub async fn enqueue_download(
        &self,
        track_ids: Vec<String>,
        folder_id: &str,
        provider_type: &str,
        priority: Option<i32>,
    ) -> Result<Vec<QueueItem>> {
        let created = self
            .queue
            .enqueue_download(track_ids, folder_id, provider_type, priority)
            .await?;
        self.after_enqueue(&created);
        Ok(created)
    }

    /// Queue an arbitrary request, e.g. one built with an explicit priority
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Vec<QueueItem>> {
        let created = self.queue.enqueue(request).await?;
        self.after_enqueue(&created);
        Ok(created)
    }

    fn after_enqueue(&self, created: &[QueueItem]) {
        for item in created {
            self.invalidate_now(InvalidationScope::TrackStatus {
                track_id: item.cloud_track_id.clone(),
            });
        }
        self.invalidate_now(InvalidationScope::QueueStats);
    }

    pub async fn dequeue_next(&self, operation: SyncOperation) -> Result<Option<QueueItem>> {
        let item = self.queue.dequeue(operation).await?;
        if item.is_some() {
            self.invalidate_now(InvalidationScope::All);
        }
        Ok(item)
    }

    pub async fn mark_completed(&self, id: QueueItemId) -> Result<bool> {
        let updated = self.queue.mark_completed(id).await?;
        self.invalidate_now(InvalidationScope::All);
        Ok(updated)
    }

    pub async fn mark_failed(&self, id: QueueItemId, error: &str) -> Result<bool> {
        let updated = self.queue.mark_failed(id, error).await?;
        self.invalidate_now(InvalidationScope::All);
        Ok(updated)
    }

    pub async fn reset_stale_in_progress(&self) -> Result<u64> {
        let count = self.queue.reset_stale_in_progress().await?;
        self.invalidate_now(InvalidationScope::All);
        Ok(count)
    }

    pub async fn cancel_items(&self, ids: &[QueueItemId]) -> Result<u64> {
        let count = self.queue.cancel_items(ids).await?;
        self.invalidate_now(InvalidationScope::All);
        Ok(count)
    }

    pub async fn retry_failed(&self, folder_id: Option<&str>) -> Result<u64> {
        let count = self.queue.retry_failed(folder_id).await?;
        self.invalidate_now(InvalidationScope::All);
        Ok(count)
    }

    pub async fn clear_completed(&self, folder_id: Option<&str>) -> Result<u64> {
        let count = self.queue.clear_completed(folder_id).await?;
        self.invalidate_now(InvalidationScope::All);
        Ok(count)
    }

    pub async fn clear_failed(&self, folder_id: Option<&str>) -> Result<u64> {
        let count = self.queue.clear_failed(folder_id).await?;
        self.invalidate_now(InvalidationScope::All);
        Ok(count)
    }

    pub async fn get_queue_items(&self, folder_id: Option<&str>) -> Result<Vec<QueueItem>> {
        Ok(self.queue.get_queue_items(folder_id).await?)
    }

    pub async fn get_queue_stats(&self, folder_id: Option<&str>) -> Result<QueueStats> {
        let observed = self.view_cache.generation();
        if let Some(stats) = self.view_cache.stats(folder_id) {
            return Ok(stats);
        }
        let stats = self.queue.get_queue_stats(folder_id).await?;
        self.view_cache.put_stats(observed, folder_id, stats);
        Ok(stats)
    }

    // =========================================================================
    // Status and library views
    // =========================================================================

    pub async fn get_track_sync_status(&self, track_id: &str) -> Result<Option<TrackSyncStatus>> {
        let observed = self.view_cache.generation();
        if let Some(cached) = self.view_cache.track_status(track_id) {
            debug!(track_id, "Track status served from cache");
            return Ok(cached);
        }
        let status = self.tracker.get_sync_status(track_id).await?;
        if !self
            .view_cache
            .put_track_status(observed, track_id, status.clone())
        {
            debug!(track_id, "Track status changed during load, not cached");
        }
        Ok(status)
    }

    pub async fn get_cloud_folder_sync_details(
        &self,
        folder_id: &str,
    ) -> Result<CloudFolderSyncDetails> {
        Ok(self.tracker.get_folder_sync_details(folder_id).await?)
    }

    /// The merged library with search and ordering applied
    pub async fn get_unified_tracks(&self, query: &TrackQuery) -> Result<Vec<UnifiedTrack>> {
        let observed = self.view_cache.generation();
        let tracks = match self.view_cache.unified_tracks() {
            Some(tracks) => tracks,
            None => {
                let tracks = self.library.load().await?;
                self.view_cache.put_unified_tracks(observed, tracks.clone());
                tracks
            }
        };

        let tracks = match query.search.as_deref() {
            Some(search) => filter_unified_tracks(tracks, search),
            None => tracks,
        };
        Ok(match query.sort {
            Some((sort_by, sort_order)) => sort_unified_tracks(tracks, sort_by, sort_order),
            None => tracks,
        })
    }

    pub async fn get_unified_status(&self, query: &TrackQuery) -> Result<UnifiedStatus> {
        let tracks = self.get_unified_tracks(query).await?;
        Ok(unified_status(&tracks))
    }
}
