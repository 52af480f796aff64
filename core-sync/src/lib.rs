//! # Sync Module
//!
//! Persistent transfer queue and the machinery that drains and observes it.
//!
//! ## Components
//!
//! - **Sync Queue** (`queue`): SQLite-backed upload/download queue with atomic claims
//! - **Sync Worker** (`worker`): Per-direction loops that execute claimed items
//! - **Transfer Contract** (`transfer`): The opaque upload/download primitives
//! - **Status Tracker** (`status`): Per-track and per-folder sync status
//! - **Invalidation** (`invalidation`): Relay, poller and view cache reconciliation
//! - **Backoff** (`backoff`): Optional automatic retry policy
//! - **Database** (`db`): SQLite pool for the queue table

pub mod backoff;
pub mod db;
pub mod error;
pub mod invalidation;
pub mod queue;
pub mod status;
pub mod transfer;
pub mod worker;

pub use backoff::{Backoff, RetryPolicy};
pub use db::open_pool;
pub use error::{Result, SyncError};
pub use invalidation::{
    StatusPoller, SyncViewCache, TrackDownloadedRelay, DEFAULT_STATUS_CACHE_CAPACITY,
};
pub use queue::{
    EnqueueRequest, QueueItem, QueueItemId, QueueItemStatus, QueueStats, SqliteSyncQueueRepository,
    SyncOperation, SyncQueue, SyncQueueRepository, SyncStatus,
};
pub use status::{
    CloudFolderSyncDetails, FolderSyncStatus, FolderTrackStatus, SyncStatusTracker,
    TrackSyncStatus,
};
pub use transfer::{TransferError, TransferExecutor, TransferOutcome};
pub use worker::{SyncWorker, WorkerSettings, WorkerState};
