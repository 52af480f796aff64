//! # Sync Queue
//!
//! Persisted upload/download queue shared by the worker loop and the UI.
//!
//! ## Overview
//!
//! Every queue item moves through:
//!
//! ```text
//!            enqueue            dequeue (atomic claim)
//!   (none) ──────────► pending ─────────────────────► in_progress
//!                        ▲  ▲                           │    │
//!          retry_failed  │  │ reset_stale_in_progress   │    │
//!          retry_item    │  └───────────────────────────┘    │
//!                        │                                   ▼
//!                      failed ◄──── mark_failed ──── completed (mark_completed)
//!
//!   cancel_items: pending | in_progress ──► cancelled (terminal)
//! ```
//!
//! ## Features
//!
//! - **Persistence**: items live in the `sync_queue` SQLite table
//! - **Idempotent enqueue**: a track never has two active items at once
//! - **Exactly-once claim**: `dequeue` flips pending to in_progress in one statement
//! - **Guarded completion**: late results for cancelled items are ignored
//!
//! ## Usage
//!
//! ```ignore
//! use core_sync::{SyncOperation, SyncQueue};
//!
//! let queue = SyncQueue::new(pool, events).await?;
//! queue.enqueue_download(vec!["cloud-1".into()], "folder-1", "dropbox", None).await?;
//!
//! while let Some(item) = queue.dequeue(SyncOperation::Download).await? {
//!     match transfer(&item).await {
//!         Ok(_) => queue.mark_completed(item.id).await?,
//!         Err(e) => queue.mark_failed(item.id, &e.to_string()).await?,
//!     };
//! }
//! ```

use async_trait::async_trait;
use bridge_traits::{Clock, SystemClock};
use core_runtime::events::{
    CoreEvent, EventBus, Invalidation, InvalidationScope, InvalidationSource, QueueEvent,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};

const COLUMNS: &str = "id, cloud_track_id, provider_type, folder_id, priority, operation, \
                       status, error_message, attempts, created_at, updated_at";

// =============================================================================
// Identifiers and Enums
// =============================================================================

/// Type-safe queue item identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueItemId(Uuid);

impl QueueItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| SyncError::InvalidItemId(e.to_string()))
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for QueueItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueueItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Upload,
    Download,
}

impl SyncOperation {
    pub const ALL: [SyncOperation; 2] = [SyncOperation::Upload, SyncOperation::Download];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncOperation {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "upload" => Ok(Self::Upload),
            "download" => Ok(Self::Download),
            _ => Err(SyncError::InvalidOperation(s.to_string())),
        }
    }
}

/// Persisted item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    /// Terminal; never retried
    Cancelled,
}

impl QueueItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

impl fmt::Display for QueueItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueItemStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(SyncError::InvalidStatus(s.to_string())),
        }
    }
}

/// Status as reported to views; only `Failed` carries data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    InProgress,
    Completed,
    Failed { error: String, attempts: u32 },
}

// =============================================================================
// Queue Item
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub cloud_track_id: String,
    pub provider_type: String,
    pub folder_id: String,
    /// Higher runs first
    pub priority: i32,
    pub operation: SyncOperation,
    pub status: QueueItemStatus,
    pub error_message: Option<String>,
    pub attempts: u32,
    /// Unix milliseconds
    pub created_at: i64,
    /// Unix milliseconds
    pub updated_at: i64,
}

impl QueueItem {
    pub fn new(
        operation: SyncOperation,
        cloud_track_id: impl Into<String>,
        folder_id: impl Into<String>,
        provider_type: impl Into<String>,
        now_ms: i64,
    ) -> Self {
        Self {
            id: QueueItemId::new(),
            cloud_track_id: cloud_track_id.into(),
            provider_type: provider_type.into(),
            folder_id: folder_id.into(),
            priority: 0,
            operation,
            status: QueueItemStatus::Pending,
            error_message: None,
            attempts: 0,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// View status; a cancelled item reads as failed
    pub fn sync_status(&self) -> SyncStatus {
        match self.status {
            QueueItemStatus::Pending => SyncStatus::Pending,
            QueueItemStatus::InProgress => SyncStatus::InProgress,
            QueueItemStatus::Completed => SyncStatus::Completed,
            QueueItemStatus::Failed => SyncStatus::Failed {
                error: self.error_message.clone().unwrap_or_default(),
                attempts: self.attempts,
            },
            QueueItemStatus::Cancelled => SyncStatus::Failed {
                error: self
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Cancelled".to_string()),
                attempts: self.attempts,
            },
        }
    }
}

/// Request to queue transfers for a batch of tracks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub operation: SyncOperation,
    pub track_ids: Vec<String>,
    pub folder_id: String,
    pub provider_type: String,
    pub priority: i32,
}

impl EnqueueRequest {
    pub fn new(
        operation: SyncOperation,
        track_ids: Vec<String>,
        folder_id: impl Into<String>,
        provider_type: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            track_ids,
            folder_id: folder_id.into(),
            provider_type: provider_type.into(),
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.track_ids.is_empty() {
            return Err(SyncError::invalid_input(
                "track_ids",
                "at least one track id is required",
            ));
        }
        if self.track_ids.iter().any(|id| id.trim().is_empty()) {
            return Err(SyncError::invalid_input("track_ids", "track ids cannot be empty"));
        }
        if self.folder_id.trim().is_empty() {
            return Err(SyncError::invalid_input("folder_id", "folder id cannot be empty"));
        }
        Ok(())
    }
}

/// Item counts; cancelled items are counted as failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.completed + self.failed
    }

    /// No pending or in-progress work
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }

    fn add(&mut self, status: QueueItemStatus, count: u64) {
        match status {
            QueueItemStatus::Pending => self.pending += count,
            QueueItemStatus::InProgress => self.in_progress += count,
            QueueItemStatus::Completed => self.completed += count,
            QueueItemStatus::Failed | QueueItemStatus::Cancelled => self.failed += count,
        }
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Persistence for queue items.
///
/// Status-changing methods are guarded: they only touch rows in the expected
/// source status and report whether anything changed.
#[async_trait]
pub trait SyncQueueRepository: Send + Sync {
    /// Insert unless the track already has an active item in either direction
    async fn insert_if_absent(&self, item: &QueueItem) -> Result<bool>;

    /// Claim the highest-priority, oldest pending item for `operation`
    async fn claim_next(&self, operation: SyncOperation, now_ms: i64)
        -> Result<Option<QueueItem>>;

    async fn find_by_id(&self, id: QueueItemId) -> Result<Option<QueueItem>>;

    /// Move every in-progress item back to pending
    async fn reset_in_progress(&self, now_ms: i64) -> Result<u64>;

    async fn mark_completed(&self, id: QueueItemId, now_ms: i64) -> Result<Option<QueueItem>>;

    /// Store the error and bump `attempts`
    async fn mark_failed(
        &self,
        id: QueueItemId,
        error: &str,
        now_ms: i64,
    ) -> Result<Option<QueueItem>>;

    async fn cancel(&self, ids: &[QueueItemId], now_ms: i64) -> Result<u64>;

    async fn retry_failed(&self, folder_id: Option<&str>, now_ms: i64) -> Result<u64>;

    async fn retry_item(&self, id: QueueItemId, now_ms: i64) -> Result<bool>;

    async fn delete_by_status(
        &self,
        statuses: &[QueueItemStatus],
        folder_id: Option<&str>,
    ) -> Result<u64>;

    /// Items newest first
    async fn list(&self, folder_id: Option<&str>) -> Result<Vec<QueueItem>>;

    /// Items of one track, newest first
    async fn list_for_track(&self, cloud_track_id: &str) -> Result<Vec<QueueItem>>;

    async fn stats(&self, folder_id: Option<&str>) -> Result<QueueStats>;

    async fn count_active(&self, folder_id: &str) -> Result<u64>;
}

/// SQLite implementation of the queue repository
pub struct SqliteSyncQueueRepository {
    pool: SqlitePool,
}

impl SqliteSyncQueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the table and indexes if they don't exist
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                id TEXT PRIMARY KEY,
                cloud_track_id TEXT NOT NULL,
                provider_type TEXT NOT NULL,
                folder_id TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                operation TEXT NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sync_queue_claim
            ON sync_queue(operation, status, priority DESC, created_at ASC)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sync_queue_track
            ON sync_queue(cloud_track_id, status)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sync_queue_folder
            ON sync_queue(folder_id, status)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }
}

fn item_from_row(row: &SqliteRow) -> Result<QueueItem> {
    Ok(QueueItem {
        id: QueueItemId::from_string(&row.get::<String, _>("id"))?,
        cloud_track_id: row.get("cloud_track_id"),
        provider_type: row.get("provider_type"),
        folder_id: row.get("folder_id"),
        priority: row.get::<i64, _>("priority") as i32,
        operation: row.get::<String, _>("operation").parse()?,
        status: row.get::<String, _>("status").parse()?,
        error_message: row.get("error_message"),
        attempts: row.get::<i64, _>("attempts") as u32,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn items_from_rows(rows: &[SqliteRow]) -> Result<Vec<QueueItem>> {
    rows.iter().map(item_from_row).collect()
}

#[async_trait]
impl SyncQueueRepository for SqliteSyncQueueRepository {
    async fn insert_if_absent(&self, item: &QueueItem) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_queue (
                id, cloud_track_id, provider_type, folder_id, priority, operation,
                status, error_message, attempts, created_at, updated_at
            )
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM sync_queue
                WHERE cloud_track_id = ? AND status IN ('pending', 'in_progress')
            )
            "#,
        )
        .bind(item.id.as_str())
        .bind(&item.cloud_track_id)
        .bind(&item.provider_type)
        .bind(&item.folder_id)
        .bind(item.priority)
        .bind(item.operation.as_str())
        .bind(item.status.as_str())
        .bind(&item.error_message)
        .bind(item.attempts as i64)
        .bind(item.created_at)
        .bind(item.updated_at)
        .bind(&item.cloud_track_id)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn claim_next(
        &self,
        operation: SyncOperation,
        now_ms: i64,
    ) -> Result<Option<QueueItem>> {
        let sql = format!(
            r#"
            UPDATE sync_queue SET status = 'in_progress', updated_at = ?
            WHERE id = (
                SELECT id FROM sync_queue
                WHERE operation = ? AND status = 'pending'
                ORDER BY priority DESC, created_at ASC, rowid ASC
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING {}
            "#,
            COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(now_ms)
            .bind(operation.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        row.as_ref().map(item_from_row).transpose()
    }

    async fn find_by_id(&self, id: QueueItemId) -> Result<Option<QueueItem>> {
        let sql = format!("SELECT {} FROM sync_queue WHERE id = ?", COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        row.as_ref().map(item_from_row).transpose()
    }

    async fn reset_in_progress(&self, now_ms: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sync_queue SET status = 'pending', updated_at = ? WHERE status = 'in_progress'",
        )
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn mark_completed(&self, id: QueueItemId, now_ms: i64) -> Result<Option<QueueItem>> {
        let sql = format!(
            r#"
            UPDATE sync_queue SET status = 'completed', error_message = NULL, updated_at = ?
            WHERE id = ? AND status = 'in_progress'
            RETURNING {}
            "#,
            COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(now_ms)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        row.as_ref().map(item_from_row).transpose()
    }

    async fn mark_failed(
        &self,
        id: QueueItemId,
        error: &str,
        now_ms: i64,
    ) -> Result<Option<QueueItem>> {
        let sql = format!(
            r#"
            UPDATE sync_queue
            SET status = 'failed', error_message = ?, attempts = attempts + 1, updated_at = ?
            WHERE id = ? AND status = 'in_progress'
            RETURNING {}
            "#,
            COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(error)
            .bind(now_ms)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        row.as_ref().map(item_from_row).transpose()
    }

    async fn cancel(&self, ids: &[QueueItemId], now_ms: i64) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE sync_queue SET status = 'cancelled', updated_at = ");
        builder.push_bind(now_ms);
        builder.push(" WHERE status IN ('pending', 'in_progress') AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str());
        }
        separated.push_unseparated(")");

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn retry_failed(&self, folder_id: Option<&str>, now_ms: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue SET status = 'pending', error_message = NULL, updated_at = ?
            WHERE status = 'failed' AND (? IS NULL OR folder_id = ?)
            "#,
        )
        .bind(now_ms)
        .bind(folder_id)
        .bind(folder_id)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn retry_item(&self, id: QueueItemId, now_ms: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue SET status = 'pending', error_message = NULL, updated_at = ?
            WHERE id = ? AND status = 'failed'
            "#,
        )
        .bind(now_ms)
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_by_status(
        &self,
        statuses: &[QueueItemStatus],
        folder_id: Option<&str>,
    ) -> Result<u64> {
        if statuses.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM sync_queue WHERE status IN (");
        let mut separated = builder.separated(", ");
        for status in statuses {
            separated.push_bind(status.as_str());
        }
        separated.push_unseparated(")");
        if let Some(folder_id) = folder_id {
            builder.push(" AND folder_id = ");
            builder.push_bind(folder_id);
        }

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn list(&self, folder_id: Option<&str>) -> Result<Vec<QueueItem>> {
        let sql = format!(
            r#"
            SELECT {} FROM sync_queue
            WHERE (? IS NULL OR folder_id = ?)
            ORDER BY created_at DESC, rowid DESC
            "#,
            COLUMNS
        );

        let rows = sqlx::query(&sql)
            .bind(folder_id)
            .bind(folder_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        items_from_rows(&rows)
    }

    async fn list_for_track(&self, cloud_track_id: &str) -> Result<Vec<QueueItem>> {
        let sql = format!(
            r#"
            SELECT {} FROM sync_queue
            WHERE cloud_track_id = ?
            ORDER BY created_at DESC, rowid DESC
            "#,
            COLUMNS
        );

        let rows = sqlx::query(&sql)
            .bind(cloud_track_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        items_from_rows(&rows)
    }

    async fn stats(&self, folder_id: Option<&str>) -> Result<QueueStats> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count FROM sync_queue
            WHERE (? IS NULL OR folder_id = ?)
            GROUP BY status
            "#,
        )
        .bind(folder_id)
        .bind(folder_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: QueueItemStatus = row.get::<String, _>("status").parse()?;
            stats.add(status, row.get::<i64, _>("count") as u64);
        }
        Ok(stats)
    }

    async fn count_active(&self, folder_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM sync_queue
            WHERE folder_id = ? AND status IN ('pending', 'in_progress')
            "#,
        )
        .bind(folder_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(count as u64)
    }
}

// =============================================================================
// Sync Queue
// =============================================================================

/// Queue operations with event publication
pub struct SyncQueue {
    repository: Arc<dyn SyncQueueRepository>,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl SyncQueue {
    /// Create a queue over `pool`, creating the table if needed
    pub async fn new(pool: SqlitePool, events: EventBus) -> Result<Self> {
        let repository = SqliteSyncQueueRepository::new(pool);
        repository.initialize().await?;

        Ok(Self::with_repository(
            Arc::new(repository),
            events,
            Arc::new(SystemClock),
        ))
    }

    pub fn with_repository(
        repository: Arc<dyn SyncQueueRepository>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            events,
            clock,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn now_ms(&self) -> i64 {
        self.clock.unix_timestamp_millis()
    }

    fn publish(&self, event: QueueEvent) {
        self.events.publish(CoreEvent::Queue(event));
    }

    fn invalidate(&self, scope: InvalidationScope) {
        self.events.invalidate(scope, InvalidationSource::User);
    }

    /// Queue transfers; returns the items actually created.
    ///
    /// Tracks with an active item in either direction are skipped.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Vec<QueueItem>> {
        request.validate()?;

        let now = self.now_ms();
        let mut created = Vec::with_capacity(request.track_ids.len());
        let mut skipped = Vec::new();

        for track_id in &request.track_ids {
            let item = QueueItem::new(
                request.operation,
                track_id.clone(),
                request.folder_id.clone(),
                request.provider_type.clone(),
                now,
            )
            .with_priority(request.priority);

            if self.repository.insert_if_absent(&item).await? {
                created.push(item);
            } else {
                debug!(
                    track_id = %track_id,
                    operation = %request.operation,
                    "Track already has an active queue item, skipping"
                );
                skipped.push(track_id.clone());
            }
        }

        info!(
            operation = %request.operation,
            folder_id = %request.folder_id,
            created = created.len(),
            skipped = skipped.len(),
            "Enqueued sync items"
        );

        self.publish(QueueEvent::Enqueued {
            operation: request.operation.to_string(),
            folder_id: request.folder_id.clone(),
            item_ids: created.iter().map(|i| i.id.to_string()).collect(),
            skipped_track_ids: skipped,
        });
        for item in &created {
            self.events.publish(CoreEvent::Invalidation(Invalidation::track(
                item.cloud_track_id.clone(),
                InvalidationSource::User,
            )));
        }
        self.invalidate(InvalidationScope::QueueStats);

        Ok(created)
    }

    /// `None` priority queues at 0, FIFO behind earlier items of equal priority
    pub async fn enqueue_upload(
        &self,
        track_ids: Vec<String>,
        folder_id: &str,
        provider_type: &str,
        priority: Option<i32>,
    ) -> Result<Vec<QueueItem>> {
        self.enqueue(
            EnqueueRequest::new(SyncOperation::Upload, track_ids, folder_id, provider_type)
                .with_priority(priority.unwrap_or_default()),
        )
        .await
    }

    pub async fn enqueue_download(
        &self,
        track_ids: Vec<String>,
        folder_id: &str,
        provider_type: &str,
        priority: Option<i32>,
    ) -> Result<Vec<QueueItem>> {
        self.enqueue(
            EnqueueRequest::new(SyncOperation::Download, track_ids, folder_id, provider_type)
                .with_priority(priority.unwrap_or_default()),
        )
        .await
    }

    /// Claim the next pending item for `operation`
    pub async fn dequeue(&self, operation: SyncOperation) -> Result<Option<QueueItem>> {
        let item = self.repository.claim_next(operation, self.now_ms()).await?;

        if let Some(item) = &item {
            debug!(
                item_id = %item.id,
                track_id = %item.cloud_track_id,
                operation = %operation,
                attempts = item.attempts,
                "Dequeued sync item"
            );
            self.publish(QueueEvent::ItemStarted {
                item_id: item.id.to_string(),
                track_id: item.cloud_track_id.clone(),
                operation: operation.to_string(),
            });
        }

        Ok(item)
    }

    /// Put items left in progress by an earlier run back to pending
    pub async fn reset_stale_in_progress(&self) -> Result<u64> {
        let count = self.repository.reset_in_progress(self.now_ms()).await?;
        if count > 0 {
            warn!(count, "Reset stale in-progress sync items");
        }
        self.publish(QueueEvent::StaleReset { count });
        Ok(count)
    }

    /// Returns `false` when the item is no longer in progress
    pub async fn mark_completed(&self, id: QueueItemId) -> Result<bool> {
        match self.repository.mark_completed(id, self.now_ms()).await? {
            Some(item) => {
                info!(
                    item_id = %id,
                    track_id = %item.cloud_track_id,
                    operation = %item.operation,
                    "Sync item completed"
                );
                self.publish(QueueEvent::ItemCompleted {
                    item_id: id.to_string(),
                    track_id: item.cloud_track_id,
                    operation: item.operation.to_string(),
                });
                Ok(true)
            }
            None => self.ignored_update(id, "completed").await,
        }
    }

    /// Returns `false` when the item is no longer in progress
    pub async fn mark_failed(&self, id: QueueItemId, error: &str) -> Result<bool> {
        match self.repository.mark_failed(id, error, self.now_ms()).await? {
            Some(item) => {
                warn!(
                    item_id = %id,
                    track_id = %item.cloud_track_id,
                    operation = %item.operation,
                    attempts = item.attempts,
                    error = %error,
                    "Sync item failed"
                );
                self.publish(QueueEvent::ItemFailed {
                    item_id: id.to_string(),
                    track_id: item.cloud_track_id,
                    operation: item.operation.to_string(),
                    error: error.to_string(),
                    attempts: item.attempts,
                });
                Ok(true)
            }
            None => self.ignored_update(id, "failed").await,
        }
    }

    async fn ignored_update(&self, id: QueueItemId, target: &str) -> Result<bool> {
        match self.repository.find_by_id(id).await? {
            Some(item) => {
                debug!(
                    item_id = %id,
                    status = %item.status,
                    target,
                    "Ignoring status update for item that is not in progress"
                );
                Ok(false)
            }
            None => Err(SyncError::ItemNotFound {
                item_id: id.to_string(),
            }),
        }
    }

    /// Cancel pending or in-progress items; returns how many changed
    pub async fn cancel_items(&self, ids: &[QueueItemId]) -> Result<u64> {
        let count = self.repository.cancel(ids, self.now_ms()).await?;
        info!(requested = ids.len(), cancelled = count, "Cancelled sync items");

        self.publish(QueueEvent::Cancelled {
            item_ids: ids.iter().map(|id| id.to_string()).collect(),
            count,
        });
        self.invalidate(InvalidationScope::All);
        Ok(count)
    }

    /// Failed items back to pending, keeping their attempt count
    pub async fn retry_failed(&self, folder_id: Option<&str>) -> Result<u64> {
        let count = self.repository.retry_failed(folder_id, self.now_ms()).await?;
        info!(folder_id = ?folder_id, count, "Retrying failed sync items");

        self.publish(QueueEvent::Retried {
            folder_id: folder_id.map(String::from),
            count,
        });
        self.invalidate(InvalidationScope::All);
        Ok(count)
    }

    /// Retry one failed item; `false` if it is not failed
    pub async fn retry_item(&self, id: QueueItemId) -> Result<bool> {
        let retried = self.repository.retry_item(id, self.now_ms()).await?;
        if retried {
            debug!(item_id = %id, "Retrying sync item");
            self.publish(QueueEvent::Retried {
                folder_id: None,
                count: 1,
            });
            self.invalidate(InvalidationScope::QueueStats);
        }
        Ok(retried)
    }

    pub async fn clear_completed(&self, folder_id: Option<&str>) -> Result<u64> {
        let count = self
            .repository
            .delete_by_status(&[QueueItemStatus::Completed], folder_id)
            .await?;
        self.cleared(QueueItemStatus::Completed, folder_id, count);
        Ok(count)
    }

    /// Removes failed and cancelled items
    pub async fn clear_failed(&self, folder_id: Option<&str>) -> Result<u64> {
        let count = self
            .repository
            .delete_by_status(
                &[QueueItemStatus::Failed, QueueItemStatus::Cancelled],
                folder_id,
            )
            .await?;
        self.cleared(QueueItemStatus::Failed, folder_id, count);
        Ok(count)
    }

    fn cleared(&self, status: QueueItemStatus, folder_id: Option<&str>, count: u64) {
        info!(status = %status, folder_id = ?folder_id, count, "Cleared sync items");
        self.publish(QueueEvent::Cleared {
            status: status.to_string(),
            folder_id: folder_id.map(String::from),
            count,
        });
        self.invalidate(InvalidationScope::All);
    }

    /// Items newest first
    pub async fn get_queue_items(&self, folder_id: Option<&str>) -> Result<Vec<QueueItem>> {
        self.repository.list(folder_id).await
    }

    pub async fn get_queue_stats(&self, folder_id: Option<&str>) -> Result<QueueStats> {
        self.repository.stats(folder_id).await
    }

    pub async fn items_for_track(&self, track_id: &str) -> Result<Vec<QueueItem>> {
        self.repository.list_for_track(track_id).await
    }

    pub async fn has_active_items(&self, folder_id: &str) -> Result<bool> {
        Ok(self.repository.count_active(folder_id).await? > 0)
    }

    pub async fn count_active(&self, folder_id: &str) -> Result<u64> {
        self.repository.count_active(folder_id).await
    }

    pub async fn find_by_id(&self, id: QueueItemId) -> Result<Option<QueueItem>> {
        self.repository.find_by_id(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::ManualClock;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::HashSet;

    async fn test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    async fn test_queue() -> (SyncQueue, ManualClock) {
        let repository = SqliteSyncQueueRepository::new(test_pool().await);
        repository.initialize().await.unwrap();
        let clock = ManualClock::default();
        let queue = SyncQueue::with_repository(
            Arc::new(repository),
            EventBus::new(64),
            Arc::new(clock.clone()),
        );
        (queue, clock)
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_queue_item_id() {
        let id = QueueItemId::new();
        let parsed = QueueItemId::from_string(&id.as_str()).unwrap();
        assert_eq!(id, parsed);
        assert!(matches!(
            QueueItemId::from_string("not-a-uuid"),
            Err(SyncError::InvalidItemId(_))
        ));
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(QueueItemStatus::InProgress.as_str(), "in_progress");
        assert_eq!(
            "cancelled".parse::<QueueItemStatus>().unwrap(),
            QueueItemStatus::Cancelled
        );
        assert!(QueueItemStatus::Cancelled.is_terminal());
        assert!(QueueItemStatus::Pending.is_active());
        assert!("paused".parse::<QueueItemStatus>().is_err());
        assert!("sideload".parse::<SyncOperation>().is_err());
    }

    #[test]
    fn test_sync_status_only_failed_carries_data() {
        let mut item = QueueItem::new(SyncOperation::Upload, "c1", "f1", "dropbox", 0);
        assert_eq!(item.sync_status(), SyncStatus::Pending);

        item.status = QueueItemStatus::Failed;
        item.error_message = Some("quota exceeded".into());
        item.attempts = 2;
        assert_eq!(
            item.sync_status(),
            SyncStatus::Failed {
                error: "quota exceeded".into(),
                attempts: 2
            }
        );

        item.status = QueueItemStatus::Cancelled;
        item.error_message = None;
        assert!(matches!(item.sync_status(), SyncStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn test_repository_init_is_repeatable() {
        let repository = SqliteSyncQueueRepository::new(test_pool().await);
        repository.initialize().await.unwrap();
        repository.initialize().await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_rejects_empty_ids() {
        let (queue, _) = test_queue().await;

        let err = queue.enqueue_upload(vec![], "f1", "dropbox", None).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput { .. }));

        let err = queue
            .enqueue_upload(ids(&["c1", " "]), "f1", "dropbox", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_per_track() {
        let (queue, _) = test_queue().await;

        let first = queue
            .enqueue_download(ids(&["c1", "c2"]), "f1", "dropbox", None)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        let again = queue
            .enqueue_download(ids(&["c1", "c3"]), "f1", "dropbox", None)
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].cloud_track_id, "c3");

        // An active download also blocks an upload for the same track
        let upload = queue.enqueue_upload(ids(&["c1"]), "f1", "dropbox", None).await.unwrap();
        assert!(upload.is_empty());

        assert_eq!(queue.get_queue_stats(None).await.unwrap().pending, 3);
    }

    #[tokio::test]
    async fn test_enqueue_allowed_again_after_completion() {
        let (queue, _) = test_queue().await;
        queue.enqueue_upload(ids(&["c1"]), "f1", "dropbox", None).await.unwrap();

        let item = queue.dequeue(SyncOperation::Upload).await.unwrap().unwrap();
        queue.mark_completed(item.id).await.unwrap();

        let again = queue.enqueue_upload(ids(&["c1"]), "f1", "dropbox", None).await.unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_priority_then_age() {
        let (queue, clock) = test_queue().await;

        queue.enqueue_upload(ids(&["old"]), "f1", "dropbox", None).await.unwrap();
        clock.advance(chrono::Duration::milliseconds(10));
        queue.enqueue_upload(ids(&["new"]), "f1", "dropbox", None).await.unwrap();
        clock.advance(chrono::Duration::milliseconds(10));
        queue
            .enqueue(
                EnqueueRequest::new(SyncOperation::Upload, ids(&["urgent"]), "f1", "dropbox")
                    .with_priority(5),
            )
            .await
            .unwrap();
        queue.enqueue_download(ids(&["down"]), "f1", "dropbox", None).await.unwrap();

        let order: Vec<String> = [
            queue.dequeue(SyncOperation::Upload).await.unwrap(),
            queue.dequeue(SyncOperation::Upload).await.unwrap(),
            queue.dequeue(SyncOperation::Upload).await.unwrap(),
        ]
        .into_iter()
        .flatten()
        .map(|item| item.cloud_track_id)
        .collect();

        assert_eq!(order, vec!["urgent", "old", "new"]);
        assert!(queue.dequeue(SyncOperation::Upload).await.unwrap().is_none());

        let download = queue.dequeue(SyncOperation::Download).await.unwrap().unwrap();
        assert_eq!(download.status, QueueItemStatus::InProgress);
    }

    #[tokio::test]
    async fn test_concurrent_dequeue_claims_each_item_once() {
        let (queue, _) = test_queue().await;
        let queue = Arc::new(queue);
        let tracks: Vec<String> = (0..5).map(|i| format!("c{}", i)).collect();
        queue.enqueue_download(tracks, "f1", "dropbox", None).await.unwrap();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.dequeue(SyncOperation::Download).await.unwrap() })
            })
            .collect();

        let mut claimed = Vec::new();
        for handle in handles {
            if let Some(item) = handle.await.unwrap() {
                claimed.push(item.id);
            }
        }

        let unique: HashSet<_> = claimed.iter().copied().collect();
        assert_eq!(claimed.len(), 5);
        assert_eq!(unique.len(), 5);
        assert_eq!(queue.get_queue_stats(None).await.unwrap().in_progress, 5);
    }

    #[tokio::test]
    async fn test_mark_failed_then_retry_preserves_attempts() {
        let (queue, _) = test_queue().await;
        queue.enqueue_upload(ids(&["c1"]), "f1", "dropbox", None).await.unwrap();

        let item = queue.dequeue(SyncOperation::Upload).await.unwrap().unwrap();
        assert!(queue.mark_failed(item.id, "network unreachable").await.unwrap());

        let failed = queue.find_by_id(item.id).await.unwrap().unwrap();
        assert_eq!(failed.status, QueueItemStatus::Failed);
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.error_message.as_deref(), Some("network unreachable"));

        assert_eq!(queue.retry_failed(None).await.unwrap(), 1);
        let retried = queue.find_by_id(item.id).await.unwrap().unwrap();
        assert_eq!(retried.status, QueueItemStatus::Pending);
        assert_eq!(retried.attempts, 1);
        assert!(retried.error_message.is_none());

        let again = queue.dequeue(SyncOperation::Upload).await.unwrap().unwrap();
        queue.mark_failed(again.id, "still down").await.unwrap();
        assert!(queue.retry_item(again.id).await.unwrap());
        assert!(!queue.retry_item(again.id).await.unwrap());
        assert_eq!(queue.find_by_id(again.id).await.unwrap().unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_reset_stale_preserves_attempts() {
        let (queue, _) = test_queue().await;
        queue.enqueue_download(ids(&["c1", "c2"]), "f1", "dropbox", None).await.unwrap();

        let first = queue.dequeue(SyncOperation::Download).await.unwrap().unwrap();
        queue.mark_failed(first.id, "timeout").await.unwrap();
        queue.retry_item(first.id).await.unwrap();
        queue.dequeue(SyncOperation::Download).await.unwrap().unwrap();
        queue.dequeue(SyncOperation::Download).await.unwrap().unwrap();

        assert_eq!(queue.reset_stale_in_progress().await.unwrap(), 2);

        let stats = queue.get_queue_stats(None).await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.in_progress, 0);
        assert_eq!(queue.find_by_id(first.id).await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_cancel_only_touches_active_items() {
        let (queue, _) = test_queue().await;
        let created = queue
            .enqueue_upload(ids(&["c1", "c2", "c3"]), "f1", "dropbox", None)
            .await
            .unwrap();

        let done = queue.dequeue(SyncOperation::Upload).await.unwrap().unwrap();
        queue.mark_completed(done.id).await.unwrap();
        let running = queue.dequeue(SyncOperation::Upload).await.unwrap().unwrap();

        let all: Vec<_> = created.iter().map(|i| i.id).collect();
        assert_eq!(queue.cancel_items(&all).await.unwrap(), 2);

        // A late result for a cancelled item is ignored
        assert!(!queue.mark_completed(running.id).await.unwrap());
        let cancelled = queue.find_by_id(running.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, QueueItemStatus::Cancelled);

        // Cancelled items never come back through retry
        assert_eq!(queue.retry_failed(None).await.unwrap(), 0);
        assert!(queue.dequeue(SyncOperation::Upload).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_unknown_item_is_not_found() {
        let (queue, _) = test_queue().await;
        let err = queue.mark_completed(QueueItemId::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::ItemNotFound { .. }));
    }

    #[tokio::test]
    async fn test_stats_count_cancelled_as_failed() {
        let (queue, _) = test_queue().await;
        let created = queue
            .enqueue_download(ids(&["c1", "c2", "c3"]), "f1", "dropbox", None)
            .await
            .unwrap();

        let item = queue.dequeue(SyncOperation::Download).await.unwrap().unwrap();
        queue.mark_failed(item.id, "boom").await.unwrap();
        queue.cancel_items(&[created[2].id]).await.unwrap();

        let stats = queue.get_queue_stats(None).await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.total(), 3);
        assert!(!stats.is_idle());
    }

    #[tokio::test]
    async fn test_clear_operations_respect_folder() {
        let (queue, _) = test_queue().await;
        queue.enqueue_upload(ids(&["a1", "a2"]), "fa", "dropbox", None).await.unwrap();
        queue.enqueue_upload(ids(&["b1"]), "fb", "dropbox", None).await.unwrap();

        for _ in 0..2 {
            let item = queue.dequeue(SyncOperation::Upload).await.unwrap().unwrap();
            queue.mark_completed(item.id).await.unwrap();
        }
        let last = queue.dequeue(SyncOperation::Upload).await.unwrap().unwrap();
        queue.mark_failed(last.id, "denied").await.unwrap();

        assert_eq!(queue.clear_completed(Some("fb")).await.unwrap(), 0);
        assert_eq!(queue.clear_completed(Some("fa")).await.unwrap(), 2);
        assert_eq!(queue.clear_failed(None).await.unwrap(), 1);
        assert!(queue.get_queue_items(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queries() {
        let (queue, clock) = test_queue().await;
        queue.enqueue_upload(ids(&["c1"]), "f1", "dropbox", None).await.unwrap();
        clock.advance(chrono::Duration::milliseconds(5));
        queue.enqueue_download(ids(&["c2"]), "f2", "gdrive", None).await.unwrap();

        let items = queue.get_queue_items(None).await.unwrap();
        assert_eq!(items[0].cloud_track_id, "c2");
        assert_eq!(queue.get_queue_items(Some("f1")).await.unwrap().len(), 1);

        assert!(queue.has_active_items("f1").await.unwrap());
        assert!(!queue.has_active_items("nope").await.unwrap());
        assert_eq!(queue.items_for_track("c2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mutations_publish_events() {
        let (queue, _) = test_queue().await;
        let mut rx = queue.events().subscribe();

        queue.enqueue_upload(ids(&["c1"]), "f1", "dropbox", None).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first,
            CoreEvent::Queue(QueueEvent::Enqueued { ref item_ids, .. }) if item_ids.len() == 1
        ));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, CoreEvent::Invalidation(_)));
    }
}
