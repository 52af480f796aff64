//! # Sync Status Tracker
//!
//! Answers "what is happening to this track?" for the library view by
//! combining the queue with the integrity facts of the track.
//!
//! ## Overview
//!
//! ```text
//!                 ┌──────────────┐
//!   track_id ───► │  SyncQueue   │──► most relevant item (active wins,
//!                 └──────────────┘    else latest updated)
//!                 ┌──────────────┐
//!            ───► │LibrarySource │──► mapping, folder, hashes
//!                 └──────────────┘
//!                 ┌──────────────┐
//!            ───► │ FileExistence│──► local copy present?
//!                 │    Probe     │
//!                 └──────────────┘
//!                        │
//!                        ▼
//!              resolve_integrity_state
//! ```

use core_library::{
    resolve_integrity_state, CloudTrack, FileExistenceProbe, LibraryError, LibrarySource,
    TrackLocationState, TrackMapping,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::queue::{QueueItem, SyncOperation, SyncQueue, SyncStatus};

/// Status of one track as shown next to it in the library
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSyncStatus {
    pub location_state: TrackLocationState,
    pub sync_operation: Option<SyncOperation>,
    pub sync_status: Option<SyncStatus>,
    /// Unix milliseconds of the reported queue item's last change
    pub updated_at: i64,
}

/// Aggregate state of a mirrored folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderSyncStatus {
    Synced,
    Syncing,
    NeedsAttention,
    Empty,
}

impl fmt::Display for FolderSyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FolderSyncStatus::Synced => "synced",
            FolderSyncStatus::Syncing => "syncing",
            FolderSyncStatus::NeedsAttention => "needs_attention",
            FolderSyncStatus::Empty => "empty",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderTrackStatus {
    pub track_id: String,
    pub file_name: String,
    pub relative_path: String,
    pub location_state: TrackLocationState,
    pub sync_operation: Option<SyncOperation>,
    pub sync_status: Option<SyncStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudFolderSyncDetails {
    pub id: String,
    pub cloud_folder_path: String,
    pub local_folder_path: String,
    pub sync_status: FolderSyncStatus,
    /// Active (pending or in-progress) items of the folder
    pub pending_sync_count: u64,
    pub tracks: Vec<FolderTrackStatus>,
}

/// Pick the item that best describes a track: active first, then newest
fn most_relevant(items: &[QueueItem]) -> Option<&QueueItem> {
    items
        .iter()
        .filter(|item| item.is_active())
        .max_by_key(|item| item.updated_at)
        .or_else(|| items.iter().max_by_key(|item| item.updated_at))
}

pub struct SyncStatusTracker {
    queue: Arc<SyncQueue>,
    library: Arc<dyn LibrarySource>,
    probe: Arc<FileExistenceProbe>,
}

impl SyncStatusTracker {
    pub fn new(
        queue: Arc<SyncQueue>,
        library: Arc<dyn LibrarySource>,
        probe: Arc<FileExistenceProbe>,
    ) -> Self {
        Self {
            queue,
            library,
            probe,
        }
    }

    /// `None` when the track has no queue item since the last clear
    pub async fn get_sync_status(&self, track_id: &str) -> Result<Option<TrackSyncStatus>> {
        let items = self.queue.items_for_track(track_id).await?;
        let Some(item) = most_relevant(&items) else {
            return Ok(None);
        };

        let location_state = self.location_state(track_id).await?;
        debug!(
            track_id,
            item_id = %item.id,
            location_state = %location_state,
            "Resolved track sync status"
        );

        Ok(Some(TrackSyncStatus {
            location_state,
            sync_operation: Some(item.operation),
            sync_status: Some(item.sync_status()),
            updated_at: item.updated_at,
        }))
    }

    /// Integrity state of a cloud track, independent of the queue
    pub async fn location_state(&self, track_id: &str) -> Result<TrackLocationState> {
        let cloud = self.library.find_cloud_track(track_id).await?;
        let mapping = self.library.find_mapping_by_cloud_track(track_id).await?;

        match mapping {
            Some(mapping) => self.mapped_state(&mapping, cloud.as_ref()).await,
            None => Ok(resolve_integrity_state(false, cloud.is_some(), false, false)),
        }
    }

    async fn mapped_state(
        &self,
        mapping: &TrackMapping,
        cloud: Option<&CloudTrack>,
    ) -> Result<TrackLocationState> {
        let has_local = match self.library.find_cloud_folder(&mapping.cloud_folder_id).await? {
            Some(folder) => {
                let path = folder.local_path_for(&mapping.relative_path);
                self.probe.exists(&path).await
            }
            None => {
                warn!(
                    mapping_id = %mapping.id,
                    folder_id = %mapping.cloud_folder_id,
                    "Mapping points at an unknown folder"
                );
                false
            }
        };
        let has_cloud = mapping.cloud_file_id.is_some();

        let local_hash = match mapping.local_track_id.as_deref() {
            Some(local_id) => self
                .library
                .find_local_track(local_id)
                .await?
                .and_then(|t| t.content_hash),
            None => None,
        };
        let cloud_hash = cloud.and_then(|c| c.content_hash.as_deref());

        // Without a recorded local hash a known cloud hash is trusted
        let hashes_match = match (local_hash.as_deref(), cloud_hash) {
            (Some(local), Some(cloud)) => local == cloud,
            (None, Some(_)) => true,
            _ => false,
        };

        Ok(resolve_integrity_state(has_local, has_cloud, hashes_match, true))
    }

    /// Per-track details and aggregate status of one folder
    pub async fn get_folder_sync_details(&self, folder_id: &str) -> Result<CloudFolderSyncDetails> {
        let folder = self
            .library
            .find_cloud_folder(folder_id)
            .await?
            .ok_or_else(|| LibraryError::not_found("cloud_folder", folder_id))?;

        let mappings = self.library.list_folder_mappings(folder_id).await?;
        let items = self.queue.get_queue_items(Some(folder_id)).await?;

        let mut by_track: HashMap<&str, Vec<QueueItem>> = HashMap::new();
        for item in &items {
            by_track
                .entry(item.cloud_track_id.as_str())
                .or_default()
                .push(item.clone());
        }
        let pending_sync_count = items.iter().filter(|i| i.is_active()).count() as u64;

        let mut tracks = Vec::with_capacity(mappings.len());
        for mapping in &mappings {
            let Some(cloud) = self.library.find_cloud_track(&mapping.cloud_track_id).await? else {
                warn!(
                    mapping_id = %mapping.id,
                    cloud_track_id = %mapping.cloud_track_id,
                    "Skipping mapping to unknown cloud track"
                );
                continue;
            };

            let location_state = self.mapped_state(mapping, Some(&cloud)).await?;
            let relevant = by_track
                .get(mapping.cloud_track_id.as_str())
                .and_then(|items| most_relevant(items));

            tracks.push(FolderTrackStatus {
                track_id: cloud.id.clone(),
                file_name: cloud.file_name.clone(),
                relative_path: mapping.relative_path.clone(),
                location_state,
                sync_operation: relevant.map(|i| i.operation),
                sync_status: relevant.map(|i| i.sync_status()),
            });
        }

        let sync_status = if tracks.is_empty() {
            FolderSyncStatus::Empty
        } else if pending_sync_count > 0 {
            FolderSyncStatus::Syncing
        } else if tracks.iter().any(|t| t.location_state.needs_attention()) {
            FolderSyncStatus::NeedsAttention
        } else {
            FolderSyncStatus::Synced
        };

        Ok(CloudFolderSyncDetails {
            id: folder.id,
            cloud_folder_path: folder.cloud_folder_path,
            local_folder_path: folder.local_folder_path,
            sync_status,
            pending_sync_count,
            tracks,
        })
    }
}
