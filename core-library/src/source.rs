//! Read-only access to the external library database.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{CloudFolder, CloudTrack, LocalTrack, TrackMapping};

/// Records owned by the library database.
///
/// Implementations are expected to be cheap to call repeatedly; the sync core
/// never writes through this trait.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LibrarySource: Send + Sync {
    async fn list_local_tracks(&self) -> Result<Vec<LocalTrack>>;

    async fn list_cloud_tracks(&self) -> Result<Vec<CloudTrack>>;

    async fn list_mappings(&self) -> Result<Vec<TrackMapping>>;

    async fn list_cloud_folders(&self) -> Result<Vec<CloudFolder>>;

    async fn find_mapping_by_cloud_track(&self, cloud_track_id: &str)
        -> Result<Option<TrackMapping>>;

    async fn find_cloud_track(&self, id: &str) -> Result<Option<CloudTrack>>;

    async fn find_local_track(&self, id: &str) -> Result<Option<LocalTrack>>;

    async fn find_cloud_folder(&self, id: &str) -> Result<Option<CloudFolder>>;

    /// Mappings belonging to one cloud folder
    async fn list_folder_mappings(&self, folder_id: &str) -> Result<Vec<TrackMapping>> {
        let mappings = self.list_mappings().await?;
        Ok(mappings
            .into_iter()
            .filter(|m| m.cloud_folder_id == folder_id)
            .collect())
    }
}

/// `LibrarySource` backed by plain vectors.
///
/// Useful for hosts that already hold the library in memory and for tests.
#[derive(Debug, Default)]
pub struct MemoryLibrarySource {
    state: std::sync::RwLock<MemoryState>,
}

#[derive(Debug, Default, Clone)]
struct MemoryState {
    local_tracks: Vec<LocalTrack>,
    cloud_tracks: Vec<CloudTrack>,
    mappings: Vec<TrackMapping>,
    folders: Vec<CloudFolder>,
}

impl MemoryLibrarySource {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_local_track(&self, track: LocalTrack) {
        self.write().local_tracks.push(track);
    }

    pub fn add_cloud_track(&self, track: CloudTrack) {
        self.write().cloud_tracks.push(track);
    }

    pub fn add_mapping(&self, mapping: TrackMapping) {
        self.write().mappings.push(mapping);
    }

    pub fn add_cloud_folder(&self, folder: CloudFolder) {
        self.write().folders.push(folder);
    }

    /// Replace the mapping with the same id, or append it
    pub fn upsert_mapping(&self, mapping: TrackMapping) {
        let mut state = self.write();
        match state.mappings.iter_mut().find(|m| m.id == mapping.id) {
            Some(existing) => *existing = mapping,
            None => state.mappings.push(mapping),
        }
    }
}

#[async_trait]
impl LibrarySource for MemoryLibrarySource {
    async fn list_local_tracks(&self) -> Result<Vec<LocalTrack>> {
        Ok(self.read().local_tracks.clone())
    }

    async fn list_cloud_tracks(&self) -> Result<Vec<CloudTrack>> {
        Ok(self.read().cloud_tracks.clone())
    }

    async fn list_mappings(&self) -> Result<Vec<TrackMapping>> {
        Ok(self.read().mappings.clone())
    }

    async fn list_cloud_folders(&self) -> Result<Vec<CloudFolder>> {
        Ok(self.read().folders.clone())
    }

    async fn find_mapping_by_cloud_track(
        &self,
        cloud_track_id: &str,
    ) -> Result<Option<TrackMapping>> {
        Ok(self
            .read()
            .mappings
            .iter()
            .find(|m| m.cloud_track_id == cloud_track_id)
            .cloned())
    }

    async fn find_cloud_track(&self, id: &str) -> Result<Option<CloudTrack>> {
        Ok(self.read().cloud_tracks.iter().find(|t| t.id == id).cloned())
    }

    async fn find_local_track(&self, id: &str) -> Result<Option<LocalTrack>> {
        Ok(self.read().local_tracks.iter().find(|t| t.id == id).cloned())
    }

    async fn find_cloud_folder(&self, id: &str) -> Result<Option<CloudFolder>> {
        Ok(self.read().folders.iter().find(|f| f.id == id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LibraryError;

    fn mapping(id: &str, cloud: &str, folder: &str) -> TrackMapping {
        TrackMapping {
            id: id.into(),
            cloud_track_id: cloud.into(),
            cloud_folder_id: folder.into(),
            cloud_file_id: None,
            relative_path: format!("{}.flac", cloud),
            local_track_id: None,
        }
    }

    #[tokio::test]
    async fn test_memory_source_lookups() {
        let source = MemoryLibrarySource::new();
        source.add_mapping(mapping("m1", "c1", "f1"));
        source.add_mapping(mapping("m2", "c2", "f2"));

        let found = source.find_mapping_by_cloud_track("c2").await.unwrap();
        assert_eq!(found.map(|m| m.id), Some("m2".to_string()));
        assert!(source.find_cloud_track("missing").await.unwrap().is_none());

        let in_folder = source.list_folder_mappings("f1").await.unwrap();
        assert_eq!(in_folder.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_mapping_replaces_by_id() {
        let source = MemoryLibrarySource::new();
        source.add_mapping(mapping("m1", "c1", "f1"));

        let mut updated = mapping("m1", "c1", "f1");
        updated.cloud_file_id = Some("remote-1".into());
        source.upsert_mapping(updated);

        let mappings = source.list_mappings().await.unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].cloud_file_id.as_deref(), Some("remote-1"));
    }

    #[tokio::test]
    async fn test_mocked_source_error_propagates() {
        let mut source = MockLibrarySource::new();
        source
            .expect_list_local_tracks()
            .returning(|| Err(LibraryError::Source("database locked".into())));

        let err = source.list_local_tracks().await.unwrap_err();
        assert!(matches!(err, LibraryError::Source(_)));
    }
}
