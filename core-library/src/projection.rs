//! # Unified Track View Projection
//!
//! Merges local tracks, cloud tracks, mappings and folders into one list of
//! [`UnifiedTrack`]s, then offers the filtering, sorting and summary helpers
//! the library view is built from.
//!
//! ## Usage
//!
//! ```ignore
//! let library = UnifiedLibrary::new(source, probe);
//! let tracks = library.load().await?;
//! let visible = sort_unified_tracks(
//!     filter_unified_tracks(tracks, "cafe"),
//!     SortBy::Artist,
//!     SortOrder::Asc,
//! );
//! println!("{}", unified_status(&visible));
//! ```

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::error::Result;
use crate::location::{resolve_locations, FileExistenceProbe};
use crate::models::{
    CloudFolder, CloudTrack, LocalTrack, TrackKind, TrackMapping, UnifiedTrack,
};
use crate::source::LibrarySource;

// =============================================================================
// Projection
// =============================================================================

/// Merge source records into unified tracks.
///
/// Local tracks come first in input order, followed by cloud tracks that no
/// local track claimed. `location_type` reflects id presence only; run
/// [`resolve_locations`] to account for files on disk.
pub fn project(
    local_tracks: &[LocalTrack],
    cloud_tracks: &[CloudTrack],
    mappings: &[TrackMapping],
    folders: &[CloudFolder],
) -> Vec<UnifiedTrack> {
    let locals: HashMap<&str, &LocalTrack> = local_tracks
        .iter()
        .map(|t| (t.id.as_str(), t))
        .collect();
    let clouds: HashMap<&str, &CloudTrack> = cloud_tracks
        .iter()
        .map(|t| (t.id.as_str(), t))
        .collect();
    let folders: HashMap<&str, &CloudFolder> =
        folders.iter().map(|f| (f.id.as_str(), f)).collect();

    let mut by_cloud: HashMap<&str, &TrackMapping> = HashMap::new();
    let mut by_local: HashMap<&str, &TrackMapping> = HashMap::new();

    for mapping in mappings {
        if !clouds.contains_key(mapping.cloud_track_id.as_str()) {
            warn!(
                mapping_id = %mapping.id,
                cloud_track_id = %mapping.cloud_track_id,
                "Skipping mapping to unknown cloud track"
            );
            continue;
        }
        if let Some(local_id) = mapping.local_track_id.as_deref() {
            if !locals.contains_key(local_id) {
                warn!(
                    mapping_id = %mapping.id,
                    local_track_id = %local_id,
                    "Skipping mapping to unknown local track"
                );
                continue;
            }
        }
        if by_cloud.contains_key(mapping.cloud_track_id.as_str()) {
            warn!(
                mapping_id = %mapping.id,
                cloud_track_id = %mapping.cloud_track_id,
                "Duplicate mapping for cloud track, keeping the first"
            );
            continue;
        }

        by_cloud.insert(mapping.cloud_track_id.as_str(), mapping);
        if let Some(local_id) = mapping.local_track_id.as_deref() {
            by_local.entry(local_id).or_insert(mapping);
        }
    }

    let mut claimed: HashSet<&str> = HashSet::new();
    let mut unified = Vec::with_capacity(local_tracks.len() + cloud_tracks.len());

    for local in local_tracks {
        if local.id.is_empty() {
            warn!(path = %local.relative_path, "Dropping local track without id");
            continue;
        }

        let link = by_local.get(local.id.as_str()).and_then(|mapping| {
            clouds
                .get(mapping.cloud_track_id.as_str())
                .filter(|_| !claimed.contains(mapping.cloud_track_id.as_str()))
                .map(|cloud| (*mapping, *cloud))
        });

        let track = match link {
            Some((mapping, cloud)) => {
                claimed.insert(cloud.id.as_str());
                let folder = folders.get(mapping.cloud_folder_id.as_str()).copied();
                merged_track(local, cloud, mapping, folder)
            }
            None => local_track(local),
        };
        unified.push(track);
    }

    for cloud in cloud_tracks {
        if cloud.id.is_empty() {
            warn!(file_name = %cloud.file_name, "Dropping cloud track without id");
            continue;
        }
        if !claimed.insert(cloud.id.as_str()) {
            continue;
        }

        let mapping = by_cloud.get(cloud.id.as_str()).copied();
        let folder = mapping.and_then(|m| folders.get(m.cloud_folder_id.as_str()).copied());
        unified.push(cloud_track(cloud, mapping, folder));
    }

    debug!(
        local = local_tracks.len(),
        cloud = cloud_tracks.len(),
        unified = unified.len(),
        "Projected unified tracks"
    );
    unified
}

fn local_track(local: &LocalTrack) -> UnifiedTrack {
    let mut track = UnifiedTrack::from_metadata(TrackKind::Local, local.metadata.clone());
    apply_local(&mut track, local);
    track.location_type = track.location_from_ids();
    track
}

fn cloud_track(
    cloud: &CloudTrack,
    mapping: Option<&TrackMapping>,
    folder: Option<&CloudFolder>,
) -> UnifiedTrack {
    let mut track = UnifiedTrack::from_metadata(TrackKind::Cloud, cloud.metadata());
    apply_cloud(&mut track, cloud, mapping, folder);
    track.location_type = track.location_from_ids();
    track
}

fn merged_track(
    local: &LocalTrack,
    cloud: &CloudTrack,
    mapping: &TrackMapping,
    folder: Option<&CloudFolder>,
) -> UnifiedTrack {
    let mut track = UnifiedTrack::from_metadata(TrackKind::Unified, local.metadata.clone());
    apply_local(&mut track, local);
    apply_cloud(&mut track, cloud, Some(mapping), folder);
    track.location_type = track.location_from_ids();
    track
}

fn apply_local(track: &mut UnifiedTrack, local: &LocalTrack) {
    track.local_id = Some(local.id.clone());
    track.local_path = Some(local.path().to_string_lossy().into_owned());
    track.local_content_hash = local.content_hash.clone();
    track.content_hash = local.content_hash.clone();
}

fn apply_cloud(
    track: &mut UnifiedTrack,
    cloud: &CloudTrack,
    mapping: Option<&TrackMapping>,
    folder: Option<&CloudFolder>,
) {
    track.cloud_id = Some(cloud.id.clone());
    track.cloud_updated_at = Some(cloud.updated_at);
    if cloud.content_hash.is_some() {
        track.content_hash = cloud.content_hash.clone();
    }

    if let Some(mapping) = mapping {
        track.cloud_map_id = Some(mapping.id.clone());
        track.cloud_folder_id = Some(mapping.cloud_folder_id.clone());
        track.cloud_relative_path = Some(mapping.relative_path.clone());
        track.cloud_file_id = mapping.cloud_file_id.clone();
    }

    if let Some(folder) = folder {
        track.cloud_folder_path = Some(folder.cloud_folder_path.clone());
        track.cloud_local_folder_path = Some(folder.local_folder_path.clone());
        track.cloud_provider_type = Some(folder.provider_type.clone());
    }
}

// =============================================================================
// Filtering
// =============================================================================

/// Lowercase and strip accents so `Café` and `cafe` compare equal
pub fn normalize_for_search(text: &str) -> String {
    text.nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
}

/// Keep tracks whose title, album, artists or genres contain `search`
pub fn filter_unified_tracks(tracks: Vec<UnifiedTrack>, search: &str) -> Vec<UnifiedTrack> {
    if search.is_empty() {
        return tracks;
    }

    let needle = normalize_for_search(search);
    tracks
        .into_iter()
        .filter(|track| {
            let artists = track.artists_joined();
            let genres = track.genres_joined();
            [
                track.title.as_str(),
                track.album.as_str(),
                artists.as_str(),
                genres.as_str(),
            ]
            .iter()
            .any(|field| normalize_for_search(field).contains(&needle))
        })
        .collect()
}

// =============================================================================
// Sorting
// =============================================================================

/// Primary sort key of the library view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortBy {
    Artist,
    Title,
    Duration,
    Album,
    Genre,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy)]
enum SortKey {
    Artist,
    Title,
    Duration,
    Album,
    Genre,
    TrackNo,
}

impl SortBy {
    fn keys(self) -> &'static [SortKey] {
        use SortKey::*;
        match self {
            SortBy::Artist => &[Artist, Album, TrackNo],
            SortBy::Title => &[Title, Artist, Album, TrackNo],
            SortBy::Duration => &[Duration, Artist, Album, TrackNo],
            SortBy::Album => &[Album, Artist, TrackNo],
            SortBy::Genre => &[Genre, Artist, Album, TrackNo],
        }
    }
}

impl SortKey {
    fn compare(self, a: &UnifiedTrack, b: &UnifiedTrack) -> Ordering {
        match self {
            SortKey::Artist => {
                normalize_for_search(&a.artists_joined()).cmp(&normalize_for_search(&b.artists_joined()))
            }
            SortKey::Title => normalize_for_search(&a.title).cmp(&normalize_for_search(&b.title)),
            SortKey::Album => normalize_for_search(&a.album).cmp(&normalize_for_search(&b.album)),
            SortKey::Genre => {
                normalize_for_search(&a.genres_joined()).cmp(&normalize_for_search(&b.genres_joined()))
            }
            SortKey::Duration => a.duration.cmp(&b.duration),
            // Missing numbers go last
            SortKey::TrackNo => match (a.track_no, b.track_no) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            },
        }
    }
}

/// Stable multi-key sort; only the primary key follows `sort_order`
pub fn sort_unified_tracks(
    mut tracks: Vec<UnifiedTrack>,
    sort_by: SortBy,
    sort_order: SortOrder,
) -> Vec<UnifiedTrack> {
    let keys = sort_by.keys();
    tracks.sort_by(|a, b| {
        let mut iter = keys.iter();
        let Some(primary) = iter.next() else {
            return Ordering::Equal;
        };

        let first = primary.compare(a, b);
        let first = match sort_order {
            SortOrder::Asc => first,
            SortOrder::Desc => first.reverse(),
        };

        iter.fold(first, |ordering, key| ordering.then_with(|| key.compare(a, b)))
    });
    tracks
}

// =============================================================================
// Summary
// =============================================================================

/// Footer summary of a track list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnifiedStatus {
    pub track_count: usize,
    /// Seconds
    pub total_duration: u64,
}

/// Count tracks and sum their durations
pub fn unified_status(tracks: &[UnifiedTrack]) -> UnifiedStatus {
    UnifiedStatus {
        track_count: tracks.len(),
        total_duration: tracks.iter().map(|t| u64::from(t.duration)).sum(),
    }
}

impl fmt::Display for UnifiedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let noun = if self.track_count == 1 { "track" } else { "tracks" };
        let hours = self.total_duration / 3600;
        let minutes = (self.total_duration % 3600) / 60;
        let seconds = self.total_duration % 60;

        if hours > 0 {
            write!(
                f,
                "{} {}, {}:{:02}:{:02}",
                self.track_count, noun, hours, minutes, seconds
            )
        } else {
            write!(f, "{} {}, {}:{:02}", self.track_count, noun, minutes, seconds)
        }
    }
}

// =============================================================================
// Selectors
// =============================================================================

/// Tracks whose local or cloud id is in `ids`, in list order
pub fn by_ids<'a>(tracks: &'a [UnifiedTrack], ids: &[&str]) -> Vec<&'a UnifiedTrack> {
    let wanted: HashSet<&str> = ids.iter().copied().collect();
    tracks
        .iter()
        .filter(|t| {
            t.local_id.as_deref().is_some_and(|id| wanted.contains(id))
                || t.cloud_id.as_deref().is_some_and(|id| wanted.contains(id))
        })
        .collect()
}

pub fn by_folder<'a>(tracks: &'a [UnifiedTrack], folder_id: &str) -> Vec<&'a UnifiedTrack> {
    tracks
        .iter()
        .filter(|t| t.cloud_folder_id.as_deref() == Some(folder_id))
        .collect()
}

pub fn by_provider<'a>(tracks: &'a [UnifiedTrack], provider_type: &str) -> Vec<&'a UnifiedTrack> {
    tracks
        .iter()
        .filter(|t| t.cloud_provider_type.as_deref() == Some(provider_type))
        .collect()
}

// =============================================================================
// Unified Library
// =============================================================================

/// Loads the source records and resolves locations in one call
pub struct UnifiedLibrary {
    source: Arc<dyn LibrarySource>,
    probe: Arc<FileExistenceProbe>,
}

impl UnifiedLibrary {
    pub fn new(source: Arc<dyn LibrarySource>, probe: Arc<FileExistenceProbe>) -> Self {
        Self { source, probe }
    }

    pub fn probe(&self) -> &Arc<FileExistenceProbe> {
        &self.probe
    }

    /// Project the whole library with probed locations
    pub async fn load(&self) -> Result<Vec<UnifiedTrack>> {
        let (local, cloud, mappings, folders) = futures::try_join!(
            self.source.list_local_tracks(),
            self.source.list_cloud_tracks(),
            self.source.list_mappings(),
            self.source.list_cloud_folders(),
        )?;

        let mut tracks = project(&local, &cloud, &mappings, &folders);
        resolve_locations(&mut tracks, &self.probe).await;
        Ok(tracks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::DEFAULT_PROBE_TTL;
    use crate::models::{LocationType, TrackMetadata};
    use crate::source::MemoryLibrarySource;
    use async_trait::async_trait;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::{FileSystemAccess, SystemClock};
    use chrono::Utc;
    use std::path::Path;

    fn meta(title: &str, artist: &str, album: &str, track_no: Option<u32>) -> TrackMetadata {
        TrackMetadata {
            title: title.into(),
            album: album.into(),
            artists: Some(vec![artist.into()]),
            duration: 200,
            track_no,
            ..TrackMetadata::default()
        }
    }

    fn local(id: &str, metadata: TrackMetadata) -> LocalTrack {
        LocalTrack {
            id: id.into(),
            local_folder_path: "/music".into(),
            relative_path: format!("{}.flac", id),
            metadata,
            content_hash: Some(format!("hash-{}", id)),
        }
    }

    fn cloud(id: &str, hash: Option<&str>) -> CloudTrack {
        CloudTrack {
            id: id.into(),
            file_name: format!("{}.flac", id),
            content_hash: hash.map(String::from),
            updated_at: Utc::now(),
            tags: None,
        }
    }

    fn mapping(id: &str, cloud_id: &str, local_id: Option<&str>) -> TrackMapping {
        TrackMapping {
            id: id.into(),
            cloud_track_id: cloud_id.into(),
            cloud_folder_id: "f1".into(),
            cloud_file_id: Some(format!("remote-{}", cloud_id)),
            relative_path: format!("{}.flac", cloud_id),
            local_track_id: local_id.map(String::from),
        }
    }

    fn folder() -> CloudFolder {
        CloudFolder {
            id: "f1".into(),
            provider_type: "dropbox".into(),
            cloud_folder_path: "/Apps/music".into(),
            cloud_folder_name: "music".into(),
            local_folder_path: "/music".into(),
        }
    }

    fn titled(title: &str) -> UnifiedTrack {
        UnifiedTrack::from_metadata(TrackKind::Local, TrackMetadata::titled(title))
    }

    #[test]
    fn test_project_merges_mapped_pairs() {
        let locals = vec![local("l1", meta("One", "A", "X", Some(1))), local("l2", meta("Two", "A", "X", Some(2)))];
        let clouds = vec![cloud("c1", Some("cloud-hash")), cloud("c9", None)];
        let mappings = vec![mapping("m1", "c1", Some("l1"))];

        let tracks = project(&locals, &clouds, &mappings, &[folder()]);

        assert_eq!(tracks.len(), 3);
        assert_eq!(tracks[0].kind, TrackKind::Unified);
        assert_eq!(tracks[0].location_type, LocationType::Both);
        assert_eq!(tracks[0].content_hash.as_deref(), Some("cloud-hash"));
        assert_eq!(tracks[0].local_content_hash.as_deref(), Some("hash-l1"));
        assert_eq!(tracks[0].cloud_provider_type.as_deref(), Some("dropbox"));
        assert_eq!(tracks[0].cloud_file_id.as_deref(), Some("remote-c1"));

        assert_eq!(tracks[1].kind, TrackKind::Local);
        assert_eq!(tracks[1].location_type, LocationType::Local);

        assert_eq!(tracks[2].kind, TrackKind::Cloud);
        assert_eq!(tracks[2].cloud_id.as_deref(), Some("c9"));
        assert_eq!(tracks[2].title, "c9.flac");
    }

    #[test]
    fn test_project_skips_dangling_mappings_and_idless_tracks() {
        let locals = vec![local("l1", meta("One", "A", "X", None)), local("", meta("Ghost", "A", "X", None))];
        let clouds = vec![cloud("c1", None)];
        let mappings = vec![
            mapping("m-bad-cloud", "nope", Some("l1")),
            mapping("m-bad-local", "c1", Some("nope")),
        ];

        let tracks = project(&locals, &clouds, &mappings, &[]);

        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].kind, TrackKind::Local);
        assert_eq!(tracks[1].kind, TrackKind::Cloud);
        assert!(tracks[1].cloud_map_id.is_none());
    }

    #[test]
    fn test_every_record_appears_once() {
        let locals = vec![local("l1", meta("One", "A", "X", None))];
        let clouds = vec![cloud("c1", None)];
        let mappings = vec![mapping("m1", "c1", Some("l1")), mapping("m2", "c1", None)];

        let tracks = project(&locals, &clouds, &mappings, &[]);
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].cloud_map_id.as_deref(), Some("m1"));
    }

    #[test]
    fn test_empty_search_is_identity() {
        let tracks = vec![titled("b"), titled("a")];
        assert_eq!(filter_unified_tracks(tracks.clone(), ""), tracks);
    }

    #[test]
    fn test_search_ignores_accents_and_case() {
        let tracks = vec![titled("Café del Mar"), titled("Tea Time")];

        let hits = filter_unified_tracks(tracks.clone(), "cafe");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Café del Mar");

        let hits = filter_unified_tracks(tracks, "CAFÉ");
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_search_matches_artists_and_genres() {
        let mut track = titled("Untitled");
        track.artists = Some(vec!["Björk".into()]);
        track.genres = Some(vec!["Electronic".into()]);
        let tracks = vec![track, titled("Other")];

        assert_eq!(filter_unified_tracks(tracks.clone(), "bjork").len(), 1);
        assert_eq!(filter_unified_tracks(tracks, "electro").len(), 1);
    }

    #[test]
    fn test_sort_by_artist_uses_tiebreakers_ascending() {
        let mut a2 = titled("a2");
        a2.artists = Some(vec!["Alpha".into()]);
        a2.album = "One".into();
        a2.track_no = Some(2);
        let mut a1 = a2.clone();
        a1.title = "a1".into();
        a1.track_no = Some(1);
        let mut a_none = a2.clone();
        a_none.title = "a?".into();
        a_none.track_no = None;
        let mut b = titled("b");
        b.artists = Some(vec!["Beta".into()]);

        let tracks = vec![a_none.clone(), b.clone(), a2.clone(), a1.clone()];

        let asc = sort_unified_tracks(tracks.clone(), SortBy::Artist, SortOrder::Asc);
        let titles: Vec<_> = asc.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["a1", "a2", "a?", "b"]);

        let desc = sort_unified_tracks(tracks, SortBy::Artist, SortOrder::Desc);
        let titles: Vec<_> = desc.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["b", "a1", "a2", "a?"]);
    }

    #[test]
    fn test_sort_is_stable_and_idempotent() {
        let mut x = titled("same");
        x.local_id = Some("first".into());
        let mut y = titled("same");
        y.local_id = Some("second".into());

        let once = sort_unified_tracks(vec![x, y], SortBy::Title, SortOrder::Asc);
        assert_eq!(once[0].local_id.as_deref(), Some("first"));

        let twice = sort_unified_tracks(once.clone(), SortBy::Title, SortOrder::Asc);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_sort_by_duration() {
        let mut long = titled("long");
        long.duration = 600;
        let mut short = titled("short");
        short.duration = 60;

        let sorted = sort_unified_tracks(vec![long, short], SortBy::Duration, SortOrder::Asc);
        assert_eq!(sorted[0].title, "short");
    }

    #[test]
    fn test_unified_status_display() {
        let mut one = titled("one");
        one.duration = 125;
        assert_eq!(unified_status(&[one.clone()]).to_string(), "1 track, 2:05");

        let mut two = titled("two");
        two.duration = 3600;
        let status = unified_status(&[one, two]);
        assert_eq!(status.track_count, 2);
        assert_eq!(status.to_string(), "2 tracks, 1:02:05");

        assert_eq!(unified_status(&[]).to_string(), "0 tracks, 0:00");
    }

    #[test]
    fn test_selectors() {
        let locals = vec![local("l1", meta("One", "A", "X", None))];
        let clouds = vec![cloud("c1", None), cloud("c2", None)];
        let mappings = vec![mapping("m1", "c1", Some("l1"))];
        let tracks = project(&locals, &clouds, &mappings, &[folder()]);

        assert_eq!(by_ids(&tracks, &["c1", "c2"]).len(), 2);
        assert_eq!(by_ids(&tracks, &["l1"]).len(), 1);
        assert_eq!(by_folder(&tracks, "f1").len(), 1);
        assert_eq!(by_provider(&tracks, "dropbox").len(), 1);
        assert!(by_provider(&tracks, "gdrive").is_empty());
    }

    struct NothingOnDisk;

    #[async_trait]
    impl FileSystemAccess for NothingOnDisk {
        async fn exists(&self, _path: &Path) -> BridgeResult<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_unified_library_load_resolves_locations() {
        let source = MemoryLibrarySource::new();
        source.add_local_track(local("l1", meta("One", "A", "X", None)));
        source.add_cloud_track(cloud("c1", None));

        let probe = Arc::new(FileExistenceProbe::new(
            Arc::new(NothingOnDisk),
            Arc::new(SystemClock),
            DEFAULT_PROBE_TTL,
        ));
        let library = UnifiedLibrary::new(Arc::new(source), probe);

        let tracks = library.load().await.unwrap();
        assert_eq!(tracks.len(), 2);
        // The local file is gone, so the local-only track falls back to cloud
        assert_eq!(tracks[0].location_type, LocationType::Cloud);
        assert_eq!(tracks[1].location_type, LocationType::Cloud);
    }
}
