//! Domain models for the unified track view
//!
//! Source records (`LocalTrack`, `CloudTrack`, `TrackMapping`, `CloudFolder`)
//! mirror what the external library database hands out. `UnifiedTrack` is the
//! derived, never persisted merge of those records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// =============================================================================
// Source Records
// =============================================================================

/// Descriptive tags shared by local and cloud tracks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub title: String,
    pub album: String,
    pub artists: Option<Vec<String>>,
    pub genres: Option<Vec<String>>,
    pub year: Option<u32>,
    /// Duration in seconds
    pub duration: u32,
    pub track_no: Option<u32>,
    pub track_of: Option<u32>,
    pub disk_no: Option<u32>,
    pub disk_of: Option<u32>,
}

impl TrackMetadata {
    /// Metadata with only a title, used for cloud files that were never tagged
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

/// Track stored in a local library folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTrack {
    pub id: String,
    pub local_folder_path: String,
    pub relative_path: String,
    pub metadata: TrackMetadata,
    pub content_hash: Option<String>,
}

impl LocalTrack {
    /// Absolute path of the audio file
    pub fn path(&self) -> PathBuf {
        Path::new(&self.local_folder_path).join(&self.relative_path)
    }
}

/// Track known to a cloud provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudTrack {
    pub id: String,
    pub file_name: String,
    pub content_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub tags: Option<TrackMetadata>,
}

impl CloudTrack {
    /// Tags when present, otherwise the file name as title
    pub fn metadata(&self) -> TrackMetadata {
        self.tags
            .clone()
            .unwrap_or_else(|| TrackMetadata::titled(self.file_name.clone()))
    }
}

/// Link between a cloud track, its folder and optionally a local track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMapping {
    pub id: String,
    pub cloud_track_id: String,
    pub cloud_folder_id: String,
    /// Provider-side file id; absent until the file exists remotely
    pub cloud_file_id: Option<String>,
    pub relative_path: String,
    pub local_track_id: Option<String>,
}

/// Local folder mirrored to a provider folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudFolder {
    pub id: String,
    pub provider_type: String,
    pub cloud_folder_path: String,
    pub cloud_folder_name: String,
    pub local_folder_path: String,
}

impl CloudFolder {
    /// Where a folder-relative file lives on disk
    pub fn local_path_for(&self, relative_path: &str) -> PathBuf {
        Path::new(&self.local_folder_path).join(relative_path)
    }
}

// =============================================================================
// Unified Track
// =============================================================================

/// Which identifiers a unified track was built from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Local,
    Cloud,
    Unified,
}

/// Where a track can currently be played from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationType {
    Local,
    Cloud,
    Both,
}

impl LocationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationType::Local => "local",
            LocationType::Cloud => "cloud",
            LocationType::Both => "both",
        }
    }
}

impl fmt::Display for LocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LocationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(LocationType::Local),
            "cloud" => Ok(LocationType::Cloud),
            "both" => Ok(LocationType::Both),
            _ => Err(format!("Invalid location type: {}", s)),
        }
    }
}

/// One row of the unified library view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnifiedTrack {
    pub kind: TrackKind,

    pub local_id: Option<String>,
    pub cloud_id: Option<String>,
    pub cloud_map_id: Option<String>,
    pub cloud_folder_id: Option<String>,

    /// Cloud hash when known, local hash otherwise
    pub content_hash: Option<String>,
    pub local_content_hash: Option<String>,

    pub local_path: Option<String>,
    pub cloud_relative_path: Option<String>,
    pub cloud_folder_path: Option<String>,
    pub cloud_local_folder_path: Option<String>,
    pub cloud_provider_type: Option<String>,
    pub cloud_file_id: Option<String>,

    pub title: String,
    pub album: String,
    pub artists: Option<Vec<String>>,
    pub genres: Option<Vec<String>>,
    pub year: Option<u32>,
    pub duration: u32,
    pub track_no: Option<u32>,
    pub track_of: Option<u32>,
    pub disk_no: Option<u32>,
    pub disk_of: Option<u32>,

    pub location_type: LocationType,
    pub cloud_updated_at: Option<DateTime<Utc>>,
}

impl UnifiedTrack {
    /// Merge key: local id if present, else cloud id
    pub fn key(&self) -> Option<&str> {
        self.local_id.as_deref().or(self.cloud_id.as_deref())
    }

    pub fn has_local_id(&self) -> bool {
        self.local_id.is_some()
    }

    pub fn has_cloud_id(&self) -> bool {
        self.cloud_id.is_some()
    }

    /// Location implied by id presence alone, before any file probe
    pub fn location_from_ids(&self) -> LocationType {
        match (self.has_local_id(), self.has_cloud_id()) {
            (true, true) => LocationType::Both,
            (true, false) => LocationType::Local,
            _ => LocationType::Cloud,
        }
    }

    /// Artists joined the way they are displayed and searched
    pub fn artists_joined(&self) -> String {
        self.artists
            .as_ref()
            .map(|a| a.join(","))
            .unwrap_or_default()
    }

    pub fn genres_joined(&self) -> String {
        self.genres.as_ref().map(|g| g.join(",")).unwrap_or_default()
    }

    pub(crate) fn from_metadata(kind: TrackKind, metadata: TrackMetadata) -> Self {
        Self {
            kind,
            local_id: None,
            cloud_id: None,
            cloud_map_id: None,
            cloud_folder_id: None,
            content_hash: None,
            local_content_hash: None,
            local_path: None,
            cloud_relative_path: None,
            cloud_folder_path: None,
            cloud_local_folder_path: None,
            cloud_provider_type: None,
            cloud_file_id: None,
            title: metadata.title,
            album: metadata.album,
            artists: metadata.artists,
            genres: metadata.genres,
            year: metadata.year,
            duration: metadata.duration,
            track_no: metadata.track_no,
            track_of: metadata.track_of,
            disk_no: metadata.disk_no,
            disk_of: metadata.disk_of,
            location_type: LocationType::Cloud,
            cloud_updated_at: None,
        }
    }
}
