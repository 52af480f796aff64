//! # Location Resolver
//!
//! Decides where a unified track can be played from and how healthy its
//! local/cloud pairing is.
//!
//! ## Overview
//!
//! ```text
//! UnifiedTrack ──► resolve_location_type ──► both | local | cloud
//!                        │
//!                        └── only local-only tracks are probed
//!                                   │
//!                           FileExistenceProbe (TTL cache)
//!                                   │
//!                           FileSystemAccess::exists
//! ```
//!
//! A probe error is never propagated: it is logged and counts as "missing".

use bridge_traits::{Clock, FileSystemAccess};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{trace, warn};

use crate::models::{LocationType, UnifiedTrack};

/// Default lifetime of a cached existence answer
pub const DEFAULT_PROBE_TTL: Duration = Duration::from_secs(5);

// =============================================================================
// Integrity State
// =============================================================================

/// Health of a track's local/cloud pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackLocationState {
    Complete,
    LocalOnly,
    CloudOnly,
    OutOfSync,
    Missing,
    NotMapped,
}

impl TrackLocationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackLocationState::Complete => "complete",
            TrackLocationState::LocalOnly => "local_only",
            TrackLocationState::CloudOnly => "cloud_only",
            TrackLocationState::OutOfSync => "out_of_sync",
            TrackLocationState::Missing => "missing",
            TrackLocationState::NotMapped => "not_mapped",
        }
    }

    /// Anything but `Complete` asks for user attention
    pub fn needs_attention(&self) -> bool {
        !matches!(self, TrackLocationState::Complete)
    }
}

impl fmt::Display for TrackLocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackLocationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(TrackLocationState::Complete),
            "local_only" => Ok(TrackLocationState::LocalOnly),
            "cloud_only" => Ok(TrackLocationState::CloudOnly),
            "out_of_sync" => Ok(TrackLocationState::OutOfSync),
            "missing" => Ok(TrackLocationState::Missing),
            "not_mapped" => Ok(TrackLocationState::NotMapped),
            _ => Err(format!("Invalid track location state: {}", s)),
        }
    }
}

/// Total mapping from the four facts to a location state.
///
/// A local and a cloud copy without a mapping are reported as `NotMapped`.
pub fn resolve_integrity_state(
    has_local: bool,
    has_cloud: bool,
    hashes_match: bool,
    is_mapped: bool,
) -> TrackLocationState {
    match (has_local, has_cloud, is_mapped, hashes_match) {
        (true, true, true, true) => TrackLocationState::Complete,
        (true, true, true, false) => TrackLocationState::OutOfSync,
        (true, true, false, _) => TrackLocationState::NotMapped,
        (true, false, _, _) => TrackLocationState::LocalOnly,
        (false, true, true, _) => TrackLocationState::CloudOnly,
        (false, true, false, _) => TrackLocationState::NotMapped,
        (false, false, _, _) => TrackLocationState::Missing,
    }
}

// =============================================================================
// File Existence Probe
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct CachedProbe {
    exists: bool,
    checked_at: DateTime<Utc>,
}

/// Cached `FileSystemAccess::exists` lookups.
///
/// Two concurrent misses for the same path may both reach the file system;
/// the later answer wins the cache slot.
pub struct FileExistenceProbe {
    fs: Arc<dyn FileSystemAccess>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    cache: Mutex<HashMap<PathBuf, CachedProbe>>,
}

impl FileExistenceProbe {
    pub fn new(fs: Arc<dyn FileSystemAccess>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            fs,
            clock,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `path` currently exists, served from cache while fresh
    pub async fn exists(&self, path: &Path) -> bool {
        let now = self.clock.now();
        if let Some(hit) = self.lookup(path, now) {
            trace!(path = %path.display(), exists = hit, "Probe cache hit");
            return hit;
        }

        let exists = match self.fs.exists(path).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "File existence probe failed");
                false
            }
        };

        self.lock_cache().insert(
            path.to_path_buf(),
            CachedProbe {
                exists,
                checked_at: self.clock.now(),
            },
        );
        exists
    }

    /// Drop the cached answer for one path
    pub fn invalidate(&self, path: &Path) {
        self.lock_cache().remove(path);
    }

    /// Drop every cached answer
    pub fn clear(&self) {
        self.lock_cache().clear();
    }

    pub fn cached_entries(&self) -> usize {
        self.lock_cache().len()
    }

    fn lookup(&self, path: &Path, now: DateTime<Utc>) -> Option<bool> {
        let cache = self.lock_cache();
        cache
            .get(path)
            .filter(|entry| now - entry.checked_at < self.ttl)
            .map(|entry| entry.exists)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, CachedProbe>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for FileExistenceProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileExistenceProbe")
            .field("ttl", &self.ttl)
            .field("cached_entries", &self.cached_entries())
            .finish()
    }
}

// =============================================================================
// Location Type
// =============================================================================

/// Where `track` can be played from.
///
/// Tracks carrying both ids are `Both` without touching the file system.
/// Only local-only tracks are probed; a missing file makes them `Cloud`.
pub async fn resolve_location_type(
    track: &UnifiedTrack,
    probe: &FileExistenceProbe,
) -> LocationType {
    match (track.has_local_id(), track.has_cloud_id()) {
        (true, true) => LocationType::Both,
        (false, true) => LocationType::Cloud,
        (true, false) => match track.local_path.as_deref() {
            Some(path) if probe.exists(Path::new(path)).await => LocationType::Local,
            _ => LocationType::Cloud,
        },
        (false, false) => {
            warn!(
                title = %track.title,
                "Track has neither a local nor a cloud id, treating as cloud"
            );
            LocationType::Cloud
        }
    }
}

/// Recompute `location_type` for every track
pub async fn resolve_locations(tracks: &mut [UnifiedTrack], probe: &FileExistenceProbe) {
    let resolved = join_all(
        tracks
            .iter()
            .map(|track| resolve_location_type(track, probe)),
    )
    .await;

    for (track, location) in tracks.iter_mut().zip(resolved) {
        track.location_type = location;
    }
}
