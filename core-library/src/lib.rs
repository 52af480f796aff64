//! # Library View Module
//!
//! Read-side model of the mirrored music library.
//!
//! ## Overview
//!
//! This module provides:
//! - Source records handed out by the external library database
//! - The `LibrarySource` contract used to read them
//! - The location resolver (`local` / `cloud` / `both` and integrity states)
//! - The unified track projection with search, sort and summary helpers

pub mod error;
pub mod location;
pub mod models;
pub mod projection;
pub mod source;

pub use error::{LibraryError, Result};
pub use location::{
    resolve_integrity_state, resolve_location_type, resolve_locations, FileExistenceProbe,
    TrackLocationState, DEFAULT_PROBE_TTL,
};
pub use models::{
    CloudFolder, CloudTrack, LocalTrack, LocationType, TrackKind, TrackMapping, TrackMetadata,
    UnifiedTrack,
};
pub use projection::{
    by_folder, by_ids, by_provider, filter_unified_tracks, project, sort_unified_tracks,
    unified_status, SortBy, SortOrder, UnifiedLibrary, UnifiedStatus,
};
pub use source::{LibrarySource, MemoryLibrarySource};
