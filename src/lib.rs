//! Workspace placeholder crate.
//!
//! This crate exists to expose shared feature flags that map to the individual
//! workspace crates. Host applications can depend on `track-sync-workspace`
//! and enable `desktop-shims` without wiring `core-service` and
//! `core-runtime` individually.

#[cfg(feature = "desktop-shims")]
pub use core_service::{CoreDependencies, CoreError, SyncConfig, TrackQuery, TrackSyncService};
