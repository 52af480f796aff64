//! Core service façade and bootstrap helpers.
//!
//! This crate wires host-provided collaborators (the library database reader
//! and the transfer backend) into the sync core. Desktop apps typically enable
//! the `desktop-shims` feature, which lets [`SyncConfig`] fall back to the
//! Tokio file system from `bridge-desktop` for local file probes.
//!
//! ```ignore
//! let config = SyncConfig::builder()
//!     .database_path(data_dir.join("sync.db"))
//!     .build()?;
//! let service = TrackSyncService::bootstrap(
//!     config,
//!     CoreDependencies::new(library, executor),
//! )
//! .await?;
//! service.start().await?;
//!
//! service.enqueue_download(vec![track_id], &folder_id, "gdrive", None).await?;
//! let status = service.get_track_sync_status(&track_id).await?;
//! ```

pub mod error;
pub mod service;

pub use core_runtime::config::SyncConfig;
pub use error::{CoreError, Result};
pub use service::{CoreDependencies, TrackQuery, TrackSyncService};
