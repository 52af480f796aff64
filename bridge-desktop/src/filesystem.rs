//! File System Access Implementation using Tokio

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::FileSystemAccess,
};
use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;
use tracing::trace;

/// Tokio-based file system implementation
///
/// Answers existence probes with `tokio::fs::metadata`. Only regular files
/// count as present: a directory sitting at a track's path is not playable.
#[derive(Debug, Clone, Default)]
pub struct TokioFileSystem;

impl TokioFileSystem {
    pub fn new() -> Self {
        Self
    }

    /// Keep the probed path alongside the I/O failure
    fn map_io_error(path: &Path, e: std::io::Error) -> BridgeError {
        BridgeError::probe_failed(path, e.to_string())
    }
}

#[async_trait]
impl FileSystemAccess for TokioFileSystem {
    async fn exists(&self, path: &Path) -> Result<bool> {
        match fs::metadata(path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                trace!(path = ?path, "File not found");
                Ok(false)
            }
            Err(e) => Err(Self::map_io_error(path, e)),
        }
    }
}
