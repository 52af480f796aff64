//! File System Abstractions
//!
//! Provides the platform-agnostic existence probe used to decide whether a
//! track's local copy is actually playable.

use async_trait::async_trait;
use std::path::Path;

use crate::error::Result;

/// File system access trait
///
/// Abstracts the file checks the sync core performs so hosts can route them
/// through their own sandboxing rules:
/// - Desktop: Direct filesystem access
/// - Mobile: Sandboxed app directories
///
/// Implementations must not treat a missing file as an error. `Err` is
/// reserved for the probe itself failing (permissions, IPC, I/O).
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::FileSystemAccess;
///
/// async fn is_playable(fs: &dyn FileSystemAccess, path: &Path) -> bool {
///     fs.exists(path).await.unwrap_or(false)
/// }
/// ```
#[async_trait]
pub trait FileSystemAccess: Send + Sync {
    /// Check if a file or directory exists
    async fn exists(&self, path: &Path) -> Result<bool>;
}
