//! # Sync Configuration Module
//!
//! Provides configuration management for the track sync core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `SyncConfig`
//! holding the queue database location, worker pacing, cache lifetimes and the
//! bridges the core depends on. Validation is fail-fast: `build()` rejects
//! values the worker loop cannot run with.
//!
//! ## Defaults
//!
//! | Setting                    | Default |
//! |----------------------------|---------|
//! | `max_concurrent_uploads`   | 3       |
//! | `max_concurrent_downloads` | 3       |
//! | `tick_interval`            | 1s      |
//! | `dequeue_pacing`           | 1s      |
//! | `probe_ttl`                | 5s      |
//! | `status_poll_interval`     | 5s      |
//! | `retry`                    | manual only |
//!
//! When the `desktop-shims` feature is enabled, `TokioFileSystem` is injected
//! automatically if no `FileSystemAccess` is provided.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{RetryConfig, SyncConfig};
//! use std::time::Duration;
//!
//! let config = SyncConfig::builder()
//!     .database_path("/path/to/sync.db")
//!     .max_concurrent_downloads(2)
//!     .retry(RetryConfig::default())
//!     .build()
//!     .expect("Failed to build config");
//! ```
//!
//! ## Error Handling
//!
//! ```should_panic
//! use core_runtime::config::SyncConfig;
//!
//! // No database path
//! let config = SyncConfig::builder()
//!     .build()
//!     .expect("Should fail - missing database path");
//! ```

use crate::error::{Error, Result};
use bridge_traits::{Clock, FileSystemAccess, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on per-direction concurrency.
pub const MAX_CONCURRENCY: usize = 32;

/// Sync core configuration.
///
/// Use [`SyncConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct SyncConfig {
    /// Path to the SQLite database holding the sync queue (`:memory:` allowed)
    pub database_path: PathBuf,

    /// Uploads allowed in flight at once
    pub max_concurrent_uploads: usize,

    /// Downloads allowed in flight at once
    pub max_concurrent_downloads: usize,

    /// Interval between worker loop ticks
    pub tick_interval: Duration,

    /// Delay between successive dequeues inside one tick
    pub dequeue_pacing: Duration,

    /// How long a file existence result stays cached
    pub probe_ttl: Duration,

    /// Interval at which status consumers are told to refresh
    pub status_poll_interval: Duration,

    /// Event bus capacity
    pub event_buffer_size: usize,

    /// Automatic retry for failed transfers. `None` keeps retry manual.
    pub retry: Option<RetryConfig>,

    /// File system access used by the existence probe
    pub file_system: Arc<dyn FileSystemAccess>,

    /// Time source for cache expiry
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("database_path", &self.database_path)
            .field("max_concurrent_uploads", &self.max_concurrent_uploads)
            .field("max_concurrent_downloads", &self.max_concurrent_downloads)
            .field("tick_interval", &self.tick_interval)
            .field("dequeue_pacing", &self.dequeue_pacing)
            .field("probe_ttl", &self.probe_ttl)
            .field("status_poll_interval", &self.status_poll_interval)
            .field("event_buffer_size", &self.event_buffer_size)
            .field("retry", &self.retry)
            .field("file_system", &"FileSystemAccess { ... }")
            .finish()
    }
}

/// Automatic retry settings for failed transfers.
///
/// A failed item is re-queued after an exponential delay
/// (`base_delay * 2^(attempts - 1)`, capped at `max_delay`) until it has failed
/// `max_attempts` times. After that it stays failed until a user retries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::invalid("retry.max_attempts", "must be at least 1"));
        }

        if self.base_delay > self.max_delay {
            return Err(Error::invalid(
                "retry.base_delay",
                format!("{:?} exceeds max_delay {:?}", self.base_delay, self.max_delay),
            ));
        }

        Ok(())
    }
}

impl SyncConfig {
    /// Creates a new builder for constructing a `SyncConfig`.
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Database path is not empty
    /// - Concurrency is between 1 and [`MAX_CONCURRENCY`] per direction
    /// - Tick, poll and probe intervals are non-zero
    /// - Retry settings are consistent
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }

        for (name, value) in [
            ("max_concurrent_uploads", self.max_concurrent_uploads),
            ("max_concurrent_downloads", self.max_concurrent_downloads),
        ] {
            if value == 0 {
                return Err(Error::invalid(name, "must be greater than 0"));
            }
            if value > MAX_CONCURRENCY {
                return Err(Error::invalid(
                    name,
                    format!("exceeds maximum of {}", MAX_CONCURRENCY),
                ));
            }
        }

        if self.tick_interval.is_zero() {
            return Err(Error::invalid("tick_interval", "must be greater than 0"));
        }

        if self.status_poll_interval.is_zero() {
            return Err(Error::invalid(
                "status_poll_interval",
                "must be greater than 0",
            ));
        }

        if self.probe_ttl.is_zero() {
            return Err(Error::invalid("probe_ttl", "must be greater than 0"));
        }

        if self.event_buffer_size == 0 {
            return Err(Error::invalid("event_buffer_size", "must be greater than 0"));
        }

        if let Some(retry) = &self.retry {
            retry.validate()?;
        }

        Ok(())
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_file_system() -> Result<Arc<dyn FileSystemAccess>> {
    Err(Error::CapabilityMissing {
        capability: "FileSystemAccess".to_string(),
        message: "FileSystemAccess implementation is required to probe local track files. \
                 Desktop: enable the 'desktop-shims' feature to use TokioFileSystem. \
                 Other hosts: inject an implementation with .file_system()."
            .to_string(),
    })
}

#[cfg(feature = "desktop-shims")]
fn provide_default_file_system() -> Result<Arc<dyn FileSystemAccess>> {
    use bridge_desktop::TokioFileSystem;

    let fs: Arc<dyn FileSystemAccess> = Arc::new(TokioFileSystem::new());
    Ok(fs)
}

/// Builder for constructing [`SyncConfig`] instances.
#[derive(Default)]
pub struct SyncConfigBuilder {
    database_path: Option<PathBuf>,
    max_concurrent_uploads: Option<usize>,
    max_concurrent_downloads: Option<usize>,
    tick_interval: Option<Duration>,
    dequeue_pacing: Option<Duration>,
    probe_ttl: Option<Duration>,
    status_poll_interval: Option<Duration>,
    event_buffer_size: Option<usize>,
    retry: Option<RetryConfig>,
    file_system: Option<Arc<dyn FileSystemAccess>>,
    clock: Option<Arc<dyn Clock>>,
}

impl SyncConfigBuilder {
    /// Sets the queue database path.
    ///
    /// # Examples
    ///
    /// ```
    /// use core_runtime::config::SyncConfig;
    ///
    /// let builder = SyncConfig::builder()
    ///     .database_path("/path/to/sync.db");
    /// ```
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Sets how many uploads may run at once.
    ///
    /// Default: 3
    pub fn max_concurrent_uploads(mut self, limit: usize) -> Self {
        self.max_concurrent_uploads = Some(limit);
        self
    }

    /// Sets how many downloads may run at once.
    ///
    /// Default: 3
    pub fn max_concurrent_downloads(mut self, limit: usize) -> Self {
        self.max_concurrent_downloads = Some(limit);
        self
    }

    /// Sets the worker loop tick interval.
    ///
    /// Default: 1 second
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = Some(interval);
        self
    }

    /// Sets the delay between dequeues within one tick.
    ///
    /// Default: 1 second. Zero disables pacing.
    pub fn dequeue_pacing(mut self, delay: Duration) -> Self {
        self.dequeue_pacing = Some(delay);
        self
    }

    /// Sets the file existence cache lifetime.
    ///
    /// Default: 5 seconds
    pub fn probe_ttl(mut self, ttl: Duration) -> Self {
        self.probe_ttl = Some(ttl);
        self
    }

    /// Sets the status polling interval.
    ///
    /// Default: 5 seconds
    pub fn status_poll_interval(mut self, interval: Duration) -> Self {
        self.status_poll_interval = Some(interval);
        self
    }

    /// Sets the event bus capacity.
    ///
    /// Default: 100
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Enables automatic retry with backoff for failed transfers.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Sets the file system access implementation.
    ///
    /// If not provided, `TokioFileSystem` is used when the `desktop-shims`
    /// feature is enabled.
    pub fn file_system(mut self, fs: Arc<dyn FileSystemAccess>) -> Self {
        self.file_system = Some(fs);
        self
    }

    /// Sets the time source. Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the database path is missing,
    /// [`Error::InvalidSetting`] when a value is out of range and
    /// [`Error::CapabilityMissing`] when no `FileSystemAccess` is available.
    pub fn build(self) -> Result<SyncConfig> {
        let database_path = self.database_path.ok_or_else(|| {
            Error::Config("Database path is required. Use .database_path() to set it.".to_string())
        })?;

        let file_system = match self.file_system {
            Some(fs) => fs,
            None => provide_default_file_system()?,
        };

        let config = SyncConfig {
            database_path,
            max_concurrent_uploads: self.max_concurrent_uploads.unwrap_or(3),
            max_concurrent_downloads: self.max_concurrent_downloads.unwrap_or(3),
            tick_interval: self.tick_interval.unwrap_or(Duration::from_secs(1)),
            dequeue_pacing: self.dequeue_pacing.unwrap_or(Duration::from_secs(1)),
            probe_ttl: self.probe_ttl.unwrap_or(Duration::from_secs(5)),
            status_poll_interval: self
                .status_poll_interval
                .unwrap_or(Duration::from_secs(5)),
            event_buffer_size: self
                .event_buffer_size
                .unwrap_or(crate::events::DEFAULT_EVENT_BUFFER_SIZE),
            retry: self.retry,
            file_system,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::Result as BridgeResult;
    use std::path::Path;

    struct MockFileSystem;

    #[async_trait]
    impl FileSystemAccess for MockFileSystem {
        async fn exists(&self, _path: &Path) -> BridgeResult<bool> {
            Ok(true)
        }
    }

    fn builder() -> SyncConfigBuilder {
        SyncConfig::builder()
            .database_path(":memory:")
            .file_system(Arc::new(MockFileSystem))
    }

    #[test]
    fn test_defaults_follow_reference_timings() {
        let config = builder().build().unwrap();

        assert_eq!(config.max_concurrent_uploads, 3);
        assert_eq!(config.max_concurrent_downloads, 3);
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.dequeue_pacing, Duration::from_secs(1));
        assert_eq!(config.probe_ttl, Duration::from_secs(5));
        assert_eq!(config.status_poll_interval, Duration::from_secs(5));
        assert!(config.retry.is_none());
    }

    #[test]
    fn test_missing_database_path() {
        let result = SyncConfig::builder()
            .file_system(Arc::new(MockFileSystem))
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let result = builder().max_concurrent_downloads(0).build();
        assert!(matches!(
            result,
            Err(Error::InvalidSetting { setting: "max_concurrent_downloads", .. })
        ));
    }

    #[test]
    fn test_excessive_concurrency_rejected() {
        let result = builder().max_concurrent_uploads(MAX_CONCURRENCY + 1).build();
        assert!(matches!(result, Err(Error::InvalidSetting { .. })));
    }

    #[test]
    fn test_zero_intervals_rejected() {
        assert!(builder().tick_interval(Duration::ZERO).build().is_err());
        assert!(builder().status_poll_interval(Duration::ZERO).build().is_err());
        assert!(builder().probe_ttl(Duration::ZERO).build().is_err());
    }

    #[test]
    fn test_zero_pacing_allowed() {
        let config = builder().dequeue_pacing(Duration::ZERO).build().unwrap();
        assert!(config.dequeue_pacing.is_zero());
    }

    #[test]
    fn test_retry_validation() {
        let bad_attempts = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert!(builder().retry(bad_attempts).build().is_err());

        let inverted = RetryConfig {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(1),
            ..RetryConfig::default()
        };
        assert!(builder().retry(inverted).build().is_err());

        let config = builder().retry(RetryConfig::default()).build().unwrap();
        assert_eq!(config.retry, Some(RetryConfig::default()));
    }

    #[cfg(not(feature = "desktop-shims"))]
    #[test]
    fn test_missing_file_system_without_shims() {
        let result = SyncConfig::builder().database_path(":memory:").build();
        assert!(matches!(
            result,
            Err(Error::CapabilityMissing { capability, .. }) if capability == "FileSystemAccess"
        ));
    }
}
