//! Errors surfaced by the service facade.

use core_sync::SyncError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// The queue database could not be opened or migrated
    #[error("Bootstrap failed while {stage}: {source}")]
    Bootstrap {
        stage: &'static str,
        #[source]
        source: SyncError,
    },

    #[error("Runtime error: {0}")]
    Runtime(#[from] core_runtime::Error),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Library error: {0}")]
    Library(#[from] core_library::LibraryError),
}

impl CoreError {
    pub(crate) fn bootstrap(stage: &'static str) -> impl FnOnce(SyncError) -> Self {
        move |source| Self::Bootstrap { stage, source }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
