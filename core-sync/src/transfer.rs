//! Contract for the opaque upload/download primitives.

use async_trait::async_trait;
use core_runtime::events::TransferEvent;
use thiserror::Error;

use crate::queue::{QueueItem, SyncOperation};

/// Transfer failure; the message is stored on the queue item verbatim
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("{0}")]
    Failed(String),
}

impl TransferError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// What a successful transfer reports back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Set by downloads that produced a local file
    pub downloaded: Option<TransferEvent>,
}

impl TransferOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn downloaded(event: TransferEvent) -> Self {
        Self {
            downloaded: Some(event),
        }
    }
}

/// Performs the actual file transfer for a claimed queue item
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    async fn perform_upload(&self, item: &QueueItem) -> Result<TransferOutcome, TransferError>;

    async fn perform_download(&self, item: &QueueItem)
        -> Result<TransferOutcome, TransferError>;
}

/// Dispatch on the item's direction
pub(crate) async fn execute(
    executor: &dyn TransferExecutor,
    item: &QueueItem,
) -> Result<TransferOutcome, TransferError> {
    match item.operation {
        SyncOperation::Upload => executor.perform_upload(item).await,
        SyncOperation::Download => executor.perform_download(item).await,
    }
}
