use core_library::LibraryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Queue item {item_id} not found")]
    ItemNotFound { item_id: String },

    #[error("Invalid input: {field} - {message}")]
    InvalidInput { field: String, message: String },

    #[error("Invalid queue item ID: {0}")]
    InvalidItemId(String),

    #[error("Invalid queue status: {0}")]
    InvalidStatus(String),

    #[error("Invalid sync operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid worker state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Library error: {0}")]
    Library(#[from] LibraryError),
}

impl SyncError {
    pub(crate) fn invalid_input(field: &str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
