use thiserror::Error;

#[derive(Error, Debug)]
pub enum LibraryError {
    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    /// The external library database failed to answer
    #[error("Library source error: {0}")]
    Source(String),
}

impl LibraryError {
    pub fn not_found(entity_type: &str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.to_string(),
            id: id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LibraryError>;
