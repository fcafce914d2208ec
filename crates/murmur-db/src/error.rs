//! Error taxonomy of the messaging core.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    /// No verified identity was presented.
    #[error("not authenticated")]
    Unauthenticated,

    /// A referenced user, conversation or message does not exist, or the
    /// caller is not a participant of it.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The action does not apply to this kind of conversation or message.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("database lock poisoned: {0}")]
    LockPoisoned(String),
}

impl ChatError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
