//! Domain error type shared by the conversation core

use crate::db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Absent, or owned by someone else
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal(reason.into())
    }
}

impl From<DbError> for CoreError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::ConversationNotFound(id) => CoreError::NotFound(format!("conversation {id}")),
            DbError::MessageNotFound(id) => CoreError::NotFound(format!("message {id}")),
            DbError::SequenceExhausted(id) => CoreError::Conflict(format!("conversation {id} is full")),
            other => CoreError::Internal(other.to_string()),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_internal_except_not_found() {
        assert!(matches!(
            CoreError::from(DbError::MessageNotFound("m".into())),
            CoreError::NotFound(_)
        ));
        assert!(matches!(
            CoreError::from(DbError::TipRejected {
                conversation_id: "c".into(),
                message_id: "m".into(),
            }),
            CoreError::Internal(_)
        ));
        assert!(matches!(
            CoreError::from(DbError::SequenceExhausted("c".into())),
            CoreError::Conflict(_)
        ));
        assert!(matches!(
            CoreError::from(DbError::Unavailable("disk".into())),
            CoreError::Internal(_)
        ));
    }
}
