//! Storage-layer error type. Repository methods return this instead of
//! `sqlx::Error` directly so callers upstream don't need to depend on sqlx.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StorageError> for loanserve_core::error::CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Database(e) => loanserve_core::error::CoreError::TransientIo(e.to_string()),
            StorageError::NotFound(msg) => loanserve_core::error::CoreError::BusinessRejection(msg),
            StorageError::Serialization(e) => loanserve_core::error::CoreError::Validation(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loanserve_core::error::CoreError;

    #[test]
    fn not_found_maps_to_a_business_rejection_not_a_retryable_error() {
        let err: CoreError = StorageError::NotFound("payment 01ABC".into()).into();
        assert!(matches!(err, CoreError::BusinessRejection(_)));
    }

    #[test]
    fn serialization_failure_maps_to_a_validation_error() {
        let bad_json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: CoreError = StorageError::Serialization(bad_json).into();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
