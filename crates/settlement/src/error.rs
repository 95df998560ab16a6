//! Settlement error types
//!
//! Expected duplicate-delivery outcomes (already settled, already resolved)
//! are NOT errors; they are variants of the result enums in the modules
//! that produce them. The taxonomy here covers real failures only.

use thiserror::Error;

/// Settlement-specific errors
#[derive(Debug, Error)]
pub enum SettlementError {
    /// Payload rejected (amount/currency mismatch, malformed data).
    /// Never retried: the same input can never succeed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Store-level failure (lock timeout, lost connection). No effects
    /// were committed; the caller may retry with the same idempotency key.
    #[error("Transient store error: {0}")]
    TransientStore(String),

    /// A persisted invariant was violated (duplicate offer insert, missing
    /// expected row). Fatal for this event; logged loudly, left for manual
    /// review, never silently swallowed.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for SettlementError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                // PostgreSQL unique violation: a guarded insert fired twice
                if db_err.code().as_deref() == Some("23505") {
                    return SettlementError::InvariantViolation(format!(
                        "unique constraint violated: {}",
                        db_err
                    ));
                }
                SettlementError::TransientStore(db_err.to_string())
            }
            sqlx::Error::RowNotFound => SettlementError::NotFound(err.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                SettlementError::TransientStore(err.to_string())
            }
            _ => SettlementError::TransientStore(err.to_string()),
        }
    }
}

pub type SettlementResult<T> = Result<T, SettlementError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: SettlementError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, SettlementError::NotFound(_)));
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        let err: SettlementError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, SettlementError::TransientStore(_)));
    }
}
