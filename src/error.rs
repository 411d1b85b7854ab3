//! Error types for the schema and serialization layer.

use thiserror::Error;

/// Errors surfaced to callers. Constraint failures are mapped to their
/// domain variant at the statement that hit them; nothing here is retried.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("customer name already taken: {0}")]
    CustomerExists(String),

    #[error("item name already taken: {0}")]
    ItemExists(String),

    #[error("review references a missing customer or item")]
    BrokenReference,

    #[error("customer not found: {0}")]
    CustomerNotFound(i64),

    #[error("item not found: {0}")]
    ItemNotFound(i64),

    #[error("review not found: {0}")]
    ReviewNotFound(i64),

    #[error("invalid serialization rule '{rule}' on {entity}: {reason}")]
    InvalidRule {
        entity: &'static str,
        rule: String,
        reason: String,
    },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
