//! Error types for media relation and payload operations
//!
//! Every variant carries enough context (relation variant, owner type/id,
//! item id or storage path) for a caller to build a meaningful message.

use crate::models::RelationVariant;

/// Errors surfaced by the registry, the relation store, the relation
/// managers and the file lifecycle controller.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// The item is already related to this owner
    #[error("{variant} relation already exists: {owner_type}#{owner_id} -> item {item_id}")]
    ConstraintViolation {
        variant: RelationVariant,
        owner_type: String,
        owner_id: i64,
        item_id: i64,
    },

    /// The relation points at an item that does not exist
    #[error("{variant} item {item_id} does not exist")]
    DanglingReference { variant: RelationVariant, item_id: i64 },

    /// The owner has not been persisted yet
    #[error("{owner_type} instance needs an id before its {variant} relations can be used")]
    UnboundOwner {
        owner_type: String,
        variant: RelationVariant,
    },

    /// The requested row does not exist
    #[error("{variant} not found: {message}")]
    NotFound {
        variant: RelationVariant,
        message: String,
    },

    /// The owner type is not registered for this relation variant
    #[error("{owner_type} is not registered for {variant} relations")]
    NotRegistered {
        owner_type: String,
        variant: RelationVariant,
    },

    /// Payload I/O failure
    #[error("Storage error at '{path}': {source}")]
    StorageError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

impl MediaError {
    /// Wrap an I/O failure for `path`
    pub fn storage(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::StorageError {
            path: path.into(),
            source,
        }
    }

    /// Shorthand for a [`MediaError::NotFound`] with a formatted message
    pub fn not_found(variant: RelationVariant, message: impl Into<String>) -> Self {
        Self::NotFound {
            variant,
            message: message.into(),
        }
    }
}
