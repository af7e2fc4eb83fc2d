//! Storage error types.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested object was not found.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// The requested reference was not found.
    #[error("reference not found: {0}")]
    RefNotFound(String),

    /// An object could not be parsed or constructed.
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// A reference was malformed or could not be resolved.
    #[error("invalid reference: {0}")]
    InvalidRef(String),
}
