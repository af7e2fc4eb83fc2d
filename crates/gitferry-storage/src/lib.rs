//! Object storage for Gitferry.
//!
//! This crate provides content-addressed storage for version control
//! objects (blobs, trees, commits, tags) and reference management.

mod error;
mod object;
mod refs;
mod store;

pub use error::StorageError;
pub use object::{GitObject, ObjectId, ObjectType, TreeEntry};
pub use refs::{RefStore, Reference};
pub use store::{ObjectStore, Repository};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
