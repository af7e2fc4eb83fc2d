//! Protocol error types.

use gitferry_storage::StorageError;
use thiserror::Error;

/// Errors raised while parsing or driving the pkt-line protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A pkt-line or command line could not be parsed.
    #[error("malformed line: {0}")]
    MalformedLine(String),

    /// The client requested a service we do not speak.
    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),

    /// A flow step was invoked out of order.
    #[error("unexpected state: {0}")]
    UnexpectedState(&'static str),

    /// The client wanted an object the repository does not have.
    #[error("unknown object: {0}")]
    UnknownObject(String),
}

/// Errors raised while reading or writing pack files.
#[derive(Debug, Error)]
pub enum PackError {
    /// The pack header was missing or malformed.
    #[error("bad pack header: {0}")]
    BadHeader(String),

    /// An entry carried an unknown type tag.
    #[error("unknown pack entry type: {0}")]
    UnknownType(u8),

    /// An entry header could not be decoded.
    #[error("bad entry header: {0}")]
    BadEntryHeader(String),

    /// A delta entry referenced a base we cannot find.
    #[error("unresolved delta base: {0}")]
    UnresolvedBase(String),

    /// A delta payload was structurally invalid.
    #[error("malformed delta: {0}")]
    MalformedDelta(String),

    /// The delta's declared base size did not match the actual base.
    #[error("delta base size mismatch: declared {declared}, actual {actual}")]
    DeltaBaseMismatch { declared: usize, actual: usize },

    /// A copy instruction reached outside the base object.
    #[error("delta copy out of range: offset {offset} length {length} base {base}")]
    DeltaOutOfRange {
        offset: usize,
        length: usize,
        base: usize,
    },

    /// The reconstructed object did not match the delta's declared size.
    #[error("delta result size mismatch: declared {declared}, actual {actual}")]
    DeltaSizeMismatch { declared: usize, actual: usize },

    /// An inflated entry did not match its declared size.
    #[error("entry size mismatch: declared {declared}, actual {actual}")]
    SizeMismatch { declared: usize, actual: usize },

    /// The trailing checksum did not match the stream contents.
    #[error("pack checksum mismatch")]
    ChecksumMismatch,

    /// The stream ended before the pack was complete.
    #[error("truncated pack stream: {0}")]
    TruncatedStream(String),
}

/// Top-level error type for protocol operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Protocol-level failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Pack encoding or decoding failure.
    #[error(transparent)]
    Pack(#[from] PackError),

    /// Storage failure from the underlying repository.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Transport I/O failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}
