//! Transfer protocol implementation for Gitferry.
//!
//! This crate implements the pack file format and the smart transfer
//! protocol, enabling standard clients to push to and fetch from
//! Gitferry repositories over any byte stream.

mod error;
mod handler;
mod negotiate;
mod pack;
mod pktline;

pub use error::{Error, PackError, ProtocolError};
pub use handler::{Handler, ReceivePack, ReceiveState, Service, UploadPack, UploadState};
pub use negotiate::{
    Capabilities, CapabilityState, RefNegotiator, RefUpdate, ADVERTISED_CAPABILITIES,
};
pub use pack::{
    delta::{delta_header_size, encode_delta, patch_delta, DeltaInstruction},
    PackEntryKind, PackReader, PackWriter,
};
pub use pktline::{PktLine, PktLineReader, PktLineWriter, MAX_PKT_PAYLOAD};

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;
