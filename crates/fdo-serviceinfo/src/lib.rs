//! # fdo-serviceinfo
//!
//! ServiceInfo streaming for the TO2 encrypted phase.
//!
//! ServiceInfo is a sequence of logical `(module:message, value)` pairs
//! whose values may be arbitrarily large, carried over MTU-bounded CBOR
//! frames. This crate provides:
//!
//! - [`pipe`]: the chunk-out pipe (producer side: logical KVs in,
//!   MTU-bounded frames out, with backpressure and forced message
//!   boundaries) and the chunk-in reassembler (frames in, logical KVs
//!   out, in producer order).
//! - [`devmod`]: the mandatory device module — descriptor table emission
//!   and the paginated `devmod:modules` list, plus the owner-side
//!   accumulator.
//! - [`modules`]: the owner FSIM module contract (explicit serializable
//!   cursors) and the `fdo.download` implementation.

pub mod devmod;
pub mod modules;
pub mod pipe;

pub use devmod::{Devmod, DevmodAccumulator};
pub use modules::{cleanup_modules, DownloadModule, ModuleCursor, ModuleStep, OwnerModule};
pub use pipe::{chunk_out, ChunkIn, Frame, Kv, ReadOutcome, ServiceInfoReader, ServiceInfoWriter};

/// Error types for ServiceInfo streaming.
#[derive(Debug, thiserror::Error)]
pub enum ServiceInfoError {
    /// The negotiated MTU cannot fit the key plus a minimum value chunk.
    #[error("MTU too small for service info key")]
    SizeTooSmall,

    /// The other end of the pipe is gone.
    #[error("service info pipe closed")]
    Closed,

    /// A module rejected a message or could not produce its next one.
    #[error("module error: {0}")]
    Module(String),

    /// Codec failure.
    #[error(transparent)]
    Cbor(#[from] fdo_cbor::CborError),
}

pub type Result<T> = std::result::Result<T, ServiceInfoError>;
