//! Defines error types and codes.

use thiserror::Error;

/// An error reported by the device core.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input, such as an invalid sample spec or channel map.
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// The operation is disabled by the device's flags or not offered by the
    /// implementor.
    #[error("operation not supported")]
    NotSupported,
    /// The operation is not allowed in the entity's current state.
    #[error("bad state: {0}")]
    BadState(String),
    /// A named entity (port, device, mapping, ...) does not exist.
    #[error("no such entity: {0}")]
    NoEntity(String),
    /// A name is already registered.
    #[error("entity exists: {0}")]
    Exist(String),
    /// A per-device limit (such as the maximum number of streams) was hit.
    #[error("too large")]
    TooLarge,
    /// Exclusive access (passthrough) is held by another stream.
    #[error("device busy")]
    Busy,
    /// The implementor does not handle a message or hook it is required to.
    #[error("missing implementation")]
    NotImplemented,
    /// An I/O error from the poll loop or the mixer backend.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
