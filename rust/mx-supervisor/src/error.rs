use std::fmt;
use std::io;

use mif_primitives::{Exhausted, RamFreeError, RefError, RingError};

/// Errors surfaced by the supervisor's synchronous operations.
///
/// Asynchronous failures (a firmware panic, a CRC mismatch) never show up
/// here; clients learn about those through their callbacks.
#[derive(Debug)]
pub enum MxError {
    /// An allocator ran dry: shared RAM, interrupt bits, mailboxes, ring slots.
    ResourceExhausted(&'static str),
    /// A bounded wait expired.
    Timeout(&'static str),
    /// The coprocessor sent something we cannot interpret.
    Protocol(String),
    /// The firmware image failed a version, size or CRC check.
    ValidationFailed(String),
    AlreadyInProgress,
    NotFound,
    Busy,
    /// HAL I/O failure, or the service manager's error flag is set.
    Io(io::Error),
    /// The management transport has been marked errored by the failure path.
    TransportErrored,
    /// The wait was cancelled by the failure path.
    Aborted,
    /// Operation not valid in the current lifecycle state.
    InvalidState(&'static str),
}

impl fmt::Display for MxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MxError::ResourceExhausted(what) => write!(f, "{what} exhausted"),
            MxError::Timeout(what) => write!(f, "timed out waiting for {what}"),
            MxError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            MxError::ValidationFailed(msg) => write!(f, "firmware validation failed: {msg}"),
            MxError::AlreadyInProgress => write!(f, "already in progress"),
            MxError::NotFound => write!(f, "not found"),
            MxError::Busy => write!(f, "busy"),
            MxError::Io(err) => write!(f, "io error: {err}"),
            MxError::TransportErrored => write!(f, "management transport is in error"),
            MxError::Aborted => write!(f, "aborted by failure handling"),
            MxError::InvalidState(msg) => write!(f, "invalid state: {msg}"),
        }
    }
}

impl std::error::Error for MxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MxError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl MxError {
    pub(crate) fn errored() -> Self {
        MxError::Io(io::Error::other("service manager is in error"))
    }
}

impl From<io::Error> for MxError {
    fn from(value: io::Error) -> Self {
        MxError::Io(value)
    }
}

impl From<Exhausted> for MxError {
    fn from(_: Exhausted) -> Self {
        MxError::ResourceExhausted("bitmap")
    }
}

impl From<RefError> for MxError {
    fn from(value: RefError) -> Self {
        MxError::Protocol(value.to_string())
    }
}

impl From<RingError> for MxError {
    fn from(value: RingError) -> Self {
        MxError::Protocol(value.to_string())
    }
}

impl From<RamFreeError> for MxError {
    fn from(_: RamFreeError) -> Self {
        MxError::NotFound
    }
}
