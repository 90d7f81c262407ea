//! Engine error taxonomy.
//!
//! Every fallible operation in the engine reports one of the kinds below,
//! independent of the transport that carried the request. Errors local to a
//! single operation are delivered through that operation's completion and do
//! not escape it; collection-wide faults latch a registry flag instead.

use std::io;

use log::error;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Log an invariant violation and crash. `Internal` is fatal by design:
/// the engine prefers restart to continuing past corrupted state, so every
/// consumer boundary funnels `Internal` errors through here rather than
/// propagating them like ordinary failures.
pub(crate) fn fatal_invariant(msg: &str) -> ! {
    error!("internal invariant violation: {msg}");
    panic!("internal invariant violation: {msg}");
}

/// Error kinds surfaced by the storage engine, scheduler and SID cache.
///
/// Completion records are cloned on test, so I/O failures carry the rendered
/// message rather than the non-cloneable [`io::Error`] itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed request; rejected before any side effect.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The referenced collection is not hosted on this server.
    #[error("no such collection")]
    NoSuchCollection,

    /// The handle is not registered in its collection.
    #[error("no such handle")]
    NoSuchHandle,

    /// The keyval map has no entry for the requested key.
    #[error("no such key")]
    NoSuchKey,

    /// A unique insert (handle, key or fs_id) collided with a live entry.
    #[error("entry already exists")]
    Exist,

    /// The collection's handle range has no free handles left.
    #[error("out of handles")]
    OutOfHandles,

    /// The backing store is out of space.
    #[error("no space left on backing store")]
    NoSpace,

    /// Backing-store I/O failed after the retry budget was spent.
    #[error("backing store I/O error: {0}")]
    Io(String),

    /// The deadline expired before the request became ready. No side effects.
    #[error("deadline expired")]
    Timeout,

    /// The request was cancelled before it became ready.
    #[error("cancelled")]
    Cancelled,

    /// The collection has latched a persistent fault; mutating ops fail fast.
    #[error("collection is degraded")]
    Degraded,

    /// The collection is read-only; mutating ops fail fast.
    #[error("collection is read-only")]
    ReadOnly,

    /// Capability check failed; the caller must re-authenticate.
    #[error("permission denied")]
    Permission,

    /// Invariant violation. The engine prefers restart to silent corruption;
    /// callers observing this should treat the process as unrecoverable.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether a worker may retry the failed backing-store call.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Io(_))
    }

    /// Escalate at a consumer boundary: an `Internal` error crashes the
    /// process via [`fatal_invariant`]; every other kind passes through.
    /// Producers still return `Internal` normally so their callers (and
    /// unit tests) can observe it; the queue workers, the engine surface
    /// and flow completion all escalate before results reach a caller.
    pub(crate) fn fatal_on_internal(self) -> EngineError {
        if let EngineError::Internal(msg) = &self {
            fatal_invariant(msg);
        }
        self
    }
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOSPC) => EngineError::NoSpace,
            Some(libc::EDQUOT) => EngineError::NoSpace,
            _ => EngineError::Io(err.to_string()),
        }
    }
}
