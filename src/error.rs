//! Error taxonomy for the control-plane surface.
//!
//! The fast path never returns a `RelayError`: a failed enqueue is a
//! `Transient` condition that the forwarding functions absorb into a
//! counter and retry on the next worker tick (§7). Everything here is
//! reached only from the control thread.

use thiserror::Error;

/// Stable small integer returned across the control-plane boundary.
///
/// Callers outside this crate (an RPC service, a CLI, a test harness)
/// are expected to match on this code rather than the error's `Display`
/// text, which may change wording between releases.
pub type StatusCode = i32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Relay id out of range, malformed PCI address, duplicated endpoint path.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// Attach attempted on a side that is not `UNINIT` (and the call was not
    /// `conditional` against an identical, already-applied request).
    #[error("already bound: {0}")]
    AlreadyBound(String),

    /// Remove attempted on a side that is already `UNINIT` (and the call was
    /// not `conditional`).
    #[error("not bound: {0}")]
    NotBound(String),

    /// The underlying port/vhost backend reported a failure during attach,
    /// queue setup, mempool allocation, or bond creation. Any partially
    /// constructed state is rolled back before this is returned.
    #[error("backend failure: {0}")]
    BackendFail(String),

    /// Cooperative removal did not observe the expected state within the
    /// control thread's poll budget (~1s). Teardown proceeds regardless;
    /// this is reported so the caller can log it.
    #[error("timed out waiting for state transition: {0}")]
    Timeout(String),
}

impl RelayError {
    /// Stable status code for this error kind. Two errors of the same kind
    /// always produce the same code regardless of the message payload.
    pub fn as_status_code(&self) -> StatusCode {
        match self {
            RelayError::InvalidArg(_) => 1,
            RelayError::AlreadyBound(_) => 2,
            RelayError::NotBound(_) => 3,
            RelayError::BackendFail(_) => 4,
            RelayError::Timeout(_) => 5,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
