//! Error categories surfaced at the layer boundary.
//!
//! Backend result codes never leak past this type: every backend converts its native codes
//! into one of these variants before returning.

use crate::backend::BackendKind;

pub type RhiResult<T> = Result<T, RhiError>;

#[derive(Debug, thiserror::Error)]
pub enum RhiError {
    /// Device or backend initialization failed; the process cannot render.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The requested backend is not compiled in or not present on this machine.
    #[error("backend {0:?} is not available on this platform")]
    BackendUnavailable(BackendKind),

    /// No queue family / feature on this device satisfies the request.
    #[error("device capability missing: {0}")]
    DeviceCapability(String),

    /// A `create_*` descriptor violates the device limits or is malformed.
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// The object is not in a state that permits the call.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The backend rejected a queue submission; the device is degraded afterwards.
    #[error("submission rejected: {0}")]
    Submission(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("device lost")]
    DeviceLost,

    /// The device is shutting down or already destroyed.
    #[error("device is shutting down")]
    ShuttingDown,

    /// A blocking wait was requested on a thread that would have to make progress for it.
    #[error("would deadlock: {0}")]
    WouldDeadlock(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other backend failure, already translated to text.
    #[error("backend error: {0}")]
    Backend(String),
}

impl RhiError {
    #[inline]
    pub fn invalid_descriptor(msg: impl Into<String>) -> Self {
        Self::InvalidDescriptor(msg.into())
    }

    #[inline]
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Whether this error leaves the device unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RhiError::Fatal(_) | RhiError::BackendUnavailable(_) | RhiError::DeviceLost)
    }
}
