//! Unified error types for devmem.

use std::fmt;

/// Result type for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Unified error type for all handle and memory operations.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// An index or element count is outside the permitted range.
    #[error("Index out of bounds: {0}")]
    IndexOutOfBounds(String),

    /// An argument violates the operation's contract.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The underlying native resource has already been released.
    #[error("Already closed: {0}")]
    AlreadyClosed(String),

    /// The release strategy reported a non-zero status; the native resource leaked.
    #[error("Leaked native resource: rc = {code} {address}")]
    ReleaseFailed {
        /// Status code returned by the release strategy.
        code: i64,
        /// Diagnostic rendering of the address that failed to release.
        address: String,
    },

    /// Native allocation failed.
    #[error("Memory allocation failed: size={size}, reason={reason}")]
    AllocationFailed {
        /// Requested allocation size in bytes.
        size: u64,
        /// Reason for allocation failure.
        reason: String,
    },

    /// Native data transfer failed.
    #[error("Transfer error: {0}")]
    TransferFailed(String),

    /// Backend-specific error.
    #[error("{backend} error: {message}")]
    BackendError {
        /// Which backend produced the error.
        backend: BackendKind,
        /// Error message from the backend.
        message: String,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal error (should not happen).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`MemoryError`].
///
/// Usage errors are fixed by the caller, state errors mean the backing
/// allocation is gone, release errors are leaks, and native errors come
/// verbatim from the backend. None of them are retried by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad offsets, out-of-range lengths.
    Usage,
    /// Operating on (or slicing from) a closed root.
    State,
    /// Release strategy reported failure.
    Release,
    /// Allocation or transfer fault in the native collaborator.
    Native,
    /// Process configuration problem.
    Config,
    /// Broken internal invariant.
    Internal,
}

/// Backend identifier for error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Host memory stand-in backend.
    Host,
    /// NVIDIA CUDA backend.
    Cuda,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Host => write!(f, "Host"),
            BackendKind::Cuda => write!(f, "CUDA"),
        }
    }
}

impl MemoryError {
    /// Create a backend-specific error.
    pub fn backend(backend: BackendKind, message: impl Into<String>) -> Self {
        MemoryError::BackendError {
            backend,
            message: message.into(),
        }
    }

    /// Create an allocation error.
    pub fn allocation(size: u64, reason: impl Into<String>) -> Self {
        MemoryError::AllocationFailed {
            size,
            reason: reason.into(),
        }
    }

    /// Create a release failure for a non-zero cleaner status.
    pub fn release_failed(code: i64, address: impl fmt::Display) -> Self {
        MemoryError::ReleaseFailed {
            code,
            address: address.to_string(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MemoryError::IndexOutOfBounds(_) | MemoryError::InvalidArgument(_) => ErrorKind::Usage,
            MemoryError::AlreadyClosed(_) => ErrorKind::State,
            MemoryError::ReleaseFailed { .. } => ErrorKind::Release,
            MemoryError::AllocationFailed { .. }
            | MemoryError::TransferFailed(_)
            | MemoryError::BackendError { .. } => ErrorKind::Native,
            MemoryError::InvalidConfig(_) => ErrorKind::Config,
            MemoryError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if this is a caller-fixable usage error.
    pub fn is_usage(&self) -> bool {
        self.kind() == ErrorKind::Usage
    }

    /// Check if this error reports a released root.
    pub fn is_already_closed(&self) -> bool {
        self.kind() == ErrorKind::State
    }
}

#[cfg(feature = "cuda")]
impl From<cudarc::driver::DriverError> for MemoryError {
    fn from(err: cudarc::driver::DriverError) -> Self {
        MemoryError::backend(BackendKind::Cuda, err.to_string())
    }
}
