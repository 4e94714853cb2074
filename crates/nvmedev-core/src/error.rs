//! Error taxonomy shared by every nvmedev crate
//!
//! Backends report [`NativeError`]s (an errno-style code plus a message). The
//! dispatcher wraps them with the specifier and backend that produced them, so
//! every [`Error`] that reaches a caller is actionable on its own.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result type for nvmedev operations
pub type Result<T> = std::result::Result<T, Error>;

/// Result type for backend-local operations
pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Failure reported by a backend's native layer (syscall, sysfs read, controller driver)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct NativeError {
    /// errno-style code (always positive)
    pub code: i32,
    /// What the backend was doing when it failed
    pub message: String,
}

impl NativeError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: code.abs(),
            message: message.into(),
        }
    }

    /// Wrap an I/O error, keeping its OS code (EIO when it has none)
    pub fn from_io(err: &std::io::Error, context: impl fmt::Display) -> Self {
        Self::new(
            err.raw_os_error().unwrap_or(libc::EIO),
            format!("{}: {}", context, err),
        )
    }

    /// Create from a driver return code (negative errno)
    pub fn from_rc(rc: i32, context: impl fmt::Display) -> Self {
        Self::new(rc, context.to_string())
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (errno {})", self.message, self.code)
    }
}

impl std::error::Error for NativeError {}

impl From<std::io::Error> for NativeError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(&err, "I/O error")
    }
}

/// Stable numeric error codes, one per [`Error`] variant.
///
/// Foreign bindings map these onto their native error types; values never
/// change within a major release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, IntoPrimitive, TryFromPrimitive)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum ErrorCode {
    ProbeMismatch = 1,
    OpenFailure = 2,
    IdentifyFailure = 3,
    EnumerateFailure = 4,
    GeometryFailure = 5,
    UseAfterClose = 6,
    CloseFailure = 7,
    CapacityExceeded = 8,
    BackendDisabled = 9,
    UnknownBackend = 10,
    InvalidSpecifier = 11,
    InvalidArgument = 12,
}

/// Error type for nvmedev operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No enabled backend recognizes the specifier
    #[error("no enabled backend recognizes specifier {specifier:?}")]
    ProbeMismatch { specifier: String },

    #[error("{backend}: failed to open {specifier:?}: {cause}")]
    OpenFailure {
        backend: String,
        specifier: String,
        cause: NativeError,
    },

    #[error("{backend}: failed to identify {specifier:?}: {cause}")]
    IdentifyFailure {
        backend: String,
        specifier: String,
        cause: NativeError,
    },

    /// Per-backend scan failure; `enumerate_all` downgrades it to a warning
    #[error("{backend}: enumeration failed: {cause}")]
    EnumerateFailure { backend: String, cause: NativeError },

    #[error("{backend}: failed to get geometry of {specifier:?}: {cause}")]
    GeometryFailure {
        backend: String,
        specifier: String,
        cause: NativeError,
    },

    /// Operation attempted on a handle that was already closed
    #[error("{backend}: handle for {specifier:?} is closed")]
    UseAfterClose { backend: String, specifier: String },

    /// Some resource could not be released cleanly; the rest were still released
    #[error("{backend}: failed to close {specifier:?}: {cause}")]
    CloseFailure {
        backend: String,
        specifier: String,
        cause: NativeError,
    },

    /// A string does not fit its fixed-capacity field
    #[error("{field} too long: {len} bytes (max {max})")]
    CapacityExceeded {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("backend {backend:?} is disabled")]
    BackendDisabled { backend: String },

    #[error("no backend named {name:?}")]
    UnknownBackend { name: String },

    #[error("invalid specifier {specifier:?}: {reason}")]
    InvalidSpecifier { specifier: String, reason: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ProbeMismatch { .. } => ErrorCode::ProbeMismatch,
            Error::OpenFailure { .. } => ErrorCode::OpenFailure,
            Error::IdentifyFailure { .. } => ErrorCode::IdentifyFailure,
            Error::EnumerateFailure { .. } => ErrorCode::EnumerateFailure,
            Error::GeometryFailure { .. } => ErrorCode::GeometryFailure,
            Error::UseAfterClose { .. } => ErrorCode::UseAfterClose,
            Error::CloseFailure { .. } => ErrorCode::CloseFailure,
            Error::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            Error::BackendDisabled { .. } => ErrorCode::BackendDisabled,
            Error::UnknownBackend { .. } => ErrorCode::UnknownBackend,
            Error::InvalidSpecifier { .. } => ErrorCode::InvalidSpecifier,
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
        }
    }

    /// The backend-local cause, if this error wraps one
    pub fn native(&self) -> Option<&NativeError> {
        match self {
            Error::OpenFailure { cause, .. }
            | Error::IdentifyFailure { cause, .. }
            | Error::EnumerateFailure { cause, .. }
            | Error::GeometryFailure { cause, .. }
            | Error::CloseFailure { cause, .. } => Some(cause),
            _ => None,
        }
    }

    /// Underlying errno, if any
    pub fn errno(&self) -> Option<i32> {
        self.native().map(|cause| cause.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_error_from_io_keeps_os_code() {
        let io = std::io::Error::from_raw_os_error(libc::ENOENT);
        let err = NativeError::from_io(&io, "open /dev/nvme9n1");
        assert_eq!(err.code, libc::ENOENT);
        assert!(err.message.starts_with("open /dev/nvme9n1"));
    }

    #[test]
    fn test_native_error_from_rc_is_positive() {
        let err = NativeError::from_rc(-libc::EBUSY, "qpair alloc");
        assert_eq!(err.code, libc::EBUSY);
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(u32::from(ErrorCode::ProbeMismatch), 1);
        assert_eq!(u32::from(ErrorCode::UseAfterClose), 6);
        assert_eq!(u32::from(ErrorCode::InvalidArgument), 12);
        assert_eq!(ErrorCode::try_from(9u32).ok(), Some(ErrorCode::BackendDisabled));
        assert!(ErrorCode::try_from(0u32).is_err());
    }

    #[test]
    fn test_error_carries_context() {
        let err = Error::OpenFailure {
            backend: "kblk".to_string(),
            specifier: "kblk:///dev/nvme0n1".to_string(),
            cause: NativeError::new(libc::EACCES, "open /dev/nvme0n1"),
        };
        assert_eq!(err.code(), ErrorCode::OpenFailure);
        assert_eq!(err.errno(), Some(libc::EACCES));
        let msg = err.to_string();
        assert!(msg.contains("kblk"));
        assert!(msg.contains("kblk:///dev/nvme0n1"));
        assert!(msg.contains(&libc::EACCES.to_string()));
    }
}
