#![forbid(unsafe_code)]
//! Error types for FrankenFS writeback ordering.
//!
//! # Error Taxonomy
//!
//! The ordered-extent layer distinguishes three kinds of failure:
//!
//! | Kind | Handling | Example |
//! |------|----------|---------|
//! | Recoverable | `Err(FfsError)` propagated with `?` | per-inode extent limit reached |
//! | Caller misuse | `Err(FfsError::InvalidRange)` / `InvalidConfig` | zero-length reservation |
//! | Invariant violation | `panic!` at the call site | overlapping reservation |
//!
//! Invariant violations never surface as an `FfsError`: an overlapping
//! reservation means disk space was handed out twice, and continuing would
//! persist metadata for the wrong bytes.
//!
//! ## errno Mapping
//!
//! Every `FfsError` variant maps to exactly one POSIX errno via
//! [`FfsError::to_errno`]. The mapping is exhaustive (no wildcard arms) so
//! adding a new variant is a compile error until its errno is assigned.
//!
//! | Variant | errno | Constant |
//! |---------|-------|----------|
//! | `Io` | raw OS error or `EIO` | 5 |
//! | `InvalidRange` | `EINVAL` | 22 |
//! | `InvalidConfig` | `EINVAL` | 22 |
//! | `NoSpace` | `ENOSPC` | 28 |
//! | `ReadOnly` | `EROFS` | 30 |
//!
//! ## Design Constraints
//!
//! - `ffs-error` MUST NOT depend on `ffs-types` (no cyclic deps).
//! - All string payloads are owned (`String`) so errors can cross thread
//!   boundaries (completion workers, flushers) without lifetimes.

use thiserror::Error;

/// Unified error type for FrankenFS writeback ordering.
#[derive(Debug, Error)]
pub enum FfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A byte range is empty or its end overflows `u64`.
    #[error("invalid byte range: start={start} len={len}")]
    InvalidRange { start: u64, len: u64 },

    /// A configuration value is out of its supported range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No room for another in-flight extent (or no free space downstream).
    #[error("no space left on device")]
    NoSpace,

    /// The filesystem is read-only and persistence was refused.
    #[error("read-only filesystem")]
    ReadOnly,
}

impl FfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive: every variant has an explicit arm.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::InvalidRange { .. } | Self::InvalidConfig(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::ReadOnly => libc::EROFS,
        }
    }
}

/// Result alias using `FfsError`.
pub type Result<T> = std::result::Result<T, FfsError>;
