#![forbid(unsafe_code)]
//! Error types for roext.
//!
//! Defines `ExtError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for VFS-layer response codes.

use roext_types::ParseError;
use thiserror::Error;

/// Unified error type for all roext operations.
///
/// `Format` covers on-disk structures that violate required invariants
/// (bad magic, impossible geometry, malformed extent trees). `Corruption`
/// covers structures that decoded but point somewhere impossible.
/// Precondition violations (inode 0, negative refcounts, oversized inline
/// data) are programming errors and panic instead of surfacing here.
#[derive(Debug, Error)]
pub enum ExtError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("unsupported filesystem object: {0}")]
    Unsupported(&'static str),
}

impl ExtError {
    /// Convert this error into a POSIX errno suitable for VFS replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Format(_) | Self::Unsupported(_) => libc::EINVAL,
            Self::Corruption { .. } => libc::EIO,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
        }
    }

    /// Whether this error reports a format-invariant violation.
    #[must_use]
    pub fn is_format(&self) -> bool {
        matches!(self, Self::Format(_))
    }
}

impl From<ParseError> for ExtError {
    fn from(err: ParseError) -> Self {
        Self::Format(err.to_string())
    }
}

/// Result alias using `ExtError`.
pub type Result<T> = std::result::Result<T, ExtError>;
