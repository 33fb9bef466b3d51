#![forbid(unsafe_code)]
//! Error types for xipfs.
//!
//! Defines `XipfsError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings for POSIX-shaped callers.

use thiserror::Error;

/// Unified error type for all xipfs operations.
#[derive(Debug, Error)]
pub enum XipfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path is empty")]
    EmptyPath,

    #[error("path contains an invalid character")]
    BadPathCharacter,

    #[error("path too long")]
    PathTooLong,

    #[error("record at {offset:#x} is not page-aligned")]
    Misaligned { offset: u64 },

    #[error("address {offset:#x} lies outside the NVM space")]
    OutsideNvm { offset: u64 },

    #[error("record at {offset:#x} is improperly linked")]
    BadLink { offset: u64 },

    #[error("offset exceeds the maximum file position")]
    OffsetBeyondEnd,

    #[error("NVM controller failure: erase or program verification failed")]
    NvmController,

    #[error("unreserved word at {offset:#x} is not in the erase state")]
    TailNotErased { offset: u64 },

    #[error("bad magic number in mount structure")]
    BadMagic,

    #[error("bad page count in mount structure")]
    BadPageCount,

    #[error("file system full")]
    Full,

    #[error("insufficient space to create the file")]
    NoSpace,

    #[error("file exists")]
    Exists,

    #[error("execution flag is neither 0 nor 1")]
    BadExecFlag,

    #[error("no such file or directory")]
    NotFound,

    #[error("is a directory")]
    IsDirectory,

    #[error("not a directory")]
    NotDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("open-file table exhausted")]
    TooManyOpenFiles,

    #[error("bad file handle")]
    BadHandle,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("resource busy")]
    Busy,

    #[error("reservation quota exceeded")]
    Quota,

    #[error("permission denied")]
    AccessDenied,
}

impl XipfsError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Misaligned { .. }
            | Self::OutsideNvm { .. }
            | Self::BadLink { .. }
            | Self::TailNotErased { .. }
            | Self::NvmController => libc::EIO,
            Self::EmptyPath | Self::NotFound => libc::ENOENT,
            Self::BadPathCharacter
            | Self::OffsetBeyondEnd
            | Self::BadMagic
            | Self::BadPageCount
            | Self::BadExecFlag
            | Self::InvalidArgument => libc::EINVAL,
            Self::PathTooLong => libc::ENAMETOOLONG,
            Self::Full | Self::Quota => libc::EDQUOT,
            Self::NoSpace => libc::ENOSPC,
            Self::Exists => libc::EEXIST,
            Self::IsDirectory => libc::EISDIR,
            Self::NotDirectory => libc::ENOTDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::TooManyOpenFiles => libc::ENFILE,
            Self::BadHandle => libc::EBADF,
            Self::Busy => libc::EBUSY,
            Self::AccessDenied => libc::EACCES,
        }
    }

    /// Collapse the capacity errors into the quota error the create paths
    /// report to POSIX callers.
    #[must_use]
    pub fn into_quota(self) -> Self {
        match self {
            Self::Full | Self::NoSpace => Self::Quota,
            other => other,
        }
    }
}

/// Result alias using `XipfsError`.
pub type Result<T> = std::result::Result<T, XipfsError>;
