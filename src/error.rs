//! Error types for remote archive operations.
//!
//! Every fallible library operation returns [`Result<T>`]. Presentation
//! layers that only need to decide what to show (or whether a retry button
//! makes sense) should use [`Error::kind`] and [`Error::is_retryable`]
//! instead of matching on variants.

use std::io;
use std::path::PathBuf;

/// Errors produced while fetching directories and entries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport failure, timeout, unexpected status or a response whose
    /// length does not match the requested range.
    #[error("network error: {0}")]
    Network(String),

    /// No End of Central Directory record in the fetched tail.
    #[error("end of central directory record not found")]
    DirectoryNotFound,

    #[error("corrupt central directory: {0}")]
    CorruptDirectory(String),

    /// The local header disagrees with the central directory.
    #[error("local header of {path} is inconsistent with the central directory: {reason}")]
    DirectoryInconsistency { path: String, reason: String },

    #[error("unsupported compression method {method} for {path}")]
    UnsupportedCompression { path: String, method: u16 },

    #[error("encrypted entries are not supported: {0}")]
    Encrypted(String),

    #[error("CRC-32 mismatch for {path}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        path: String,
        expected: u32,
        actual: u32,
    },

    #[error("failed to inflate {path}: {reason}")]
    Inflate { path: String, reason: String },

    #[error("{path} decompressed to {actual} bytes, expected {expected}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    /// An entry was requested before the directory finished loading.
    #[error("archive directory has not been loaded")]
    DirectoryNotLoaded,

    #[error("no entry named {0} in the archive")]
    EntryNotFound(String),

    #[error("download of {0} was cancelled")]
    Cancelled(String),

    #[error("cache I/O error at {}: {source}", path.display())]
    CacheIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Coarse error categories handed to presentation layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    DirectoryNotFound,
    CorruptDirectory,
    DirectoryInconsistency,
    UnsupportedCompression,
    ChecksumMismatch,
    DirectoryNotLoaded,
    EntryNotFound,
    Cancelled,
    CacheIo,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Network(_) => ErrorKind::Network,
            Error::DirectoryNotFound => ErrorKind::DirectoryNotFound,
            Error::CorruptDirectory(_) => ErrorKind::CorruptDirectory,
            Error::DirectoryInconsistency { .. } => ErrorKind::DirectoryInconsistency,
            Error::UnsupportedCompression { .. } | Error::Encrypted(_) => {
                ErrorKind::UnsupportedCompression
            }
            Error::ChecksumMismatch { .. } | Error::Inflate { .. } | Error::SizeMismatch { .. } => {
                ErrorKind::ChecksumMismatch
            }
            Error::DirectoryNotLoaded => ErrorKind::DirectoryNotLoaded,
            Error::EntryNotFound(_) => ErrorKind::EntryNotFound,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::CacheIo { .. } => ErrorKind::CacheIo,
        }
    }

    /// Whether repeating the same call may succeed.
    ///
    /// Transport failures and integrity failures (which may come from a
    /// corrupted transfer) are retryable. Malformed archives, unsupported
    /// entries and sequencing mistakes are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Network | ErrorKind::ChecksumMismatch | ErrorKind::Cancelled
        )
    }

    pub(crate) fn network(msg: impl Into<String>) -> Self {
        Error::Network(msg.into())
    }

    pub(crate) fn inconsistent(path: &str, reason: impl Into<String>) -> Self {
        Error::DirectoryInconsistency {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Network(format!("request timed out: {err}"))
        } else {
            Error::Network(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
