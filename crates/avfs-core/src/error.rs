//! Error types shared by backends, the job engine and callers.

use std::io;

use serde::{Deserialize, Serialize};
use strum::{EnumIter, IntoStaticStr};
use thiserror::Error;

/// Result type returned by every backend primitive.
pub type BackendResult<T> = Result<T, ErrorCode>;

/// Outcome code of a failed operation.
///
/// Codes are plain values: they cross the worker/caller boundary inside
/// notifications and carry no formatted text. Turning a code into a message
/// is up to the caller.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize, EnumIter, IntoStaticStr,
)]
pub enum ErrorCode {
    #[error("File not found")]
    NotFound,
    #[error("Generic error")]
    Generic,
    #[error("Internal error")]
    Internal,
    #[error("Invalid parameters")]
    BadParameters,
    #[error("Unsupported operation")]
    NotSupported,
    #[error("I/O error")]
    Io,
    #[error("Data corrupted")]
    CorruptedData,
    #[error("Format not valid")]
    WrongFormat,
    #[error("Bad file handle")]
    BadFile,
    #[error("File too big")]
    TooBig,
    #[error("No space left on device")]
    NoSpace,
    #[error("Read-only file")]
    ReadOnly,
    #[error("Invalid URI")]
    InvalidUri,
    #[error("File not open")]
    NotOpen,
    #[error("Open mode not valid")]
    InvalidOpenMode,
    #[error("Access denied")]
    AccessDenied,
    #[error("Too many open files")]
    TooManyOpenFiles,
    #[error("End of file")]
    Eof,
    #[error("Not a directory")]
    NotADirectory,
    #[error("Operation in progress")]
    InProgress,
    #[error("Operation interrupted")]
    Interrupted,
    #[error("File exists")]
    FileExists,
    #[error("Looping links encountered")]
    Loop,
    #[error("Operation not permitted")]
    NotPermitted,
    #[error("Is a directory")]
    IsDirectory,
    #[error("Not enough memory")]
    NoMemory,
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Directory not empty")]
    DirectoryNotEmpty,
    #[error("Name too long")]
    NameTooLong,
    #[error("Not on the same file system")]
    NotSameFileSystem,
    #[error("Directory busy")]
    DirectoryBusy,
    #[error("Resource busy")]
    Busy,
}

impl ErrorCode {
    /// Stable identifier, suitable for machine-readable output.
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

impl From<io::Error> for ErrorCode {
    fn from(err: io::Error) -> Self {
        #[cfg(unix)]
        if let Some(errno) = err.raw_os_error() {
            match errno {
                libc::ELOOP => return Self::Loop,
                libc::EMFILE | libc::ENFILE => return Self::TooManyOpenFiles,
                libc::EPERM => return Self::NotPermitted,
                _ => {}
            }
        }

        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::AccessDenied,
            io::ErrorKind::AlreadyExists => Self::FileExists,
            io::ErrorKind::InvalidInput => Self::BadParameters,
            io::ErrorKind::InvalidData => Self::CorruptedData,
            io::ErrorKind::UnexpectedEof => Self::Eof,
            io::ErrorKind::Interrupted => Self::Interrupted,
            io::ErrorKind::Unsupported => Self::NotSupported,
            io::ErrorKind::OutOfMemory => Self::NoMemory,
            io::ErrorKind::NotADirectory => Self::NotADirectory,
            io::ErrorKind::IsADirectory => Self::IsDirectory,
            io::ErrorKind::DirectoryNotEmpty => Self::DirectoryNotEmpty,
            io::ErrorKind::ReadOnlyFilesystem => Self::ReadOnly,
            io::ErrorKind::StorageFull => Self::NoSpace,
            io::ErrorKind::FileTooLarge => Self::TooBig,
            io::ErrorKind::ResourceBusy => Self::Busy,
            io::ErrorKind::CrossesDevices => Self::NotSameFileSystem,
            io::ErrorKind::InvalidFilename => Self::NameTooLong,
            _ => Self::Io,
        }
    }
}

/// Errors returned synchronously by the caller-facing API.
///
/// Everything that happens after a job has been accepted is reported through
/// notifications instead.
#[derive(Debug, Error)]
pub enum VfsError {
    /// The request was malformed and never reached a worker.
    #[error("Invalid parameters: {message}")]
    BadParameters { message: String },

    /// A URI string could not be parsed.
    #[error("Invalid URI: {uri}")]
    InvalidUri { uri: String },

    /// No backend is registered for the scheme.
    #[error("No backend registered for scheme '{scheme}'")]
    UnknownScheme { scheme: String },

    /// The handle does not refer to a live job or file.
    #[error("Invalid or stale handle")]
    InvalidHandle,

    /// The engine no longer accepts work.
    #[error("Engine is shut down")]
    ShutDown,

    /// A backend failure surfaced synchronously.
    #[error(transparent)]
    Backend(#[from] ErrorCode),
}

impl VfsError {
    /// Create a bad-parameters error.
    pub fn bad_parameters(message: impl Into<String>) -> Self {
        Self::BadParameters {
            message: message.into(),
        }
    }

    /// The code a notification would carry for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::BadParameters { .. } => ErrorCode::BadParameters,
            Self::InvalidUri { .. } | Self::UnknownScheme { .. } => ErrorCode::InvalidUri,
            Self::InvalidHandle => ErrorCode::NotOpen,
            Self::ShutDown => ErrorCode::Cancelled,
            Self::Backend(code) => *code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(ErrorCode::from(err), ErrorCode::NotFound);

        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(ErrorCode::from(err), ErrorCode::AccessDenied);

        let err = io::Error::new(io::ErrorKind::AlreadyExists, "exists");
        assert_eq!(ErrorCode::from(err), ErrorCode::FileExists);
    }

    #[cfg(unix)]
    #[test]
    fn test_raw_errno_mapping() {
        assert_eq!(
            ErrorCode::from(io::Error::from_raw_os_error(libc::ELOOP)),
            ErrorCode::Loop
        );
        assert_eq!(
            ErrorCode::from(io::Error::from_raw_os_error(libc::EXDEV)),
            ErrorCode::NotSameFileSystem
        );
    }

    #[test]
    fn test_vfs_error_code() {
        assert_eq!(
            VfsError::bad_parameters("empty").code(),
            ErrorCode::BadParameters
        );
        assert_eq!(
            VfsError::from(ErrorCode::NoSpace).code(),
            ErrorCode::NoSpace
        );
        assert!(VfsError::bad_parameters("empty").to_string().contains("empty"));
    }

    #[test]
    fn test_code_identifier() {
        assert_eq!(ErrorCode::NotSameFileSystem.as_str(), "NotSameFileSystem");
    }
}
