//! Descriptors of the operations a job can carry, and what they produce.

use avfs_core::{
    BackendRegistry, FileInfo, FindDirectoryKind, OpenMode, SeekPosition, SetInfoMask, Uri,
    VfsError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumIter, IntoStaticStr};

use crate::files::FileId;
use crate::xfer::{TransferRequest, XferSummary};

/// Largest byte count a single `Read` may ask for.
pub const MAX_READ_COUNT: usize = 64 * 1024 * 1024;

/// The closed set of operation kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum OperationKind {
    Open,
    OpenAsStream,
    Create,
    CreateSymlink,
    CreateAsStream,
    Close,
    Read,
    Write,
    Seek,
    LoadDirectory,
    FindDirectory,
    Transfer,
    GetFileInfo,
    SetFileInfo,
    ModuleCallback,
    FileControl,
}

/// A request for one operation, with its kind-specific arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    Open {
        uri: Uri,
        mode: OpenMode,
    },
    /// Open without random access.
    OpenAsStream {
        uri: Uri,
        mode: OpenMode,
    },
    Create {
        uri: Uri,
        mode: OpenMode,
        exclusive: bool,
        permissions: u32,
    },
    CreateSymlink {
        uri: Uri,
        target: String,
    },
    CreateAsStream {
        uri: Uri,
        mode: OpenMode,
        exclusive: bool,
        permissions: u32,
    },
    Close {
        file: FileId,
    },
    /// Read up to `count` bytes.
    Read {
        file: FileId,
        count: usize,
    },
    Write {
        file: FileId,
        data: Vec<u8>,
    },
    Seek {
        file: FileId,
        whence: SeekPosition,
        offset: i64,
    },
    LoadDirectory {
        uri: Uri,
        follow_links: bool,
    },
    FindDirectory {
        near: Uri,
        kind: FindDirectoryKind,
        create_if_needed: bool,
    },
    Transfer(Box<TransferRequest>),
    GetFileInfo {
        uri: Uri,
        follow_links: bool,
    },
    SetFileInfo {
        uri: Uri,
        info: Box<FileInfo>,
        mask: SetInfoMask,
    },
    /// Round-trip `payload` to the caller's handler registered as `name`.
    ModuleCallback {
        name: String,
        payload: Value,
    },
    FileControl {
        file: FileId,
        operation: String,
        data: Value,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Open { .. } => OperationKind::Open,
            Self::OpenAsStream { .. } => OperationKind::OpenAsStream,
            Self::Create { .. } => OperationKind::Create,
            Self::CreateSymlink { .. } => OperationKind::CreateSymlink,
            Self::CreateAsStream { .. } => OperationKind::CreateAsStream,
            Self::Close { .. } => OperationKind::Close,
            Self::Read { .. } => OperationKind::Read,
            Self::Write { .. } => OperationKind::Write,
            Self::Seek { .. } => OperationKind::Seek,
            Self::LoadDirectory { .. } => OperationKind::LoadDirectory,
            Self::FindDirectory { .. } => OperationKind::FindDirectory,
            Self::Transfer(_) => OperationKind::Transfer,
            Self::GetFileInfo { .. } => OperationKind::GetFileInfo,
            Self::SetFileInfo { .. } => OperationKind::SetFileInfo,
            Self::ModuleCallback { .. } => OperationKind::ModuleCallback,
            Self::FileControl { .. } => OperationKind::FileControl,
        }
    }

    /// The file handle the operation works on, if any.
    pub fn file(&self) -> Option<FileId> {
        match self {
            Self::Close { file }
            | Self::Read { file, .. }
            | Self::Write { file, .. }
            | Self::Seek { file, .. }
            | Self::FileControl { file, .. } => Some(*file),
            _ => None,
        }
    }

    /// Check the arguments. Failures here mean the job is never queued.
    pub fn validate(&self, registry: &BackendRegistry) -> Result<(), VfsError> {
        match self {
            Self::Open { uri, mode } | Self::OpenAsStream { uri, mode } => {
                registry.resolve(uri)?;
                if !mode.is_valid() {
                    return Err(VfsError::bad_parameters("open mode must read or write"));
                }
            }
            Self::Create { uri, mode, .. } | Self::CreateAsStream { uri, mode, .. } => {
                registry.resolve(uri)?;
                if !mode.is_valid() {
                    return Err(VfsError::bad_parameters("open mode must read or write"));
                }
            }
            Self::CreateSymlink { uri, target } => {
                registry.resolve(uri)?;
                if target.is_empty() {
                    return Err(VfsError::bad_parameters("symlink target is empty"));
                }
            }
            Self::Read { count, .. } if *count == 0 || *count > MAX_READ_COUNT => {
                return Err(VfsError::bad_parameters(format!(
                    "read count must be between 1 and {MAX_READ_COUNT}"
                )));
            }
            Self::LoadDirectory { uri, .. } | Self::GetFileInfo { uri, .. } => {
                registry.resolve(uri)?;
            }
            Self::FindDirectory { near, .. } => {
                registry.resolve(near)?;
            }
            Self::SetFileInfo { uri, mask, .. } => {
                registry.resolve(uri)?;
                if mask.is_empty() {
                    return Err(VfsError::bad_parameters("set-info mask selects nothing"));
                }
            }
            Self::Transfer(request) => request.validate(registry)?,
            Self::ModuleCallback { name, .. } if name.is_empty() => {
                return Err(VfsError::bad_parameters("module callback name is empty"));
            }
            Self::FileControl { operation, .. } if operation.is_empty() => {
                return Err(VfsError::bad_parameters("file control operation is empty"));
            }
            Self::Close { .. }
            | Self::Read { .. }
            | Self::Write { .. }
            | Self::Seek { .. }
            | Self::ModuleCallback { .. }
            | Self::FileControl { .. } => {}
        }
        Ok(())
    }
}

/// What a successful operation produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    /// Open and create variants.
    Opened(FileId),
    /// Close, CreateSymlink and SetFileInfo.
    Done,
    Read(Vec<u8>),
    Written(usize),
    /// New absolute position after a seek.
    Position(u64),
    Directory(Vec<FileInfo>),
    FoundDirectory(Uri),
    Transferred(XferSummary),
    FileInfo(Box<FileInfo>),
    /// Reply of a module callback or a file control request.
    Value(Value),
}

impl Outcome {
    pub fn file(&self) -> Option<FileId> {
        match self {
            Self::Opened(file) => Some(*file),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(OperationKind::iter().count(), 16);
        assert_eq!(OperationKind::OpenAsStream.to_string(), "open_as_stream");
        let name: &'static str = OperationKind::LoadDirectory.into();
        assert_eq!(name, "load_directory");
    }

    #[test]
    fn test_validate_rejects_bad_arguments() {
        let registry = BackendRegistry::new();
        let op = Operation::Open {
            uri: Uri::local("/x"),
            mode: OpenMode::read(),
        };
        assert!(matches!(
            op.validate(&registry),
            Err(VfsError::UnknownScheme { .. })
        ));

        let op = Operation::ModuleCallback {
            name: String::new(),
            payload: Value::Null,
        };
        assert!(matches!(
            op.validate(&registry),
            Err(VfsError::BadParameters { .. })
        ));
        assert_eq!(op.kind(), OperationKind::ModuleCallback);
    }
}
