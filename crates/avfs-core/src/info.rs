//! File metadata and the small value types operations are parameterized by.

use std::time::SystemTime;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use strum::Display;

/// Kind of filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Other,
}

/// Metadata for one filesystem object, as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Base name of the object.
    pub name: CompactString,
    /// Object kind.
    pub file_type: FileType,
    /// Size in bytes (0 for directories on backends that do not track it).
    pub size: u64,
    /// Unix permission bits.
    pub permissions: u32,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Last modification time.
    pub modified: SystemTime,
    /// Last access time.
    pub accessed: SystemTime,
    /// Device the object lives on, used for same-filesystem checks.
    pub device: u64,
    /// Inode number (0 when unknown).
    pub inode: u64,
    /// Link target, for symlinks.
    pub symlink_target: Option<String>,
}

impl FileInfo {
    /// Create info for an object with default ownership and current times.
    pub fn new(name: impl Into<CompactString>, file_type: FileType, size: u64) -> Self {
        let now = SystemTime::now();
        Self {
            name: name.into(),
            file_type,
            size,
            permissions: match file_type {
                FileType::Directory => 0o755,
                _ => 0o644,
            },
            uid: 0,
            gid: 0,
            modified: now,
            accessed: now,
            device: 0,
            inode: 0,
            symlink_target: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }

    pub fn is_regular(&self) -> bool {
        self.file_type == FileType::Regular
    }
}

/// Which fields a set-info request applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetInfoMask {
    /// Apply `permissions`.
    pub permissions: bool,
    /// Apply `uid`/`gid`.
    pub owner: bool,
    /// Rename to `name` within the same parent.
    pub name: bool,
    /// Apply `accessed`/`modified`.
    pub time: bool,
}

impl SetInfoMask {
    /// Permissions and timestamps, the attributes a transfer copies.
    pub fn attributes() -> Self {
        Self {
            permissions: true,
            time: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.permissions || self.owner || self.name || self.time)
    }
}

/// Access mode for opened files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    /// Allow seeking on the handle.
    pub random: bool,
    /// Truncate on open (write handles only).
    pub truncate: bool,
}

impl OpenMode {
    pub fn read() -> Self {
        Self {
            read: true,
            random: true,
            ..Self::default()
        }
    }

    pub fn write() -> Self {
        Self {
            write: true,
            random: true,
            truncate: true,
            ..Self::default()
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            random: true,
            truncate: false,
        }
    }

    /// Sequential-only variant of this mode.
    pub fn sequential(mut self) -> Self {
        self.random = false;
        self
    }

    /// A mode is usable only if it reads or writes.
    pub fn is_valid(&self) -> bool {
        self.read || self.write
    }
}

/// Origin for a seek offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeekPosition {
    Start,
    Current,
    End,
}

/// Well-known directories a backend can locate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum FindDirectoryKind {
    Desktop,
    Trash,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_permissions() {
        assert_eq!(FileInfo::new("d", FileType::Directory, 0).permissions, 0o755);
        assert_eq!(FileInfo::new("f", FileType::Regular, 3).permissions, 0o644);
    }

    #[test]
    fn test_open_mode() {
        assert!(OpenMode::read().is_valid());
        assert!(!OpenMode::default().is_valid());
        assert!(!OpenMode::write().sequential().random);
        assert!(OpenMode::write().truncate);
    }

    #[test]
    fn test_set_info_mask() {
        assert!(SetInfoMask::default().is_empty());
        let mask = SetInfoMask::attributes();
        assert!(mask.permissions && mask.time && !mask.owner && !mask.name);
    }

    #[test]
    fn test_file_type_display() {
        assert_eq!(FileType::Symlink.to_string(), "symlink");
        assert_eq!(FindDirectoryKind::Trash.to_string(), "trash");
    }
}
