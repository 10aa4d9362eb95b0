//! Host filesystem backend.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};

use avfs_core::{
    Backend, BackendResult, ErrorCode, FileHandle, FileInfo, FileType, FindDirectoryKind,
    OpContext, OpenMode, SeekPosition, SetInfoMask, Uri,
};
use compact_str::CompactString;
use filetime::FileTime;
use serde_json::Value;

/// Scheme served by [`LocalBackend`].
pub const LOCAL_SCHEME: &str = "file";

/// Backend for the host filesystem.
#[derive(Debug, Default, Clone)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

/// An open host file.
struct LocalFile {
    file: File,
    path: PathBuf,
    random: bool,
    dirty: bool,
}

impl FileHandle for LocalFile {
    fn read(&mut self, buf: &mut [u8], ctx: &OpContext<'_>) -> BackendResult<usize> {
        ctx.checkpoint()?;
        loop {
            match self.file.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => ctx.checkpoint()?,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write(&mut self, data: &[u8], ctx: &OpContext<'_>) -> BackendResult<usize> {
        ctx.checkpoint()?;
        self.file.write_all(data)?;
        self.dirty = true;
        Ok(data.len())
    }

    fn seek(&mut self, whence: SeekPosition, offset: i64, ctx: &OpContext<'_>) -> BackendResult<u64> {
        ctx.checkpoint()?;
        if !self.random {
            return Err(ErrorCode::NotSupported);
        }
        let target = match whence {
            SeekPosition::Start => {
                SeekFrom::Start(u64::try_from(offset).map_err(|_| ErrorCode::BadParameters)?)
            }
            SeekPosition::Current => SeekFrom::Current(offset),
            SeekPosition::End => SeekFrom::End(offset),
        };
        Ok(self.file.seek(target)?)
    }

    fn control(&mut self, operation: &str, _data: &Value, ctx: &OpContext<'_>) -> BackendResult<Value> {
        ctx.checkpoint()?;
        match operation {
            "sync" => {
                self.file.sync_all()?;
                self.dirty = false;
                Ok(Value::Null)
            }
            "size" => Ok(Value::from(self.file.metadata()?.len())),
            _ => Err(ErrorCode::NotSupported),
        }
    }

    fn close(mut self: Box<Self>, _ctx: &OpContext<'_>) -> BackendResult<()> {
        if self.dirty {
            self.file.flush()?;
        }
        tracing::trace!(target: "avfs::backend", path = %self.path.display(), "closed");
        Ok(())
    }
}

impl Backend for LocalBackend {
    fn scheme(&self) -> &str {
        LOCAL_SCHEME
    }

    fn open(&self, uri: &Uri, mode: OpenMode, ctx: &OpContext<'_>) -> BackendResult<Box<dyn FileHandle>> {
        ctx.checkpoint()?;
        if !mode.is_valid() {
            return Err(ErrorCode::InvalidOpenMode);
        }
        let path = uri.path();
        if fs::metadata(path)?.is_dir() {
            return Err(ErrorCode::IsDirectory);
        }

        let file = OpenOptions::new()
            .read(mode.read)
            .write(mode.write)
            .truncate(mode.write && mode.truncate)
            .open(path)?;

        Ok(Box::new(LocalFile {
            file,
            path: path.to_path_buf(),
            random: mode.random,
            dirty: false,
        }))
    }

    fn create(
        &self,
        uri: &Uri,
        mode: OpenMode,
        exclusive: bool,
        permissions: u32,
        ctx: &OpContext<'_>,
    ) -> BackendResult<Box<dyn FileHandle>> {
        ctx.checkpoint()?;
        let path = uri.path();
        if let Ok(meta) = fs::symlink_metadata(path) {
            if meta.is_dir() {
                return Err(ErrorCode::IsDirectory);
            }
        }

        let mut options = OpenOptions::new();
        options.read(mode.read).write(true);
        if exclusive {
            options.create_new(true);
        } else {
            options.create(true).truncate(mode.truncate);
        }
        #[cfg(unix)]
        options.mode(permissions);
        #[cfg(not(unix))]
        let _ = permissions;

        let file = options.open(path)?;
        Ok(Box::new(LocalFile {
            file,
            path: path.to_path_buf(),
            random: mode.random,
            dirty: false,
        }))
    }

    #[cfg(unix)]
    fn create_symlink(&self, uri: &Uri, target: &str, ctx: &OpContext<'_>) -> BackendResult<()> {
        ctx.checkpoint()?;
        std::os::unix::fs::symlink(target, uri.path())?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn create_symlink(&self, _uri: &Uri, _target: &str, _ctx: &OpContext<'_>) -> BackendResult<()> {
        Err(ErrorCode::NotSupported)
    }

    fn get_file_info(&self, uri: &Uri, follow_links: bool, ctx: &OpContext<'_>) -> BackendResult<FileInfo> {
        ctx.checkpoint()?;
        stat(uri.path(), follow_links)
    }

    fn set_file_info(
        &self,
        uri: &Uri,
        info: &FileInfo,
        mask: SetInfoMask,
        ctx: &OpContext<'_>,
    ) -> BackendResult<()> {
        ctx.checkpoint()?;
        let path = uri.path();

        if mask.permissions {
            set_mode(path, info.permissions)?;
        }

        if mask.owner {
            set_owner(path, info.uid, info.gid)?;
        }

        if mask.time {
            let atime = FileTime::from_system_time(info.accessed);
            let mtime = FileTime::from_system_time(info.modified);
            if fs::symlink_metadata(path)?.file_type().is_symlink() {
                filetime::set_symlink_file_times(path, atime, mtime)?;
            } else {
                filetime::set_file_times(path, atime, mtime)?;
            }
        }

        if mask.name {
            if info.name.is_empty() || info.name.contains('/') {
                return Err(ErrorCode::BadParameters);
            }
            let renamed = path.with_file_name(info.name.as_str());
            if renamed != path {
                if fs::symlink_metadata(&renamed).is_ok() {
                    return Err(ErrorCode::FileExists);
                }
                fs::rename(path, &renamed)?;
            }
        }

        Ok(())
    }

    fn load_directory(&self, uri: &Uri, follow_links: bool, ctx: &OpContext<'_>) -> BackendResult<Vec<FileInfo>> {
        ctx.checkpoint()?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(uri.path())? {
            ctx.checkpoint()?;
            let path = entry?.path();
            let info = match stat(&path, follow_links) {
                // Dangling link: report the link itself.
                Err(_) if follow_links => stat(&path, false),
                other => other,
            };
            match info {
                Ok(info) => entries.push(info),
                // Raced with a concurrent unlink.
                Err(ErrorCode::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn find_directory(
        &self,
        _near: &Uri,
        kind: FindDirectoryKind,
        create_if_needed: bool,
        ctx: &OpContext<'_>,
    ) -> BackendResult<Uri> {
        ctx.checkpoint()?;
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .ok_or(ErrorCode::NotFound)?;

        let dir = match kind {
            FindDirectoryKind::Desktop => home.join("Desktop"),
            FindDirectoryKind::Trash => std::env::var_os("XDG_DATA_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| home.join(".local/share"))
                .join("Trash/files"),
        };

        if !dir.is_dir() {
            if !create_if_needed {
                return Err(ErrorCode::NotFound);
            }
            let mut builder = fs::DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            builder.mode(0o700);
            builder.create(&dir)?;
        }

        Ok(Uri::local(dir))
    }

    fn make_directory(&self, uri: &Uri, permissions: u32, ctx: &OpContext<'_>) -> BackendResult<()> {
        ctx.checkpoint()?;
        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        builder.mode(permissions);
        #[cfg(not(unix))]
        let _ = permissions;
        builder.create(uri.path())?;
        Ok(())
    }

    fn remove(&self, uri: &Uri, ctx: &OpContext<'_>) -> BackendResult<()> {
        ctx.checkpoint()?;
        let path = uri.path();
        if fs::symlink_metadata(path)?.is_dir() {
            fs::remove_dir(path)?;
        } else {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn rename(&self, from: &Uri, to: &Uri, ctx: &OpContext<'_>) -> BackendResult<()> {
        ctx.checkpoint()?;
        fs::rename(from.path(), to.path())?;
        tracing::debug!(target: "avfs::backend", from = %from, to = %to, "renamed");
        Ok(())
    }

    fn same_fs(&self, a: &Uri, b: &Uri, ctx: &OpContext<'_>) -> BackendResult<bool> {
        ctx.checkpoint()?;
        let dev_a = device_of(a.path())?;
        let dev_b = device_of(nearest_existing(b.path()))?;
        Ok(dev_a == dev_b)
    }
}

/// Build a [`FileInfo`] from host metadata.
fn stat(path: &Path, follow_links: bool) -> BackendResult<FileInfo> {
    let meta = if follow_links {
        fs::metadata(path)?
    } else {
        fs::symlink_metadata(path)?
    };

    let file_type = if meta.file_type().is_symlink() {
        FileType::Symlink
    } else if meta.is_dir() {
        FileType::Directory
    } else if meta.is_file() {
        FileType::Regular
    } else {
        FileType::Other
    };

    let symlink_target = if file_type == FileType::Symlink {
        fs::read_link(path)
            .ok()
            .map(|t| t.to_string_lossy().into_owned())
    } else {
        None
    };

    let name = path
        .file_name()
        .map(|n| CompactString::from(n.to_string_lossy().as_ref()))
        .unwrap_or_else(|| CompactString::from("/"));

    Ok(FileInfo {
        name,
        file_type,
        size: if file_type == FileType::Regular { meta.len() } else { 0 },
        permissions: get_mode(&meta),
        uid: get_uid(&meta),
        gid: get_gid(&meta),
        modified: meta.modified().unwrap_or(std::time::UNIX_EPOCH),
        accessed: meta.accessed().unwrap_or(std::time::UNIX_EPOCH),
        device: get_dev(&meta),
        inode: get_ino(&meta),
        symlink_target,
    })
}

/// Walk up to the first ancestor that exists.
fn nearest_existing(path: &Path) -> &Path {
    let mut current = path;
    while fs::symlink_metadata(current).is_err() {
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    current
}

fn device_of(path: &Path) -> BackendResult<u64> {
    Ok(get_dev(&fs::symlink_metadata(path)?))
}

#[cfg(unix)]
fn get_mode(metadata: &fs::Metadata) -> u32 {
    metadata.mode() & 0o7777
}

#[cfg(not(unix))]
fn get_mode(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() { 0o444 } else { 0o644 }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> BackendResult<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(path: &Path, mode: u32) -> BackendResult<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, permissions)?;
    Ok(())
}

#[cfg(unix)]
fn set_owner(path: &Path, uid: u32, gid: u32) -> BackendResult<()> {
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner(_path: &Path, _uid: u32, _gid: u32) -> BackendResult<()> {
    Err(ErrorCode::NotSupported)
}

#[cfg(unix)]
fn get_uid(metadata: &fs::Metadata) -> u32 {
    metadata.uid()
}

#[cfg(not(unix))]
fn get_uid(_metadata: &fs::Metadata) -> u32 {
    0
}

#[cfg(unix)]
fn get_gid(metadata: &fs::Metadata) -> u32 {
    metadata.gid()
}

#[cfg(not(unix))]
fn get_gid(_metadata: &fs::Metadata) -> u32 {
    0
}

#[cfg(unix)]
fn get_dev(metadata: &fs::Metadata) -> u64 {
    metadata.dev()
}

#[cfg(not(unix))]
fn get_dev(_metadata: &fs::Metadata) -> u64 {
    0
}

#[cfg(unix)]
fn get_ino(metadata: &fs::Metadata) -> u64 {
    metadata.ino()
}

#[cfg(not(unix))]
fn get_ino(_metadata: &fs::Metadata) -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn uri(dir: &TempDir, name: &str) -> Uri {
        Uri::local(dir.path().join(name))
    }

    #[test]
    fn test_create_write_read() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new();
        let ctx = OpContext::detached();
        let target = uri(&temp, "a.txt");

        let mut handle = backend
            .create(&target, OpenMode::write(), true, 0o644, &ctx)
            .unwrap();
        assert_eq!(handle.write(b"hello", &ctx).unwrap(), 5);
        handle.close(&ctx).unwrap();

        let mut handle = backend.open(&target, OpenMode::read(), &ctx).unwrap();
        let mut buf = [0u8; 16];
        let n = handle.read(&mut buf, &ctx).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(handle.read(&mut buf, &ctx).unwrap(), 0);
        handle.close(&ctx).unwrap();
    }

    #[test]
    fn test_exclusive_create_conflict() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), "x").unwrap();
        let backend = LocalBackend::new();
        let ctx = OpContext::detached();

        let err = backend
            .create(&uri(&temp, "a.txt"), OpenMode::write(), true, 0o644, &ctx)
            .err()
            .unwrap();
        assert_eq!(err, ErrorCode::FileExists);
    }

    #[test]
    fn test_open_directory_fails() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new();
        let ctx = OpContext::detached();
        let err = backend
            .open(&Uri::local(temp.path()), OpenMode::read(), &ctx)
            .err()
            .unwrap();
        assert_eq!(err, ErrorCode::IsDirectory);
    }

    #[test]
    fn test_sequential_handle_rejects_seek() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), "abc").unwrap();
        let backend = LocalBackend::new();
        let ctx = OpContext::detached();

        let mut handle = backend
            .open(&uri(&temp, "a.txt"), OpenMode::read().sequential(), &ctx)
            .unwrap();
        assert_eq!(
            handle.seek(SeekPosition::Start, 1, &ctx),
            Err(ErrorCode::NotSupported)
        );
    }

    #[test]
    fn test_load_directory_sorted() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("b"), "bb").unwrap();
        fs::write(temp.path().join("a"), "a").unwrap();
        fs::create_dir(temp.path().join("c")).unwrap();
        let backend = LocalBackend::new();

        let entries = backend
            .load_directory(&Uri::local(temp.path()), false, &OpContext::detached())
            .unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(entries[1].size, 2);
        assert!(entries[2].is_dir());
    }

    #[test]
    fn test_remove_non_empty_directory_fails() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("d")).unwrap();
        fs::write(temp.path().join("d/f"), "x").unwrap();
        let backend = LocalBackend::new();

        let err = backend
            .remove(&uri(&temp, "d"), &OpContext::detached())
            .unwrap_err();
        assert_eq!(err, ErrorCode::DirectoryNotEmpty);
    }

    #[test]
    fn test_same_fs_for_missing_target() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a"), "x").unwrap();
        let backend = LocalBackend::new();
        let same = backend
            .same_fs(
                &uri(&temp, "a"),
                &uri(&temp, "missing/deeper/b"),
                &OpContext::detached(),
            )
            .unwrap();
        assert!(same);
    }

    #[cfg(unix)]
    #[test]
    fn test_set_permissions_and_rename() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a"), "x").unwrap();
        let backend = LocalBackend::new();
        let ctx = OpContext::detached();
        let target = uri(&temp, "a");

        let mut info = backend.get_file_info(&target, false, &ctx).unwrap();
        info.permissions = 0o600;
        info.name = "renamed".into();
        let mask = SetInfoMask {
            permissions: true,
            name: true,
            ..SetInfoMask::default()
        };
        backend.set_file_info(&target, &info, mask, &ctx).unwrap();

        let renamed = backend
            .get_file_info(&uri(&temp, "renamed"), false, &ctx)
            .unwrap();
        assert_eq!(renamed.permissions, 0o600);
        assert!(!temp.path().join("a").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_info() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("target"), "data").unwrap();
        let backend = LocalBackend::new();
        let ctx = OpContext::detached();
        let link = uri(&temp, "link");

        backend.create_symlink(&link, "target", &ctx).unwrap();
        let info = backend.get_file_info(&link, false, &ctx).unwrap();
        assert!(info.is_symlink());
        assert_eq!(info.symlink_target.as_deref(), Some("target"));

        let followed = backend.get_file_info(&link, true, &ctx).unwrap();
        assert!(followed.is_regular());
        assert_eq!(followed.size, 4);
    }
}
