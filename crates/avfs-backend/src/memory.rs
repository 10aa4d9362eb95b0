//! In-process backend holding a directory tree in memory.
//!
//! Besides serving the `mem` scheme, the backend counts every call it
//! receives and can be told to fail specific operations, which makes it the
//! workhorse of the engine's tests.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use avfs_core::{
    Backend, BackendResult, ErrorCode, FileHandle, FileInfo, FileType, FindDirectoryKind,
    OpContext, OpenMode, SeekPosition, SetInfoMask, Uri,
};
use compact_str::CompactString;
use serde_json::Value;

/// Scheme served by [`MemoryBackend`].
pub const MEMORY_SCHEME: &str = "mem";

const MAX_SYMLINK_DEPTH: usize = 8;

#[derive(Debug, Clone)]
enum Content {
    File(Vec<u8>),
    Directory,
    Symlink(String),
}

#[derive(Debug, Clone)]
struct Node {
    content: Content,
    permissions: u32,
    uid: u32,
    gid: u32,
    modified: SystemTime,
    accessed: SystemTime,
    inode: u64,
}

/// Call and byte counters.
#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    /// Calls received, keyed by operation name.
    pub calls: HashMap<&'static str, u64>,
    /// Bytes accepted by `write`.
    pub bytes_written: u64,
    /// Bytes returned by `read`.
    pub bytes_read: u64,
}

impl MemoryStats {
    /// Number of calls made to one operation.
    pub fn count(&self, op: &str) -> u64 {
        self.calls.get(op).copied().unwrap_or(0)
    }

    /// Number of calls made to any operation.
    pub fn total_calls(&self) -> u64 {
        self.calls.values().sum()
    }
}

#[derive(Debug)]
struct Fault {
    op: &'static str,
    path: PathBuf,
    code: ErrorCode,
    remaining: Option<usize>,
}

#[derive(Debug)]
struct State {
    nodes: BTreeMap<PathBuf, Node>,
    stats: MemoryStats,
    faults: Vec<Fault>,
    devices: Vec<(PathBuf, u64)>,
    next_inode: u64,
}

impl State {
    fn node(&self, path: &Path) -> BackendResult<&Node> {
        self.nodes.get(path).ok_or(ErrorCode::NotFound)
    }

    fn new_node(&mut self, content: Content, permissions: u32) -> Node {
        self.next_inode += 1;
        let now = SystemTime::now();
        Node {
            content,
            permissions,
            uid: 0,
            gid: 0,
            modified: now,
            accessed: now,
            inode: self.next_inode,
        }
    }

    fn device(&self, path: &Path) -> u64 {
        self.devices
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.components().count())
            .map(|(_, dev)| *dev)
            .unwrap_or(1)
    }

    /// Follow symlinks at `path` itself.
    fn resolve(&self, path: &Path, follow_links: bool) -> BackendResult<PathBuf> {
        let mut current = path.to_path_buf();
        for _ in 0..MAX_SYMLINK_DEPTH {
            let node = self.node(&current)?;
            match &node.content {
                Content::Symlink(target) if follow_links => {
                    let base = current.parent().unwrap_or(Path::new("/"));
                    current = Uri::new(MEMORY_SCHEME, base.join(target))
                        .path()
                        .to_path_buf();
                }
                _ => return Ok(current),
            }
        }
        Err(ErrorCode::Loop)
    }

    fn require_parent_dir(&self, path: &Path) -> BackendResult<()> {
        let parent = path.parent().ok_or(ErrorCode::BadParameters)?;
        match self.node(parent)?.content {
            Content::Directory => Ok(()),
            _ => Err(ErrorCode::NotADirectory),
        }
    }

    fn has_children(&self, path: &Path) -> bool {
        self.nodes
            .keys()
            .any(|k| k.parent() == Some(path) && k.as_path() != path)
    }

    fn info(&self, path: &Path, node: &Node) -> FileInfo {
        let (file_type, size, symlink_target) = match &node.content {
            Content::File(data) => (FileType::Regular, data.len() as u64, None),
            Content::Directory => (FileType::Directory, 0, None),
            Content::Symlink(target) => (FileType::Symlink, 0, Some(target.clone())),
        };
        FileInfo {
            name: path
                .file_name()
                .map(|n| CompactString::from(n.to_string_lossy().as_ref()))
                .unwrap_or_else(|| CompactString::from("/")),
            file_type,
            size,
            permissions: node.permissions,
            uid: node.uid,
            gid: node.gid,
            modified: node.modified,
            accessed: node.accessed,
            device: self.device(path),
            inode: node.inode,
            symlink_target,
        }
    }

    /// Create missing ancestors of `path` as directories.
    fn make_parents(&mut self, path: &Path) {
        let ancestors: Vec<PathBuf> = path
            .ancestors()
            .skip(1)
            .map(Path::to_path_buf)
            .collect();
        for ancestor in ancestors.into_iter().rev() {
            if !self.nodes.contains_key(&ancestor) {
                let node = self.new_node(Content::Directory, 0o755);
                self.nodes.insert(ancestor, node);
            }
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a call and apply any matching injected fault.
    fn enter(&self, op: &'static str, path: &Path) -> BackendResult<MutexGuard<'_, State>> {
        let mut state = self.lock();
        *state.stats.calls.entry(op).or_insert(0) += 1;

        if let Some(index) = state
            .faults
            .iter()
            .position(|f| f.op == op && f.path == path)
        {
            let code = state.faults[index].code;
            match state.faults[index].remaining {
                Some(n) if n <= 1 => {
                    state.faults.remove(index);
                }
                Some(n) => state.faults[index].remaining = Some(n - 1),
                None => {}
            }
            tracing::trace!(target: "avfs::backend", op, path = %path.display(), ?code, "injected fault");
            return Err(code);
        }

        Ok(state)
    }
}

/// Backend serving an in-memory tree under the `mem` scheme.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create a backend containing only the root directory.
    pub fn new() -> Self {
        let mut state = State {
            nodes: BTreeMap::new(),
            stats: MemoryStats::default(),
            faults: Vec::new(),
            devices: Vec::new(),
            next_inode: 0,
        };
        let root = state.new_node(Content::Directory, 0o755);
        state.nodes.insert(PathBuf::from("/"), root);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
            }),
        }
    }

    /// URI for a path on this backend.
    pub fn uri(path: impl Into<PathBuf>) -> Uri {
        Uri::new(MEMORY_SCHEME, path)
    }

    /// Add a file, creating parent directories as needed.
    pub fn add_file(&self, path: impl AsRef<Path>, data: impl Into<Vec<u8>>) -> &Self {
        let mut state = self.inner.lock();
        state.make_parents(path.as_ref());
        let node = state.new_node(Content::File(data.into()), 0o644);
        state.nodes.insert(path.as_ref().to_path_buf(), node);
        self
    }

    /// Add a directory, creating parents as needed.
    pub fn add_dir(&self, path: impl AsRef<Path>) -> &Self {
        let mut state = self.inner.lock();
        state.make_parents(path.as_ref());
        if !state.nodes.contains_key(path.as_ref()) {
            let node = state.new_node(Content::Directory, 0o755);
            state.nodes.insert(path.as_ref().to_path_buf(), node);
        }
        self
    }

    /// Add a symbolic link.
    pub fn add_symlink(&self, path: impl AsRef<Path>, target: impl Into<String>) -> &Self {
        let mut state = self.inner.lock();
        state.make_parents(path.as_ref());
        let node = state.new_node(Content::Symlink(target.into()), 0o777);
        state.nodes.insert(path.as_ref().to_path_buf(), node);
        self
    }

    /// Contents of a regular file.
    pub fn read_file(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        match &self.inner.lock().nodes.get(path.as_ref())?.content {
            Content::File(data) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.inner.lock().nodes.contains_key(path.as_ref())
    }

    /// Metadata of a path without counting a call.
    pub fn info(&self, path: impl AsRef<Path>) -> Option<FileInfo> {
        let state = self.inner.lock();
        let node = state.nodes.get(path.as_ref())?;
        Some(state.info(path.as_ref(), node))
    }

    /// Set permission bits and modification time of a path directly.
    pub fn set_attributes(&self, path: impl AsRef<Path>, permissions: u32, modified: SystemTime) {
        let mut state = self.inner.lock();
        if let Some(node) = state.nodes.get_mut(path.as_ref()) {
            node.permissions = permissions;
            node.modified = modified;
        }
    }

    /// All paths in the tree, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.inner.lock().nodes.keys().cloned().collect()
    }

    /// Snapshot of the call counters.
    pub fn stats(&self) -> MemoryStats {
        self.inner.lock().stats.clone()
    }

    pub fn reset_stats(&self) {
        self.inner.lock().stats = MemoryStats::default();
    }

    /// Make `op` on `path` fail with `code`, `times` times (forever if `None`).
    pub fn inject_fault(
        &self,
        op: &'static str,
        path: impl Into<PathBuf>,
        code: ErrorCode,
        times: Option<usize>,
    ) {
        self.inner.lock().faults.push(Fault {
            op,
            path: path.into(),
            code,
            remaining: times,
        });
    }

    pub fn clear_faults(&self) {
        self.inner.lock().faults.clear();
    }

    /// Place everything under `prefix` on its own device.
    pub fn mount(&self, prefix: impl Into<PathBuf>, device: u64) {
        self.inner.lock().devices.push((prefix.into(), device));
    }

    fn handle(&self, path: PathBuf, mode: OpenMode) -> Box<dyn FileHandle> {
        Box::new(MemoryFile {
            inner: Arc::clone(&self.inner),
            path,
            position: 0,
            mode,
        })
    }
}

/// An open in-memory file.
struct MemoryFile {
    inner: Arc<Inner>,
    path: PathBuf,
    position: u64,
    mode: OpenMode,
}

impl FileHandle for MemoryFile {
    fn read(&mut self, buf: &mut [u8], ctx: &OpContext<'_>) -> BackendResult<usize> {
        ctx.checkpoint()?;
        if !self.mode.read {
            return Err(ErrorCode::InvalidOpenMode);
        }
        let mut state = self.inner.enter("read", &self.path)?;
        let data = match &state.node(&self.path).map_err(|_| ErrorCode::BadFile)?.content {
            Content::File(data) => data,
            _ => return Err(ErrorCode::BadFile),
        };
        let start = (self.position as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.position += n as u64;
        state.stats.bytes_read += n as u64;
        Ok(n)
    }

    fn write(&mut self, bytes: &[u8], ctx: &OpContext<'_>) -> BackendResult<usize> {
        ctx.checkpoint()?;
        if !self.mode.write {
            return Err(ErrorCode::ReadOnly);
        }
        let mut state = self.inner.enter("write", &self.path)?;
        let node = state.nodes.get_mut(&self.path).ok_or(ErrorCode::BadFile)?;
        let Content::File(data) = &mut node.content else {
            return Err(ErrorCode::BadFile);
        };
        let start = self.position as usize;
        if data.len() < start + bytes.len() {
            data.resize(start + bytes.len(), 0);
        }
        data[start..start + bytes.len()].copy_from_slice(bytes);
        node.modified = SystemTime::now();
        self.position += bytes.len() as u64;
        state.stats.bytes_written += bytes.len() as u64;
        Ok(bytes.len())
    }

    fn seek(&mut self, whence: SeekPosition, offset: i64, ctx: &OpContext<'_>) -> BackendResult<u64> {
        ctx.checkpoint()?;
        if !self.mode.random {
            return Err(ErrorCode::NotSupported);
        }
        let state = self.inner.enter("seek", &self.path)?;
        let len = match &state.node(&self.path).map_err(|_| ErrorCode::BadFile)?.content {
            Content::File(data) => data.len() as i64,
            _ => return Err(ErrorCode::BadFile),
        };
        let base = match whence {
            SeekPosition::Start => 0,
            SeekPosition::Current => self.position as i64,
            SeekPosition::End => len,
        };
        let target = base.checked_add(offset).ok_or(ErrorCode::BadParameters)?;
        if target < 0 {
            return Err(ErrorCode::BadParameters);
        }
        self.position = target as u64;
        Ok(self.position)
    }

    fn control(&mut self, operation: &str, _data: &Value, ctx: &OpContext<'_>) -> BackendResult<Value> {
        ctx.checkpoint()?;
        let state = self.inner.enter("control", &self.path)?;
        match (operation, &state.node(&self.path)?.content) {
            ("size", Content::File(data)) => Ok(Value::from(data.len() as u64)),
            _ => Err(ErrorCode::NotSupported),
        }
    }

    fn close(self: Box<Self>, _ctx: &OpContext<'_>) -> BackendResult<()> {
        self.inner.enter("close", &self.path)?;
        Ok(())
    }
}

impl Backend for MemoryBackend {
    fn scheme(&self) -> &str {
        MEMORY_SCHEME
    }

    fn open(&self, uri: &Uri, mode: OpenMode, ctx: &OpContext<'_>) -> BackendResult<Box<dyn FileHandle>> {
        ctx.checkpoint()?;
        if !mode.is_valid() {
            return Err(ErrorCode::InvalidOpenMode);
        }
        let mut state = self.inner.enter("open", uri.path())?;
        let path = state.resolve(uri.path(), true)?;
        let node = state.nodes.get_mut(&path).ok_or(ErrorCode::NotFound)?;
        match &mut node.content {
            Content::File(data) => {
                if mode.write && mode.truncate {
                    data.clear();
                }
            }
            Content::Directory => return Err(ErrorCode::IsDirectory),
            Content::Symlink(_) => return Err(ErrorCode::Loop),
        }
        node.accessed = SystemTime::now();
        drop(state);
        Ok(self.handle(path, mode))
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
        let mut state = self.inner.enter("create", uri.path())?;
        state.require_parent_dir(uri.path())?;

        let path = uri.path().to_path_buf();
        if let Some(node) = state.nodes.get_mut(&path) {
            if exclusive {
                return Err(ErrorCode::FileExists);
            }
            match &mut node.content {
                Content::File(data) => {
                    if mode.truncate {
                        data.clear();
                    }
                }
                Content::Directory => return Err(ErrorCode::IsDirectory),
                Content::Symlink(_) => return Err(ErrorCode::FileExists),
            }
        } else {
            let node = state.new_node(Content::File(Vec::new()), permissions);
            state.nodes.insert(path.clone(), node);
        }
        drop(state);

        let mode = OpenMode {
            write: true,
            ..mode
        };
        Ok(self.handle(path, mode))
    }

    fn create_symlink(&self, uri: &Uri, target: &str, ctx: &OpContext<'_>) -> BackendResult<()> {
        ctx.checkpoint()?;
        let mut state = self.inner.enter("create_symlink", uri.path())?;
        state.require_parent_dir(uri.path())?;
        if state.nodes.contains_key(uri.path()) {
            return Err(ErrorCode::FileExists);
        }
        let node = state.new_node(Content::Symlink(target.to_string()), 0o777);
        state.nodes.insert(uri.path().to_path_buf(), node);
        Ok(())
    }

    fn get_file_info(&self, uri: &Uri, follow_links: bool, ctx: &OpContext<'_>) -> BackendResult<FileInfo> {
        ctx.checkpoint()?;
        let state = self.inner.enter("get_file_info", uri.path())?;
        let resolved = state.resolve(uri.path(), follow_links)?;
        let mut info = state.info(&resolved, state.node(&resolved)?);
        // Followed links keep the name they were looked up by.
        if let Some(name) = uri.file_name() {
            info.name = CompactString::from(name);
        }
        Ok(info)
    }

    fn set_file_info(
        &self,
        uri: &Uri,
        info: &FileInfo,
        mask: SetInfoMask,
        ctx: &OpContext<'_>,
    ) -> BackendResult<()> {
        ctx.checkpoint()?;
        let mut state = self.inner.enter("set_file_info", uri.path())?;
        let path = uri.path().to_path_buf();
        let node = state.nodes.get_mut(&path).ok_or(ErrorCode::NotFound)?;

        if mask.permissions {
            node.permissions = info.permissions & 0o7777;
        }
        if mask.owner {
            node.uid = info.uid;
            node.gid = info.gid;
        }
        if mask.time {
            node.modified = info.modified;
            node.accessed = info.accessed;
        }

        if mask.name {
            if info.name.is_empty() || info.name.contains('/') {
                return Err(ErrorCode::BadParameters);
            }
            let renamed = path.with_file_name(info.name.as_str());
            if renamed != path {
                if state.nodes.contains_key(&renamed) {
                    return Err(ErrorCode::FileExists);
                }
                move_subtree(&mut state.nodes, &path, &renamed);
            }
        }
        Ok(())
    }

    fn load_directory(&self, uri: &Uri, follow_links: bool, ctx: &OpContext<'_>) -> BackendResult<Vec<FileInfo>> {
        ctx.checkpoint()?;
        let state = self.inner.enter("load_directory", uri.path())?;
        let dir = state.resolve(uri.path(), true)?;
        if !matches!(state.node(&dir)?.content, Content::Directory) {
            return Err(ErrorCode::NotADirectory);
        }

        let mut entries = Vec::new();
        for (path, node) in state.nodes.iter() {
            if path.parent() != Some(dir.as_path()) {
                continue;
            }
            let mut info = match state.resolve(path, follow_links) {
                Ok(target) => state.info(&target, state.node(&target)?),
                Err(_) => state.info(path, node),
            };
            info.name = path
                .file_name()
                .map(|n| CompactString::from(n.to_string_lossy().as_ref()))
                .unwrap_or_default();
            entries.push(info);
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
        let path = match kind {
            FindDirectoryKind::Desktop => PathBuf::from("/Desktop"),
            FindDirectoryKind::Trash => PathBuf::from("/.Trash"),
        };
        let mut state = self.inner.enter("find_directory", &path)?;
        match state.nodes.get(&path).map(|n| &n.content) {
            Some(Content::Directory) => {}
            Some(_) => return Err(ErrorCode::NotADirectory),
            None if create_if_needed => {
                let node = state.new_node(Content::Directory, 0o700);
                state.nodes.insert(path.clone(), node);
            }
            None => return Err(ErrorCode::NotFound),
        }
        Ok(Self::uri(path))
    }

    fn make_directory(&self, uri: &Uri, permissions: u32, ctx: &OpContext<'_>) -> BackendResult<()> {
        ctx.checkpoint()?;
        let mut state = self.inner.enter("make_directory", uri.path())?;
        state.require_parent_dir(uri.path())?;
        if state.nodes.contains_key(uri.path()) {
            return Err(ErrorCode::FileExists);
        }
        let node = state.new_node(Content::Directory, permissions);
        state.nodes.insert(uri.path().to_path_buf(), node);
        Ok(())
    }

    fn remove(&self, uri: &Uri, ctx: &OpContext<'_>) -> BackendResult<()> {
        ctx.checkpoint()?;
        let mut state = self.inner.enter("remove", uri.path())?;
        let path = uri.path();
        if path == Path::new("/") {
            return Err(ErrorCode::NotPermitted);
        }
        if matches!(state.node(path)?.content, Content::Directory) && state.has_children(path) {
            return Err(ErrorCode::DirectoryNotEmpty);
        }
        state.nodes.remove(path);
        Ok(())
    }

    fn rename(&self, from: &Uri, to: &Uri, ctx: &OpContext<'_>) -> BackendResult<()> {
        ctx.checkpoint()?;
        let mut state = self.inner.enter("rename", from.path())?;
        let (src, dst) = (from.path(), to.path());
        state.node(src)?;
        state.require_parent_dir(dst)?;
        if src == dst {
            return Ok(());
        }
        if dst.starts_with(src) {
            return Err(ErrorCode::BadParameters);
        }
        if state.device(src) != state.device(dst) {
            return Err(ErrorCode::NotSameFileSystem);
        }

        let src_is_dir = matches!(state.node(src)?.content, Content::Directory);
        if let Ok(existing) = state.node(dst) {
            match existing.content {
                Content::Directory if !src_is_dir => return Err(ErrorCode::IsDirectory),
                Content::Directory if state.has_children(dst) => {
                    return Err(ErrorCode::DirectoryNotEmpty);
                }
                _ if src_is_dir && !matches!(existing.content, Content::Directory) => {
                    return Err(ErrorCode::NotADirectory);
                }
                _ => {}
            }
            state.nodes.remove(dst);
        }

        move_subtree(&mut state.nodes, src, dst);
        Ok(())
    }

    fn same_fs(&self, a: &Uri, b: &Uri, ctx: &OpContext<'_>) -> BackendResult<bool> {
        ctx.checkpoint()?;
        let state = self.inner.enter("same_fs", a.path())?;
        Ok(state.device(a.path()) == state.device(b.path()))
    }
}

/// Re-key `from` and everything beneath it to live under `to`.
fn move_subtree(nodes: &mut BTreeMap<PathBuf, Node>, from: &Path, to: &Path) {
    let keys: Vec<PathBuf> = nodes
        .keys()
        .filter(|k| k.starts_with(from))
        .cloned()
        .collect();
    for key in keys {
        if let Some(node) = nodes.remove(&key) {
            let suffix = key.strip_prefix(from).unwrap_or(Path::new(""));
            let new_key = if suffix.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(suffix)
            };
            nodes.insert(new_key, node);
        }
    }
}
