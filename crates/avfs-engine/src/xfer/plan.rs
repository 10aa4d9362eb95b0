//! The Collecting pass: enumerate what a transfer will touch before any
//! byte moves, so totals are known up front.

use std::path::PathBuf;
use std::sync::Arc;

use avfs_core::{Backend, BackendResult, ErrorCode, FileInfo, FileType, OpContext, Uri};

/// Directory nesting beyond which enumeration assumes a link cycle.
const MAX_DEPTH: usize = 64;

/// One object below (or at) a top-level source.
#[derive(Debug, Clone)]
pub(crate) struct PlanEntry {
    pub source: Uri,
    /// Location relative to the top-level source; empty for the source itself.
    pub relative: PathBuf,
    pub info: FileInfo,
}

impl PlanEntry {
    pub fn is_top(&self) -> bool {
        self.relative.as_os_str().is_empty()
    }

    pub fn is_dir(&self) -> bool {
        self.info.is_dir()
    }

    /// Bytes this entry contributes to the transfer totals.
    pub fn size(&self) -> u64 {
        size_of(&self.info)
    }
}

pub(crate) fn size_of(info: &FileInfo) -> u64 {
    match info.file_type {
        FileType::Regular => info.size,
        _ => 0,
    }
}

/// One source/target pair with everything collected beneath it.
pub(crate) struct TopLevel {
    pub source: Uri,
    pub target: Option<Uri>,
    pub info: FileInfo,
    pub source_backend: Arc<dyn Backend>,
    pub target_backend: Option<Arc<dyn Backend>>,
    /// Move by a single rename.
    pub rename: bool,
    /// Handled as one unit (a rename or a link) even when it is a directory.
    pub single: bool,
    pub entries: Vec<PlanEntry>,
}

impl TopLevel {
    pub fn root_entry(&self) -> PlanEntry {
        PlanEntry {
            source: self.source.clone(),
            relative: PathBuf::new(),
            info: self.info.clone(),
        }
    }

    /// Number of entries that count as files.
    pub fn file_count(&self) -> u64 {
        if self.single {
            return self.entries.len() as u64;
        }
        self.entries.iter().filter(|e| !e.is_dir()).count() as u64
    }

    pub fn byte_count(&self) -> u64 {
        self.entries.iter().map(PlanEntry::size).sum()
    }
}

/// Walk `root` depth-first. Directories precede their children unless
/// `children_first` is set.
pub(crate) fn enumerate(
    backend: &dyn Backend,
    root: PlanEntry,
    follow_links: bool,
    children_first: bool,
    ctx: &OpContext<'_>,
) -> BackendResult<Vec<PlanEntry>> {
    let mut entries = Vec::new();
    walk(backend, root, follow_links, children_first, 0, ctx, &mut entries)?;
    Ok(entries)
}

fn walk(
    backend: &dyn Backend,
    entry: PlanEntry,
    follow_links: bool,
    children_first: bool,
    depth: usize,
    ctx: &OpContext<'_>,
    out: &mut Vec<PlanEntry>,
) -> BackendResult<()> {
    ctx.checkpoint()?;
    if !entry.is_dir() {
        out.push(entry);
        return Ok(());
    }
    if depth >= MAX_DEPTH {
        return Err(ErrorCode::Loop);
    }

    let children = backend.load_directory(&entry.source, follow_links, ctx)?;
    if !children_first {
        out.push(entry.clone());
    }
    for info in children {
        let child = PlanEntry {
            source: entry.source.join(info.name.as_str()),
            relative: entry.relative.join(info.name.as_str()),
            info,
        };
        walk(backend, child, follow_links, children_first, depth + 1, ctx, out)?;
    }
    if children_first {
        out.push(entry);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, relative: &str, info: FileInfo) -> PlanEntry {
        PlanEntry {
            source: Uri::local(path),
            relative: PathBuf::from(relative),
            info,
        }
    }

    #[test]
    fn test_entry_sizes() {
        let top = entry("/src/d", "", FileInfo::new("d", FileType::Directory, 4096));
        let file = entry("/src/d/a", "a", FileInfo::new("a", FileType::Regular, 42));
        let link = entry("/src/d/l", "l", FileInfo::new("l", FileType::Symlink, 9));

        assert!(top.is_top());
        assert!(!file.is_top());
        assert_eq!(file.size(), 42);
        assert_eq!(link.size(), 0);
        assert_eq!(top.size(), 0);
    }
}
