//! The transfer state machine.
//!
//! A transfer runs in three stages: every source/target pair is checked,
//! everything the transfer will touch is collected so totals are known, and
//! then each file is driven through its phases. Every blocking step consults
//! the cancellation token first, and every snapshot goes to an
//! [`XferMonitor`], which answers the snapshots that need a decision.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use avfs_core::{
    Backend, BackendRegistry, BackendResult, EngineConfig, ErrorCode, FileHandle, FileInfo,
    FileType, OpContext, OpenMode, SetInfoMask, Uri, VfsError,
};
use tokio_util::sync::CancellationToken;

use super::names::{MAX_CANDIDATES, unique_name};
use super::options::{ErrorMode, OverwriteMode, TransferMode, TransferRequest};
use super::plan::{self, PlanEntry, TopLevel};
use super::progress::{XferDecision, XferPhase, XferProgressInfo, XferStatus, XferSummary};

const DEFAULT_FILE_PERMS: u32 = 0o644;
const DEFAULT_DIR_PERMS: u32 = 0o755;

/// Receives transfer snapshots.
///
/// Snapshots whose [`XferProgressInfo::is_query`] is true wait for the
/// returned decision. For the others, returning [`XferDecision::Abort`]
/// cancels the transfer and anything else is ignored.
pub trait XferMonitor {
    fn update(&mut self, info: &XferProgressInfo) -> XferDecision;
}

impl<F> XferMonitor for F
where
    F: FnMut(&XferProgressInfo) -> XferDecision,
{
    fn update(&mut self, info: &XferProgressInfo) -> XferDecision {
        self(info)
    }
}

/// Run a transfer on the calling thread.
///
/// `monitor` is invoked inline for every snapshot. Cancelling `cancel` from
/// another thread stops the transfer at its next step.
pub fn transfer_sync(
    registry: &BackendRegistry,
    request: &TransferRequest,
    config: &EngineConfig,
    monitor: &mut dyn XferMonitor,
    cancel: CancellationToken,
) -> Result<XferSummary, VfsError> {
    request.validate(registry)?;
    let ctx = OpContext::new(cancel);
    Ok(run_transfer(registry, request, config, monitor, &ctx)?)
}

/// Run an already validated transfer.
pub(crate) fn run_transfer(
    registry: &BackendRegistry,
    request: &TransferRequest,
    config: &EngineConfig,
    monitor: &mut dyn XferMonitor,
    ctx: &OpContext<'_>,
) -> Result<XferSummary, ErrorCode> {
    Xfer {
        registry,
        request,
        monitor,
        ctx,
        buffer_size: config.buffer_size.max(1),
        progress_interval: config.progress_interval,
        info: XferProgressInfo::default(),
        overwrite: request.overwrite_mode,
        skip_errors: false,
        file_base: 0,
        last_report: Instant::now(),
        summary: XferSummary::default(),
    }
    .run()
}

enum ErrorAction {
    Retry,
    Skip,
}

/// Where an entry lands once target conflicts are settled.
enum Slot {
    /// Nothing is in the way.
    Free(Uri),
    /// An existing directory receives the entry's children.
    Merge(Uri),
}

impl Slot {
    fn uri(&self) -> &Uri {
        match self {
            Self::Free(uri) | Self::Merge(uri) => uri,
        }
    }
}

/// Handles of the file being copied. Whatever is still held when the copy
/// bails out gets closed, and an unfinished target is removed.
struct OpenPair {
    source: Option<Box<dyn FileHandle>>,
    sink: Option<Box<dyn FileHandle>>,
    partial: Option<(Arc<dyn Backend>, Uri)>,
}

impl Drop for OpenPair {
    fn drop(&mut self) {
        let ctx = OpContext::detached();
        for handle in [self.source.take(), self.sink.take()].into_iter().flatten() {
            let _ = handle.close(&ctx);
        }
        if let Some((backend, uri)) = self.partial.take() {
            if let Err(code) = backend.remove(&uri, &ctx) {
                tracing::debug!(target: "avfs::xfer", %uri, ?code, "could not remove partial target");
            }
        }
    }
}

struct Xfer<'a, 'c, M: XferMonitor + ?Sized> {
    registry: &'a BackendRegistry,
    request: &'a TransferRequest,
    monitor: &'a mut M,
    ctx: &'a OpContext<'c>,
    buffer_size: usize,
    progress_interval: Duration,
    info: XferProgressInfo,
    /// Overwrite policy, updated by ReplaceAll and SkipAll replies.
    overwrite: OverwriteMode,
    /// Set by a SkipAll reply to an error query.
    skip_errors: bool,
    /// `total_bytes_copied` when the current file started.
    file_base: u64,
    last_report: Instant,
    summary: XferSummary,
}

impl<M: XferMonitor + ?Sized> Xfer<'_, '_, M> {
    fn run(mut self) -> Result<XferSummary, ErrorCode> {
        let request = self.request;
        tracing::debug!(
            target: "avfs::xfer",
            mode = %request.options.mode,
            sources = request.sources.len(),
            "transfer started"
        );
        self.phase(XferPhase::Initial)?;

        self.phase(XferPhase::CheckingDestination)?;
        let mut checked = Vec::with_capacity(request.sources.len());
        for (source, target) in request.pairs() {
            if let Some(item) = self.check(source, target)? {
                checked.push(item);
            }
        }

        self.clear_current();
        self.phase(XferPhase::Collecting)?;
        let mut items = Vec::with_capacity(checked.len());
        for item in checked {
            if let Some(item) = self.collect(item)? {
                items.push(item);
            }
        }
        self.info.files_total = items.iter().map(TopLevel::file_count).sum();
        self.info.bytes_total = items.iter().map(TopLevel::byte_count).sum();

        self.clear_current();
        self.phase(XferPhase::ReadyToGo)?;

        for item in items {
            match request.options.mode {
                TransferMode::Delete => self.delete_item(item)?,
                TransferMode::Link => self.link_item(item)?,
                TransferMode::Move if item.rename => self.rename_item(item)?,
                TransferMode::Copy | TransferMode::Move => self.copy_item(item)?,
            }
        }

        self.clear_current();
        self.phase(XferPhase::Cleanup)?;

        self.info.phase = XferPhase::Completed;
        self.summary.total_bytes_copied = self.info.total_bytes_copied;
        self.monitor.update(&self.info);

        tracing::debug!(
            target: "avfs::xfer",
            files = self.summary.files_transferred,
            skipped = self.summary.files_skipped,
            bytes = self.summary.bytes_written,
            "transfer completed"
        );
        Ok(self.summary)
    }

    // Stage 1: sources and destinations.

    fn check(&mut self, source: Uri, target: Option<Uri>) -> Result<Option<TopLevel>, ErrorCode> {
        let request = self.request;
        let source_backend = self.registry.resolve(&source).map_err(|e| e.code())?;
        let target_backend = match &target {
            Some(target) => Some(self.registry.resolve(target).map_err(|e| e.code())?),
            None => None,
        };
        self.info.source_name = Some(source.to_string());
        self.info.target_name = target.as_ref().map(Uri::to_string);

        let follow = request.options.follow_links && request.options.mode != TransferMode::Delete;
        let Some(info) = self.retry(|ctx| source_backend.get_file_info(&source, follow, ctx))? else {
            self.summary.files_skipped += 1;
            return Ok(None);
        };

        let mut rename = false;
        if let (Some(target), Some(target_backend)) = (&target, &target_backend) {
            loop {
                match self.check_target(&source, target, &info, &*source_backend, &**target_backend) {
                    Ok(by_rename) => {
                        rename = by_rename;
                        break;
                    }
                    Err(code) => match self.on_error(code)? {
                        ErrorAction::Retry => continue,
                        ErrorAction::Skip => {
                            self.summary.files_skipped += 1;
                            return Ok(None);
                        }
                    },
                }
            }
        }

        let single = rename || request.options.mode == TransferMode::Link;
        Ok(Some(TopLevel {
            source,
            target,
            info,
            source_backend,
            target_backend,
            rename,
            single,
            entries: Vec::new(),
        }))
    }

    /// Validate one pair; returns whether it can be moved by renaming.
    fn check_target(
        &self,
        source: &Uri,
        target: &Uri,
        info: &FileInfo,
        source_backend: &dyn Backend,
        target_backend: &dyn Backend,
    ) -> BackendResult<bool> {
        let options = &self.request.options;
        let renames_on_clash =
            options.use_unique_names || self.request.overwrite_mode == OverwriteMode::RenameUnique;

        if source == target && (options.mode != TransferMode::Copy || !renames_on_clash) {
            return Err(ErrorCode::BadParameters);
        }
        if info.is_dir() && source != target && source.is_ancestor_of(target) {
            return Err(ErrorCode::BadParameters);
        }

        let parent = target.parent().ok_or(ErrorCode::BadParameters)?;
        if !target_backend.get_file_info(&parent, true, self.ctx)?.is_dir() {
            return Err(ErrorCode::NotADirectory);
        }

        if options.mode != TransferMode::Move
            || !options.same_fs
            || source.scheme() != target.scheme()
        {
            return Ok(false);
        }
        // Merging into an existing directory needs the copy path.
        let merging = info.is_dir()
            && matches!(target_backend.get_file_info(target, false, self.ctx), Ok(existing) if existing.is_dir());
        if merging {
            return Ok(false);
        }
        match source_backend.same_fs(source, target, self.ctx) {
            Ok(same) => Ok(same),
            Err(ErrorCode::Cancelled) => Err(ErrorCode::Cancelled),
            Err(_) => Ok(false),
        }
    }

    // Stage 2: collecting.

    fn collect(&mut self, mut item: TopLevel) -> Result<Option<TopLevel>, ErrorCode> {
        let request = self.request;
        let options = &request.options;
        let root = item.root_entry();
        let delete = options.mode == TransferMode::Delete;

        if item.single || (root.is_dir() && delete && !options.recursive) {
            item.entries = vec![root];
            return Ok(Some(item));
        }

        let recursive = options.recursive;
        let follow = options.follow_links && !delete;
        let backend = Arc::clone(&item.source_backend);
        self.info.source_name = Some(item.source.to_string());

        let entries = self.retry(|ctx| {
            if root.is_dir() && !recursive {
                return Err(ErrorCode::IsDirectory);
            }
            plan::enumerate(&*backend, root.clone(), follow, delete, ctx)
        })?;
        match entries {
            Some(entries) => {
                item.entries = entries;
                Ok(Some(item))
            }
            None => {
                self.summary.files_skipped += 1;
                Ok(None)
            }
        }
    }

    // Stage 3: per-item processing.

    fn copy_item(&mut self, item: TopLevel) -> Result<(), ErrorCode> {
        let moving = self.request.options.mode == TransferMode::Move;
        let target_backend = item.target_backend.clone().ok_or(ErrorCode::Internal)?;
        let mut root_target = item.target.clone().ok_or(ErrorCode::Internal)?;

        let mut created_dirs: Vec<(Uri, &FileInfo)> = Vec::new();
        // Subtrees that are not transferred at all.
        let mut pruned: Vec<PathBuf> = Vec::new();
        // Sources that must not be deleted by a move.
        let mut kept: Vec<PathBuf> = Vec::new();

        for entry in &item.entries {
            if pruned.iter().any(|p| entry.relative.starts_with(p)) {
                self.skip_unvisited(entry);
                continue;
            }

            let target = if entry.is_top() {
                root_target.clone()
            } else {
                root_target.join(&entry.relative)
            };
            self.begin(entry, Some(&target), !entry.is_dir());

            let Some(slot) = self.resolve_target(&target_backend, target, entry.is_dir())? else {
                if entry.is_dir() {
                    pruned.push(entry.relative.clone());
                } else {
                    self.skip_current();
                }
                kept.push(entry.relative.clone());
                continue;
            };
            if entry.is_top() {
                root_target = slot.uri().clone();
            }
            self.info.target_name = Some(slot.uri().to_string());

            let done = match (&slot, entry.info.file_type) {
                (Slot::Merge(_), _) => true,
                (Slot::Free(target), FileType::Directory) => {
                    let created = self.make_directory(&target_backend, target, &entry.info)?;
                    if created {
                        created_dirs.push((target.clone(), &entry.info));
                    } else {
                        pruned.push(entry.relative.clone());
                    }
                    created
                }
                (Slot::Free(target), FileType::Symlink) => {
                    self.copy_symlink(&item.source_backend, &target_backend, entry, target)?
                }
                (Slot::Free(target), _) => {
                    self.copy_file(&item.source_backend, &target_backend, entry, target)?
                }
            };
            if !done {
                kept.push(entry.relative.clone());
            }
        }

        // Directory attributes last, so adding children does not undo them.
        for (target, info) in created_dirs.iter().rev() {
            self.apply_attributes(&target_backend, target, info)?;
        }

        if moving {
            let source_backend = Arc::clone(&item.source_backend);
            for entry in item.entries.iter().rev().filter(|e| e.is_dir()) {
                if kept.iter().any(|k| k.starts_with(&entry.relative)) {
                    continue;
                }
                self.retry(|ctx| source_backend.remove(&entry.source, ctx))?;
            }
        }
        Ok(())
    }

    /// Copy one regular file. Returns whether it was fully handled.
    fn copy_file(
        &mut self,
        source_backend: &Arc<dyn Backend>,
        target_backend: &Arc<dyn Backend>,
        entry: &PlanEntry,
        target: &Uri,
    ) -> Result<bool, ErrorCode> {
        self.phase(XferPhase::OpenSource)?;
        let Some(source) =
            self.retry(|ctx| source_backend.open(&entry.source, OpenMode::read().sequential(), ctx))?
        else {
            self.skip_current();
            return Ok(false);
        };
        let mut pair = OpenPair {
            source: Some(source),
            sink: None,
            partial: None,
        };

        self.phase(XferPhase::OpenTarget)?;
        let permissions = if self.request.options.target_default_perms {
            DEFAULT_FILE_PERMS
        } else {
            entry.info.permissions
        };
        let Some(sink) = self.retry(|ctx| {
            target_backend.create(target, OpenMode::write().sequential(), false, permissions, ctx)
        })?
        else {
            self.skip_current();
            return Ok(false);
        };
        pair.sink = Some(sink);
        pair.partial = Some((Arc::clone(target_backend), target.clone()));

        self.phase(XferPhase::Copying)?;
        if !self.pump(&mut pair)? {
            self.skip_current();
            return Ok(false);
        }

        self.phase(XferPhase::CloseSource)?;
        if let Some(handle) = pair.source.take() {
            if let Err(code) = handle.close(self.ctx) {
                tracing::debug!(target: "avfs::xfer", source = %entry.source, ?code, "close failed");
            }
        }
        self.phase(XferPhase::CloseTarget)?;
        if let Some(handle) = pair.sink.take() {
            if let Err(code) = handle.close(self.ctx) {
                // A failed close cannot be retried; anything but abort skips the file.
                self.on_error(code)?;
                self.skip_current();
                return Ok(false);
            }
        }
        pair.partial = None;

        self.info.warning = self.apply_attributes(target_backend, target, &entry.info)?;
        let done = if self.request.options.mode == TransferMode::Move {
            self.delete_source(source_backend, &entry.source)?
        } else {
            true
        };
        self.complete_current()?;
        Ok(done)
    }

    /// Move bytes from source to sink. Returns false if the file was skipped.
    fn pump(&mut self, pair: &mut OpenPair) -> Result<bool, ErrorCode> {
        let (Some(source), Some(sink)) = (pair.source.as_deref_mut(), pair.sink.as_deref_mut()) else {
            return Err(ErrorCode::Internal);
        };
        let mut buf = vec![0u8; self.buffer_size];

        loop {
            self.ctx.checkpoint()?;
            self.info.phase = XferPhase::ReadSource;
            let Some(n) = self.retry(|ctx| source.read(&mut buf, ctx))? else {
                return Ok(false);
            };
            if n == 0 {
                return Ok(true);
            }

            self.info.phase = XferPhase::WriteTarget;
            let mut written = 0;
            while written < n {
                let chunk = &buf[written..n];
                let Some(accepted) = self.retry(|ctx| sink.write(chunk, ctx))? else {
                    return Ok(false);
                };
                if accepted == 0 {
                    return Err(ErrorCode::Io);
                }
                written += accepted;
            }

            self.info.bytes_copied += n as u64;
            self.summary.bytes_written += n as u64;
            self.info.total_bytes_copied =
                self.file_base + self.info.bytes_copied.min(self.info.file_size);
            self.info.phase = XferPhase::Copying;
            if self.last_report.elapsed() >= self.progress_interval {
                self.report()?;
            }
        }
    }

    fn copy_symlink(
        &mut self,
        source_backend: &Arc<dyn Backend>,
        target_backend: &Arc<dyn Backend>,
        entry: &PlanEntry,
        target: &Uri,
    ) -> Result<bool, ErrorCode> {
        let link = entry.info.symlink_target.clone().unwrap_or_default();
        self.phase(XferPhase::OpenTarget)?;
        if self
            .retry(|ctx| target_backend.create_symlink(target, &link, ctx))?
            .is_none()
        {
            self.skip_current();
            return Ok(false);
        }
        let done = if self.request.options.mode == TransferMode::Move {
            self.delete_source(source_backend, &entry.source)?
        } else {
            true
        };
        self.complete_current()?;
        Ok(done)
    }

    fn make_directory(
        &mut self,
        backend: &Arc<dyn Backend>,
        target: &Uri,
        info: &FileInfo,
    ) -> Result<bool, ErrorCode> {
        // Owner access is needed to fill the directory; the real mode follows later.
        let permissions = if self.request.options.target_default_perms {
            DEFAULT_DIR_PERMS
        } else {
            info.permissions | 0o700
        };
        Ok(self
            .retry(|ctx| backend.make_directory(target, permissions, ctx))?
            .is_some())
    }

    fn rename_item(&mut self, item: TopLevel) -> Result<(), ErrorCode> {
        let entry = item.root_entry();
        let target_backend = item.target_backend.clone().ok_or(ErrorCode::Internal)?;
        let target = item.target.clone().ok_or(ErrorCode::Internal)?;
        self.begin(&entry, Some(&target), true);

        let Some(slot) = self.resolve_target(&target_backend, target, entry.is_dir())? else {
            self.skip_current();
            return Ok(());
        };
        let target = slot.uri().clone();
        self.info.target_name = Some(target.to_string());

        self.phase(XferPhase::Moving)?;
        let backend = Arc::clone(&item.source_backend);
        if self
            .retry(|ctx| backend.rename(&entry.source, &target, ctx))?
            .is_none()
        {
            self.skip_current();
            return Ok(());
        }
        self.complete_current()
    }

    fn link_item(&mut self, item: TopLevel) -> Result<(), ErrorCode> {
        let entry = item.root_entry();
        let target_backend = item.target_backend.clone().ok_or(ErrorCode::Internal)?;
        let target = item.target.clone().ok_or(ErrorCode::Internal)?;
        self.begin(&entry, Some(&target), true);

        let Some(slot) = self.resolve_target(&target_backend, target, false)? else {
            self.skip_current();
            return Ok(());
        };
        let target = slot.uri().clone();
        self.info.target_name = Some(target.to_string());

        self.phase(XferPhase::OpenTarget)?;
        let link = entry.source.path().to_string_lossy().into_owned();
        let same_backend = entry.source.scheme() == target.scheme();
        let linked = self.retry(|ctx| {
            if !same_backend {
                return Err(ErrorCode::NotSupported);
            }
            target_backend.create_symlink(&target, &link, ctx)
        })?;
        if linked.is_none() {
            self.skip_current();
            return Ok(());
        }
        self.complete_current()
    }

    fn delete_item(&mut self, item: TopLevel) -> Result<(), ErrorCode> {
        let backend = Arc::clone(&item.source_backend);
        let mut kept: Vec<PathBuf> = Vec::new();

        // Entries arrive children first.
        for entry in &item.entries {
            if entry.is_dir() {
                if kept.iter().any(|k| k.starts_with(&entry.relative)) {
                    kept.push(entry.relative.clone());
                    continue;
                }
                self.begin(entry, None, false);
                if self
                    .retry(|ctx| backend.remove(&entry.source, ctx))?
                    .is_none()
                {
                    kept.push(entry.relative.clone());
                }
                continue;
            }

            self.begin(entry, None, true);
            if !self.delete_source(&backend, &entry.source)? {
                kept.push(entry.relative.clone());
                self.skip_current();
                continue;
            }
            self.complete_current()?;
        }
        Ok(())
    }

    fn delete_source(&mut self, backend: &Arc<dyn Backend>, source: &Uri) -> Result<bool, ErrorCode> {
        self.phase(XferPhase::DeleteSource)?;
        Ok(self.retry(|ctx| backend.remove(source, ctx))?.is_some())
    }

    /// Copy permissions and timestamps. A failure is returned as a warning.
    fn apply_attributes(
        &mut self,
        backend: &Arc<dyn Backend>,
        target: &Uri,
        info: &FileInfo,
    ) -> Result<Option<ErrorCode>, ErrorCode> {
        self.phase(XferPhase::SetAttributes)?;
        let mask = SetInfoMask {
            permissions: !self.request.options.target_default_perms,
            ..SetInfoMask::attributes()
        };
        match backend.set_file_info(target, info, mask, self.ctx) {
            Ok(()) => Ok(None),
            Err(ErrorCode::Cancelled) => Err(ErrorCode::Cancelled),
            Err(code) => {
                tracing::warn!(target: "avfs::xfer", %target, ?code, "could not set attributes");
                self.summary.warnings.push((target.to_string(), code));
                Ok(Some(code))
            }
        }
    }

    // Conflicts at the target.

    fn resolve_target(
        &mut self,
        backend: &Arc<dyn Backend>,
        target: Uri,
        is_dir: bool,
    ) -> Result<Option<Slot>, ErrorCode> {
        let existing = loop {
            match backend.get_file_info(&target, false, self.ctx) {
                Ok(existing) => break existing,
                Err(ErrorCode::NotFound) => return Ok(Some(Slot::Free(target))),
                Err(code) => match self.on_error(code)? {
                    ErrorAction::Retry => continue,
                    ErrorAction::Skip => return Ok(None),
                },
            }
        };

        if self.request.options.use_unique_names {
            return self.duplicate_name(backend, target);
        }

        let choice = match self.overwrite {
            OverwriteMode::Query => match self.ask(XferStatus::NeedsOverwriteDecision)? {
                XferDecision::Replace => OverwriteMode::Replace,
                XferDecision::ReplaceAll => {
                    self.overwrite = OverwriteMode::Replace;
                    OverwriteMode::Replace
                }
                XferDecision::Skip => OverwriteMode::Skip,
                XferDecision::SkipAll => {
                    self.overwrite = OverwriteMode::Skip;
                    OverwriteMode::Skip
                }
                XferDecision::RenameUnique => OverwriteMode::RenameUnique,
                _ => return Err(ErrorCode::Interrupted),
            },
            mode => mode,
        };

        match choice {
            // Replacing a directory with a directory merges into it.
            OverwriteMode::Replace if existing.is_dir() && is_dir => Ok(Some(Slot::Merge(target))),
            OverwriteMode::Replace => {
                let backend = Arc::clone(backend);
                let removed = self.retry(|ctx| {
                    if existing.is_dir() {
                        remove_tree(&*backend, &target, ctx)
                    } else {
                        backend.remove(&target, ctx)
                    }
                })?;
                Ok(removed.map(|()| Slot::Free(target)))
            }
            OverwriteMode::Skip => Ok(None),
            OverwriteMode::RenameUnique => self.next_free_name(backend, target),
            OverwriteMode::Abort | OverwriteMode::Query => Err(ErrorCode::FileExists),
        }
    }

    fn next_free_name(&mut self, backend: &Arc<dyn Backend>, target: Uri) -> Result<Option<Slot>, ErrorCode> {
        let name = target.file_name().unwrap_or_default().to_string();
        for n in 1..=MAX_CANDIDATES {
            let candidate = target.with_file_name(&unique_name(&name, n));
            match self.retry(|ctx| backend.exists(&candidate, ctx))? {
                None => return Ok(None),
                Some(true) => continue,
                Some(false) => return Ok(Some(Slot::Free(candidate))),
            }
        }
        Err(ErrorCode::FileExists)
    }

    /// Offer free "name (N)" candidates until the caller settles on one.
    fn duplicate_name(&mut self, backend: &Arc<dyn Backend>, target: Uri) -> Result<Option<Slot>, ErrorCode> {
        let name = target.file_name().unwrap_or_default().to_string();
        let mut n = 1;

        while n <= MAX_CANDIDATES {
            let candidate = target.with_file_name(&unique_name(&name, n));
            match self.retry(|ctx| backend.exists(&candidate, ctx))? {
                None => return Ok(None),
                Some(true) => {
                    n += 1;
                    continue;
                }
                Some(false) => {}
            }

            self.info.duplicate_name = candidate.file_name().map(str::to_string);
            self.info.duplicate_count = n;
            match self.ask(XferStatus::NeedsDuplicateNameDecision)? {
                XferDecision::Continue => return Ok(Some(Slot::Free(candidate))),
                XferDecision::UseName(custom) if is_plain_name(&custom) => {
                    let chosen = target.with_file_name(&custom);
                    match self.retry(|ctx| backend.exists(&chosen, ctx))? {
                        None => return Ok(None),
                        Some(false) => return Ok(Some(Slot::Free(chosen))),
                        Some(true) => n += 1,
                    }
                }
                XferDecision::NextCandidate | XferDecision::UseName(_) => n += 1,
                XferDecision::Skip | XferDecision::SkipAll => return Ok(None),
                _ => return Err(ErrorCode::Interrupted),
            }
        }
        Err(ErrorCode::FileExists)
    }

    // Progress bookkeeping.

    fn begin(&mut self, entry: &PlanEntry, target: Option<&Uri>, counted: bool) {
        self.info.source_name = Some(entry.source.to_string());
        self.info.target_name = target.map(Uri::to_string);
        self.info.top_level_item = entry.is_top();
        self.info.warning = None;
        if counted {
            self.info.file_index += 1;
            self.info.file_size = entry.size();
            self.info.bytes_copied = 0;
            self.file_base = self.info.total_bytes_copied;
        }
    }

    fn clear_current(&mut self) {
        self.info.source_name = None;
        self.info.target_name = None;
        self.info.top_level_item = false;
        self.info.file_size = 0;
        self.info.bytes_copied = 0;
    }

    fn complete_current(&mut self) -> Result<(), ErrorCode> {
        self.info.total_bytes_copied = self.file_base + self.info.file_size;
        self.summary.files_transferred += 1;
        self.phase(XferPhase::FileCompleted)?;
        self.info.warning = None;
        Ok(())
    }

    fn skip_current(&mut self) {
        tracing::debug!(
            target: "avfs::xfer",
            source = self.info.source_name.as_deref().unwrap_or_default(),
            "skipped"
        );
        self.info.total_bytes_copied = self.file_base + self.info.file_size;
        self.summary.files_skipped += 1;
    }

    /// Account for a file below a directory that was skipped.
    fn skip_unvisited(&mut self, entry: &PlanEntry) {
        if entry.is_dir() {
            return;
        }
        self.info.file_index += 1;
        self.info.total_bytes_copied += entry.size();
        self.summary.files_skipped += 1;
    }

    fn phase(&mut self, phase: XferPhase) -> Result<(), ErrorCode> {
        self.info.phase = phase;
        tracing::trace!(target: "avfs::xfer", %phase, index = self.info.file_index, "phase");
        self.report()
    }

    /// Post an informational snapshot.
    fn report(&mut self) -> Result<(), ErrorCode> {
        self.ctx.checkpoint()?;
        self.last_report = Instant::now();
        match self.monitor.update(&self.info) {
            XferDecision::Abort => Err(ErrorCode::Cancelled),
            _ => Ok(()),
        }
    }

    /// Post a query and wait for the answer.
    fn ask(&mut self, status: XferStatus) -> Result<XferDecision, ErrorCode> {
        self.ctx.checkpoint()?;
        self.info.status = status;
        let decision = self.monitor.update(&self.info);
        tracing::debug!(target: "avfs::xfer", %status, ?decision, "query answered");

        self.info.status = XferStatus::Ok;
        self.info.vfs_status = None;
        self.info.duplicate_name = None;
        self.info.duplicate_count = 0;
        self.ctx.checkpoint()?;
        Ok(decision)
    }

    /// Apply the error mode to a failed step. `Err` aborts the transfer.
    fn on_error(&mut self, code: ErrorCode) -> Result<ErrorAction, ErrorCode> {
        if code == ErrorCode::Cancelled || self.ctx.is_cancelled() {
            return Err(ErrorCode::Cancelled);
        }
        tracing::debug!(
            target: "avfs::xfer",
            phase = %self.info.phase,
            source = self.info.source_name.as_deref().unwrap_or_default(),
            ?code,
            "step failed"
        );
        if self.skip_errors {
            return Ok(ErrorAction::Skip);
        }

        match self.request.error_mode {
            ErrorMode::Abort => Err(code),
            ErrorMode::Query => {
                self.info.vfs_status = Some(code);
                match self.ask(XferStatus::BackendError)? {
                    XferDecision::Retry => Ok(ErrorAction::Retry),
                    XferDecision::Skip => Ok(ErrorAction::Skip),
                    XferDecision::SkipAll => {
                        self.skip_errors = true;
                        Ok(ErrorAction::Skip)
                    }
                    _ => Err(code),
                }
            }
        }
    }

    /// Run `op` until it succeeds or the error mode says otherwise.
    /// `Ok(None)` means the caller chose to skip.
    fn retry<T>(
        &mut self,
        mut op: impl FnMut(&OpContext<'_>) -> BackendResult<T>,
    ) -> Result<Option<T>, ErrorCode> {
        loop {
            match op(self.ctx) {
                Ok(value) => return Ok(Some(value)),
                Err(code) => match self.on_error(code)? {
                    ErrorAction::Retry => continue,
                    ErrorAction::Skip => return Ok(None),
                },
            }
        }
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

/// Remove a directory and everything beneath it.
fn remove_tree(backend: &dyn Backend, uri: &Uri, ctx: &OpContext<'_>) -> BackendResult<()> {
    for child in backend.load_directory(uri, false, ctx)? {
        let path = uri.join(child.name.as_str());
        if child.is_dir() {
            remove_tree(backend, &path, ctx)?;
        } else {
            backend.remove(&path, ctx)?;
        }
    }
    backend.remove(uri, ctx)
}
