//! Jobs: one operation, its cancellation token and its priority.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use avfs_core::{
    Backend, BackendRegistry, BackendResult, EngineConfig, ErrorCode, FileHandle, OpContext, Uri,
};
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio_util::sync::CancellationToken;

use crate::arena::Index;
use crate::channel::{ChannelMonitor, JobCallbacks, NotificationResult, Notifier};
use crate::files::{FileId, FileTable};
use crate::operation::{Operation, Outcome};
use crate::xfer::run_transfer;

/// Caller-visible identity of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobHandle(pub(crate) Index);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Shared state every job executes against.
pub(crate) struct JobEnv {
    pub registry: Arc<BackendRegistry>,
    pub files: Arc<FileTable>,
    pub notifier: Notifier,
    pub config: EngineConfig,
}

impl JobEnv {
    fn backend(&self, uri: &Uri) -> BackendResult<Arc<dyn Backend>> {
        self.registry.resolve(uri).map_err(|e| e.code())
    }
}

pub(crate) struct Job {
    pub handle: JobHandle,
    pub operation: Operation,
    pub priority: i32,
    pub cancel: CancellationToken,
}

impl Job {
    /// Execute the operation and build the job's result. Panics inside a
    /// backend are contained to this job.
    pub fn run(self, env: &JobEnv) -> NotificationResult {
        let kind = self.operation.kind();
        tracing::debug!(target: "avfs::scheduler", job = %self.handle, %kind, priority = self.priority, "job started");

        let mut outcome = panic::catch_unwind(AssertUnwindSafe(|| self.execute(env)))
            .unwrap_or_else(|_| {
                tracing::error!(target: "avfs::scheduler", job = %self.handle, %kind, "backend panicked");
                Err(ErrorCode::Internal)
            });

        let cancelled = self.cancel.is_cancelled() || outcome == Err(ErrorCode::Cancelled);
        if cancelled {
            if let Some(file) = outcome.as_ref().ok().and_then(Outcome::file) {
                close_unclaimed(env, file);
            }
            outcome = Err(ErrorCode::Cancelled);
        }

        tracing::debug!(
            target: "avfs::scheduler",
            job = %self.handle,
            %kind,
            cancelled,
            error = ?outcome.as_ref().err(),
            "job finished"
        );
        NotificationResult {
            job: self.handle,
            kind,
            outcome,
            cancelled,
        }
    }

    fn execute(&self, env: &JobEnv) -> Result<Outcome, ErrorCode> {
        let callbacks = JobCallbacks {
            job: self.handle,
            notifier: &env.notifier,
        };
        let ctx = OpContext::new(self.cancel.clone()).with_callbacks(&callbacks);
        ctx.checkpoint()?;

        match &self.operation {
            Operation::Open { uri, mode } => {
                let handle = env.backend(uri)?.open(uri, *mode, &ctx)?;
                Ok(Outcome::Opened(env.files.insert(uri.clone(), false, handle)))
            }
            Operation::OpenAsStream { uri, mode } => {
                let handle = env.backend(uri)?.open(uri, mode.sequential(), &ctx)?;
                Ok(Outcome::Opened(env.files.insert(uri.clone(), true, handle)))
            }
            Operation::Create {
                uri,
                mode,
                exclusive,
                permissions,
            } => {
                let handle = env.backend(uri)?.create(uri, *mode, *exclusive, *permissions, &ctx)?;
                Ok(Outcome::Opened(env.files.insert(uri.clone(), false, handle)))
            }
            Operation::CreateAsStream {
                uri,
                mode,
                exclusive,
                permissions,
            } => {
                let handle =
                    env.backend(uri)?
                        .create(uri, mode.sequential(), *exclusive, *permissions, &ctx)?;
                Ok(Outcome::Opened(env.files.insert(uri.clone(), true, handle)))
            }
            Operation::CreateSymlink { uri, target } => {
                env.backend(uri)?.create_symlink(uri, target, &ctx)?;
                Ok(Outcome::Done)
            }
            Operation::Close { file } => {
                let checkout = env.files.checkout(*file)?;
                env.files.retire(checkout).close(&ctx)?;
                Ok(Outcome::Done)
            }
            Operation::Read { file, count } => with_file(env, *file, |handle, _| {
                let mut buf = vec![0u8; *count];
                let n = handle.read(&mut buf, &ctx)?;
                if n == 0 {
                    return Err(ErrorCode::Eof);
                }
                buf.truncate(n);
                Ok(Outcome::Read(buf))
            }),
            Operation::Write { file, data } => with_file(env, *file, |handle, _| {
                handle.write(data, &ctx).map(Outcome::Written)
            }),
            Operation::Seek {
                file,
                whence,
                offset,
            } => with_file(env, *file, |handle, stream| {
                if stream {
                    return Err(ErrorCode::NotSupported);
                }
                handle.seek(*whence, *offset, &ctx).map(Outcome::Position)
            }),
            Operation::LoadDirectory { uri, follow_links } => env
                .backend(uri)?
                .load_directory(uri, *follow_links, &ctx)
                .map(Outcome::Directory),
            Operation::FindDirectory {
                near,
                kind,
                create_if_needed,
            } => env
                .backend(near)?
                .find_directory(near, *kind, *create_if_needed, &ctx)
                .map(Outcome::FoundDirectory),
            Operation::Transfer(request) => {
                let mut monitor = ChannelMonitor {
                    job: self.handle,
                    notifier: &env.notifier,
                };
                run_transfer(&env.registry, request, &env.config, &mut monitor, &ctx)
                    .map(Outcome::Transferred)
            }
            Operation::GetFileInfo { uri, follow_links } => env
                .backend(uri)?
                .get_file_info(uri, *follow_links, &ctx)
                .map(|info| Outcome::FileInfo(Box::new(info))),
            Operation::SetFileInfo { uri, info, mask } => {
                env.backend(uri)?.set_file_info(uri, info, *mask, &ctx)?;
                Ok(Outcome::Done)
            }
            Operation::ModuleCallback { name, payload } => env
                .notifier
                .module_callback(self.handle, name, payload.clone())
                .map(Outcome::Value),
            Operation::FileControl {
                file,
                operation,
                data,
            } => with_file(env, *file, |handle, _| {
                handle.control(operation, data, &ctx).map(Outcome::Value)
            }),
        }
    }
}

/// Borrow an open file for one step. The second argument tells whether the
/// file was opened as a stream.
fn with_file<T>(
    env: &JobEnv,
    file: FileId,
    op: impl FnOnce(&mut dyn FileHandle, bool) -> BackendResult<T>,
) -> BackendResult<T> {
    let mut checkout = env.files.checkout(file)?;
    let result = op(&mut *checkout.handle, checkout.stream);
    env.files.checkin(checkout);
    result
}

/// Close a file whose open raced with cancellation; nobody will ever see its id.
fn close_unclaimed(env: &JobEnv, file: FileId) {
    if let Ok(checkout) = env.files.checkout(file) {
        if let Err(code) = env.files.retire(checkout).close(&OpContext::detached()) {
            tracing::debug!(target: "avfs::scheduler", %file, ?code, "close after cancel failed");
        }
    }
}
