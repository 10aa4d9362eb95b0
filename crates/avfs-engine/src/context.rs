//! The caller-side face of the engine.
//!
//! A [`Context`] belongs to the thread that created it. Jobs run on worker
//! threads, but every callback (results, transfer progress, decisions and
//! module callbacks) runs on the caller's thread, inside [`Context::drain`],
//! [`Context::wait`] or [`Context::wait_blocking`]. Callbacks are therefore
//! free to capture non-`Send` state.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use avfs_core::{
    BackendRegistry, BackendResult, EngineConfig, ErrorCode, OpContext, PRIORITY_MAX,
    PRIORITY_MIN, VfsError,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::channel::{self, Notification, NotificationResult};
use crate::files::{FileId, FileTable};
use crate::job::{JobEnv, JobHandle, JobState};
use crate::operation::{Operation, OperationKind, Outcome};
use crate::scheduler::{CancelOutcome, Scheduler};
use crate::xfer::{
    TransferRequest, XferDecision, XferMonitor, XferProgressInfo, XferSummary, transfer_sync,
};

/// Receives a job's final result.
pub type ResultCallback = Box<dyn FnOnce(NotificationResult)>;

/// Receives transfer snapshots and answers queries.
pub type ProgressCallback = Box<dyn FnMut(&XferProgressInfo) -> XferDecision>;

type ModuleHandler = Box<dyn FnMut(&Value) -> BackendResult<Value>>;

/// Caller-side bookkeeping for a job whose result is not delivered yet.
struct Pending {
    kind: OperationKind,
    on_result: Option<ResultCallback>,
    on_progress: Option<ProgressCallback>,
    cancel_requested: bool,
}

/// An engine instance: a worker pool, its notification queue, and the
/// callbacks of every outstanding job.
pub struct Context {
    scheduler: Scheduler,
    receiver: mpsc::Receiver<Notification>,
    registry: Arc<BackendRegistry>,
    files: Arc<FileTable>,
    config: EngineConfig,
    pending: HashMap<JobHandle, Pending>,
    /// Results produced on this thread (jobs cancelled while queued).
    local: VecDeque<NotificationResult>,
    module_callbacks: HashMap<String, ModuleHandler>,
    stopped: bool,
}

impl Context {
    /// Start an engine with `config.max_workers` workers.
    pub fn new(registry: BackendRegistry, config: EngineConfig) -> Result<Self, VfsError> {
        config.validate().map_err(VfsError::bad_parameters)?;

        let registry = Arc::new(registry);
        let files = Arc::new(FileTable::new());
        let (notifier, receiver) = channel::channel(config.channel_capacity);
        let env = JobEnv {
            registry: Arc::clone(&registry),
            files: Arc::clone(&files),
            notifier,
            config: config.clone(),
        };
        let scheduler = Scheduler::new(env, config.max_workers)?;

        tracing::debug!(
            target: "avfs::scheduler",
            workers = config.max_workers,
            schemes = ?registry.schemes(),
            "engine started"
        );
        Ok(Self {
            scheduler,
            receiver,
            registry,
            files,
            config,
            pending: HashMap::new(),
            local: VecDeque::new(),
            module_callbacks: HashMap::new(),
            stopped: false,
        })
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Queue an operation. `on_result` runs exactly once, on this thread.
    ///
    /// Malformed operations are rejected here and never reach a worker.
    pub fn submit<F>(
        &mut self,
        operation: Operation,
        priority: i32,
        on_result: F,
    ) -> Result<JobHandle, VfsError>
    where
        F: FnOnce(NotificationResult) + 'static,
    {
        self.enqueue(operation, priority, Some(Box::new(on_result)), None)
    }

    /// Queue a transfer. `on_progress` receives every snapshot and answers
    /// the ones that are queries; `on_result` receives the summary.
    pub fn transfer<P, F>(
        &mut self,
        request: TransferRequest,
        priority: i32,
        on_progress: P,
        on_result: F,
    ) -> Result<JobHandle, VfsError>
    where
        P: FnMut(&XferProgressInfo) -> XferDecision + 'static,
        F: FnOnce(NotificationResult) + 'static,
    {
        self.enqueue(
            Operation::Transfer(Box::new(request)),
            priority,
            Some(Box::new(on_result)),
            Some(Box::new(on_progress)),
        )
    }

    /// Run a transfer on this thread, bypassing the worker pool.
    pub fn transfer_sync(
        &self,
        request: &TransferRequest,
        monitor: &mut dyn XferMonitor,
        cancel: CancellationToken,
    ) -> Result<XferSummary, VfsError> {
        transfer_sync(&self.registry, request, &self.config, monitor, cancel)
    }

    fn enqueue(
        &mut self,
        operation: Operation,
        priority: i32,
        on_result: Option<ResultCallback>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<JobHandle, VfsError> {
        if self.stopped {
            return Err(VfsError::ShutDown);
        }
        if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&priority) {
            return Err(VfsError::bad_parameters(format!(
                "priority {priority} outside {PRIORITY_MIN}..={PRIORITY_MAX}"
            )));
        }
        operation.validate(&self.registry)?;

        let kind = operation.kind();
        let handle = self.scheduler.submit(operation, priority)?;
        self.pending.insert(
            handle,
            Pending {
                kind,
                on_result,
                on_progress,
                cancel_requested: false,
            },
        );
        Ok(handle)
    }

    /// Request cancellation. Returns false if the handle is unknown or its
    /// result was already delivered.
    ///
    /// A queued job is dropped without ever reaching a backend. A running job
    /// stops at its next checkpoint. Either way its callback still receives
    /// exactly one result, flagged as cancelled.
    pub fn cancel(&mut self, handle: JobHandle) -> bool {
        let Some(pending) = self.pending.get_mut(&handle) else {
            return false;
        };
        if pending.cancel_requested {
            return true;
        }
        pending.cancel_requested = true;

        if let CancelOutcome::Dequeued(result) = self.scheduler.cancel(handle) {
            self.local.push_back(result);
        }
        true
    }

    /// Dispatch every notification that is ready, without blocking.
    /// Returns the number of results delivered.
    pub fn drain(&mut self) -> usize {
        let mut delivered = self.flush_local();
        while let Ok(notification) = self.receiver.try_recv() {
            delivered += self.dispatch(notification);
            delivered += self.flush_local();
        }
        delivered
    }

    /// Wait for at least one notification, then drain. Returns immediately
    /// when nothing is outstanding.
    pub async fn wait(&mut self) -> usize {
        if !self.local.is_empty() || self.pending.is_empty() {
            return self.drain();
        }
        match self.receiver.recv().await {
            Some(notification) => self.dispatch(notification) + self.drain(),
            None => 0,
        }
    }

    /// Blocking variant of [`Context::wait`] for threads outside an async
    /// runtime.
    pub fn wait_blocking(&mut self) -> usize {
        if !self.local.is_empty() || self.pending.is_empty() {
            return self.drain();
        }
        match self.receiver.blocking_recv() {
            Some(notification) => self.dispatch(notification) + self.drain(),
            None => 0,
        }
    }

    /// Dispatch notifications until every job has delivered its result.
    pub async fn wait_all(&mut self) {
        while !self.pending.is_empty() {
            self.wait().await;
        }
    }

    /// Blocking variant of [`Context::wait_all`].
    pub fn wait_all_blocking(&mut self) {
        while !self.pending.is_empty() {
            self.wait_blocking();
        }
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.scheduler.queued()
    }

    /// Jobs whose result has not been delivered yet.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// State of a job whose result has not been delivered yet.
    pub fn job_state(&self, handle: JobHandle) -> Option<JobState> {
        if !self.pending.contains_key(&handle) {
            return None;
        }
        self.scheduler.state(handle)
    }

    /// Install the handler backends reach through `name`. Replaces any
    /// previous handler of that name.
    pub fn register_module_callback<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: FnMut(&Value) -> BackendResult<Value> + 'static,
    {
        self.module_callbacks.insert(name.into(), Box::new(handler));
    }

    pub fn unregister_module_callback(&mut self, name: &str) -> bool {
        self.module_callbacks.remove(name).is_some()
    }

    pub fn job_limit(&self) -> usize {
        self.scheduler.limit()
    }

    /// Resize the worker pool. Running jobs are unaffected.
    pub fn set_job_limit(&mut self, limit: usize) -> Result<(), VfsError> {
        self.scheduler.set_limit(limit)
    }

    /// Files opened through this engine and not closed yet.
    pub fn open_files(&self) -> usize {
        self.files.len()
    }

    /// Stop the engine. Queued jobs are cancelled without running, running
    /// jobs are signalled, and every outstanding callback receives its result
    /// before this returns.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn dispatch(&mut self, notification: Notification) -> usize {
        match notification {
            Notification::Completed(result) => self.deliver(result),
            Notification::Progress { job, info } => {
                let decision = match self.pending.get_mut(&job) {
                    Some(pending) if !pending.cancel_requested => {
                        pending.on_progress.as_mut().map(|callback| callback(&info))
                    }
                    _ => None,
                };
                if decision == Some(XferDecision::Abort) {
                    self.cancel(job);
                }
                0
            }
            Notification::Decision { job, info, reply } => {
                let decision = match self.pending.get_mut(&job) {
                    Some(pending) if !pending.cancel_requested => pending
                        .on_progress
                        .as_mut()
                        .map_or(XferDecision::Abort, |callback| callback(&info)),
                    _ => XferDecision::Abort,
                };
                // The worker may have given up already.
                let _ = reply.send(decision);
                0
            }
            Notification::ModuleCallback {
                job,
                name,
                payload,
                reply,
            } => {
                let answer = match self.module_callbacks.get_mut(&name) {
                    Some(handler) => handler(&payload),
                    None => Err(ErrorCode::NotSupported),
                };
                tracing::trace!(target: "avfs::scheduler", %job, %name, ok = answer.is_ok(), "module callback");
                let _ = reply.send(answer);
                0
            }
        }
    }

    fn deliver(&mut self, mut result: NotificationResult) -> usize {
        let Some(pending) = self.pending.remove(&result.job) else {
            return 0;
        };
        self.scheduler.release(result.job);

        if pending.cancel_requested && !result.cancelled {
            // Finished before the cancel got to it.
            if let Some(file) = result.outcome.as_ref().ok().and_then(Outcome::file) {
                self.close_unclaimed(file);
                result.outcome = Err(ErrorCode::Cancelled);
            }
            result.cancelled = true;
        }
        if let Some(on_result) = pending.on_result {
            on_result(result);
        }
        1
    }

    fn flush_local(&mut self) -> usize {
        let mut delivered = 0;
        while let Some(result) = self.local.pop_front() {
            delivered += self.deliver(result);
        }
        delivered
    }

    fn close_unclaimed(&mut self, file: FileId) {
        if let Err(err) = self.enqueue(Operation::Close { file }, PRIORITY_MAX, None, None) {
            tracing::debug!(target: "avfs::scheduler", %file, %err, "could not queue close");
        }
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        let dropped = self.scheduler.shutdown();
        self.local.extend(dropped);

        // Refuse further posts, then drop whatever is buffered. Dropping a
        // query's reply sender answers it with an abort.
        self.receiver.close();
        while let Ok(notification) = self.receiver.try_recv() {
            if let Notification::Completed(result) = notification {
                self.local.push_back(result);
            }
        }
        self.scheduler.join();

        self.flush_local();
        let lost: Vec<(JobHandle, OperationKind)> = self
            .pending
            .iter()
            .map(|(handle, pending)| (*handle, pending.kind))
            .collect();
        for (handle, kind) in lost {
            self.deliver(NotificationResult::cancelled(handle, kind));
        }

        self.files.close_all(&OpContext::detached());
        tracing::debug!(target: "avfs::scheduler", "engine stopped");
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.stop();
    }
}
