//! Worker-to-caller notifications.
//!
//! Workers never run caller code. Everything that needs the caller (final
//! results, transfer progress, decisions, module callbacks) travels over one
//! bounded queue and is dispatched when the caller drains it. Requests that
//! need an answer carry a oneshot reply the worker blocks on.

use avfs_core::{BackendResult, ErrorCode, ModuleCallbacks};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::job::JobHandle;
use crate::operation::{OperationKind, Outcome};
use crate::xfer::{XferDecision, XferMonitor, XferProgressInfo};

/// The single final report of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationResult {
    pub job: JobHandle,
    pub kind: OperationKind,
    pub outcome: Result<Outcome, ErrorCode>,
    /// The job was cancelled; the outcome should be disregarded.
    pub cancelled: bool,
}

impl NotificationResult {
    pub(crate) fn cancelled(job: JobHandle, kind: OperationKind) -> Self {
        Self {
            job,
            kind,
            outcome: Err(ErrorCode::Cancelled),
            cancelled: true,
        }
    }

    pub fn is_ok(&self) -> bool {
        !self.cancelled && self.outcome.is_ok()
    }

    /// The failure code, counting cancellation as a failure.
    pub fn error(&self) -> Option<ErrorCode> {
        match (&self.outcome, self.cancelled) {
            (_, true) => Some(ErrorCode::Cancelled),
            (Err(code), false) => Some(*code),
            (Ok(_), false) => None,
        }
    }
}

/// One entry on the notification queue.
#[derive(Debug)]
pub(crate) enum Notification {
    Completed(NotificationResult),
    Progress {
        job: JobHandle,
        info: XferProgressInfo,
    },
    Decision {
        job: JobHandle,
        info: XferProgressInfo,
        reply: oneshot::Sender<XferDecision>,
    },
    ModuleCallback {
        job: JobHandle,
        name: String,
        payload: Value,
        reply: oneshot::Sender<BackendResult<Value>>,
    },
}

/// Worker-side end of the queue.
#[derive(Debug, Clone)]
pub(crate) struct Notifier {
    tx: mpsc::Sender<Notification>,
}

pub(crate) fn channel(capacity: usize) -> (Notifier, mpsc::Receiver<Notification>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Notifier { tx }, rx)
}

impl Notifier {
    /// Queue a notification, waiting for room. Returns false once the caller
    /// side is gone.
    pub fn post(&self, notification: Notification) -> bool {
        self.tx.blocking_send(notification).is_ok()
    }

    /// Ask the caller to decide on a transfer query. A caller that went away
    /// counts as an abort.
    pub fn request_decision(&self, job: JobHandle, info: XferProgressInfo) -> XferDecision {
        let (reply, answer) = oneshot::channel();
        if !self.post(Notification::Decision { job, info, reply }) {
            return XferDecision::Abort;
        }
        answer.blocking_recv().unwrap_or(XferDecision::Abort)
    }

    /// Run the caller's module callback `name` and wait for its reply.
    pub fn module_callback(&self, job: JobHandle, name: &str, payload: Value) -> BackendResult<Value> {
        let (reply, answer) = oneshot::channel();
        let notification = Notification::ModuleCallback {
            job,
            name: name.to_string(),
            payload,
            reply,
        };
        if !self.post(notification) {
            return Err(ErrorCode::Cancelled);
        }
        answer.blocking_recv().unwrap_or(Err(ErrorCode::Cancelled))
    }
}

/// Module-callback bridge handed to backends running inside a job.
pub(crate) struct JobCallbacks<'a> {
    pub job: JobHandle,
    pub notifier: &'a Notifier,
}

impl ModuleCallbacks for JobCallbacks<'_> {
    fn invoke(&self, name: &str, payload: Value) -> BackendResult<Value> {
        self.notifier.module_callback(self.job, name, payload)
    }
}

/// Routes transfer snapshots of one job through the queue.
pub(crate) struct ChannelMonitor<'a> {
    pub job: JobHandle,
    pub notifier: &'a Notifier,
}

impl XferMonitor for ChannelMonitor<'_> {
    fn update(&mut self, info: &XferProgressInfo) -> XferDecision {
        if info.is_query() {
            return self.notifier.request_decision(self.job, info.clone());
        }
        self.notifier.post(Notification::Progress {
            job: self.job,
            info: info.clone(),
        });
        XferDecision::Continue
    }
}
