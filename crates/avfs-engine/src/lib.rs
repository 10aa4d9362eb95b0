//! Prioritized job engine for avfs.
//!
//! A [`Context`] owns a pool of worker threads and a priority queue of jobs.
//! Each job carries one [`Operation`]: a primitive call on a backend, or a
//! whole-tree transfer driven by the phase machine in [`xfer`]. Workers post
//! everything the caller must see to a bounded notification queue, and the
//! caller dispatches it on its own thread.

mod arena;
mod channel;
mod context;
mod files;
mod job;
mod operation;
mod scheduler;
pub mod xfer;

pub use channel::NotificationResult;
pub use context::{Context, ProgressCallback, ResultCallback};
pub use files::FileId;
pub use job::{JobHandle, JobState};
pub use operation::{MAX_READ_COUNT, Operation, OperationKind, Outcome};
pub use xfer::{
    ErrorMode, OverwriteMode, TransferMode, TransferRequest, XferDecision, XferMonitor,
    XferOptions, XferOptionsBuilder, XferPhase, XferProgressInfo, XferStatus, XferSummary,
    transfer_sync,
};
