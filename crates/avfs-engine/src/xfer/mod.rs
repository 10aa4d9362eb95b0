//! Copy, move, link and delete of whole trees.

mod engine;
mod names;
mod options;
mod plan;
mod progress;

pub use engine::{XferMonitor, transfer_sync};
pub use options::{
    ErrorMode, OverwriteMode, TransferMode, TransferRequest, XferOptions, XferOptionsBuilder,
};
pub use progress::{XferDecision, XferPhase, XferProgressInfo, XferStatus, XferSummary};

pub(crate) use engine::run_transfer;
