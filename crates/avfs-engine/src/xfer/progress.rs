//! Progress snapshots and the caller's replies to transfer queries.

use avfs_core::ErrorCode;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

/// Step of the transfer state machine.
///
/// `ReadSource` and `WriteTarget` are never reported on their own. They
/// show up only on `BackendError` query snapshots, naming the I/O step
/// that failed while the file was `Copying`.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
pub enum XferPhase {
    #[default]
    Initial,
    CheckingDestination,
    Collecting,
    ReadyToGo,
    OpenSource,
    OpenTarget,
    Copying,
    Moving,
    ReadSource,
    WriteTarget,
    CloseSource,
    CloseTarget,
    DeleteSource,
    SetAttributes,
    FileCompleted,
    Cleanup,
    Completed,
}

/// Whether a snapshot is informational or awaits a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
pub enum XferStatus {
    #[default]
    Ok,
    /// A backend call failed; reply with Abort, Retry or Skip.
    BackendError,
    /// The target exists; reply with Replace, ReplaceAll, Skip, SkipAll,
    /// RenameUnique or Abort.
    NeedsOverwriteDecision,
    /// A candidate name is offered in `duplicate_name`; reply with Continue,
    /// NextCandidate, UseName, Skip or Abort.
    NeedsDuplicateNameDecision,
}

/// The caller's answer to a progress snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum XferDecision {
    Continue,
    Abort,
    Retry,
    Skip,
    SkipAll,
    Replace,
    ReplaceAll,
    RenameUnique,
    NextCandidate,
    UseName(CompactString),
}

/// Snapshot of a running transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct XferProgressInfo {
    pub status: XferStatus,
    /// Failure behind a `BackendError` status.
    pub vfs_status: Option<ErrorCode>,
    pub phase: XferPhase,
    pub source_name: Option<String>,
    pub target_name: Option<String>,
    /// 1-based index of the current file.
    pub file_index: u64,
    pub files_total: u64,
    pub bytes_total: u64,
    pub file_size: u64,
    /// Bytes of the current file written so far.
    pub bytes_copied: u64,
    /// Bytes accounted for across the whole transfer, skipped files included.
    pub total_bytes_copied: u64,
    pub duplicate_name: Option<String>,
    pub duplicate_count: u32,
    /// The current file is one of the request's sources rather than a
    /// descendant of one.
    pub top_level_item: bool,
    /// Non-fatal failure attached to a `FileCompleted` snapshot.
    pub warning: Option<ErrorCode>,
}

impl XferProgressInfo {
    /// Whether this snapshot expects an answer.
    pub fn is_query(&self) -> bool {
        self.status != XferStatus::Ok
    }

    /// Completion as a percentage (0.0 to 100.0).
    pub fn percentage(&self) -> f64 {
        if self.bytes_total > 0 {
            (self.total_bytes_copied as f64 / self.bytes_total as f64) * 100.0
        } else if self.files_total > 0 {
            (self.file_index.saturating_sub(1) as f64 / self.files_total as f64) * 100.0
        } else {
            0.0
        }
    }
}

/// Totals reported when a transfer finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct XferSummary {
    pub files_transferred: u64,
    pub files_skipped: u64,
    pub bytes_written: u64,
    pub total_bytes_copied: u64,
    /// Non-fatal failures, keyed by the target they concern.
    pub warnings: Vec<(String, ErrorCode)>,
}

impl XferSummary {
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_phase_order() {
        let phases: Vec<XferPhase> = XferPhase::iter().collect();
        assert_eq!(phases.first(), Some(&XferPhase::Initial));
        assert_eq!(phases.last(), Some(&XferPhase::Completed));
        assert!(XferPhase::Collecting < XferPhase::OpenSource);
        assert_eq!(XferPhase::ReadyToGo.to_string(), "ready-to-go");
    }

    #[test]
    fn test_percentage() {
        let info = XferProgressInfo {
            bytes_total: 200,
            total_bytes_copied: 50,
            ..Default::default()
        };
        assert!((info.percentage() - 25.0).abs() < f64::EPSILON);
        assert!(!info.is_query());
    }
}
