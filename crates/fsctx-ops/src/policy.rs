//! The host side of an operation: error handling, interactions and hooks.

use std::path::Path;

use fsctx_core::FsError;

use crate::answer::{AnswerFlags, ErrorDecision, GenericAnswer, Interaction, InteractionDecision};
use crate::operation::OperationKind;
use crate::progress::{Counts, OperationComplete, ProgressInfo};

/// A failed filesystem call waiting for a decision.
#[derive(Debug)]
pub struct ErrorRequest<'a> {
    /// The innermost operation when the call failed.
    pub operation: OperationKind,
    pub path: &'a Path,
    pub error: &'a FsError,
    /// Generic answers legal here. `RETRY` allows [`ErrorDecision::retry`].
    pub legal: AnswerFlags,
}

/// An interaction waiting for a decision.
#[derive(Debug)]
pub struct InteractionRequest<'a> {
    pub interaction: Interaction,
    pub operation: OperationKind,
    pub source: Option<&'a Path>,
    pub target: Option<&'a Path>,
    /// Generic answers legal besides the interaction's own commands.
    pub legal: AnswerFlags,
}

/// What an operation is about to do, once the pre-pass has finished.
#[derive(Debug)]
pub struct OperationInfo<'a> {
    pub operation: OperationKind,
    /// Devices the operation reads from or writes to.
    pub devices: &'a [u64],
    pub totals: Counts,
}

/// Receives undo records for entries an operation created or relocated.
pub trait UndoJournal: Send + Sync {
    fn record_created(&self, operation: OperationKind, source: &Path, created: &Path);

    fn record_relocated(&self, operation: OperationKind, from: &Path, to: &Path);
}

/// Decisions and notifications supplied by whoever runs an operation.
///
/// Only [`error_handler`](Self::error_handler) and
/// [`interaction`](Self::interaction) are required. Decisions must be legal
/// for the request they answer; an illegal decision is a bug in the policy
/// and panics.
pub trait FsPolicy: Send + Sync {
    fn error_handler(&self, request: &ErrorRequest<'_>) -> ErrorDecision;

    fn interaction(&self, request: &InteractionRequest<'_>) -> InteractionDecision;

    /// An entry was created inside `directory`.
    fn next_entry_created(&self, _directory: &Path, _created: &Path) {}

    /// A directory is about to be moved to the trash.
    fn directory_trashed(&self, _directory: &Path) {}

    /// An entry is about to be removed or trashed.
    fn about_to_delete_or_trash(&self, _entry: &Path) {}

    fn init_progress_indicator(&self, _operation: OperationKind) {}

    /// The pre-pass is starting.
    fn preparing_operation(&self, _operation: OperationKind) {}

    fn operation_begins(&self, _info: &OperationInfo<'_>) {}

    fn operation_finished(
        &self,
        _operation: OperationKind,
        _result: &Result<OperationComplete, FsError>,
    ) {
    }

    /// Progress changed. `status` describes the innermost operation.
    fn progress(&self, _progress: &ProgressInfo, _status: &str) {}

    /// Called between entries and chunks. May block while the operation is
    /// paused, and may return a generic answer to act on.
    fn checkpoint(&self) -> Option<GenericAnswer> {
        None
    }

    /// Whether the next checkpoint will block.
    fn pause_pending(&self) -> bool {
        false
    }

    fn undo_journal(&self) -> Option<&dyn UndoJournal> {
        None
    }
}
