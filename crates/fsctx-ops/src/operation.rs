//! File operation types and the nested operation stack.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum::EnumIter;

/// Deepest nesting of operations one call may reach.
pub const MAX_OPERATION_DEPTH: usize = 32;

/// What the engine is doing at one level of the operation stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter)]
pub enum OperationKind {
    Copying,
    Moving,
    Duplicating,
    Linking,
    Removing,
    Trashing,
    Restoring,
    EmptyingTrash,
    Inspecting,
    CreatingDirectory,
    CopyingFile,
    CopyingLink,
    CopyingAttributes,
    CleaningUp,
}

impl OperationKind {
    /// Whether this kind can start a call.
    pub fn is_root(self) -> bool {
        matches!(
            self,
            Self::Copying
                | Self::Moving
                | Self::Duplicating
                | Self::Linking
                | Self::Removing
                | Self::Trashing
                | Self::Restoring
                | Self::EmptyingTrash
        )
    }

    /// Past-tense verb used in summaries.
    pub fn past_tense(self) -> &'static str {
        match self {
            Self::Copying | Self::CopyingFile | Self::CopyingLink => "Copied",
            Self::Moving => "Moved",
            Self::Duplicating => "Duplicated",
            Self::Linking => "Linked",
            Self::Removing | Self::EmptyingTrash | Self::CleaningUp => "Removed",
            Self::Trashing => "Trashed",
            Self::Restoring => "Restored",
            Self::Inspecting => "Inspected",
            Self::CreatingDirectory => "Created",
            Self::CopyingAttributes => "Updated",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Copying => write!(f, "Copying"),
            Self::Moving => write!(f, "Moving"),
            Self::Duplicating => write!(f, "Duplicating"),
            Self::Linking => write!(f, "Creating links"),
            Self::Removing => write!(f, "Removing"),
            Self::Trashing => write!(f, "Moving to trash"),
            Self::Restoring => write!(f, "Restoring"),
            Self::EmptyingTrash => write!(f, "Emptying trash"),
            Self::Inspecting => write!(f, "Preparing"),
            Self::CreatingDirectory => write!(f, "Creating directory"),
            Self::CopyingFile => write!(f, "Copying file"),
            Self::CopyingLink => write!(f, "Copying link"),
            Self::CopyingAttributes => write!(f, "Copying attributes"),
            Self::CleaningUp => write!(f, "Cleaning up"),
        }
    }
}

/// Bounded stack of nested operation kinds.
///
/// Pushing the kind already on top is a no-op, so helpers can announce
/// their operation without checking who called them.
#[derive(Debug, Clone, Default)]
pub struct OperationStack {
    kinds: Vec<OperationKind>,
}

impl OperationStack {
    pub fn new() -> Self {
        Self {
            kinds: Vec::with_capacity(MAX_OPERATION_DEPTH),
        }
    }

    /// Push `kind` unless it is already on top. Returns whether it was pushed.
    ///
    /// # Panics
    ///
    /// Panics when the stack would exceed [`MAX_OPERATION_DEPTH`].
    pub fn push(&mut self, kind: OperationKind) -> bool {
        if self.top() == Some(kind) {
            return false;
        }
        assert!(
            self.kinds.len() < MAX_OPERATION_DEPTH,
            "operation stack overflow pushing {kind:?}"
        );
        self.kinds.push(kind);
        true
    }

    /// Pop `kind`, which must be on top.
    pub fn pop(&mut self, kind: OperationKind) {
        let popped = self.kinds.pop();
        debug_assert_eq!(popped, Some(kind), "unbalanced operation stack");
    }

    pub fn top(&self) -> Option<OperationKind> {
        self.kinds.last().copied()
    }

    pub fn root(&self) -> Option<OperationKind> {
        self.kinds.first().copied()
    }

    pub fn depth(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Status text for the innermost operation.
    pub fn describe(&self) -> String {
        self.top().map(|kind| kind.to_string()).unwrap_or_default()
    }
}

/// A file operation to be executed against a set of entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FileOperation {
    /// Copy entries into a target directory.
    CopyTo { target: PathBuf },
    /// Move entries into a target directory.
    MoveTo { target: PathBuf },
    /// Copy entries next to themselves under a unique name.
    Duplicate,
    /// Create links to entries in a target directory.
    CreateLinkTo { target: PathBuf, relative: bool },
    /// Move entries to their volume's trash.
    MoveToTrash,
    /// Move trashed entries back to where they came from.
    RestoreFromTrash,
    /// Delete entries permanently.
    Remove,
    /// Delete everything in every trash. Entries are ignored.
    EmptyTrash,
}

impl FileOperation {
    /// Create a copy operation.
    pub fn copy_to(target: impl Into<PathBuf>) -> Self {
        Self::CopyTo {
            target: target.into(),
        }
    }

    /// Create a move operation.
    pub fn move_to(target: impl Into<PathBuf>) -> Self {
        Self::MoveTo {
            target: target.into(),
        }
    }

    /// Create a link operation.
    pub fn link_to(target: impl Into<PathBuf>, relative: bool) -> Self {
        Self::CreateLinkTo {
            target: target.into(),
            relative,
        }
    }

    /// The root kind this operation runs under.
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::CopyTo { .. } => OperationKind::Copying,
            Self::MoveTo { .. } => OperationKind::Moving,
            Self::Duplicate => OperationKind::Duplicating,
            Self::CreateLinkTo { .. } => OperationKind::Linking,
            Self::MoveToTrash => OperationKind::Trashing,
            Self::RestoreFromTrash => OperationKind::Restoring,
            Self::Remove => OperationKind::Removing,
            Self::EmptyTrash => OperationKind::EmptyingTrash,
        }
    }
}

/// An error that occurred during a file operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationError {
    /// The path that caused the error.
    pub path: PathBuf,
    /// A human-readable error message.
    pub message: String,
}

impl OperationError {
    /// Create a new operation error.
    pub fn new(path: PathBuf, message: impl Into<String>) -> Self {
        Self {
            path,
            message: message.into(),
        }
    }
}

impl From<&fsctx_core::FsError> for OperationError {
    fn from(error: &fsctx_core::FsError) -> Self {
        Self::new(
            error.path().map(PathBuf::from).unwrap_or_default(),
            error.to_string(),
        )
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_push_is_idempotent() {
        let mut stack = OperationStack::new();
        assert!(stack.push(OperationKind::Copying));
        assert!(!stack.push(OperationKind::Copying));
        assert!(stack.push(OperationKind::CopyingFile));
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.root(), Some(OperationKind::Copying));
        assert_eq!(stack.describe(), "Copying file");

        stack.pop(OperationKind::CopyingFile);
        stack.pop(OperationKind::Copying);
        assert!(stack.is_empty());
    }

    #[test]
    #[should_panic(expected = "operation stack overflow")]
    fn test_stack_is_bounded() {
        let mut stack = OperationStack::new();
        for i in 0..=MAX_OPERATION_DEPTH {
            let kind = if i % 2 == 0 {
                OperationKind::Copying
            } else {
                OperationKind::CreatingDirectory
            };
            stack.push(kind);
        }
    }

    #[test]
    fn test_file_operation_kinds_are_roots() {
        let ops = [
            FileOperation::copy_to("/t"),
            FileOperation::move_to("/t"),
            FileOperation::Duplicate,
            FileOperation::link_to("/t", true),
            FileOperation::MoveToTrash,
            FileOperation::RestoreFromTrash,
            FileOperation::Remove,
            FileOperation::EmptyTrash,
        ];
        for op in ops {
            assert!(op.kind().is_root());
        }
        let roots = OperationKind::iter().filter(|k| k.is_root()).count();
        assert_eq!(roots, 8);
    }
}
