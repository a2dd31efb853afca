//! Interaction kinds, their legal answers, and generic control answers.
//!
//! Every conflict the engine cannot settle on its own is raised as an
//! [`Interaction`] with a fixed table of legal [`Command`]s. Error prompts and
//! interactions may also be answered with a [`GenericAnswer`], restricted by
//! the [`AnswerFlags`] legal at the point where the question is asked.

use std::collections::HashMap;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use strum::EnumIter;

use crate::operation::OperationKind;

/// Specific answers to an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter)]
pub enum Command {
    Replace,
    ReplaceIfNewer,
    Append,
    ContinuePartial,
    MakeUniqueName,
    RenameSource,
    RenameTarget,
    MergeDirectories,
    MoveTargetToTrash,
    Skip,
    Retry,
    Continue,
    CopyAndDelete,
    CopyAndTrash,
    CopyOnly,
    CreateAbsoluteLink,
    CopyInstead,
    MoveToTrash,
    Remove,
    Keep,
    Restore,
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Replace => "Replace",
            Self::ReplaceIfNewer => "Replace if newer",
            Self::Append => "Append",
            Self::ContinuePartial => "Continue partial copy",
            Self::MakeUniqueName => "Keep both",
            Self::RenameSource => "Rename source",
            Self::RenameTarget => "Rename target",
            Self::MergeDirectories => "Merge",
            Self::MoveTargetToTrash => "Move target to trash",
            Self::Skip => "Skip",
            Self::Retry => "Retry",
            Self::Continue => "Continue",
            Self::CopyAndDelete => "Copy and delete",
            Self::CopyAndTrash => "Copy and move to trash",
            Self::CopyOnly => "Copy only",
            Self::CreateAbsoluteLink => "Create absolute link",
            Self::CopyInstead => "Copy instead",
            Self::MoveToTrash => "Move to trash",
            Self::Remove => "Remove",
            Self::Keep => "Keep",
            Self::Restore => "Restore original size",
        };
        f.write_str(label)
    }
}

/// Situations that need an answer from the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter)]
pub enum Interaction {
    /// A file or link is in the way of a file or link.
    FileExists,
    /// A directory is in the way of a directory.
    DirectoryExists,
    /// A directory is in the way of a file, or the other way round.
    TypeMismatch,
    /// The target directory lies inside the directory being copied or moved.
    TargetIsSubdirectory,
    /// The target directory is a trash.
    TargetIsTrash,
    /// The target directory is the filesystem root.
    TargetIsRoot,
    /// The target volume reports less free space than the entry needs.
    NotEnoughSpace,
    /// A move has to cross devices.
    CannotMove,
    /// A relative link cannot span devices.
    CannotCreateRelativeLink,
    /// The target filesystem does not support symbolic links.
    LinksUnsupported,
    /// The entry cannot be moved to the trash.
    CannotTrash,
    /// The entry's volume has no usable trash.
    TrashUnavailable,
    /// A skipped directory left a partial copy behind.
    RemovePartialDirectory,
    /// A failed copy left a partial file behind.
    RemovePartialFile,
    /// A failed append left the target longer than it was.
    RestoreOriginalSize,
}

impl Interaction {
    /// The legal specific answers, in presentation order.
    pub fn answers(self) -> &'static [Command] {
        use Command::*;
        match self {
            Self::FileExists => &[
                Replace,
                ReplaceIfNewer,
                Append,
                ContinuePartial,
                MakeUniqueName,
                RenameSource,
                RenameTarget,
                MoveTargetToTrash,
                Skip,
                Retry,
            ],
            Self::DirectoryExists => &[
                MergeDirectories,
                Replace,
                MakeUniqueName,
                RenameSource,
                RenameTarget,
                MoveTargetToTrash,
                Skip,
                Retry,
            ],
            Self::TypeMismatch => &[
                Replace,
                MakeUniqueName,
                RenameSource,
                RenameTarget,
                MoveTargetToTrash,
                Skip,
                Retry,
            ],
            Self::TargetIsSubdirectory => &[Skip],
            Self::TargetIsTrash => &[MoveToTrash, Continue, Skip],
            Self::TargetIsRoot => &[Continue, Skip],
            Self::NotEnoughSpace => &[Continue, Retry, Skip],
            Self::CannotMove => &[CopyAndDelete, CopyAndTrash, CopyOnly, Skip],
            Self::CannotCreateRelativeLink => &[CreateAbsoluteLink, CopyInstead, Skip],
            Self::LinksUnsupported => &[CopyInstead, Skip],
            Self::CannotTrash => &[Skip],
            Self::TrashUnavailable => &[Remove, Skip],
            Self::RemovePartialDirectory => &[Remove, Keep],
            Self::RemovePartialFile => &[Remove, Keep],
            Self::RestoreOriginalSize => &[Restore, Keep],
        }
    }

    pub fn accepts(self, command: Command) -> bool {
        self.answers().contains(&command)
    }

    /// Whether this interaction is asked while cleaning up after another
    /// answer. Such prompts take no generic answers.
    pub fn is_cleanup(self) -> bool {
        matches!(
            self,
            Self::RemovePartialDirectory | Self::RemovePartialFile | Self::RestoreOriginalSize
        )
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::FileExists => "An item with this name already exists",
            Self::DirectoryExists => "A directory with this name already exists",
            Self::TypeMismatch => "An item of a different type has this name",
            Self::TargetIsSubdirectory => "The target is inside the source directory",
            Self::TargetIsTrash => "The target is a trash directory",
            Self::TargetIsRoot => "The target is the filesystem root",
            Self::NotEnoughSpace => "Not enough free space on the target volume",
            Self::CannotMove => "The entry cannot be moved across devices",
            Self::CannotCreateRelativeLink => "Relative links cannot span devices",
            Self::LinksUnsupported => "The target volume does not support links",
            Self::CannotTrash => "The entry cannot be moved to the trash",
            Self::TrashUnavailable => "No trash is available on this volume",
            Self::RemovePartialDirectory => "Remove the partially copied directory?",
            Self::RemovePartialFile => "Remove the partially copied file?",
            Self::RestoreOriginalSize => "Restore the target to its original size?",
        }
    }
}

/// Answers that steer the engine rather than settle one question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter)]
pub enum GenericAnswer {
    SkipEntry,
    SkipDirectory,
    SkipOperation,
    RetryEntry,
    RetryOperation,
    Cancel,
    Ignore,
}

impl GenericAnswer {
    pub fn flag(self) -> AnswerFlags {
        match self {
            Self::SkipEntry => AnswerFlags::SKIP_ENTRY,
            Self::SkipDirectory => AnswerFlags::SKIP_DIRECTORY,
            Self::SkipOperation => AnswerFlags::SKIP_OPERATION,
            Self::RetryEntry => AnswerFlags::RETRY_ENTRY,
            Self::RetryOperation => AnswerFlags::RETRY_OPERATION,
            Self::Cancel => AnswerFlags::CANCEL,
            Self::Ignore => AnswerFlags::IGNORE,
        }
    }

    pub fn is_retry(self) -> bool {
        matches!(self, Self::RetryEntry | Self::RetryOperation)
    }
}

/// Set of answers legal at one point of an operation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AnswerFlags(u8);

impl AnswerFlags {
    pub const SKIP_ENTRY: Self = Self(1);
    pub const SKIP_DIRECTORY: Self = Self(1 << 1);
    pub const SKIP_OPERATION: Self = Self(1 << 2);
    pub const RETRY_ENTRY: Self = Self(1 << 3);
    pub const RETRY_OPERATION: Self = Self(1 << 4);
    pub const CANCEL: Self = Self(1 << 5);
    pub const IGNORE: Self = Self(1 << 6);
    /// Retry the failed call itself. Only meaningful for error prompts.
    pub const RETRY: Self = Self(1 << 7);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn allows(self, answer: GenericAnswer) -> bool {
        self.contains(answer.flag())
    }
}

impl std::ops::BitOr for AnswerFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl std::fmt::Debug for AnswerFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use strum::IntoEnumIterator;
        let mut set = f.debug_set();
        for answer in GenericAnswer::iter().filter(|a| self.allows(*a)) {
            set.entry(&answer);
        }
        if self.contains(Self::RETRY) {
            set.entry(&"Retry");
        }
        set.finish()
    }
}

/// Control signal carried up the call chain in place of a result.
///
/// Skip-operation and retry-operation name the operation they unwind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Cancel,
    SkipEntry,
    SkipDirectory,
    SkipOperation(OperationKind),
    RetryEntry,
    RetryOperation(OperationKind),
}

/// How long an answer stays in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Remember {
    /// Only this question.
    #[default]
    Once,
    /// Every matching question for the rest of this call.
    ForOperation,
    /// Every matching question asked through the same [`AnswerMemory`].
    ForSession,
}

/// An answer to an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InteractionAnswer {
    Command(Command),
    Generic(GenericAnswer),
}

impl InteractionAnswer {
    /// Whether the answer asks for the same work again. Such answers are
    /// never remembered, since replaying them would loop on the same failure.
    pub fn is_retry(self) -> bool {
        match self {
            Self::Command(command) => command == Command::Retry,
            Self::Generic(answer) => answer.is_retry(),
        }
    }
}

/// A policy's decision on one interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionDecision {
    pub answer: InteractionAnswer,
    pub remember: Remember,
    /// Name to use for rename answers. A unique name is made up when absent.
    pub new_name: Option<CompactString>,
}

impl InteractionDecision {
    pub fn command(command: Command) -> Self {
        Self {
            answer: InteractionAnswer::Command(command),
            remember: Remember::Once,
            new_name: None,
        }
    }

    pub fn generic(answer: GenericAnswer) -> Self {
        Self {
            answer: InteractionAnswer::Generic(answer),
            remember: Remember::Once,
            new_name: None,
        }
    }

    pub fn remembered(mut self, remember: Remember) -> Self {
        self.remember = remember;
        self
    }

    pub fn with_name(mut self, name: impl Into<CompactString>) -> Self {
        self.new_name = Some(name.into());
        self
    }
}

/// An answer to an error prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorAnswer {
    /// Try the failed call again.
    Retry,
    Generic(GenericAnswer),
}

impl ErrorAnswer {
    /// Whether the answer asks for the same work again.
    pub fn is_retry(self) -> bool {
        match self {
            Self::Retry => true,
            Self::Generic(answer) => answer.is_retry(),
        }
    }

    pub fn is_legal(self, legal: AnswerFlags) -> bool {
        match self {
            ErrorAnswer::Retry => legal.contains(AnswerFlags::RETRY),
            ErrorAnswer::Generic(answer) => legal.allows(answer),
        }
    }
}

/// A policy's decision on one error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDecision {
    pub answer: ErrorAnswer,
    pub remember: Remember,
}

impl ErrorDecision {
    pub fn retry() -> Self {
        Self {
            answer: ErrorAnswer::Retry,
            remember: Remember::Once,
        }
    }

    pub fn generic(answer: GenericAnswer) -> Self {
        Self {
            answer: ErrorAnswer::Generic(answer),
            remember: Remember::Once,
        }
    }

    /// Record the error and carry on.
    pub fn ignore() -> Self {
        Self::generic(GenericAnswer::Ignore)
    }

    pub fn remembered(mut self, remember: Remember) -> Self {
        self.remember = remember;
        self
    }

    pub fn is_legal(&self, legal: AnswerFlags) -> bool {
        self.answer.is_legal(legal)
    }
}

/// Most error answers remembered at once; the oldest is dropped first.
pub const ERROR_ANSWER_CAPACITY: usize = 16;

/// Remembered answers, keyed by interaction and by (operation, error code).
#[derive(Debug, Clone, Default)]
pub struct AnswerCache {
    interactions: HashMap<Interaction, InteractionAnswer>,
    errors: Vec<(OperationKind, i32, ErrorAnswer)>,
}

impl AnswerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interaction(&self, interaction: Interaction) -> Option<InteractionAnswer> {
        self.interactions.get(&interaction).copied()
    }

    pub fn remember_interaction(&mut self, interaction: Interaction, answer: InteractionAnswer) {
        self.interactions.insert(interaction, answer);
    }

    /// The most recent answer given for `code` while running `operation`.
    pub fn error(&self, operation: OperationKind, code: i32) -> Option<ErrorAnswer> {
        self.errors
            .iter()
            .rev()
            .find(|(op, c, _)| *op == operation && *c == code)
            .map(|(_, _, answer)| *answer)
    }

    pub fn remember_error(&mut self, operation: OperationKind, code: i32, answer: ErrorAnswer) {
        self.errors.retain(|(op, c, _)| !(*op == operation && *c == code));
        if self.errors.len() == ERROR_ANSWER_CAPACITY {
            self.errors.remove(0);
        }
        self.errors.push((operation, code, answer));
    }

    pub fn clear(&mut self) {
        self.interactions.clear();
        self.errors.clear();
    }
}

/// Answers remembered across calls, shared by every context that holds it.
#[derive(Debug, Default)]
pub struct AnswerMemory {
    cache: parking_lot::Mutex<AnswerCache>,
}

impl AnswerMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset a default answer for an interaction.
    pub fn set_default(&self, interaction: Interaction, command: Command) {
        assert!(
            interaction.accepts(command),
            "{command:?} is not an answer to {interaction:?}"
        );
        self.cache
            .lock()
            .remember_interaction(interaction, InteractionAnswer::Command(command));
    }

    pub(crate) fn interaction(&self, interaction: Interaction) -> Option<InteractionAnswer> {
        self.cache.lock().interaction(interaction)
    }

    pub(crate) fn remember_interaction(&self, interaction: Interaction, answer: InteractionAnswer) {
        self.cache.lock().remember_interaction(interaction, answer);
    }

    pub(crate) fn error(&self, operation: OperationKind, code: i32) -> Option<ErrorAnswer> {
        self.cache.lock().error(operation, code)
    }

    pub(crate) fn remember_error(&self, operation: OperationKind, code: i32, answer: ErrorAnswer) {
        self.cache.lock().remember_error(operation, code, answer);
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}
