//! A policy that answers every question the same way, for unattended runs.

use std::collections::HashMap;

use crate::answer::{Command, ErrorDecision, GenericAnswer, Interaction, InteractionDecision};
use crate::policy::{ErrorRequest, FsPolicy, InteractionRequest};

/// Fixed answers, set up front.
///
/// Interactions without a preset answer are skipped when skipping is one of
/// their answers, otherwise they take their first legal answer. Errors are
/// ignored unless another decision is configured.
#[derive(Debug, Clone, Default)]
pub struct PresetPolicy {
    answers: HashMap<Interaction, InteractionDecision>,
    on_error: Option<ErrorDecision>,
}

impl PresetPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `interaction` with `command`.
    ///
    /// # Panics
    ///
    /// Panics when `command` is not a legal answer to `interaction`.
    pub fn answer(mut self, interaction: Interaction, command: Command) -> Self {
        assert!(
            interaction.accepts(command),
            "{command:?} is not an answer to {interaction:?}"
        );
        self.answers
            .insert(interaction, InteractionDecision::command(command));
        self
    }

    /// Answer `interaction` with an arbitrary decision.
    pub fn decide(mut self, interaction: Interaction, decision: InteractionDecision) -> Self {
        self.answers.insert(interaction, decision);
        self
    }

    pub fn on_error(mut self, decision: ErrorDecision) -> Self {
        self.on_error = Some(decision);
        self
    }

    /// Answer every collision with [`Command::Replace`].
    pub fn replace_all() -> Self {
        Self::new()
            .answer(Interaction::FileExists, Command::Replace)
            .answer(Interaction::DirectoryExists, Command::MergeDirectories)
            .answer(Interaction::TypeMismatch, Command::Replace)
    }

    /// Resolve every collision by picking a fresh name.
    pub fn keep_both() -> Self {
        Self::new()
            .answer(Interaction::FileExists, Command::MakeUniqueName)
            .answer(Interaction::DirectoryExists, Command::MakeUniqueName)
            .answer(Interaction::TypeMismatch, Command::MakeUniqueName)
    }
}

impl FsPolicy for PresetPolicy {
    fn error_handler(&self, request: &ErrorRequest<'_>) -> ErrorDecision {
        match self.on_error {
            Some(decision) if decision.is_legal(request.legal) => decision,
            _ if request.legal.allows(GenericAnswer::Ignore) => ErrorDecision::ignore(),
            _ => ErrorDecision::generic(GenericAnswer::SkipEntry),
        }
    }

    fn interaction(&self, request: &InteractionRequest<'_>) -> InteractionDecision {
        if let Some(decision) = self.answers.get(&request.interaction) {
            return decision.clone();
        }
        let answers = request.interaction.answers();
        let command = if answers.contains(&Command::Skip) {
            Command::Skip
        } else {
            answers[0]
        };
        InteractionDecision::command(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::answer::{AnswerFlags, InteractionAnswer};
    use crate::operation::OperationKind;

    fn ask(policy: &PresetPolicy, interaction: Interaction) -> InteractionAnswer {
        policy
            .interaction(&InteractionRequest {
                interaction,
                operation: OperationKind::Copying,
                source: None,
                target: None,
                legal: AnswerFlags::SKIP_ENTRY,
            })
            .answer
    }

    #[test]
    fn test_defaults_prefer_skip() {
        let policy = PresetPolicy::new();
        assert_eq!(
            ask(&policy, Interaction::FileExists),
            InteractionAnswer::Command(Command::Skip)
        );
        assert_eq!(
            ask(&policy, Interaction::RemovePartialFile),
            InteractionAnswer::Command(Command::Remove)
        );
    }

    #[test]
    fn test_preset_answers() {
        let policy = PresetPolicy::replace_all();
        assert_eq!(
            ask(&policy, Interaction::DirectoryExists),
            InteractionAnswer::Command(Command::MergeDirectories)
        );
    }

    #[test]
    #[should_panic(expected = "is not an answer to")]
    fn test_rejects_illegal_preset() {
        let _ = PresetPolicy::new().answer(Interaction::TargetIsRoot, Command::Append);
    }
}
