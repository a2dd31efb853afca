//! The operation context: one policy, one configuration, one call at a time.

use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use compact_str::CompactString;
use fsctx_core::{
    DirectoryIterator, EngineConfig, EntryFilter, EntryIterator, EntryRef, FsError,
};

use crate::answer::{
    AnswerCache, AnswerFlags, AnswerMemory, Command, ControlSignal, ErrorAnswer, ErrorDecision,
    GenericAnswer, Interaction, InteractionAnswer, InteractionDecision, Remember,
};
use crate::buffer::{BufferManager, MemoryProbe, SystemMemory};
use crate::operation::{FileOperation, OperationError, OperationKind, OperationStack};
use crate::policy::{ErrorRequest, FsPolicy, InteractionRequest, OperationInfo};
use crate::progress::{OperationComplete, ProgressInfo, ProgressMark};
use crate::trash::TrashLocator;

/// Why a step did not produce a value.
#[derive(Debug)]
pub(crate) enum Flow {
    /// A control answer unwinding to the level it applies to.
    Signal(ControlSignal),
    /// An error the policy chose to record and move past.
    Ignored(FsError),
    /// An error that ends the call.
    Failed(FsError),
}

pub(crate) type Step<T = ()> = Result<T, Flow>;

/// How colliding names are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Naming {
    Ask,
    /// Always pick a fresh name, as duplicating does.
    Unique,
}

/// The directory a copy started from and the directory it created for it.
#[derive(Debug)]
pub(crate) struct CopyRoot {
    pub source: PathBuf,
    pub target: PathBuf,
}

/// What is legal and what applies at one level of a walk.
#[derive(Debug, Clone)]
pub(crate) struct Scope {
    pub flags: AnswerFlags,
    /// The operation skip-operation and retry-operation unwind to.
    pub operation: OperationKind,
    /// Skip-directory abandons the current directory. When false it only
    /// skips the entry it was given for.
    pub fresh_dir: bool,
    pub copy_root: Option<Arc<CopyRoot>>,
    pub naming: Naming,
    pub filter: Option<EntryFilter>,
}

impl Scope {
    pub(crate) fn root(operation: OperationKind, filter: Option<EntryFilter>, naming: Naming) -> Self {
        Self {
            flags: AnswerFlags::SKIP_ENTRY
                | AnswerFlags::SKIP_OPERATION
                | AnswerFlags::RETRY_ENTRY
                | AnswerFlags::RETRY_OPERATION
                | AnswerFlags::CANCEL
                | AnswerFlags::IGNORE
                | AnswerFlags::RETRY,
            operation,
            fresh_dir: false,
            copy_root: None,
            naming,
            filter,
        }
    }

    /// Scope for the entries of a directory.
    pub(crate) fn in_directory(&self, fresh: bool) -> Self {
        Self {
            flags: self.flags | AnswerFlags::SKIP_DIRECTORY,
            fresh_dir: fresh,
            naming: Naming::Ask,
            ..self.clone()
        }
    }

    pub(crate) fn for_operation(&self, operation: OperationKind) -> Self {
        Self {
            flags: self.flags | AnswerFlags::SKIP_OPERATION | AnswerFlags::RETRY_OPERATION,
            operation,
            ..self.clone()
        }
    }

    pub(crate) fn without(&self, flags: AnswerFlags) -> Self {
        Self {
            flags: self.flags.without(flags),
            ..self.clone()
        }
    }

    pub(crate) fn signal(&self, answer: GenericAnswer) -> ControlSignal {
        match answer {
            GenericAnswer::SkipEntry | GenericAnswer::Ignore => ControlSignal::SkipEntry,
            GenericAnswer::SkipDirectory => ControlSignal::SkipDirectory,
            GenericAnswer::SkipOperation => ControlSignal::SkipOperation(self.operation),
            GenericAnswer::RetryEntry => ControlSignal::RetryEntry,
            GenericAnswer::RetryOperation => ControlSignal::RetryOperation(self.operation),
            GenericAnswer::Cancel => ControlSignal::Cancel,
        }
    }
}

/// A specific answer to an interaction.
#[derive(Debug, Clone)]
pub(crate) struct Resolution {
    pub command: Command,
    pub new_name: Option<CompactString>,
}

/// How the pre-pass counts the work ahead.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Measure {
    /// Every entry below every top-level entry.
    Tree,
    /// Top-level entries only.
    TopLevel,
    /// Entries already on the target device move as a whole and count once.
    Move { target_device: u64 },
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Plan {
    pub measure: Measure,
    pub target_device: Option<u64>,
    pub naming: Naming,
    /// Apply the configured ignore patterns to the entries.
    pub filtered: bool,
}

/// Runs filesystem operations on behalf of one policy.
///
/// A context runs one root operation at a time; its progress, answers and
/// buffer belong to that call. Calls report their outcome as
/// [`OperationComplete`]; `Err` is reserved for cancellation, refused
/// targets and errors that end the whole call.
pub struct FsContext {
    pub(crate) policy: Arc<dyn FsPolicy>,
    pub(crate) config: Arc<EngineConfig>,
    filter: Option<EntryFilter>,
    pub(crate) progress: ProgressInfo,
    pub(crate) stack: OperationStack,
    pub(crate) buffer: BufferManager,
    answers: AnswerCache,
    memory: Option<Arc<AnswerMemory>>,
    pub(crate) trash: TrashLocator,
    /// Set once the target refused a link; later links copy what they
    /// point to.
    pub(crate) links_as_copies: bool,
    /// Makes every symlink call fail as on a volume without links.
    #[cfg(test)]
    pub(crate) refuse_links: bool,
    pub(crate) report: OperationComplete,
    /// Entries skipped or failed below the top level during this call.
    pub(crate) incomplete: u64,
}

impl FsContext {
    pub fn new(policy: Arc<dyn FsPolicy>, config: EngineConfig) -> Result<Self, FsError> {
        Self::with_memory_probe(policy, config, Arc::new(SystemMemory::new()))
    }

    /// Create a context whose buffer sizes follow `probe` instead of the
    /// system's memory statistics.
    pub fn with_memory_probe(
        policy: Arc<dyn FsPolicy>,
        config: EngineConfig,
        probe: Arc<dyn MemoryProbe>,
    ) -> Result<Self, FsError> {
        config.check()?;
        let filter = config.entry_filter()?;
        Ok(Self {
            policy,
            filter,
            progress: ProgressInfo::new(),
            stack: OperationStack::new(),
            buffer: BufferManager::new(&config, probe),
            answers: AnswerCache::new(),
            memory: None,
            trash: TrashLocator::new(&config),
            links_as_copies: false,
            #[cfg(test)]
            refuse_links: false,
            report: OperationComplete::new(OperationKind::Copying),
            incomplete: 0,
            config: Arc::new(config),
        })
    }

    /// Share remembered answers with other contexts and later calls.
    pub fn with_answer_memory(mut self, memory: Arc<AnswerMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Progress of the current or last call.
    pub fn progress(&self) -> &ProgressInfo {
        &self.progress
    }

    pub fn buffer(&self) -> &BufferManager {
        &self.buffer
    }

    /// Run `operation` over `entries`.
    pub fn run(
        &mut self,
        operation: &FileOperation,
        entries: &mut dyn EntryIterator,
    ) -> Result<OperationComplete, FsError> {
        match operation {
            FileOperation::CopyTo { target } => self.copy_to(entries, target),
            FileOperation::MoveTo { target } => self.move_to(entries, target),
            FileOperation::Duplicate => self.duplicate(entries),
            FileOperation::CreateLinkTo { target, relative } => {
                self.create_link_to(entries, target, *relative)
            }
            FileOperation::MoveToTrash => self.move_to_trash(entries),
            FileOperation::RestoreFromTrash => self.restore_from_trash(entries),
            FileOperation::Remove => self.remove(entries),
            FileOperation::EmptyTrash => self.empty_trash(),
        }
    }

    /// Run `operation` on a thread of its own.
    pub fn spawn(
        mut self,
        operation: FileOperation,
        mut entries: Box<dyn EntryIterator>,
    ) -> io::Result<JoinHandle<Result<OperationComplete, FsError>>> {
        std::thread::Builder::new()
            .name(format!("fsctx-{}", operation.kind()).replace(' ', "-").to_lowercase())
            .spawn(move || self.run(&operation, entries.as_mut()))
    }

    /// Resolve and check the directory an operation writes into.
    pub(crate) fn target_directory(&self, target: &Path) -> Result<PathBuf, FsError> {
        let target = target.canonicalize().map_err(|e| FsError::io(target, e))?;
        if !target.is_dir() {
            return Err(FsError::invalid_target(&target, "not a directory"));
        }
        Ok(target)
    }

    /// Drive one root operation over `entries`.
    pub(crate) fn run_root(
        &mut self,
        kind: OperationKind,
        entries: &mut dyn EntryIterator,
        plan: Plan,
        mut process: impl FnMut(&mut Self, &Scope, &EntryRef) -> Step,
    ) -> Result<OperationComplete, FsError> {
        assert!(
            self.stack.is_empty(),
            "{kind} started while {} is running",
            self.stack.describe()
        );
        let started = Instant::now();
        self.progress = ProgressInfo::new();
        self.answers.clear();
        self.report = OperationComplete::new(kind);
        self.links_as_copies = false;
        self.incomplete = 0;

        if plan.filtered && entries.filter().is_none() {
            entries.set_filter(self.filter.clone());
        }
        let scope = Scope::root(kind, entries.filter().cloned(), plan.naming);
        tracing::info!(operation = %kind, "Starting operation");

        let result = self.in_operation(kind, |ctx| {
            ctx.policy.init_progress_indicator(kind);
            let devices = ctx.prepare(kind, entries, &plan)?;
            ctx.policy.operation_begins(&OperationInfo {
                operation: kind,
                devices: &devices,
                totals: ctx.progress.total,
            });
            ctx.process_entries(&scope, entries, &mut process)
        });

        let result = result.map(|()| {
            let mut report = std::mem::replace(&mut self.report, OperationComplete::new(kind));
            report.bytes_processed = self.progress.current.bytes;
            report.elapsed = started.elapsed();
            report
        });
        self.progress.set_current_entry(None);
        self.report_progress();

        match &result {
            Ok(report) => tracing::info!(
                operation = %kind,
                succeeded = report.succeeded,
                skipped = report.skipped,
                failed = report.failed,
                "Operation finished"
            ),
            Err(error) => tracing::warn!(operation = %kind, %error, "Operation ended early"),
        }
        self.policy.operation_finished(kind, &result);
        result
    }

    fn prepare(
        &mut self,
        kind: OperationKind,
        entries: &mut dyn EntryIterator,
        plan: &Plan,
    ) -> Result<Vec<u64>, FsError> {
        self.policy.preparing_operation(kind);
        let mut devices: Vec<u64> = plan.target_device.into_iter().collect();
        let mut walk = entries.box_clone();

        self.in_operation(OperationKind::Inspecting, |ctx| {
            while let Some(entry) = walk.next_entry() {
                ctx.poll_cancel()?;
                let path = entry.path();
                let Ok(meta) = fs::symlink_metadata(&path) else {
                    continue;
                };
                let device = std::os::unix::fs::MetadataExt::dev(&meta);
                if !devices.contains(&device) {
                    devices.push(device);
                }
                match plan.measure {
                    Measure::Tree => ctx.measure_tree(&path, &meta, walk.filter())?,
                    Measure::Move { target_device } if target_device != device => {
                        ctx.measure_tree(&path, &meta, walk.filter())?
                    }
                    Measure::Move { .. } | Measure::TopLevel => ctx.measure_one(&meta),
                }
            }
            Ok::<(), FsError>(())
        })?;

        entries.rewind();
        tracing::debug!(
            entries = self.progress.total.entries,
            bytes = self.progress.total.bytes,
            "Pre-pass finished"
        );
        self.report_progress();
        Ok(devices)
    }

    fn measure_one(&mut self, meta: &Metadata) {
        let file_type = meta.file_type();
        if file_type.is_dir() {
            self.progress.new_directory();
        } else if file_type.is_symlink() {
            self.progress.new_link();
        } else {
            self.progress.new_file(meta.len());
        }
    }

    fn measure_tree(
        &mut self,
        path: &Path,
        meta: &Metadata,
        filter: Option<&EntryFilter>,
    ) -> Result<(), FsError> {
        self.measure_one(meta);
        if !meta.is_dir() {
            return Ok(());
        }
        self.poll_cancel()?;
        let Ok(mut children) = DirectoryIterator::open(path) else {
            self.progress.disable_totals();
            return Ok(());
        };
        children.set_filter(filter.cloned());
        while let Some(child) = children.next_entry() {
            let child_path = child.path();
            match fs::symlink_metadata(&child_path) {
                Ok(child_meta) => self.measure_tree(&child_path, &child_meta, filter)?,
                Err(_) => self.progress.disable_totals(),
            }
        }
        Ok(())
    }

    /// Cancellation check for stretches where nothing else can be answered.
    fn poll_cancel(&mut self) -> Result<(), FsError> {
        self.report_progress();
        match self.policy.checkpoint() {
            Some(GenericAnswer::Cancel) => Err(FsError::Cancelled),
            _ => Ok(()),
        }
    }

    fn process_entries(
        &mut self,
        scope: &Scope,
        entries: &mut dyn EntryIterator,
        process: &mut impl FnMut(&mut Self, &Scope, &EntryRef) -> Step,
    ) -> Result<(), FsError> {
        let kind = scope.operation;
        let start = self.progress.mark();
        'operation: loop {
            while let Some(entry) = entries.next_entry() {
                let path = entry.path();
                loop {
                    let mark = self.progress.mark();
                    self.progress.set_current_entry(Some(path.clone()));
                    let step = match self.checkpoint(scope) {
                        Ok(()) => process(self, scope, &entry),
                        Err(flow) => Err(flow),
                    };
                    match step {
                        Ok(()) => {
                            self.report.succeeded += 1;
                            break;
                        }
                        Err(Flow::Signal(ControlSignal::RetryEntry)) => {
                            tracing::debug!(entry = %path.display(), "Retrying entry");
                            self.progress.rewind_to(mark);
                        }
                        Err(Flow::Signal(ControlSignal::SkipEntry | ControlSignal::SkipDirectory)) => {
                            self.skip_accounting(mark, &path);
                            self.report.skipped += 1;
                            break;
                        }
                        Err(Flow::Ignored(error)) => {
                            self.skip_accounting(mark, &path);
                            self.record_error(&error);
                            self.report.failed += 1;
                            break;
                        }
                        Err(Flow::Signal(ControlSignal::SkipOperation(op))) => {
                            if op != kind {
                                tracing::warn!(operation = %op, "Skip unwound past its operation");
                            }
                            tracing::info!(operation = %kind, "Skipping rest of operation");
                            self.report.stopped = true;
                            return Ok(());
                        }
                        Err(Flow::Signal(ControlSignal::RetryOperation(op))) if op == kind => {
                            tracing::info!(operation = %kind, "Restarting operation");
                            self.progress.rewind_to(start);
                            self.report = OperationComplete::new(kind);
                            entries.rewind();
                            continue 'operation;
                        }
                        Err(Flow::Signal(ControlSignal::RetryOperation(op))) => {
                            tracing::warn!(operation = %op, "Retry unwound past its operation");
                            self.progress.rewind_to(mark);
                        }
                        Err(Flow::Signal(ControlSignal::Cancel)) => return Err(FsError::Cancelled),
                        Err(Flow::Failed(error)) => return Err(error),
                    }
                }
            }
            return Ok(());
        }
    }

    /// Visit every entry of `directory`, settling per-entry signals here.
    ///
    /// Skip-directory ends the walk when `scope` was made for a fresh
    /// directory and only skips the entry otherwise.
    pub(crate) fn walk_directory(
        &mut self,
        scope: &Scope,
        directory: &Path,
        mut each: impl FnMut(&mut Self, &Scope, &EntryRef) -> Step,
    ) -> Step {
        let mut children = self.attempt(scope, directory, || DirectoryIterator::open(directory))?;
        children.set_filter(scope.filter.clone());

        while let Some(child) = children.next_entry() {
            let path = child.path();
            loop {
                let mark = self.progress.mark();
                self.progress.set_current_entry(Some(path.clone()));
                let step = match self.checkpoint(scope) {
                    Ok(()) => each(self, scope, &child),
                    Err(flow) => Err(flow),
                };
                match step {
                    Ok(()) => break,
                    Err(Flow::Signal(ControlSignal::RetryEntry)) => self.progress.rewind_to(mark),
                    Err(Flow::Signal(ControlSignal::SkipEntry)) => {
                        self.skip_accounting(mark, &path);
                        self.incomplete += 1;
                        break;
                    }
                    Err(Flow::Signal(ControlSignal::SkipDirectory)) if !scope.fresh_dir => {
                        self.skip_accounting(mark, &path);
                        self.incomplete += 1;
                        break;
                    }
                    Err(Flow::Ignored(error)) => {
                        self.skip_accounting(mark, &path);
                        self.record_error(&error);
                        break;
                    }
                    Err(flow) => return Err(flow),
                }
            }
        }
        Ok(())
    }

    fn skip_accounting(&mut self, mark: ProgressMark, path: &Path) {
        self.progress.rewind_to(mark);
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => self.progress.skip_directory(),
            Ok(meta) if meta.file_type().is_symlink() => self.progress.skip_link(),
            Ok(meta) => self.progress.skip_file(meta.len()),
            Err(_) => self.progress.disable_totals(),
        }
    }

    pub(crate) fn record_error(&mut self, error: &FsError) {
        tracing::warn!(%error, "Entry failed");
        self.report.errors.push(OperationError::from(error));
        self.incomplete += 1;
    }

    /// Record an ignored error and go on with `None`.
    pub(crate) fn ignorable<T>(&mut self, step: Step<T>) -> Step<Option<T>> {
        match step {
            Ok(value) => Ok(Some(value)),
            Err(Flow::Ignored(error)) => {
                self.report.errors.push(OperationError::from(&error));
                tracing::debug!(%error, "Ignored error");
                Ok(None)
            }
            Err(flow) => Err(flow),
        }
    }

    /// Run `f` with `kind` on the operation stack.
    pub(crate) fn in_operation<T>(&mut self, kind: OperationKind, f: impl FnOnce(&mut Self) -> T) -> T {
        let first = self.stack.is_empty();
        let pushed = self.stack.push(kind);
        if first {
            self.progress.set_current_entry(None);
        }
        let result = f(self);
        if pushed {
            self.stack.pop(kind);
        }
        result
    }

    /// Run `f` as a nested operation that skip-operation and
    /// retry-operation answers can target.
    pub(crate) fn sub_operation<T>(
        &mut self,
        scope: &Scope,
        kind: OperationKind,
        mut f: impl FnMut(&mut Self, &Scope) -> Step<T>,
    ) -> Step<Option<T>> {
        let scope = scope.for_operation(kind);
        loop {
            match self.in_operation(kind, |ctx| f(ctx, &scope)) {
                Ok(value) => return Ok(Some(value)),
                Err(Flow::Signal(ControlSignal::SkipOperation(op))) if op == kind => {
                    tracing::debug!(operation = %kind, "Skipped nested operation");
                    return Ok(None);
                }
                Err(Flow::Signal(ControlSignal::RetryOperation(op))) if op == kind => continue,
                Err(flow) => return Err(flow),
            }
        }
    }

    /// Run `call`, asking the policy what to do each time it fails.
    pub(crate) fn attempt<T>(
        &mut self,
        scope: &Scope,
        path: &Path,
        mut call: impl FnMut() -> io::Result<T>,
    ) -> Step<T> {
        loop {
            match call() {
                Ok(value) => return Ok(value),
                Err(error) => self.handle_error(scope, FsError::io(path, error))?,
            }
        }
    }

    /// Ask what to do about `error`. `Ok(())` means retry the failed call.
    pub(crate) fn handle_error(&mut self, scope: &Scope, error: FsError) -> Step {
        if error.is_cancelled() {
            return Err(Flow::Signal(ControlSignal::Cancel));
        }
        let operation = self.stack.top().unwrap_or(scope.operation);
        let code = error.os_code();
        let remembered = code
            .and_then(|code| self.remembered_error(operation, code))
            .filter(|answer| answer.is_legal(scope.flags));

        let answer = match remembered {
            Some(answer) => answer,
            None => {
                let decision = self.policy.error_handler(&ErrorRequest {
                    operation,
                    path: error.path().unwrap_or(Path::new("")),
                    error: &error,
                    legal: scope.flags,
                });
                assert!(
                    decision.is_legal(scope.flags),
                    "policy answered {:?} to an error, but only {:?} is legal here",
                    decision.answer,
                    scope.flags
                );
                if let Some(code) = code {
                    self.remember_error(operation, code, decision);
                }
                decision.answer
            }
        };
        tracing::debug!(%error, ?answer, "Error answered");

        match answer {
            ErrorAnswer::Retry => Ok(()),
            ErrorAnswer::Generic(GenericAnswer::Ignore) => Err(Flow::Ignored(error)),
            ErrorAnswer::Generic(answer) => Err(Flow::Signal(scope.signal(answer))),
        }
    }

    fn remembered_error(&self, operation: OperationKind, code: i32) -> Option<ErrorAnswer> {
        self.answers
            .error(operation, code)
            .or_else(|| self.memory.as_ref()?.error(operation, code))
    }

    fn remember_error(&mut self, operation: OperationKind, code: i32, decision: ErrorDecision) {
        if decision.answer.is_retry() {
            return;
        }
        match (decision.remember, &self.memory) {
            (Remember::Once, _) => {}
            (Remember::ForSession, Some(memory)) => {
                memory.remember_error(operation, code, decision.answer)
            }
            (Remember::ForOperation | Remember::ForSession, _) => {
                self.answers.remember_error(operation, code, decision.answer)
            }
        }
    }

    /// Ask the policy to settle `interaction`.
    ///
    /// Skip answers and generic answers come back as signals; everything
    /// else is left to the caller.
    pub(crate) fn interact(
        &mut self,
        scope: &Scope,
        interaction: Interaction,
        source: Option<&Path>,
        target: Option<&Path>,
    ) -> Step<Resolution> {
        let legal = if interaction.is_cleanup() {
            AnswerFlags::empty()
        } else {
            scope.flags.without(AnswerFlags::IGNORE | AnswerFlags::RETRY)
        };
        let remembered = self
            .remembered_interaction(interaction)
            .filter(|answer| interaction_legal(interaction, *answer, legal));

        let (answer, new_name) = match remembered {
            Some(answer) => (answer, None),
            None => {
                let operation = self.stack.top().unwrap_or(scope.operation);
                let decision = self.policy.interaction(&InteractionRequest {
                    interaction,
                    operation,
                    source,
                    target,
                    legal,
                });
                assert!(
                    interaction_legal(interaction, decision.answer, legal),
                    "policy answered {:?} to {interaction:?}, which is not legal here",
                    decision.answer
                );
                self.remember_interaction(interaction, &decision);
                (decision.answer, decision.new_name)
            }
        };
        tracing::debug!(?interaction, ?answer, "Interaction answered");

        match answer {
            InteractionAnswer::Command(Command::Skip) => {
                Err(Flow::Signal(ControlSignal::SkipEntry))
            }
            InteractionAnswer::Command(command) => Ok(Resolution { command, new_name }),
            InteractionAnswer::Generic(answer) => Err(Flow::Signal(scope.signal(answer))),
        }
    }

    fn remembered_interaction(&self, interaction: Interaction) -> Option<InteractionAnswer> {
        self.answers
            .interaction(interaction)
            .or_else(|| self.memory.as_ref()?.interaction(interaction))
    }

    fn remember_interaction(&mut self, interaction: Interaction, decision: &InteractionDecision) {
        if decision.answer.is_retry() {
            return;
        }
        match (decision.remember, &self.memory) {
            (Remember::Once, _) => {}
            (Remember::ForSession, Some(memory)) => {
                memory.remember_interaction(interaction, decision.answer)
            }
            (Remember::ForOperation | Remember::ForSession, _) => {
                self.answers.remember_interaction(interaction, decision.answer)
            }
        }
    }

    /// Report progress, then let the policy pause or redirect the operation.
    pub(crate) fn checkpoint(&mut self, scope: &Scope) -> Step {
        self.report_progress();
        if self.policy.pause_pending() {
            self.buffer.release();
        }
        let Some(answer) = self.policy.checkpoint() else {
            return Ok(());
        };
        let answer = if answer != GenericAnswer::Ignore && scope.flags.allows(answer) {
            answer
        } else if scope.flags.allows(GenericAnswer::SkipEntry) {
            GenericAnswer::SkipEntry
        } else {
            GenericAnswer::Cancel
        };
        Err(Flow::Signal(scope.signal(answer)))
    }

    pub(crate) fn report_progress(&mut self) {
        if self.progress.take_dirty() {
            let status = self.stack.describe();
            self.policy.progress(&self.progress, &status);
        }
    }

    /// Count a finished entry of any type.
    pub(crate) fn count_done(&mut self, meta: &Metadata) {
        let file_type = meta.file_type();
        if file_type.is_dir() {
            self.progress.directory_done();
        } else if file_type.is_symlink() {
            self.progress.link_done();
        } else {
            self.progress.file_done();
        }
    }

    pub(crate) fn note_created(&self, source: &Path, created: &Path) {
        if let Some(directory) = created.parent() {
            self.policy.next_entry_created(directory, created);
        }
        if let (Some(journal), Some(root)) = (self.policy.undo_journal(), self.stack.root()) {
            journal.record_created(root, source, created);
        }
    }

    pub(crate) fn note_relocated(&self, from: &Path, to: &Path) {
        if let Some(directory) = to.parent() {
            self.policy.next_entry_created(directory, to);
        }
        if let (Some(journal), Some(root)) = (self.policy.undo_journal(), self.stack.root()) {
            journal.record_relocated(root, from, to);
        }
    }

    /// Delete `path` without asking anyone, for cleaning up after ourselves.
    pub(crate) fn discard(&mut self, path: &Path) {
        let removed = match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
            Ok(_) => fs::remove_file(path),
            Err(_) => return,
        };
        match removed {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed partial copy"),
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "Could not remove partial copy")
            }
        }
    }
}

fn interaction_legal(interaction: Interaction, answer: InteractionAnswer, legal: AnswerFlags) -> bool {
    match answer {
        InteractionAnswer::Command(command) => interaction.accepts(command),
        InteractionAnswer::Generic(GenericAnswer::Ignore) => false,
        InteractionAnswer::Generic(answer) => legal.allows(answer),
    }
}
