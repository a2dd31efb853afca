//! Policy that forwards decisions and notifications to an async host.
//!
//! The engine runs on a worker thread and blocks on the host's replies; the
//! host receives [`OperationEvent`]s from a tokio channel and answers
//! prompts through their one-shot reply handles. Pause, resume and cancel
//! go through [`OperationControl`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fsctx_core::FsError;
use parking_lot::{Condvar, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::answer::{
    AnswerFlags, Command, ErrorDecision, GenericAnswer, Interaction, InteractionDecision,
};
use crate::operation::OperationKind;
use crate::policy::{ErrorRequest, FsPolicy, InteractionRequest, OperationInfo, UndoJournal};
use crate::progress::{Counts, OperationComplete, ProgressInfo};

/// Default capacity of the event channel.
pub const EVENT_CHANNEL_SIZE: usize = 100;

/// Everything the engine tells the host.
#[derive(Debug)]
pub enum OperationEvent {
    /// The pre-pass is counting entries.
    Preparing { operation: OperationKind },
    Started {
        operation: OperationKind,
        totals: Counts,
        devices: Vec<u64>,
    },
    Progress(ProgressSnapshot),
    /// An error needs an answer.
    Error(ErrorPrompt),
    /// A decision point needs an answer.
    Interaction(InteractionPrompt),
    EntryCreated { directory: PathBuf, entry: PathBuf },
    DirectoryTrashed(PathBuf),
    AboutToRemove(PathBuf),
    Finished(Result<OperationComplete, String>),
}

#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub progress: ProgressInfo,
    /// Innermost running operation, e.g. "Copying file".
    pub status: String,
    /// Time spent working, pauses excluded.
    pub elapsed: Duration,
    pub estimated_remaining: Option<Duration>,
    pub paused: bool,
}

/// An error waiting for the host's decision.
#[derive(Debug)]
pub struct ErrorPrompt {
    pub operation: OperationKind,
    pub path: PathBuf,
    pub message: String,
    pub os_code: Option<i32>,
    pub legal: AnswerFlags,
    reply: oneshot::Sender<ErrorDecision>,
}

impl ErrorPrompt {
    pub fn answer(self, decision: ErrorDecision) {
        let _ = self.reply.send(decision);
    }
}

/// An interaction waiting for the host's decision.
#[derive(Debug)]
pub struct InteractionPrompt {
    pub interaction: Interaction,
    pub operation: OperationKind,
    pub source: Option<PathBuf>,
    pub target: Option<PathBuf>,
    pub legal: AnswerFlags,
    reply: oneshot::Sender<InteractionDecision>,
}

impl InteractionPrompt {
    /// Commands that answer this prompt.
    pub fn answers(&self) -> &'static [Command] {
        self.interaction.answers()
    }

    pub fn answer(self, decision: InteractionDecision) {
        let _ = self.reply.send(decision);
    }
}

struct ControlState {
    cancel: CancellationToken,
    paused: Mutex<bool>,
    resumed: Condvar,
}

/// Pause, resume and cancel for a running operation.
#[derive(Clone)]
pub struct OperationControl {
    state: Arc<ControlState>,
}

impl Default for OperationControl {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OperationControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationControl")
            .field("cancelled", &self.is_cancelled())
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl OperationControl {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ControlState {
                cancel: CancellationToken::new(),
                paused: Mutex::new(false),
                resumed: Condvar::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.state.cancel.cancel();
        self.state.resumed.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancel.is_cancelled()
    }

    /// Token that fires on [`cancel`](Self::cancel), for async hosts.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.state.cancel.clone()
    }

    pub fn pause(&self) {
        *self.state.paused.lock() = true;
    }

    pub fn resume(&self) {
        *self.state.paused.lock() = false;
        self.state.resumed.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self.state.paused.lock()
    }

    /// Block while paused. Returns how long that was.
    fn wait_while_paused(&self) -> Duration {
        let started = Instant::now();
        let mut paused = self.state.paused.lock();
        while *paused && !self.is_cancelled() {
            self.state.resumed.wait(&mut paused);
        }
        started.elapsed()
    }
}

#[derive(Debug, Default)]
struct ActivityState {
    next_id: u64,
    active: Vec<(u64, Vec<u64>)>,
}

/// Running operations and the devices they touch.
///
/// An operation that shares a device with one registered before it waits
/// until that one is done.
#[derive(Debug, Default)]
pub struct ActivityRegistry {
    state: Mutex<ActivityState>,
    changed: Condvar,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, devices: &[u64]) -> u64 {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.active.push((id, devices.to_vec()));
        id
    }

    pub fn deregister(&self, id: u64) {
        self.state.lock().active.retain(|(active, _)| *active != id);
        self.changed.notify_all();
    }

    /// Whether an operation registered before `id` shares a device with it.
    pub fn has_earlier_overlap(&self, id: u64) -> bool {
        Self::overlaps(&self.state.lock(), id)
    }

    fn overlaps(state: &ActivityState, id: u64) -> bool {
        let Some((_, devices)) = state.active.iter().find(|(active, _)| *active == id) else {
            return false;
        };
        state
            .active
            .iter()
            .take_while(|(active, _)| *active != id)
            .any(|(_, other)| other.iter().any(|device| devices.contains(device)))
    }

    /// Block until `id` has no earlier overlapping operation or `control`
    /// is cancelled. Returns how long that took.
    fn wait_for_turn(&self, id: u64, control: &OperationControl) -> Duration {
        let started = Instant::now();
        let mut state = self.state.lock();
        while Self::overlaps(&state, id) && !control.is_cancelled() {
            self.changed.wait_for(&mut state, Duration::from_millis(100));
        }
        started.elapsed()
    }
}

#[derive(Debug, Default)]
struct AdapterState {
    started: Option<Instant>,
    paused_for: Duration,
    last_progress: Option<Instant>,
    activity: Option<u64>,
}

/// [`FsPolicy`] that hands every decision to a host over a channel.
///
/// It blocks the engine thread while waiting, so the engine must not run
/// on an async runtime thread. When the host stops listening, operations
/// are cancelled where that is legal and otherwise take the first answer
/// offered.
pub struct PolicyAdapter {
    events: mpsc::Sender<OperationEvent>,
    control: OperationControl,
    journal: Option<Arc<dyn UndoJournal>>,
    registry: Option<Arc<ActivityRegistry>>,
    interval: Duration,
    state: Mutex<AdapterState>,
}

impl PolicyAdapter {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OperationEvent>) {
        let (events, receiver) = mpsc::channel(capacity.max(1));
        let adapter = Self {
            events,
            control: OperationControl::new(),
            journal: None,
            registry: None,
            interval: Duration::from_millis(250),
            state: Mutex::new(AdapterState::default()),
        };
        (adapter, receiver)
    }

    pub fn with_journal(mut self, journal: Arc<dyn UndoJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Wait for earlier operations on the same devices before starting.
    pub fn with_auto_pause(mut self, registry: Arc<ActivityRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn control(&self) -> OperationControl {
        self.control.clone()
    }

    fn send(&self, event: OperationEvent) -> bool {
        if self.events.blocking_send(event).is_err() {
            tracing::debug!("Host stopped listening");
            return false;
        }
        true
    }

    fn snapshot(&self, progress: &ProgressInfo, status: &str, paused: bool) -> ProgressSnapshot {
        let state = self.state.lock();
        let elapsed = state
            .started
            .map(|started| started.elapsed().saturating_sub(state.paused_for))
            .unwrap_or_default();
        ProgressSnapshot {
            progress: progress.clone(),
            status: status.to_string(),
            elapsed,
            estimated_remaining: estimate_remaining(progress, elapsed),
            paused,
        }
    }

    fn waiting_for_turn(&self) -> Option<(Arc<ActivityRegistry>, u64)> {
        let registry = self.registry.as_ref()?;
        let id = self.state.lock().activity?;
        registry.has_earlier_overlap(id).then(|| (Arc::clone(registry), id))
    }
}

fn estimate_remaining(progress: &ProgressInfo, elapsed: Duration) -> Option<Duration> {
    if !progress.totals_valid() || progress.current.bytes == 0 || elapsed.is_zero() {
        return None;
    }
    let rate = progress.current.bytes as f64 / elapsed.as_secs_f64();
    let remaining = progress.total.bytes.saturating_sub(progress.current.bytes) as f64;
    Some(Duration::from_secs_f64(remaining / rate))
}

/// Answer for a prompt nobody is left to answer.
fn abandoned_error(legal: AnswerFlags) -> ErrorDecision {
    if legal.allows(GenericAnswer::Cancel) {
        ErrorDecision::generic(GenericAnswer::Cancel)
    } else if legal.allows(GenericAnswer::SkipEntry) {
        ErrorDecision::generic(GenericAnswer::SkipEntry)
    } else {
        ErrorDecision::ignore()
    }
}

fn abandoned_interaction(interaction: Interaction, legal: AnswerFlags) -> InteractionDecision {
    if legal.allows(GenericAnswer::Cancel) {
        InteractionDecision::generic(GenericAnswer::Cancel)
    } else {
        InteractionDecision::command(interaction.answers()[0])
    }
}

impl FsPolicy for PolicyAdapter {
    fn error_handler(&self, request: &ErrorRequest<'_>) -> ErrorDecision {
        if self.control.is_cancelled() {
            return abandoned_error(request.legal);
        }
        let (reply, answer) = oneshot::channel();
        let prompt = ErrorPrompt {
            operation: request.operation,
            path: request.path.to_path_buf(),
            message: request.error.to_string(),
            os_code: request.error.os_code(),
            legal: request.legal,
            reply,
        };
        if !self.send(OperationEvent::Error(prompt)) {
            return abandoned_error(request.legal);
        }
        answer
            .blocking_recv()
            .unwrap_or_else(|_| abandoned_error(request.legal))
    }

    fn interaction(&self, request: &InteractionRequest<'_>) -> InteractionDecision {
        if self.control.is_cancelled() {
            return abandoned_interaction(request.interaction, request.legal);
        }
        let (reply, answer) = oneshot::channel();
        let prompt = InteractionPrompt {
            interaction: request.interaction,
            operation: request.operation,
            source: request.source.map(Path::to_path_buf),
            target: request.target.map(Path::to_path_buf),
            legal: request.legal,
            reply,
        };
        if !self.send(OperationEvent::Interaction(prompt)) {
            return abandoned_interaction(request.interaction, request.legal);
        }
        answer
            .blocking_recv()
            .unwrap_or_else(|_| abandoned_interaction(request.interaction, request.legal))
    }

    fn next_entry_created(&self, directory: &Path, created: &Path) {
        self.send(OperationEvent::EntryCreated {
            directory: directory.to_path_buf(),
            entry: created.to_path_buf(),
        });
    }

    fn directory_trashed(&self, directory: &Path) {
        self.send(OperationEvent::DirectoryTrashed(directory.to_path_buf()));
    }

    fn about_to_delete_or_trash(&self, entry: &Path) {
        self.send(OperationEvent::AboutToRemove(entry.to_path_buf()));
    }

    fn init_progress_indicator(&self, _operation: OperationKind) {
        let mut state = self.state.lock();
        state.started = Some(Instant::now());
        state.paused_for = Duration::ZERO;
        state.last_progress = None;
    }

    fn preparing_operation(&self, operation: OperationKind) {
        self.send(OperationEvent::Preparing { operation });
    }

    fn operation_begins(&self, info: &OperationInfo<'_>) {
        if let Some(registry) = &self.registry {
            let id = registry.register(info.devices);
            self.state.lock().activity = Some(id);
        }
        self.send(OperationEvent::Started {
            operation: info.operation,
            totals: info.totals,
            devices: info.devices.to_vec(),
        });
    }

    fn operation_finished(&self, _operation: OperationKind, result: &Result<OperationComplete, FsError>) {
        let activity = self.state.lock().activity.take();
        if let (Some(registry), Some(id)) = (&self.registry, activity) {
            registry.deregister(id);
        }
        let result = match result {
            Ok(report) => Ok(report.clone()),
            Err(error) => Err(error.to_string()),
        };
        self.send(OperationEvent::Finished(result));
    }

    fn progress(&self, progress: &ProgressInfo, status: &str) {
        {
            let mut state = self.state.lock();
            let now = Instant::now();
            if state
                .last_progress
                .is_some_and(|last| now.duration_since(last) < self.interval)
            {
                return;
            }
            state.last_progress = Some(now);
        }
        let snapshot = self.snapshot(progress, status, false);
        // Progress is advisory; a full channel drops it.
        let _ = self.events.try_send(OperationEvent::Progress(snapshot));
    }

    fn checkpoint(&self) -> Option<GenericAnswer> {
        if self.control.is_cancelled() {
            return Some(GenericAnswer::Cancel);
        }
        if self.control.is_paused() {
            tracing::debug!("Operation paused");
            let waited = self.control.wait_while_paused();
            self.state.lock().paused_for += waited;
            tracing::debug!(?waited, "Operation resumed");
        }
        if let Some((registry, id)) = self.waiting_for_turn() {
            tracing::info!("Waiting for an earlier operation on the same device");
            let waited = registry.wait_for_turn(id, &self.control);
            self.state.lock().paused_for += waited;
        }
        self.control.is_cancelled().then_some(GenericAnswer::Cancel)
    }

    fn pause_pending(&self) -> bool {
        self.control.is_paused() || self.waiting_for_turn().is_some()
    }

    fn undo_journal(&self) -> Option<&dyn UndoJournal> {
        self.journal.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::answer::Command;
    use crate::buffer::FixedMemory;
    use crate::context::FsContext;
    use fsctx_core::{EngineConfig, SingleEntryIterator};
    use tempfile::TempDir;

    fn spawn_copy(
        adapter: PolicyAdapter,
        source: &Path,
        target: &Path,
    ) -> std::thread::JoinHandle<Result<OperationComplete, FsError>> {
        let ctx = FsContext::with_memory_probe(
            Arc::new(adapter),
            EngineConfig::default(),
            Arc::new(FixedMemory(1 << 30)),
        )
        .unwrap();
        let entries = SingleEntryIterator::from_path(source).unwrap();
        ctx.spawn(crate::FileOperation::copy_to(target), Box::new(entries))
            .unwrap()
    }

    #[test]
    fn test_interaction_round_trip() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("a.txt");
        let target = temp.path().join("out");
        std::fs::write(&source, b"new").unwrap();
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("a.txt"), b"old").unwrap();

        let (adapter, mut events) = PolicyAdapter::new(EVENT_CHANNEL_SIZE);
        let worker = spawn_copy(adapter, &source, &target);

        let mut asked = Vec::new();
        let mut finished = None;
        while let Some(event) = events.blocking_recv() {
            match event {
                OperationEvent::Interaction(prompt) => {
                    asked.push(prompt.interaction);
                    assert!(prompt.answers().contains(&Command::Replace));
                    prompt.answer(InteractionDecision::command(Command::Replace));
                }
                OperationEvent::Finished(result) => finished = Some(result),
                _ => {}
            }
        }

        let report = worker.join().unwrap().unwrap();
        assert_eq!(asked, vec![Interaction::FileExists]);
        assert_eq!(report.succeeded, 1);
        assert!(matches!(finished, Some(Ok(_))));
        assert_eq!(std::fs::read(target.join("a.txt")).unwrap(), b"new");
    }

    #[test]
    fn test_cancel_before_start() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("a.txt");
        std::fs::write(&source, b"x").unwrap();

        let (adapter, mut events) = PolicyAdapter::new(EVENT_CHANNEL_SIZE);
        adapter.control().cancel();
        let worker = spawn_copy(adapter, &source, temp.path());
        while events.blocking_recv().is_some() {}

        assert!(matches!(worker.join().unwrap(), Err(FsError::Cancelled)));
    }

    #[test]
    fn test_pause_holds_operation() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("a.txt");
        let target = temp.path().join("out");
        std::fs::write(&source, b"x").unwrap();
        std::fs::create_dir(&target).unwrap();

        let (adapter, mut events) = PolicyAdapter::new(EVENT_CHANNEL_SIZE);
        let control = adapter.control();
        control.pause();
        let worker = spawn_copy(adapter, &source, &target);

        std::thread::sleep(Duration::from_millis(100));
        assert!(!target.join("a.txt").exists());
        control.resume();

        while events.blocking_recv().is_some() {}
        assert_eq!(worker.join().unwrap().unwrap().succeeded, 1);
        assert!(target.join("a.txt").exists());
    }

    #[test]
    fn test_registry_orders_overlapping_operations() {
        let registry = ActivityRegistry::new();
        let first = registry.register(&[1, 2]);
        let second = registry.register(&[2]);
        let third = registry.register(&[3]);

        assert!(!registry.has_earlier_overlap(first));
        assert!(registry.has_earlier_overlap(second));
        assert!(!registry.has_earlier_overlap(third));

        registry.deregister(first);
        assert!(!registry.has_earlier_overlap(second));
    }

    #[test]
    fn test_estimate_remaining() {
        let mut progress = ProgressInfo::new();
        progress.new_file(300);
        progress.add_bytes(100);
        let eta = estimate_remaining(&progress, Duration::from_secs(1)).unwrap();
        assert_eq!(eta, Duration::from_secs(2));
        assert_eq!(estimate_remaining(&ProgressInfo::new(), Duration::from_secs(1)), None);
    }
}
