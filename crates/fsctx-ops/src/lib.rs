//! Filesystem operation engine for fsctx.
//!
//! An [`FsContext`] copies, moves, duplicates, links, removes, trashes and
//! restores entries on behalf of an [`FsPolicy`], which settles every error
//! and conflict the engine cannot settle on its own. Operations run
//! synchronously on the calling thread; [`PolicyAdapter`] bridges them to an
//! async host through a channel of [`OperationEvent`]s.

mod adapter;
mod answer;
mod attrs;
mod buffer;
mod conflict;
mod context;
mod copy;
mod link;
mod move_op;
mod operation;
pub mod paths;
mod pipeline;
mod policy;
mod preset;
mod progress;
mod remove;
mod trash;
pub mod volume;

pub use adapter::{
    ActivityRegistry, ErrorPrompt, InteractionPrompt, OperationControl, OperationEvent,
    PolicyAdapter, ProgressSnapshot, EVENT_CHANNEL_SIZE,
};
pub use answer::{
    AnswerCache, AnswerFlags, AnswerMemory, Command, ControlSignal, ErrorAnswer, ErrorDecision,
    GenericAnswer, Interaction, InteractionAnswer, InteractionDecision, Remember,
};
pub use attrs::{TrashRecord, ORIGINAL_PATH_ATTR, TRASHED_AT_ATTR};
pub use buffer::{BufferManager, FixedMemory, MemoryProbe, SystemMemory};
pub use conflict::unique_path;
pub use context::FsContext;
pub use operation::{FileOperation, OperationError, OperationKind, OperationStack};
pub use pipeline::PipelineStats;
pub use policy::{ErrorRequest, FsPolicy, InteractionRequest, OperationInfo, UndoJournal};
pub use preset::PresetPolicy;
pub use progress::{Counts, OperationComplete, ProgressInfo, ProgressMark};
pub use trash::{TrashBin, TrashLocator, TrashedEntry};
