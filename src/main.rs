//! fsctx - copy, move, link, trash and restore file trees.
//!
//! Usage:
//!   fsctx copy SOURCE... TARGET      Copy entries into a directory
//!   fsctx move SOURCE... TARGET      Move entries into a directory
//!   fsctx duplicate SOURCE...        Copy entries next to themselves
//!   fsctx link SOURCE... TARGET      Create symlinks in a directory
//!   fsctx rm PATH...                 Delete permanently
//!   fsctx trash PATH...              Move to the trash
//!   fsctx restore PATH...            Put trashed entries back
//!   fsctx empty-trash                Delete everything in every trash
//!   fsctx --help                     Show help

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result, bail, eyre};
use fsctx_core::{EngineConfig, EntryIterator, EntryListIterator, FsError};
use fsctx_ops::{
    ActivityRegistry, AnswerFlags, Command as Answer, ErrorAnswer, ErrorDecision, ErrorPrompt, FileOperation,
    FsContext, GenericAnswer, Interaction, InteractionAnswer, InteractionDecision,
    InteractionPrompt, OperationComplete, OperationEvent, PolicyAdapter, PresetPolicy,
    ProgressSnapshot, Remember, EVENT_CHANNEL_SIZE,
};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "fsctx",
    version,
    about = "Copy, move, link, trash and restore file trees",
    long_about = "fsctx runs file operations with progress reporting and asks \
                  how to settle every conflict and error it cannot settle on its own.\n\n\
                  Use --on-conflict and --on-error to answer up front for unattended runs."
)]
struct Cli {
    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Engine configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Extra trash directory, used for entries on its volume
    #[arg(long = "trash-dir", global = true)]
    trash_dirs: Vec<PathBuf>,

    /// How to settle name collisions
    #[arg(long, value_enum, default_value_t = ConflictMode::Ask, global = true)]
    on_conflict: ConflictMode,

    /// What a move does with sources it had to copy to another device
    #[arg(long, value_enum, default_value_t = CrossDevice::Delete, global = true)]
    cross_device: CrossDevice,

    /// How to handle errors
    #[arg(long, value_enum, default_value_t = ErrorMode::Ask, global = true)]
    on_error: ErrorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Copy entries into a directory
    Copy {
        /// Sources followed by the target directory
        #[arg(required = true, num_args = 2..)]
        paths: Vec<PathBuf>,
    },

    /// Move entries into a directory
    Move {
        /// Sources followed by the target directory
        #[arg(required = true, num_args = 2..)]
        paths: Vec<PathBuf>,
    },

    /// Copy entries next to themselves under a new name
    Duplicate {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Create symbolic links to entries in a directory
    Link {
        /// Write absolute link targets
        #[arg(short, long)]
        absolute: bool,

        /// Sources followed by the target directory
        #[arg(required = true, num_args = 2..)]
        paths: Vec<PathBuf>,
    },

    /// Delete entries permanently
    Rm {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Move entries to the trash of their volume
    Trash {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Put trashed entries back where they came from
    Restore {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Delete everything in every trash
    EmptyTrash,

    /// Delete the oldest trashed entries on a volume until enough space is free
    Reclaim {
        /// Any path on the volume
        path: PathBuf,

        /// Bytes to free
        bytes: u64,
    },

    /// List trashed entries, oldest first
    TrashList {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ConflictMode {
    Ask,
    Skip,
    Replace,
    KeepBoth,
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CrossDevice {
    Ask,
    Delete,
    Trash,
    Keep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ErrorMode {
    Ask,
    Skip,
    Abort,
}

/// Answers given on the command line.
#[derive(Debug, Clone, Copy)]
struct Answers {
    on_conflict: ConflictMode,
    cross_device: CrossDevice,
    on_error: ErrorMode,
}

impl Answers {
    fn preset(&self, interaction: Interaction) -> Option<Answer> {
        let collision = matches!(
            interaction,
            Interaction::FileExists | Interaction::DirectoryExists | Interaction::TypeMismatch
        );
        if collision {
            return match (self.on_conflict, interaction) {
                (ConflictMode::Ask, _) => None,
                (ConflictMode::Skip, _) => Some(Answer::Skip),
                (ConflictMode::Replace | ConflictMode::Merge, Interaction::DirectoryExists) => {
                    Some(Answer::MergeDirectories)
                }
                (ConflictMode::Replace, _) => Some(Answer::Replace),
                (ConflictMode::KeepBoth, _) => Some(Answer::MakeUniqueName),
                (ConflictMode::Merge, _) => None,
            };
        }
        match (interaction, self.cross_device) {
            (Interaction::CannotMove, CrossDevice::Delete) => Some(Answer::CopyAndDelete),
            (Interaction::CannotMove, CrossDevice::Trash) => Some(Answer::CopyAndTrash),
            (Interaction::CannotMove, CrossDevice::Keep) => Some(Answer::CopyOnly),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    config.trash_dirs.extend(cli.trash_dirs.iter().cloned());

    let answers = Answers {
        on_conflict: cli.on_conflict,
        cross_device: cli.cross_device,
        on_error: cli.on_error,
    };

    let (operation, entries) = match cli.command {
        Command::Copy { paths } => {
            let (target, sources) = split_target(paths)?;
            (FileOperation::copy_to(target), sources)
        }
        Command::Move { paths } => {
            let (target, sources) = split_target(paths)?;
            (FileOperation::move_to(target), sources)
        }
        Command::Duplicate { paths } => (FileOperation::Duplicate, paths),
        Command::Link { absolute, paths } => {
            let (target, sources) = split_target(paths)?;
            (FileOperation::link_to(target, !absolute), sources)
        }
        Command::Rm { paths } => (FileOperation::Remove, paths),
        Command::Trash { paths } => (FileOperation::MoveToTrash, paths),
        Command::Restore { paths } => (FileOperation::RestoreFromTrash, paths),
        Command::EmptyTrash => (FileOperation::EmptyTrash, Vec::new()),
        Command::Reclaim { path, bytes } => {
            let device = fsctx_ops::volume::device_of(&path)
                .with_context(|| format!("Cannot stat {}", path.display()))?;
            return run_reclaim(config, answers, device, bytes).await;
        }
        Command::TrashList { json } => return list_trash(config, json),
    };

    let entries: Box<dyn EntryIterator> = Box::new(
        EntryListIterator::from_paths(&entries).context("Invalid path")?,
    );
    let (adapter, events) = policy_adapter(&config);
    let ctx = FsContext::new(Arc::new(adapter), config)?;
    let worker = ctx.spawn(operation, entries)?;

    let report = drive(events, worker, answers).await?;
    finish(&report)
}

fn init_tracing(verbose: u8) {
    let filter = std::env::var("FSCTX_LOG")
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| {
            let level = match verbose {
                0 => "warn",
                1 => "info",
                _ => "debug",
            };
            EnvFilter::new(level)
        });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn policy_adapter(config: &EngineConfig) -> (PolicyAdapter, mpsc::Receiver<OperationEvent>) {
    let (adapter, events) = PolicyAdapter::new(EVENT_CHANNEL_SIZE);
    let adapter = adapter.with_progress_interval(config.progress_interval());
    if config.auto_pause {
        static REGISTRY: OnceLock<Arc<ActivityRegistry>> = OnceLock::new();
        let registry = REGISTRY.get_or_init(|| Arc::new(ActivityRegistry::new()));
        return (adapter.with_auto_pause(Arc::clone(registry)), events);
    }
    (adapter, events)
}

/// Split "SOURCE... TARGET" into the target and the sources.
fn split_target(mut paths: Vec<PathBuf>) -> Result<(PathBuf, Vec<PathBuf>)> {
    let target = paths.pop().ok_or_else(|| eyre!("Missing target directory"))?;
    if paths.is_empty() {
        bail!("Missing source paths");
    }
    Ok((target, paths))
}

type Worker = JoinHandle<Result<OperationComplete, FsError>>;

/// Serve the engine's events until it finishes, then collect its result.
async fn drive(
    mut events: mpsc::Receiver<OperationEvent>,
    worker: Worker,
    answers: Answers,
) -> Result<OperationComplete> {
    let mut progress_shown = false;
    while let Some(event) = events.recv().await {
        match event {
            OperationEvent::Preparing { operation } => {
                eprintln!("{operation}: counting entries...");
            }
            OperationEvent::Started { totals, .. } => {
                eprintln!(
                    "{} entries, {}",
                    totals.entries,
                    format_size(totals.bytes)
                );
            }
            OperationEvent::Progress(snapshot) => {
                show_progress(&snapshot);
                progress_shown = true;
            }
            OperationEvent::Error(prompt) => {
                clear_progress(&mut progress_shown);
                settle_error(prompt, answers).await;
            }
            OperationEvent::Interaction(prompt) => {
                clear_progress(&mut progress_shown);
                settle_interaction(prompt, answers).await;
            }
            OperationEvent::EntryCreated { entry, .. } => {
                tracing::debug!(entry = %entry.display(), "Created");
            }
            OperationEvent::DirectoryTrashed(directory) => {
                tracing::debug!(directory = %directory.display(), "Trashing directory");
            }
            OperationEvent::AboutToRemove(entry) => {
                tracing::debug!(entry = %entry.display(), "Removing");
            }
            OperationEvent::Finished(_) => clear_progress(&mut progress_shown),
        }
    }

    let joined = tokio::task::spawn_blocking(move || worker.join())
        .await
        .context("Worker task failed")?;
    let result = joined.map_err(|_| eyre!("Operation thread panicked"))?;
    Ok(result?)
}

async fn run_reclaim(config: EngineConfig, answers: Answers, device: u64, bytes: u64) -> Result<()> {
    let (adapter, events) = policy_adapter(&config);
    let mut ctx = FsContext::new(Arc::new(adapter), config)?;
    let worker = std::thread::Builder::new()
        .name("fsctx-reclaim".to_string())
        .spawn(move || ctx.reclaim_trash_space(device, bytes))?;
    let report = drive(events, worker, answers).await?;
    finish(&report)
}

fn list_trash(config: EngineConfig, json: bool) -> Result<()> {
    let mut ctx = FsContext::new(Arc::new(PresetPolicy::new()), config)?;
    let trashed = ctx.trash_contents()?;

    if json {
        let listing: Vec<_> = trashed
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "path": entry.path,
                    "original_path": entry.original_path,
                    "trashed_at": entry.trashed_at.to_rfc3339(),
                    "size": entry.size,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    if trashed.is_empty() {
        println!("Trash is empty.");
        return Ok(());
    }
    for entry in &trashed {
        let original = entry
            .original_path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "?".to_string());
        println!(
            "{}  {:>10}  {}  ({})",
            entry.trashed_at.format("%Y-%m-%d %H:%M"),
            format_size(entry.size),
            original,
            entry.path.display()
        );
    }
    Ok(())
}

fn finish(report: &OperationComplete) -> Result<()> {
    println!(
        "{} ({} in {:.1}s)",
        report.summary(),
        format_size(report.bytes_processed),
        report.elapsed.as_secs_f64()
    );
    for error in &report.errors {
        eprintln!("  {error}");
    }
    if report.stopped {
        eprintln!("Stopped before every entry was handled.");
    }
    if !report.is_success() {
        bail!("{} entries failed", report.failed);
    }
    Ok(())
}

fn show_progress(snapshot: &ProgressSnapshot) {
    let progress = &snapshot.progress;
    let mut line = format!(
        "{}: {} of {} entries, {}",
        snapshot.status,
        progress.current.entries,
        progress.total.entries,
        format_size(progress.current.bytes)
    );
    if let Some(fraction) = progress.fraction() {
        line.push_str(&format!(" ({:.0}%)", fraction * 100.0));
    }
    if let Some(remaining) = snapshot.estimated_remaining {
        line.push_str(&format!(", {}s left", remaining.as_secs()));
    }
    if snapshot.paused {
        line.push_str(" [paused]");
    }
    eprint!("\r\x1b[2K{line}");
    let _ = std::io::stderr().flush();
}

fn clear_progress(shown: &mut bool) {
    if std::mem::take(shown) {
        eprintln!();
    }
}

async fn settle_interaction(prompt: InteractionPrompt, answers: Answers) {
    if let Some(command) = answers.preset(prompt.interaction) {
        prompt.answer(InteractionDecision::command(command));
        return;
    }

    let mut options: Vec<(String, InteractionAnswer)> = prompt
        .answers()
        .iter()
        .map(|command| (command.to_string(), InteractionAnswer::Command(*command)))
        .collect();
    if prompt.legal.allows(GenericAnswer::Cancel) {
        options.push(("Cancel".to_string(), InteractionAnswer::Generic(GenericAnswer::Cancel)));
    }

    let mut question = prompt.interaction.description().to_string();
    if let Some(source) = &prompt.source {
        question.push_str(&format!("\n  source: {}", source.display()));
    }
    if let Some(target) = &prompt.target {
        question.push_str(&format!("\n  target: {}", target.display()));
    }

    let labels = options.iter().map(|(label, _)| label.clone()).collect();
    let decision = match choose(question, labels).await {
        Some((index, all)) => InteractionDecision {
            answer: options[index].1,
            remember: if all { Remember::ForOperation } else { Remember::Once },
            new_name: None,
        },
        // Nobody to ask.
        None if prompt.legal.allows(GenericAnswer::Cancel) => {
            InteractionDecision::generic(GenericAnswer::Cancel)
        }
        None => InteractionDecision::command(prompt.answers()[0]),
    };
    prompt.answer(decision);
}

async fn settle_error(prompt: ErrorPrompt, answers: Answers) {
    let legal = prompt.legal;
    let fallback = [GenericAnswer::SkipEntry, GenericAnswer::Ignore, GenericAnswer::Cancel]
        .into_iter()
        .find(|answer| legal.allows(*answer))
        .unwrap_or(GenericAnswer::Cancel);

    match answers.on_error {
        ErrorMode::Skip => {
            eprintln!("{}: {}", prompt.path.display(), prompt.message);
            prompt.answer(ErrorDecision::generic(fallback));
            return;
        }
        ErrorMode::Abort if legal.allows(GenericAnswer::Cancel) => {
            eprintln!("{}: {}", prompt.path.display(), prompt.message);
            prompt.answer(ErrorDecision::generic(GenericAnswer::Cancel));
            return;
        }
        ErrorMode::Abort | ErrorMode::Ask => {}
    }

    let mut options: Vec<(&str, ErrorAnswer)> = Vec::new();
    if legal.contains(AnswerFlags::RETRY) {
        options.push(("Retry", ErrorAnswer::Retry));
    }
    for (label, answer) in [
        ("Skip", GenericAnswer::SkipEntry),
        ("Skip directory", GenericAnswer::SkipDirectory),
        ("Skip the rest", GenericAnswer::SkipOperation),
        ("Retry entry", GenericAnswer::RetryEntry),
        ("Ignore", GenericAnswer::Ignore),
        ("Cancel", GenericAnswer::Cancel),
    ] {
        if legal.allows(answer) {
            options.push((label, ErrorAnswer::Generic(answer)));
        }
    }

    let question = format!(
        "{} failed on {}: {}",
        prompt.operation,
        prompt.path.display(),
        prompt.message
    );
    let labels = options.iter().map(|(label, _)| label.to_string()).collect();
    let decision = match choose(question, labels).await {
        Some((index, all)) => ErrorDecision {
            answer: options[index].1,
            remember: if all { Remember::ForOperation } else { Remember::Once },
        },
        None => ErrorDecision::generic(fallback),
    };
    prompt.answer(decision);
}

/// Ask on the terminal. Returns the chosen index, and whether it should
/// apply to every similar question; `None` when stdin is closed.
async fn choose(question: String, choices: Vec<String>) -> Option<(usize, bool)> {
    tokio::task::spawn_blocking(move || {
        let stdin = std::io::stdin();
        loop {
            eprintln!("{question}");
            for (i, choice) in choices.iter().enumerate() {
                eprintln!("  {}) {choice}", i + 1);
            }
            eprint!("Choice (add ! to answer all alike): ");
            let _ = std::io::stderr().flush();

            let mut line = String::new();
            if stdin.lock().read_line(&mut line).ok()? == 0 {
                return None;
            }
            let line = line.trim();
            let (number, all) = match line.strip_suffix('!') {
                Some(number) => (number.trim(), true),
                None => (line, false),
            };
            match number.parse::<usize>() {
                Ok(n) if (1..=choices.len()).contains(&n) => return Some((n - 1, all)),
                _ => eprintln!("Enter a number from 1 to {}.", choices.len()),
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Format bytes as human-readable size.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_target() {
        let (target, sources) =
            split_target(vec![PathBuf::from("a"), PathBuf::from("b"), PathBuf::from("dst")]).unwrap();
        assert_eq!(target, PathBuf::from("dst"));
        assert_eq!(sources, vec![PathBuf::from("a"), PathBuf::from("b")]);
        assert!(split_target(vec![PathBuf::from("dst")]).is_err());
    }

    #[test]
    fn test_preset_answers_are_legal() {
        for &on_conflict in ConflictMode::value_variants() {
            for &cross_device in CrossDevice::value_variants() {
                let answers = Answers {
                    on_conflict,
                    cross_device,
                    on_error: ErrorMode::Ask,
                };
                for interaction in [
                    Interaction::FileExists,
                    Interaction::DirectoryExists,
                    Interaction::TypeMismatch,
                    Interaction::CannotMove,
                ] {
                    if let Some(command) = answers.preset(interaction) {
                        assert!(interaction.accepts(command), "{answers:?} {interaction:?}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["fsctx", "--on-conflict", "keep-both", "copy", "a", "b", "dst"])
            .unwrap();
        assert_eq!(cli.on_conflict, ConflictMode::KeepBoth);
        assert!(matches!(cli.command, Command::Copy { ref paths } if paths.len() == 3));
        assert!(Cli::try_parse_from(["fsctx", "copy", "only"]).is_err());
    }
}
