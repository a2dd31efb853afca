//! Name collisions at the destination and how they are settled.

use std::ffi::{OsStr, OsString};
use std::fs::{self, Metadata};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::answer::{Command, ControlSignal, Interaction};
use crate::context::{Flow, FsContext, Naming, Scope, Step};
use crate::operation::OperationKind;

/// Where an entry goes once collisions are settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Placement {
    /// Nothing is in the way.
    Fresh(PathBuf),
    /// An existing directory takes the entries.
    Merge(PathBuf),
    /// The data goes after the end of an existing file.
    Append { path: PathBuf, original_len: u64 },
    /// An interrupted copy picks up where the existing file ends.
    Resume { path: PathBuf, original_len: u64 },
}

impl Placement {
    pub(crate) fn path(&self) -> &Path {
        match self {
            Placement::Fresh(path)
            | Placement::Merge(path)
            | Placement::Append { path, .. }
            | Placement::Resume { path, .. } => path,
        }
    }
}

/// A free path next to `path`.
///
/// For "file.txt", tries "file (1).txt", "file (2).txt", etc.
pub fn unique_path(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or(Path::new(""));
    let stem = path.file_stem().unwrap_or(OsStr::new(""));
    let extension = path.extension();

    let named = |suffix: &str| {
        let mut name = OsString::from(stem);
        name.push(suffix);
        if let Some(ext) = extension {
            name.push(".");
            name.push(ext);
        }
        parent.join(name)
    };

    for i in 1..1000 {
        let candidate = named(&format!(" ({i})"));
        if fs::symlink_metadata(&candidate).is_err() {
            return candidate;
        }
    }

    // Fallback: use timestamp
    named(&format!("_{}", chrono::Utc::now().timestamp_millis()))
}

fn is_same_entry(a: &Metadata, b: &Metadata) -> bool {
    a.dev() == b.dev() && a.ino() == b.ino()
}

fn is_newer(source: &Metadata, existing: &Metadata) -> bool {
    matches!((source.modified(), existing.modified()), (Ok(a), Ok(b)) if a > b)
}

impl FsContext {
    /// Settle where `source` goes inside `target_dir`.
    pub(crate) fn place(
        &mut self,
        scope: &Scope,
        source: &Path,
        meta: &Metadata,
        target_dir: &Path,
        name: &OsStr,
    ) -> Step<Placement> {
        let mut name = name.to_os_string();
        loop {
            let dest = target_dir.join(&name);
            let existing = match fs::symlink_metadata(&dest) {
                Ok(existing) => existing,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(Placement::Fresh(dest));
                }
                Err(e) => {
                    self.handle_error(scope, fsctx_core::FsError::io(&dest, e))?;
                    continue;
                }
            };
            if scope.naming == Naming::Unique || is_same_entry(meta, &existing) {
                return Ok(Placement::Fresh(unique_path(&dest)));
            }

            let interaction = match (meta.is_dir(), existing.is_dir()) {
                (true, true) => Interaction::DirectoryExists,
                (false, false) => Interaction::FileExists,
                _ => Interaction::TypeMismatch,
            };
            let resolution = self.interact(scope, interaction, Some(source), Some(&dest))?;
            match resolution.command {
                Command::Replace => {
                    self.clear_target(scope, &dest)?;
                    return Ok(Placement::Fresh(dest));
                }
                Command::ReplaceIfNewer => {
                    if !is_newer(meta, &existing) {
                        tracing::debug!(target = %dest.display(), "Target is up to date");
                        return Err(Flow::Signal(ControlSignal::SkipEntry));
                    }
                    self.clear_target(scope, &dest)?;
                    return Ok(Placement::Fresh(dest));
                }
                Command::Append => {
                    return Ok(Placement::Append {
                        path: dest,
                        original_len: existing.len(),
                    });
                }
                Command::ContinuePartial => {
                    return Ok(Placement::Resume {
                        path: dest,
                        original_len: existing.len(),
                    });
                }
                Command::MakeUniqueName => return Ok(Placement::Fresh(unique_path(&dest))),
                Command::RenameSource => {
                    name = match resolution.new_name {
                        Some(new_name) => OsString::from(new_name.as_str()),
                        None => unique_path(&dest)
                            .file_name()
                            .map(OsStr::to_os_string)
                            .unwrap_or(name),
                    };
                }
                Command::RenameTarget => {
                    let aside = match resolution.new_name {
                        Some(new_name) => target_dir.join(new_name.as_str()),
                        None => unique_path(&dest),
                    };
                    self.attempt(scope, &dest, || fs::rename(&dest, &aside))?;
                    tracing::debug!(from = %dest.display(), to = %aside.display(), "Moved target aside");
                    return Ok(Placement::Fresh(dest));
                }
                Command::MergeDirectories => return Ok(Placement::Merge(dest)),
                Command::MoveTargetToTrash => {
                    self.trash_entry(scope, &dest, &existing)?;
                    return Ok(Placement::Fresh(dest));
                }
                Command::Retry => {}
                other => unreachable!("{other} is not an answer to {interaction:?}"),
            }
        }
    }

    /// Remove whatever is at `path` to make room, without counting it as
    /// progress.
    pub(crate) fn clear_target(&mut self, scope: &Scope, path: &Path) -> Step {
        let mark = self.progress.mark();
        let removed = self.in_operation(OperationKind::Removing, |ctx| ctx.remove_entry(scope, path));
        self.progress.rewind_to(mark);
        removed
    }

    /// Turn a placement into the path a link or symlink copy is created at.
    ///
    /// Appending to or resuming an entry makes no sense for links, so the
    /// existing entry is replaced instead.
    pub(crate) fn link_destination(&mut self, scope: &Scope, placement: Placement) -> Step<PathBuf> {
        match placement {
            Placement::Fresh(path) => Ok(path),
            Placement::Append { path, .. } | Placement::Resume { path, .. } => {
                self.clear_target(scope, &path)?;
                Ok(path)
            }
            Placement::Merge(path) => {
                tracing::debug!(target = %path.display(), "Cannot merge a link into a directory");
                Err(Flow::Signal(ControlSignal::SkipEntry))
            }
        }
    }
}
