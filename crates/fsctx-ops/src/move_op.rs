//! Move, by rename where possible and by copy and dispose otherwise.

use std::ffi::OsStr;
use std::fs::{self, Metadata};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use filetime::FileTime;
use fsctx_core::{EntryIterator, EntryRef, FsError};

use crate::answer::{Command, Interaction};
use crate::attrs;
use crate::conflict::Placement;
use crate::context::{Flow, FsContext, Measure, Naming, Plan, Scope, Step};
use crate::operation::{OperationError, OperationKind};
use crate::paths;
use crate::progress::OperationComplete;
use crate::volume;

impl FsContext {
    /// Move `entries` into the directory `target`.
    pub fn move_to(
        &mut self,
        entries: &mut dyn EntryIterator,
        target: impl AsRef<Path>,
    ) -> Result<OperationComplete, FsError> {
        let target = self.target_directory(target.as_ref())?;
        let device = volume::device_of(&target).map_err(|e| FsError::io(&target, e))?;
        let plan = Plan {
            measure: Measure::Move {
                target_device: device,
            },
            target_device: Some(device),
            naming: Naming::Ask,
            filtered: true,
        };
        self.run_root(OperationKind::Moving, entries, plan, |ctx, scope, entry| {
            ctx.move_top_level(scope, entry, &target, device)
        })
    }

    fn move_top_level(&mut self, scope: &Scope, entry: &EntryRef, target: &Path, device: u64) -> Step {
        let source = paths::resolve_parent(&entry.path());
        let meta = self.attempt(scope, &source, || fs::symlink_metadata(&source))?;
        if source.parent() == Some(target) {
            tracing::debug!(path = %source.display(), "Already in target directory");
            self.count_done(&meta);
            return Ok(());
        }
        if entry.is_root() {
            return Err(Flow::Ignored(FsError::invalid_target(
                &source,
                "the filesystem root cannot be moved",
            )));
        }
        if !self.check_target(scope, &source, &meta, target)? {
            return Ok(());
        }
        self.move_entry(scope, &source, &meta, target, entry.name(), device)
            .map(drop)
    }

    /// Move one entry into `target_dir`, which lives on `device`. Returns
    /// where the entry ended up.
    pub(crate) fn move_entry(
        &mut self,
        scope: &Scope,
        source: &Path,
        meta: &Metadata,
        target_dir: &Path,
        name: &OsStr,
        device: u64,
    ) -> Step<PathBuf> {
        if meta.dev() != device {
            return self.move_across_devices(scope, source, meta, target_dir, name);
        }

        match self.place(scope, source, meta, target_dir, name)? {
            Placement::Fresh(dest) => {
                if meta.file_type().is_symlink() {
                    return self.move_link(scope, source, meta, &dest);
                }
                loop {
                    match fs::rename(source, &dest) {
                        Ok(()) => break,
                        Err(e) if volume::is_cross_device(&e) => {
                            let name = dest.file_name().unwrap_or(name);
                            return self.move_across_devices(scope, source, meta, target_dir, name);
                        }
                        Err(e) => self.handle_error(scope, FsError::io(source, e))?,
                    }
                }
                self.count_done(meta);
                self.note_relocated(source, &dest);
                Ok(dest)
            }
            Placement::Merge(dest) => {
                // The pre-pass counted this directory as one entry, but its
                // children are now moved one by one.
                self.progress.disable_totals();
                let inner = scope.in_directory(false);
                self.walk_directory(&inner, source, |ctx, scope, child| {
                    let path = child.path();
                    let child_meta = ctx.attempt(scope, &path, || fs::symlink_metadata(&path))?;
                    ctx.move_entry(scope, &path, &child_meta, &dest, child.name(), device)
                        .map(drop)
                })?;
                if let Err(error) = fs::remove_dir(source) {
                    tracing::debug!(path = %source.display(), %error, "Kept source directory after merge");
                }
                self.progress.directory_done();
                Ok(dest)
            }
            placement => {
                let dest = self.write_file(scope, source, meta, placement)?;
                self.attempt(scope, source, || fs::remove_file(source))?;
                Ok(dest)
            }
        }
    }

    /// Symlinks are recreated with the same text, so relative links keep
    /// resolving against their new directory.
    fn move_link(&mut self, scope: &Scope, source: &Path, meta: &Metadata, dest: &Path) -> Step<PathBuf> {
        let link = self.attempt(scope, source, || fs::read_link(source))?;
        if link.is_absolute() {
            self.attempt(scope, source, || fs::rename(source, dest))?;
        } else {
            self.attempt(scope, dest, || std::os::unix::fs::symlink(&link, dest))?;
            let config = Arc::clone(&self.config);
            if let Err(error) = attrs::copy_attributes(source, dest, &config) {
                tracing::debug!(path = %dest.display(), %error, "Link attributes not carried over");
            }
            let accessed = FileTime::from_last_access_time(meta);
            let modified = FileTime::from_last_modification_time(meta);
            if let Err(error) = filetime::set_symlink_file_times(dest, accessed, modified) {
                tracing::debug!(path = %dest.display(), %error, "Link timestamps not carried over");
            }
            self.attempt(scope, source, || fs::remove_file(source))?;
        }
        self.progress.link_done();
        self.note_relocated(source, dest);
        Ok(dest.to_path_buf())
    }

    /// Copy to the other device, then dispose of the source as the policy
    /// decides. A source whose copy is incomplete is always kept.
    fn move_across_devices(
        &mut self,
        scope: &Scope,
        source: &Path,
        meta: &Metadata,
        target_dir: &Path,
        name: &OsStr,
    ) -> Step<PathBuf> {
        let resolution = self.interact(scope, Interaction::CannotMove, Some(source), Some(target_dir))?;
        let incomplete_before = self.incomplete;
        let copied = self.in_operation(OperationKind::Copying, |ctx| {
            ctx.copy_entry(scope, source, meta, target_dir, name)
        })?;

        if self.incomplete != incomplete_before {
            tracing::warn!(path = %source.display(), "Copy is incomplete, keeping source");
            self.report.errors.push(OperationError::new(
                source.to_path_buf(),
                "source kept because not every entry was copied",
            ));
            return Ok(copied);
        }

        // The copy already counted this entry.
        let mark = self.progress.mark();
        let disposed = match resolution.command {
            Command::CopyAndDelete => self.sub_operation(scope, OperationKind::Removing, |ctx, scope| {
                ctx.policy.about_to_delete_or_trash(source);
                ctx.remove_entry(scope, source)
            }),
            Command::CopyAndTrash => self.sub_operation(scope, OperationKind::Trashing, |ctx, scope| {
                ctx.trash_entry(scope, source, meta).map(drop)
            }),
            _ => Ok(None),
        };
        self.progress.rewind_to(mark);
        if disposed?.is_some() {
            self.note_relocated(source, &copied);
        }
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::context;
    use crate::preset::PresetPolicy;
    use fsctx_core::{EngineConfig, SingleEntryIterator};
    use tempfile::TempDir;

    #[test]
    fn test_move_within_directory_is_noop() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("stay.txt");
        fs::write(&file, b"x").unwrap();

        let mut ctx = context(PresetPolicy::new(), EngineConfig::default());
        let mut entries = SingleEntryIterator::from_path(&file).unwrap();
        let report = ctx.move_to(&mut entries, temp.path()).unwrap();

        assert_eq!(report.succeeded, 1);
        assert!(file.exists());
    }

    #[test]
    fn test_move_merges_directories() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("a/docs");
        let target = temp.path().join("b");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(target.join("docs")).unwrap();
        fs::write(source.join("new.txt"), b"new").unwrap();
        fs::write(target.join("docs/old.txt"), b"old").unwrap();

        let mut ctx = context(PresetPolicy::replace_all(), EngineConfig::default());
        let mut entries = SingleEntryIterator::from_path(&source).unwrap();
        let report = ctx.move_to(&mut entries, &target).unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(fs::read(target.join("docs/new.txt")).unwrap(), b"new");
        assert_eq!(fs::read(target.join("docs/old.txt")).unwrap(), b"old");
        assert!(!source.exists());
        assert!(!ctx.progress().totals_valid());
    }

    #[test]
    fn test_plain_move_keeps_totals() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("a/docs");
        let target = temp.path().join("b");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&target).unwrap();
        fs::write(source.join("new.txt"), b"new").unwrap();

        let mut ctx = context(PresetPolicy::new(), EngineConfig::default());
        let mut entries = SingleEntryIterator::from_path(&source).unwrap();
        ctx.move_to(&mut entries, &target).unwrap();

        let progress = ctx.progress();
        assert!(progress.totals_valid());
        assert_eq!(progress.current, progress.total);
    }

    #[test]
    fn test_cross_device_move_disposes_as_answered() {
        for command in [Command::CopyAndDelete, Command::CopyAndTrash, Command::CopyOnly] {
            let temp = TempDir::new().unwrap();
            let base = temp.path().canonicalize().unwrap();
            let source = base.join("photos");
            let target = base.join("external");
            fs::create_dir_all(source.join("2024")).unwrap();
            fs::write(source.join("2024/beach.jpg"), b"jpg").unwrap();
            fs::create_dir(&target).unwrap();

            let config = EngineConfig {
                trash_dirs: vec![base.join("trash")],
                discover_volume_trash: false,
                ..Default::default()
            };
            let policy = PresetPolicy::new().answer(Interaction::CannotMove, command);
            let mut ctx = context(policy, config);
            let scope = Scope::root(OperationKind::Moving, None, Naming::Ask);
            let meta = fs::symlink_metadata(&source).unwrap();
            // Pretend the target lives on another volume.
            let other_device = meta.dev() + 1;
            let moved = ctx
                .move_entry(&scope, &source, &meta, &target, OsStr::new("photos"), other_device)
                .unwrap();

            assert_eq!(moved, target.join("photos"), "{command:?}");
            assert_eq!(fs::read(moved.join("2024/beach.jpg")).unwrap(), b"jpg", "{command:?}");
            match command {
                Command::CopyAndDelete => assert!(!source.exists()),
                Command::CopyAndTrash => {
                    assert!(!source.exists());
                    assert_eq!(
                        fs::read(base.join("trash/files/photos/2024/beach.jpg")).unwrap(),
                        b"jpg"
                    );
                }
                _ => assert_eq!(fs::read(source.join("2024/beach.jpg")).unwrap(), b"jpg"),
            }
        }
    }

    #[test]
    fn test_move_relative_link_keeps_text() {
        let temp = TempDir::new().unwrap();
        let from = temp.path().join("from");
        let to = temp.path().join("to");
        fs::create_dir_all(&from).unwrap();
        fs::create_dir_all(&to).unwrap();
        std::os::unix::fs::symlink("../shared/file", from.join("link")).unwrap();

        let mut ctx = context(PresetPolicy::new(), EngineConfig::default());
        let mut entries = SingleEntryIterator::from_path(from.join("link")).unwrap();
        ctx.move_to(&mut entries, &to).unwrap();

        assert_eq!(fs::read_link(to.join("link")).unwrap(), PathBuf::from("../shared/file"));
        assert!(fs::symlink_metadata(from.join("link")).is_err());
    }
}
