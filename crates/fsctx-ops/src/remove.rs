//! Permanent removal.

use std::fs;
use std::io;
use std::path::Path;

use fsctx_core::{EntryIterator, FsError};

use crate::answer::ControlSignal;
use crate::context::{Flow, FsContext, Measure, Naming, Plan, Scope, Step};
use crate::operation::OperationKind;
use crate::progress::OperationComplete;

fn is_not_empty(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::DirectoryNotEmpty
        || matches!(
            error.raw_os_error(),
            Some(nix::libc::ENOTEMPTY) | Some(nix::libc::EEXIST)
        )
}

impl FsContext {
    /// Remove `entries` and everything below them.
    pub fn remove(&mut self, entries: &mut dyn EntryIterator) -> Result<OperationComplete, FsError> {
        let plan = Plan {
            measure: Measure::Tree,
            target_device: None,
            naming: Naming::Ask,
            filtered: false,
        };
        self.run_root(OperationKind::Removing, entries, plan, |ctx, scope, entry| {
            let path = entry.path();
            if entry.is_root() {
                return Err(Flow::Ignored(FsError::invalid_target(
                    &path,
                    "the filesystem root cannot be removed",
                )));
            }
            ctx.policy.about_to_delete_or_trash(&path);
            ctx.remove_entry(scope, &path)
        })
    }

    /// Remove `path`, emptying it first if it is a directory that is not
    /// empty.
    pub(crate) fn remove_entry(&mut self, scope: &Scope, path: &Path) -> Step {
        let meta = self.attempt(scope, path, || fs::symlink_metadata(path))?;
        if !meta.is_dir() {
            self.attempt(scope, path, || fs::remove_file(path))?;
            self.count_done(&meta);
            return Ok(());
        }

        let mut emptied = false;
        loop {
            match fs::remove_dir(path) {
                Ok(()) => break,
                Err(e) if !emptied && is_not_empty(&e) => {
                    emptied = true;
                    let inner = Scope {
                        filter: None,
                        ..scope.in_directory(true)
                    };
                    let walked = self.walk_directory(&inner, path, |ctx, scope, child| {
                        ctx.remove_entry(scope, &child.path())
                    });
                    match walked {
                        Err(Flow::Signal(ControlSignal::SkipDirectory)) => {
                            return Err(Flow::Signal(ControlSignal::SkipEntry));
                        }
                        other => other?,
                    }
                }
                Err(e) => self.handle_error(scope, FsError::io(path, e))?,
            }
        }
        self.progress.directory_done();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::context;
    use crate::preset::PresetPolicy;
    use fsctx_core::{EngineConfig, EntryListIterator};
    use tempfile::TempDir;

    #[test]
    fn test_remove_tree_and_file() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path().join("tree");
        fs::create_dir_all(tree.join("a/b")).unwrap();
        fs::write(tree.join("a/b/file"), b"x").unwrap();
        fs::write(tree.join(".hidden"), b"x").unwrap();
        let single = temp.path().join("single");
        fs::write(&single, b"x").unwrap();

        let config = EngineConfig {
            include_hidden: false,
            ..Default::default()
        };
        let mut ctx = context(PresetPolicy::new(), config);
        let mut entries = EntryListIterator::from_paths([&tree, &single]).unwrap();
        let report = ctx.remove(&mut entries).unwrap();

        assert_eq!(report.succeeded, 2);
        assert!(!tree.exists());
        assert!(!single.exists());
        assert_eq!(ctx.progress().current.directories, 3);
        assert_eq!(ctx.progress().current.files, 3);
    }
}
