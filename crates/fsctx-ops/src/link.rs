//! Symbolic links to entries.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use fsctx_core::{EntryIterator, EntryRef, FsError};

use crate::answer::{Command, Interaction};
use crate::context::{FsContext, Measure, Naming, Plan, Scope, Step};
use crate::copy::links_unsupported;
use crate::operation::OperationKind;
use crate::paths;
use crate::progress::OperationComplete;
use crate::volume;

impl FsContext {
    /// Create a symlink in `target` for each of `entries`.
    ///
    /// Relative links are written relative to `target`; links between
    /// devices can only be absolute.
    pub fn create_link_to(
        &mut self,
        entries: &mut dyn EntryIterator,
        target: impl AsRef<Path>,
        relative: bool,
    ) -> Result<OperationComplete, FsError> {
        let target = self.target_directory(target.as_ref())?;
        let device = volume::device_of(&target).map_err(|e| FsError::io(&target, e))?;
        let plan = Plan {
            measure: Measure::TopLevel,
            target_device: Some(device),
            naming: Naming::Ask,
            filtered: true,
        };
        self.run_root(OperationKind::Linking, entries, plan, |ctx, scope, entry| {
            ctx.link_entry(scope, entry, &target, device, relative)
        })
    }

    fn link_entry(
        &mut self,
        scope: &Scope,
        entry: &EntryRef,
        target_dir: &Path,
        target_device: u64,
        relative: bool,
    ) -> Step {
        let source = paths::resolve_parent(&entry.path());
        let meta = self.attempt(scope, &source, || fs::symlink_metadata(&source))?;

        let mut relative = relative;
        if relative && meta.dev() != target_device {
            let resolution = self.interact(
                scope,
                Interaction::CannotCreateRelativeLink,
                Some(&source),
                Some(target_dir),
            )?;
            if resolution.command != Command::CreateAbsoluteLink {
                return self
                    .copy_entry(scope, &source, &meta, target_dir, entry.name())
                    .map(drop);
            }
            relative = false;
        }

        let placement = self.place(scope, &source, &meta, target_dir, entry.name())?;
        let dest = self.link_destination(scope, placement)?;
        let text = if relative {
            paths::relative_path(target_dir, &source)
        } else {
            source.clone()
        };

        loop {
            match std::os::unix::fs::symlink(&text, &dest) {
                Ok(()) => break,
                Err(e) if links_unsupported(&e) => {
                    self.interact(scope, Interaction::LinksUnsupported, Some(&source), Some(target_dir))?;
                    let name = dest.file_name().unwrap_or(entry.name());
                    return self.copy_entry(scope, &source, &meta, target_dir, name).map(drop);
                }
                Err(e) => self.handle_error(scope, FsError::io(&dest, e))?,
            }
        }
        tracing::debug!(link = %dest.display(), target = %text.display(), "Created link");
        self.progress.link_done();
        self.note_created(&source, &dest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::context;
    use crate::preset::PresetPolicy;
    use fsctx_core::{EngineConfig, SingleEntryIterator};
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_relative_link() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().canonicalize().unwrap();
        fs::create_dir_all(base.join("data")).unwrap();
        fs::create_dir_all(base.join("links")).unwrap();
        fs::write(base.join("data/report.txt"), b"r").unwrap();

        let mut ctx = context(PresetPolicy::new(), EngineConfig::default());
        let mut entries = SingleEntryIterator::from_path(base.join("data/report.txt")).unwrap();
        let report = ctx.create_link_to(&mut entries, base.join("links"), true).unwrap();

        assert_eq!(report.succeeded, 1);
        let link = base.join("links/report.txt");
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("../data/report.txt"));
        assert_eq!(fs::read(&link).unwrap(), b"r");
    }

    #[test]
    fn test_absolute_link() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().canonicalize().unwrap();
        fs::write(base.join("file"), b"f").unwrap();
        fs::create_dir(base.join("out")).unwrap();

        let mut ctx = context(PresetPolicy::new(), EngineConfig::default());
        let mut entries = SingleEntryIterator::from_path(base.join("file")).unwrap();
        ctx.create_link_to(&mut entries, base.join("out"), false).unwrap();

        assert_eq!(fs::read_link(base.join("out/file")).unwrap(), base.join("file"));
    }
}
