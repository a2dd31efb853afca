//! Copy and duplicate.

use std::ffi::OsStr;
use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use filetime::FileTime;
use fsctx_core::{EntryIterator, EntryRef, FsError};

use crate::answer::{Command, ControlSignal, Interaction};
use crate::attrs;
use crate::conflict::Placement;
use crate::context::{CopyRoot, Flow, FsContext, Measure, Naming, Plan, Resolution, Scope, Step};
use crate::operation::OperationKind;
use crate::paths;
use crate::pipeline::next_chunk_size;
use crate::progress::OperationComplete;
use crate::volume;

/// Whether a failed symlink call means the filesystem has no symlinks.
pub(crate) fn links_unsupported(error: &std::io::Error) -> bool {
    matches!(
        error.raw_os_error(),
        Some(nix::libc::EPERM) | Some(nix::libc::EOPNOTSUPP) | Some(nix::libc::ENOSYS)
    )
}

impl FsContext {
    /// Copy `entries` into the directory `target`.
    pub fn copy_to(
        &mut self,
        entries: &mut dyn EntryIterator,
        target: impl AsRef<Path>,
    ) -> Result<OperationComplete, FsError> {
        let target = self.target_directory(target.as_ref())?;
        let plan = Plan {
            measure: Measure::Tree,
            target_device: volume::device_of(&target).ok(),
            naming: Naming::Ask,
            filtered: true,
        };
        self.run_root(OperationKind::Copying, entries, plan, |ctx, scope, entry| {
            ctx.copy_top_level(scope, entry, &target)
        })
    }

    /// Copy every entry next to itself under a fresh name.
    pub fn duplicate(&mut self, entries: &mut dyn EntryIterator) -> Result<OperationComplete, FsError> {
        let plan = Plan {
            measure: Measure::Tree,
            target_device: None,
            naming: Naming::Unique,
            filtered: true,
        };
        self.run_root(OperationKind::Duplicating, entries, plan, |ctx, scope, entry| {
            let source = entry.path();
            if entry.is_root() {
                return Err(Flow::Ignored(FsError::invalid_target(
                    &source,
                    "the filesystem root cannot be duplicated",
                )));
            }
            let meta = ctx.attempt(scope, &source, || fs::symlink_metadata(&source))?;
            ctx.copy_entry(scope, &source, &meta, entry.parent(), entry.name())
                .map(drop)
        })
    }

    fn copy_top_level(&mut self, scope: &Scope, entry: &EntryRef, target: &Path) -> Step {
        let source = entry.path();
        let meta = self.attempt(scope, &source, || fs::symlink_metadata(&source))?;
        if !self.check_target(scope, &source, &meta, target)? {
            return Ok(());
        }
        let name = match entry.name() {
            name if name.is_empty() => OsStr::new("root"),
            name => name,
        };
        self.copy_entry(scope, &source, &meta, target, name).map(drop)
    }

    /// Check that `target` may receive `source`.
    ///
    /// Returns `false` when the policy chose to trash the source instead.
    pub(crate) fn check_target(
        &mut self,
        scope: &Scope,
        source: &Path,
        meta: &Metadata,
        target: &Path,
    ) -> Step<bool> {
        if meta.is_dir() && paths::is_within(target, &paths::resolve_parent(source)) {
            self.interact(scope, Interaction::TargetIsSubdirectory, Some(source), Some(target))?;
            return Err(Flow::Signal(ControlSignal::SkipEntry));
        }
        if self.trash.is_trash(target) {
            let resolution =
                self.interact(scope, Interaction::TargetIsTrash, Some(source), Some(target))?;
            if resolution.command == Command::MoveToTrash {
                self.trash_entry(scope, source, meta)?;
                return Ok(false);
            }
        }
        if target.parent().is_none() {
            self.interact(scope, Interaction::TargetIsRoot, Some(source), Some(target))?;
        }
        Ok(true)
    }

    /// Copy one entry of any type into `target_dir`. Returns the path of
    /// the copy.
    pub(crate) fn copy_entry(
        &mut self,
        scope: &Scope,
        source: &Path,
        meta: &Metadata,
        target_dir: &Path,
        name: &OsStr,
    ) -> Step<PathBuf> {
        let file_type = meta.file_type();
        if file_type.is_dir() {
            self.copy_directory(scope, source, meta, target_dir, name)
        } else if file_type.is_symlink() {
            if self.links_as_copies {
                self.copy_link_target(scope, source, target_dir, name)
            } else {
                self.copy_link(scope, source, meta, target_dir, name)
            }
        } else if file_type.is_file() {
            self.copy_file(scope, source, meta, target_dir, name)
        } else {
            tracing::warn!(path = %source.display(), "Skipping special file");
            Err(Flow::Signal(ControlSignal::SkipEntry))
        }
    }

    fn copy_directory(
        &mut self,
        scope: &Scope,
        source: &Path,
        meta: &Metadata,
        target_dir: &Path,
        name: &OsStr,
    ) -> Step<PathBuf> {
        let placement = self.in_operation(OperationKind::CreatingDirectory, |ctx| {
            ctx.place(scope, source, meta, target_dir, name)
        })?;
        let (dest, fresh) = match placement {
            Placement::Merge(dest) => (dest, false),
            placement => {
                let dest = placement.path().to_path_buf();
                self.in_operation(OperationKind::CreatingDirectory, |ctx| {
                    ctx.attempt(scope, &dest, || fs::create_dir(&dest))
                })?;
                self.note_created(source, &dest);
                (dest, true)
            }
        };

        let mut inner = scope.in_directory(fresh);
        if inner.copy_root.is_none() {
            inner.copy_root = Some(Arc::new(CopyRoot {
                source: paths::normalize(source),
                target: dest.clone(),
            }));
        }
        let walked = self.walk_directory(&inner, source, |ctx, scope, child| {
            let path = child.path();
            let child_meta = ctx.attempt(scope, &path, || fs::symlink_metadata(&path))?;
            ctx.copy_entry(scope, &path, &child_meta, &dest, child.name())
                .map(drop)
        });

        match walked {
            Ok(()) => {
                self.copy_metadata(scope, source, &dest, meta)?;
                self.progress.directory_done();
                Ok(dest)
            }
            Err(Flow::Signal(ControlSignal::SkipDirectory)) => {
                if fresh && self.confirm_cleanup(scope, Interaction::RemovePartialDirectory, source, &dest) {
                    self.discard(&dest);
                }
                Err(Flow::Signal(ControlSignal::SkipEntry))
            }
            Err(Flow::Signal(ControlSignal::RetryEntry)) if fresh => {
                self.discard(&dest);
                Err(Flow::Signal(ControlSignal::RetryEntry))
            }
            Err(flow) => Err(flow),
        }
    }

    fn copy_file(
        &mut self,
        scope: &Scope,
        source: &Path,
        meta: &Metadata,
        target_dir: &Path,
        name: &OsStr,
    ) -> Step<PathBuf> {
        let placement = self.place(scope, source, meta, target_dir, name)?;
        self.write_file(scope, source, meta, placement)
    }

    /// Copy the file `source` to an already settled placement.
    pub(crate) fn write_file(
        &mut self,
        scope: &Scope,
        source: &Path,
        meta: &Metadata,
        placement: Placement,
    ) -> Step<PathBuf> {
        let offset = match placement {
            Placement::Resume { original_len, .. } => original_len,
            _ => 0,
        };
        if let Some(directory) = placement.path().parent() {
            self.ensure_space(scope, source, directory, meta.len().saturating_sub(offset))?;
        }

        let copied = self.in_operation(OperationKind::CopyingFile, |ctx| {
            ctx.copy_contents(scope, source, meta, &placement)
        });
        if let Err(flow) = copied {
            self.clean_partial_file(scope, source, &placement, &flow);
            return Err(flow);
        }

        let dest = placement.path().to_path_buf();
        if !matches!(placement, Placement::Append { .. }) {
            self.copy_metadata(scope, source, &dest, meta)?;
        }
        self.progress.file_done();
        self.note_created(source, &dest);
        Ok(dest)
    }

    fn ensure_space(&mut self, scope: &Scope, source: &Path, directory: &Path, needed: u64) -> Step {
        loop {
            let Ok(available) = volume::available_space(directory) else {
                return Ok(());
            };
            if available >= needed {
                return Ok(());
            }
            tracing::debug!(available, needed, "Not enough space on target");
            let resolution =
                self.interact(scope, Interaction::NotEnoughSpace, Some(source), Some(directory))?;
            if resolution.command == Command::Continue {
                return Ok(());
            }
        }
    }

    fn copy_contents(
        &mut self,
        scope: &Scope,
        source: &Path,
        meta: &Metadata,
        placement: &Placement,
    ) -> Step {
        let mut input = self.attempt(scope, source, || File::open(source))?;
        let (mut output, base, offset) = match placement {
            Placement::Fresh(path) => {
                let output = self.attempt(scope, path, || {
                    OpenOptions::new().write(true).create_new(true).open(path)
                })?;
                (output, 0, 0)
            }
            Placement::Append { path, original_len } => {
                let output = self.attempt(scope, path, || OpenOptions::new().append(true).open(path))?;
                (output, *original_len, 0)
            }
            Placement::Resume { path, original_len } => {
                let output = self.attempt(scope, path, || OpenOptions::new().append(true).open(path))?;
                (output, *original_len, *original_len)
            }
            Placement::Merge(path) => unreachable!("a file cannot merge into {}", path.display()),
        };
        if offset > 0 {
            self.attempt(scope, source, || input.seek(SeekFrom::Start(offset)).map(drop))?;
        }

        let dest = placement.path();
        let remaining = meta.len().saturating_sub(offset);
        let cross_device = dest
            .parent()
            .and_then(|parent| volume::device_of(parent).ok())
            .is_some_and(|device| device != meta.dev());

        if self.use_pipeline(remaining, cross_device) {
            tracing::debug!(source = %source.display(), bytes = remaining, "Copying with reader and writer threads");
            self.copy_pipelined(scope, source, dest, input, output)?;
        } else {
            self.copy_stream(scope, source, dest, &mut input, &mut output, base)?;
        }
        Ok(())
    }

    fn use_pipeline(&self, remaining: u64, cross_device: bool) -> bool {
        remaining >= self.config.pipeline_threshold
            && (cross_device || !self.config.pipeline_cross_device_only)
    }

    fn copy_stream(
        &mut self,
        scope: &Scope,
        source: &Path,
        dest: &Path,
        input: &mut File,
        output: &mut File,
        base: u64,
    ) -> Step<u64> {
        let mut buffer = self.buffer.take();
        let copied = self.stream_chunks(scope, source, dest, input, output, base, &mut buffer);
        self.buffer.restore(buffer);
        copied
    }

    #[allow(clippy::too_many_arguments)]
    fn stream_chunks(
        &mut self,
        scope: &Scope,
        source: &Path,
        dest: &Path,
        input: &mut File,
        output: &mut File,
        base: u64,
        buffer: &mut Vec<u8>,
    ) -> Step<u64> {
        let interval = self.config.progress_interval();
        let mut written = 0u64;
        loop {
            if self.policy.pause_pending() {
                // Hand the memory back for the length of the pause.
                self.buffer.restore(std::mem::take(buffer));
                self.buffer.release();
                let resumed = self.checkpoint(scope);
                *buffer = self.buffer.take();
                resumed?;
            } else {
                self.checkpoint(scope)?;
            }

            let started = Instant::now();
            let read = self.attempt(scope, source, || input.read(&mut buffer[..]))?;
            if read == 0 {
                return Ok(written);
            }

            let position = base + written;
            let mut retried = false;
            self.attempt(scope, dest, || {
                if retried {
                    output.set_len(position)?;
                    output.seek(SeekFrom::Start(position))?;
                }
                retried = true;
                output.write_all(&buffer[..read])
            })?;

            written += read as u64;
            self.progress.add_bytes(read as u64);
            if read == buffer.len() {
                self.buffer
                    .suggest_size(next_chunk_size(buffer.len(), started.elapsed(), interval));
            }
        }
    }

    /// Undo what a failed file copy left behind.
    ///
    /// Cancelled and retried copies are cleaned up without asking.
    fn clean_partial_file(&mut self, scope: &Scope, source: &Path, placement: &Placement, flow: &Flow) {
        let silent = matches!(
            flow,
            Flow::Signal(ControlSignal::Cancel | ControlSignal::RetryEntry)
        );
        match placement {
            Placement::Fresh(path) => {
                if fs::symlink_metadata(path).is_err() {
                    return;
                }
                if silent || self.confirm_cleanup(scope, Interaction::RemovePartialFile, source, path) {
                    self.discard(path);
                }
            }
            Placement::Append { path, original_len } | Placement::Resume { path, original_len } => {
                if silent || self.confirm_cleanup(scope, Interaction::RestoreOriginalSize, source, path) {
                    let truncated = OpenOptions::new()
                        .write(true)
                        .open(path)
                        .and_then(|file| file.set_len(*original_len));
                    if let Err(error) = truncated {
                        tracing::warn!(path = %path.display(), %error, "Could not restore original size");
                    }
                }
            }
            Placement::Merge(_) => {}
        }
    }

    fn confirm_cleanup(&mut self, scope: &Scope, interaction: Interaction, source: &Path, target: &Path) -> bool {
        self.in_operation(OperationKind::CleaningUp, |ctx| {
            matches!(
                ctx.interact(scope, interaction, Some(source), Some(target)),
                Ok(Resolution {
                    command: Command::Remove | Command::Restore,
                    ..
                })
            )
        })
    }

    fn copy_link(
        &mut self,
        scope: &Scope,
        source: &Path,
        meta: &Metadata,
        target_dir: &Path,
        name: &OsStr,
    ) -> Step<PathBuf> {
        let link = self.attempt(scope, source, || fs::read_link(source))?;
        let dest = self.in_operation(OperationKind::CopyingLink, |ctx| {
            let placement = ctx.place(scope, source, meta, target_dir, name)?;
            ctx.link_destination(scope, placement)
        })?;
        let text = link_text(scope, source, &link, &dest);

        loop {
            match self.make_symlink(&text, &dest) {
                Ok(()) => break,
                Err(e) if links_unsupported(&e) => {
                    self.interact(scope, Interaction::LinksUnsupported, Some(source), Some(target_dir))?;
                    tracing::info!(target = %target_dir.display(), "Target has no symlinks, copying what links point to");
                    self.links_as_copies = true;
                    let name = dest.file_name().unwrap_or(name);
                    return self.copy_link_target(scope, source, target_dir, name);
                }
                Err(e) => self.handle_error(scope, FsError::io(&dest, e))?,
            }
        }

        self.copy_metadata(scope, source, &dest, meta)?;
        self.progress.link_done();
        self.note_created(source, &dest);
        Ok(dest)
    }

    fn make_symlink(&self, text: &Path, dest: &Path) -> std::io::Result<()> {
        #[cfg(test)]
        if self.refuse_links {
            return Err(std::io::Error::from_raw_os_error(nix::libc::EPERM));
        }
        std::os::unix::fs::symlink(text, dest)
    }

    /// Copy what the symlink `source` points to.
    pub(crate) fn copy_link_target(
        &mut self,
        scope: &Scope,
        source: &Path,
        target_dir: &Path,
        name: &OsStr,
    ) -> Step<PathBuf> {
        let meta = self.attempt(scope, source, || fs::metadata(source))?;
        if meta.is_dir() {
            self.copy_directory(scope, source, &meta, target_dir, name)
        } else {
            self.copy_file(scope, source, &meta, target_dir, name)
        }
    }

    /// Carry attributes, permissions and timestamps over to `dest`.
    ///
    /// Failures here are the policy's to answer; ignoring them keeps the copy.
    pub(crate) fn copy_metadata(&mut self, scope: &Scope, source: &Path, dest: &Path, meta: &Metadata) -> Step {
        let config = Arc::clone(&self.config);
        let is_link = meta.file_type().is_symlink();
        self.sub_operation(scope, OperationKind::CopyingAttributes, |ctx, scope| {
            let step = ctx.attempt(scope, dest, || attrs::copy_attributes(source, dest, &config));
            ctx.ignorable(step)?;
            if config.preserve_permissions && !is_link {
                let step = ctx.attempt(scope, dest, || fs::set_permissions(dest, meta.permissions()));
                ctx.ignorable(step)?;
            }
            if config.preserve_timestamps {
                let accessed = FileTime::from_last_access_time(meta);
                let modified = FileTime::from_last_modification_time(meta);
                let step = ctx.attempt(scope, dest, || filetime::set_symlink_file_times(dest, accessed, modified));
                ctx.ignorable(step)?;
            }
            Ok(())
        })?;
        Ok(())
    }
}

/// Text for the copy of the symlink `source`, which reads `link`.
///
/// Relative links that resolve inside the tree being copied are pointed at
/// the same entry in the copy; anything else is kept verbatim.
fn link_text(scope: &Scope, source: &Path, link: &Path, dest: &Path) -> PathBuf {
    if link.is_absolute() {
        return link.to_path_buf();
    }
    let (Some(root), Some(parent)) = (scope.copy_root.as_deref(), source.parent()) else {
        return link.to_path_buf();
    };
    let resolved = paths::normalize(&parent.join(link));
    match resolved.strip_prefix(&root.source) {
        Ok(inside) => {
            let mapped = root.target.join(inside);
            paths::relative_path(dest.parent().unwrap_or(&root.target), &mapped)
        }
        Err(_) => link.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::context;
    use crate::answer::{ErrorDecision, InteractionDecision};
    use crate::policy::{ErrorRequest, FsPolicy, InteractionRequest};
    use crate::preset::PresetPolicy;
    use fsctx_core::{EngineConfig, SingleEntryIterator};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[test]
    fn test_link_text_remaps_inside_tree() {
        let scope = Scope {
            copy_root: Some(Arc::new(CopyRoot {
                source: PathBuf::from("/src/tree"),
                target: PathBuf::from("/dst/tree"),
            })),
            ..Scope::root(OperationKind::Copying, None, Naming::Ask)
        };
        let text = link_text(
            &scope,
            Path::new("/src/tree/sub/link"),
            Path::new("./../file"),
            Path::new("/dst/tree/sub/link"),
        );
        assert_eq!(text, PathBuf::from("../file"));

        let outside = link_text(
            &scope,
            Path::new("/src/tree/link"),
            Path::new("../../elsewhere"),
            Path::new("/dst/tree/link"),
        );
        assert_eq!(outside, PathBuf::from("../../elsewhere"));

        let absolute = link_text(
            &scope,
            Path::new("/src/tree/link"),
            Path::new("/etc/hosts"),
            Path::new("/dst/tree/link"),
        );
        assert_eq!(absolute, PathBuf::from("/etc/hosts"));
    }

    #[test]
    fn test_copy_file_reports_bytes() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("data.bin");
        let target = temp.path().join("out");
        fs::write(&source, vec![7u8; 300 * 1024]).unwrap();
        fs::create_dir(&target).unwrap();

        let config = EngineConfig {
            initial_buffer_size: 16 * 1024,
            min_buffer_size: 16 * 1024,
            ..Default::default()
        };
        let mut ctx = context(PresetPolicy::new(), config);
        let mut entries = SingleEntryIterator::from_path(&source).unwrap();
        let report = ctx.copy_to(&mut entries, &target).unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.bytes_processed, 300 * 1024);
        assert_eq!(fs::read(target.join("data.bin")).unwrap(), fs::read(&source).unwrap());
        // Full reads ask for a bigger buffer.
        assert!(ctx.buffer().size() > 16 * 1024);
    }

    #[test]
    fn test_copy_into_itself_is_skipped() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path().join("tree");
        fs::create_dir_all(tree.join("inner")).unwrap();

        let mut ctx = context(PresetPolicy::new(), EngineConfig::default());
        let mut entries = SingleEntryIterator::from_path(&tree).unwrap();
        let report = ctx.copy_to(&mut entries, tree.join("inner")).unwrap();

        assert_eq!(report.skipped, 1);
        assert!(!tree.join("inner/tree").exists());
    }

    #[test]
    fn test_copy_into_own_directory_makes_unique_name() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("notes.txt");
        fs::write(&file, b"hello").unwrap();

        let mut ctx = context(PresetPolicy::new(), EngineConfig::default());
        let mut entries = SingleEntryIterator::from_path(&file).unwrap();
        ctx.copy_to(&mut entries, temp.path()).unwrap();

        assert_eq!(fs::read(temp.path().join("notes (1).txt")).unwrap(), b"hello");
    }

    /// Counts how often the target's lack of links is reported.
    struct LinklessTarget {
        preset: PresetPolicy,
        asked: Arc<AtomicUsize>,
    }

    impl FsPolicy for LinklessTarget {
        fn error_handler(&self, request: &ErrorRequest<'_>) -> ErrorDecision {
            self.preset.error_handler(request)
        }

        fn interaction(&self, request: &InteractionRequest<'_>) -> InteractionDecision {
            if request.interaction == Interaction::LinksUnsupported {
                self.asked.fetch_add(1, Ordering::SeqCst);
            }
            self.preset.interaction(request)
        }
    }

    #[test]
    fn test_refused_links_copy_their_targets_for_rest_of_call() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path().join("tree");
        fs::create_dir_all(tree.join("sub")).unwrap();
        fs::write(tree.join("file.txt"), b"content").unwrap();
        fs::write(tree.join("sub/inner.txt"), b"inner").unwrap();
        std::os::unix::fs::symlink("file.txt", tree.join("a")).unwrap();
        std::os::unix::fs::symlink("sub", tree.join("b")).unwrap();
        let out = temp.path().join("out");
        fs::create_dir(&out).unwrap();

        let asked = Arc::new(AtomicUsize::new(0));
        let policy = LinklessTarget {
            preset: PresetPolicy::new().answer(Interaction::LinksUnsupported, Command::CopyInstead),
            asked: Arc::clone(&asked),
        };
        let mut ctx = context(policy, EngineConfig::default());
        ctx.refuse_links = true;
        let mut entries = SingleEntryIterator::from_path(&tree).unwrap();
        let report = ctx.copy_to(&mut entries, &out).unwrap();

        assert_eq!(report.succeeded, 1);
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        let copy = out.join("tree");
        let a = fs::symlink_metadata(copy.join("a")).unwrap();
        assert!(a.is_file());
        assert_eq!(fs::read(copy.join("a")).unwrap(), b"content");
        assert!(fs::symlink_metadata(copy.join("b")).unwrap().is_dir());
        assert_eq!(fs::read(copy.join("b/inner.txt")).unwrap(), b"inner");
        assert_eq!(asked.load(Ordering::SeqCst), 1);
        assert!(ctx.links_as_copies);
    }

    #[test]
    fn test_links_unsupported_errors() {
        let refused = std::io::Error::from_raw_os_error(nix::libc::EPERM);
        let unsupported = std::io::Error::from_raw_os_error(nix::libc::EOPNOTSUPP);
        let missing = std::io::Error::from_raw_os_error(nix::libc::ENOENT);
        assert!(links_unsupported(&refused));
        assert!(links_unsupported(&unsupported));
        assert!(!links_unsupported(&missing));
    }
}
