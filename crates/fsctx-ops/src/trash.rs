//! Trash directories and the operations that use them.
//!
//! Every volume has at most one trash. A trash is a directory holding
//! `files/`, where trashed entries live, and `info/`, which keeps JSON
//! records for entries whose filesystem refuses extended attributes.
//! Trashes are either configured explicitly or found as `.Trash-<uid>` at
//! the root of the entry's volume.

use std::ffi::{OsStr, OsString};
use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use fsctx_core::{
    ChainIterator, DirectoryIterator, EngineConfig, EntryIterator, EntryListIterator, EntryRef,
    FsError,
};
use sysinfo::Disks;

use crate::answer::{Command, ControlSignal, Interaction};
use crate::attrs::TrashRecord;
use crate::conflict::unique_path;
use crate::context::{Flow, FsContext, Measure, Naming, Plan, Scope, Step};
use crate::operation::OperationKind;
use crate::paths;
use crate::progress::OperationComplete;
use crate::volume;

const FILES_DIR: &str = "files";
const INFO_DIR: &str = "info";

/// One trash directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrashBin {
    root: PathBuf,
    device: u64,
}

/// An entry sitting in a trash.
#[derive(Debug, Clone)]
pub struct TrashedEntry {
    pub path: PathBuf,
    pub original_path: Option<PathBuf>,
    pub trashed_at: DateTime<Utc>,
    pub size: u64,
}

impl TrashBin {
    /// Open the trash at `root`, creating it when missing.
    pub fn open(root: &Path) -> io::Result<Self> {
        fs::create_dir_all(root.join(FILES_DIR))?;
        fs::create_dir_all(root.join(INFO_DIR))?;
        let root = root.canonicalize()?;
        Ok(Self {
            device: volume::device_of(&root)?,
            root,
        })
    }

    /// The trash at `root` if it exists already.
    fn existing(root: &Path) -> Option<Self> {
        if !root.join(FILES_DIR).is_dir() {
            return None;
        }
        let root = root.canonicalize().ok()?;
        Some(Self {
            device: volume::device_of(&root).ok()?,
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn device(&self) -> u64 {
        self.device
    }

    pub fn files_dir(&self) -> PathBuf {
        self.root.join(FILES_DIR)
    }

    /// Whether `path` was trashed here, or lies inside something that was.
    pub fn holds(&self, path: &Path) -> bool {
        let files = self.files_dir();
        path != files && paths::is_within(path, &files)
    }

    /// Record file for the trashed entry called `name`.
    pub fn sidecar(&self, name: &OsStr) -> PathBuf {
        let mut file = OsString::from(name);
        file.push(".json");
        self.root.join(INFO_DIR).join(file)
    }

    /// Where the original location of `path` is recorded, and what it is.
    ///
    /// Entries inside a trashed directory carry no record of their own;
    /// their location follows from the nearest trashed ancestor.
    pub fn original_location(&self, path: &Path) -> Option<PathBuf> {
        let files = self.files_dir();
        let mut current = path.to_path_buf();
        let mut below = Vec::new();
        while current != files && current.starts_with(&files) {
            let record = TrashRecord::load_attributes(&current).or_else(|| {
                if current.parent() == Some(files.as_path()) {
                    TrashRecord::load_sidecar(&self.sidecar(current.file_name()?))
                } else {
                    None
                }
            });
            if let Some(record) = record {
                let mut original = record.original_path;
                for name in below.iter().rev() {
                    original.push(name);
                }
                return Some(original);
            }
            below.push(current.file_name()?.to_os_string());
            current = current.parent()?.to_path_buf();
        }
        None
    }

    /// Everything in this trash, oldest first.
    pub fn entries(&self) -> io::Result<Vec<TrashedEntry>> {
        let mut entries = Vec::new();
        for item in fs::read_dir(self.files_dir())? {
            let path = item?.path();
            let meta = fs::symlink_metadata(&path)?;
            let record = TrashRecord::load_attributes(&path).or_else(|| {
                TrashRecord::load_sidecar(&self.sidecar(path.file_name()?))
            });
            let trashed_at = match &record {
                Some(record) => record.trashed_at,
                None => meta.modified().map(DateTime::<Utc>::from).unwrap_or_default(),
            };
            entries.push(TrashedEntry {
                size: tree_size(&path, &meta),
                original_path: record.map(|record| record.original_path),
                trashed_at,
                path,
            });
        }
        entries.sort_by_key(|entry| entry.trashed_at);
        Ok(entries)
    }
}

fn tree_size(path: &Path, meta: &Metadata) -> u64 {
    if !meta.is_dir() {
        return meta.len();
    }
    fs::read_dir(path)
        .map(|children| {
            children
                .filter_map(Result::ok)
                .filter_map(|child| {
                    let meta = fs::symlink_metadata(child.path()).ok()?;
                    Some(tree_size(&child.path(), &meta))
                })
                .sum()
        })
        .unwrap_or(0)
}

/// Finds the trash for an entry.
#[derive(Debug)]
pub struct TrashLocator {
    configured: Vec<PathBuf>,
    discover: bool,
    uid: u32,
    known: Vec<TrashBin>,
}

impl TrashLocator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            configured: config.trash_dirs.clone(),
            discover: config.discover_volume_trash,
            uid: nix::unistd::getuid().as_raw(),
            known: Vec::new(),
        }
    }

    fn volume_trash_root(&self, volume: &Path) -> PathBuf {
        volume.join(format!(".Trash-{}", self.uid))
    }

    fn remember(&mut self, bin: &TrashBin) {
        if !self.known.contains(bin) {
            self.known.push(bin.clone());
        }
    }

    /// The trash for `path`, which lives on `device`, created if needed.
    pub fn bin_for(&mut self, path: &Path, device: u64) -> io::Result<TrashBin> {
        if let Some(bin) = self.known.iter().find(|bin| bin.device == device) {
            return Ok(bin.clone());
        }
        for root in self.configured.clone() {
            let Some(bin) = TrashBin::existing(&root).or_else(|| TrashBin::open(&root).ok()) else {
                continue;
            };
            if bin.device == device {
                self.remember(&bin);
                return Ok(bin);
            }
        }
        if !self.discover {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no trash is configured for this volume",
            ));
        }

        let start = path.parent().unwrap_or(path);
        let volume = volume::volume_root(start)?;
        let root = self.volume_trash_root(&volume);
        if !root.exists() && !volume::is_writable(&volume) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("cannot create a trash in {}", volume.display()),
            ));
        }
        let bin = TrashBin::open(&root)?;
        if bin.device != device {
            return Err(io::Error::other(format!(
                "{} is on another device",
                root.display()
            )));
        }
        tracing::debug!(trash = %bin.root.display(), "Using volume trash");
        self.remember(&bin);
        Ok(bin)
    }

    /// Trashes that already exist and could concern `path`.
    fn candidates(&mut self, path: &Path) -> Vec<TrashBin> {
        let mut bins = self.known.clone();
        for root in &self.configured {
            if let Some(bin) = TrashBin::existing(root) {
                bins.push(bin);
            }
        }
        if self.discover {
            let start = if path.is_dir() { path } else { path.parent().unwrap_or(path) };
            if let Ok(volume) = volume::volume_root(start) {
                if let Some(bin) = TrashBin::existing(&self.volume_trash_root(&volume)) {
                    bins.push(bin);
                }
            }
        }
        bins
    }

    /// The trash `path` was trashed into.
    pub fn bin_holding(&mut self, path: &Path) -> Option<TrashBin> {
        let bin = self
            .candidates(path)
            .into_iter()
            .find(|bin| bin.holds(path))?;
        self.remember(&bin);
        Some(bin)
    }

    /// Whether `path` is a trash or lies inside one.
    pub fn is_trash(&mut self, path: &Path) -> bool {
        self.candidates(path)
            .iter()
            .any(|bin| paths::is_within(path, &bin.root))
    }

    /// Whether `path` is a trash, lies inside one or contains one.
    fn touches_trash(&mut self, path: &Path) -> bool {
        self.candidates(path).iter().any(|bin| {
            paths::is_within(path, &bin.root) || paths::is_within(&bin.root, path)
        })
    }

    /// Every trash that exists now.
    pub fn all_bins(&mut self) -> Vec<TrashBin> {
        let mut bins = Vec::new();
        let mut add = |bin: TrashBin| {
            if !bins.contains(&bin) {
                bins.push(bin);
            }
        };
        for bin in self.known.iter().cloned() {
            add(bin);
        }
        for root in &self.configured {
            if let Some(bin) = TrashBin::existing(root) {
                add(bin);
            }
        }
        if self.discover {
            let disks = Disks::new_with_refreshed_list();
            for disk in disks.list() {
                if disk.is_removable() {
                    continue;
                }
                if let Some(bin) = TrashBin::existing(&self.volume_trash_root(disk.mount_point())) {
                    add(bin);
                }
            }
        }
        bins
    }
}

static EMPTYING_TRASH: AtomicBool = AtomicBool::new(false);

/// Held while the trash is being emptied.
struct EmptyingGuard;

impl EmptyingGuard {
    fn acquire() -> Result<Self, FsError> {
        EMPTYING_TRASH
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self)
            .map_err(|_| FsError::AlreadyRunning {
                operation: OperationKind::EmptyingTrash.to_string(),
            })
    }
}

impl Drop for EmptyingGuard {
    fn drop(&mut self) {
        EMPTYING_TRASH.store(false, Ordering::Release);
    }
}

impl FsContext {
    /// Move `entries` to the trash of their volume.
    pub fn move_to_trash(&mut self, entries: &mut dyn EntryIterator) -> Result<OperationComplete, FsError> {
        let plan = Plan {
            measure: Measure::TopLevel,
            target_device: None,
            naming: Naming::Ask,
            filtered: false,
        };
        self.run_root(OperationKind::Trashing, entries, plan, |ctx, scope, entry| {
            let path = paths::resolve_parent(&entry.path());
            let meta = ctx.attempt(scope, &path, || fs::symlink_metadata(&path))?;
            ctx.trash_entry(scope, &path, &meta).map(drop)
        })
    }

    /// Move one entry to the trash. Returns where it went.
    ///
    /// When its volume has no usable trash the policy may have it removed
    /// instead.
    pub(crate) fn trash_entry(&mut self, scope: &Scope, path: &Path, meta: &Metadata) -> Step<PathBuf> {
        let path = paths::resolve_parent(path);
        if path.parent().is_none() || self.trash.touches_trash(&path) {
            tracing::debug!(path = %path.display(), "Refusing to trash");
            self.interact(scope, Interaction::CannotTrash, Some(&path), None)?;
            return Err(Flow::Signal(ControlSignal::SkipEntry));
        }

        let device = std::os::unix::fs::MetadataExt::dev(meta);
        let bin = match self.trash.bin_for(&path, device) {
            Ok(bin) => bin,
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "No usable trash");
                let resolution = self.interact(scope, Interaction::TrashUnavailable, Some(&path), None)?;
                if resolution.command != Command::Remove {
                    return Err(Flow::Ignored(FsError::TrashUnavailable { path }));
                }
                self.policy.about_to_delete_or_trash(&path);
                self.in_operation(OperationKind::Removing, |ctx| ctx.remove_entry(scope, &path))?;
                return Ok(path);
            }
        };

        self.policy.about_to_delete_or_trash(&path);
        if meta.is_dir() {
            self.policy.directory_trashed(&path);
        }
        let record = TrashRecord::new(path.clone());
        let in_attributes = record.store_attributes(&path).unwrap_or_else(|error| {
            tracing::debug!(path = %path.display(), %error, "Trash record not stored in attributes");
            false
        });
        let name = path.file_name().unwrap_or(OsStr::new("entry"));
        let slot = unique_slot(&bin.files_dir().join(name));

        if let Err(flow) = self.attempt(scope, &path, || fs::rename(&path, &slot)) {
            if in_attributes {
                TrashRecord::clear_attributes(&path);
            }
            return Err(flow);
        }
        if !in_attributes {
            tracing::warn!(path = %path.display(), "Keeping trash record in a sidecar file");
            if let Some(slot_name) = slot.file_name() {
                let sidecar = bin.sidecar(slot_name);
                let step = self.attempt(scope, &sidecar, || record.store_sidecar(&sidecar));
                self.ignorable(step)?;
            }
        }

        self.count_done(meta);
        self.note_relocated(&path, &slot);
        tracing::debug!(from = %path.display(), to = %slot.display(), "Trashed");
        Ok(slot)
    }

    /// Put trashed `entries` back where they came from.
    pub fn restore_from_trash(&mut self, entries: &mut dyn EntryIterator) -> Result<OperationComplete, FsError> {
        let plan = Plan {
            measure: Measure::TopLevel,
            target_device: None,
            naming: Naming::Ask,
            filtered: false,
        };
        self.run_root(OperationKind::Restoring, entries, plan, |ctx, scope, entry| {
            ctx.restore_entry(scope, &paths::resolve_parent(&entry.path()))
        })
    }

    fn restore_entry(&mut self, scope: &Scope, path: &Path) -> Step {
        let meta = self.attempt(scope, path, || fs::symlink_metadata(path))?;
        let Some(bin) = self.trash.bin_holding(path) else {
            return Err(Flow::Ignored(FsError::invalid_target(path, "not in a trash")));
        };
        let original = bin.original_location(path).ok_or_else(|| {
            Flow::Ignored(FsError::NoOriginalLocation {
                path: path.to_path_buf(),
            })
        })?;
        let (Some(parent), Some(name)) = (original.parent(), original.file_name()) else {
            return Err(Flow::Ignored(FsError::invalid_target(
                &original,
                "recorded location has no parent",
            )));
        };

        self.attempt(scope, parent, || fs::create_dir_all(parent))?;
        let device = self.attempt(scope, parent, || volume::device_of(parent))?;
        let restored = self.move_entry(scope, path, &meta, parent, name, device)?;

        TrashRecord::clear_attributes(&restored);
        if path.parent() == Some(bin.files_dir().as_path()) {
            if let Some(trashed_name) = path.file_name() {
                let _ = fs::remove_file(bin.sidecar(trashed_name));
            }
        }
        tracing::debug!(path = %restored.display(), "Restored");
        Ok(())
    }

    /// Remove everything in every trash.
    ///
    /// Only one emptying runs per process at a time.
    pub fn empty_trash(&mut self) -> Result<OperationComplete, FsError> {
        let _guard = EmptyingGuard::acquire()?;
        let mut entries = ChainIterator::new();
        for bin in self.trash.all_bins() {
            match DirectoryIterator::open(bin.files_dir()) {
                Ok(listing) => entries.push(Box::new(listing)),
                Err(error) => {
                    tracing::warn!(trash = %bin.root().display(), %error, "Cannot list trash")
                }
            }
        }
        let plan = Plan {
            measure: Measure::Tree,
            target_device: None,
            naming: Naming::Ask,
            filtered: false,
        };
        self.run_root(OperationKind::EmptyingTrash, &mut entries, plan, |ctx, scope, entry| {
            ctx.remove_trashed(scope, entry)
        })
    }

    /// Remove the oldest trashed entries on `device` until at least `bytes`
    /// are freed.
    pub fn reclaim_trash_space(&mut self, device: u64, bytes: u64) -> Result<OperationComplete, FsError> {
        let mut trashed = Vec::new();
        for bin in self.trash.all_bins().into_iter().filter(|bin| bin.device() == device) {
            trashed.extend(bin.entries().map_err(|e| FsError::io(bin.files_dir(), e))?);
        }
        trashed.sort_by_key(|entry| entry.trashed_at);

        let mut freed = 0;
        let mut chosen = Vec::new();
        for entry in trashed {
            if freed >= bytes {
                break;
            }
            freed += entry.size;
            chosen.push(EntryRef::from_path(&entry.path).map_err(|e| FsError::io(&entry.path, e))?);
        }
        tracing::info!(device, requested = bytes, freed, entries = chosen.len(), "Reclaiming trash space");

        let mut entries = EntryListIterator::new(chosen);
        let plan = Plan {
            measure: Measure::Tree,
            target_device: Some(device),
            naming: Naming::Ask,
            filtered: false,
        };
        self.run_root(OperationKind::EmptyingTrash, &mut entries, plan, |ctx, scope, entry| {
            ctx.remove_trashed(scope, entry)
        })
    }

    /// Every entry in every trash, oldest first.
    pub fn trash_contents(&mut self) -> Result<Vec<TrashedEntry>, FsError> {
        let mut trashed = Vec::new();
        for bin in self.trash.all_bins() {
            trashed.extend(bin.entries().map_err(|e| FsError::io(bin.files_dir(), e))?);
        }
        trashed.sort_by_key(|entry| entry.trashed_at);
        Ok(trashed)
    }

    fn remove_trashed(&mut self, scope: &Scope, entry: &EntryRef) -> Step {
        let path = entry.path();
        self.policy.about_to_delete_or_trash(&path);
        self.remove_entry(scope, &path)?;
        if let Some(sidecar) = sidecar_of(&path) {
            let _ = fs::remove_file(sidecar);
        }
        Ok(())
    }
}

/// A free name in a trash's `files/` for `wanted`.
fn unique_slot(wanted: &Path) -> PathBuf {
    if fs::symlink_metadata(wanted).is_err() {
        return wanted.to_path_buf();
    }
    unique_path(wanted)
}

/// Sidecar of an entry directly inside a trash's `files/`.
fn sidecar_of(path: &Path) -> Option<PathBuf> {
    let files = path.parent()?;
    if files.file_name()? != FILES_DIR {
        return None;
    }
    let mut name = OsString::from(path.file_name()?);
    name.push(".json");
    Some(files.parent()?.join(INFO_DIR).join(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_bin_layout() {
        let temp = TempDir::new().unwrap();
        let bin = TrashBin::open(&temp.path().join("trash")).unwrap();
        assert!(bin.files_dir().is_dir());
        assert!(bin.root().join(INFO_DIR).is_dir());
        assert_eq!(
            bin.sidecar(OsStr::new("a.txt")),
            bin.root().join("info/a.txt.json")
        );
        assert!(bin.holds(&bin.files_dir().join("a.txt")));
        assert!(!bin.holds(&bin.files_dir()));
        assert_eq!(
            sidecar_of(&bin.files_dir().join("a.txt")),
            Some(bin.root().join("info/a.txt.json"))
        );
    }

    #[test]
    fn test_original_location_from_ancestor() {
        let temp = TempDir::new().unwrap();
        let bin = TrashBin::open(&temp.path().join("trash")).unwrap();
        let trashed = bin.files_dir().join("project");
        fs::create_dir_all(trashed.join("src")).unwrap();
        TrashRecord::new(PathBuf::from("/work/project"))
            .store_sidecar(&bin.sidecar(OsStr::new("project")))
            .unwrap();

        assert_eq!(
            bin.original_location(&trashed.join("src")),
            Some(PathBuf::from("/work/project/src"))
        );
        assert_eq!(bin.original_location(&bin.files_dir().join("other")), None);
    }

    #[test]
    fn test_entries_oldest_first() {
        let temp = TempDir::new().unwrap();
        let bin = TrashBin::open(&temp.path().join("trash")).unwrap();
        for (name, age) in [("new", 10), ("old", 1000)] {
            fs::write(bin.files_dir().join(name), vec![0u8; 10]).unwrap();
            let record = TrashRecord {
                original_path: PathBuf::from("/x").join(name),
                trashed_at: Utc::now() - chrono::Duration::seconds(age),
            };
            record.store_sidecar(&bin.sidecar(OsStr::new(name))).unwrap();
        }
        let names: Vec<_> = bin
            .entries()
            .unwrap()
            .into_iter()
            .map(|entry| entry.path.file_name().unwrap().to_owned())
            .collect();
        assert_eq!(names, ["old", "new"]);
    }

    #[test]
    fn test_locator_uses_configured_trash() {
        let temp = TempDir::new().unwrap();
        let config = EngineConfig {
            trash_dirs: vec![temp.path().join("trash")],
            discover_volume_trash: false,
            ..Default::default()
        };
        let mut locator = TrashLocator::new(&config);
        let device = volume::device_of(temp.path()).unwrap();
        let bin = locator.bin_for(&temp.path().join("file"), device).unwrap();
        assert!(locator.is_trash(&bin.files_dir().join("x")));
        assert!(!locator.is_trash(temp.path()));
        assert!(locator.touches_trash(temp.path()));
        assert_eq!(locator.all_bins(), vec![bin]);
    }
}
