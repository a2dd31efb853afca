//! Entry cursors.
//!
//! An [`EntryIterator`] yields a lazy, finite sequence of [`EntryRef`]s. The
//! engine walks one cursor per directory level; cursors spawned for nested
//! directories inherit the parent's exclude filter through
//! [`EntryIterator::register_nested`].

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::entry::{DirId, EntryRef};
use crate::filter::EntryFilter;

/// A restartable cursor over filesystem entries.
pub trait EntryIterator: Send {
    /// Produce the next entry, or `None` once the sequence is exhausted.
    fn next_entry(&mut self) -> Option<EntryRef>;

    /// Restart the sequence from the beginning.
    fn rewind(&mut self);

    /// Number of entries the sequence yields.
    ///
    /// Must not be called while iterating; it rewinds the cursor.
    fn count_entries(&mut self) -> usize;

    /// A fresh cursor over the same sequence, positioned at the start.
    fn box_clone(&self) -> Box<dyn EntryIterator>;

    /// The attached exclude filter.
    fn filter(&self) -> Option<&EntryFilter>;

    /// Attach (or detach) an exclude filter.
    fn set_filter(&mut self, filter: Option<EntryFilter>);

    /// Hand this cursor's filter down to a cursor spawned for a nested
    /// directory.
    fn register_nested(&self, nested: &mut dyn EntryIterator) {
        nested.set_filter(self.filter().cloned());
    }
}

fn excluded(filter: &Option<EntryFilter>, entry: &EntryRef) -> bool {
    filter.as_ref().is_some_and(|f| f.excludes(entry))
}

/// Yields exactly one entry.
#[derive(Debug, Clone)]
pub struct SingleEntryIterator {
    entry: EntryRef,
    done: bool,
    filter: Option<EntryFilter>,
}

impl SingleEntryIterator {
    /// Create a cursor over a single entry.
    pub fn new(entry: EntryRef) -> Self {
        Self {
            entry,
            done: false,
            filter: None,
        }
    }

    /// Create a cursor over the entry at `path`.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        EntryRef::from_path(path).map(Self::new)
    }
}

impl EntryIterator for SingleEntryIterator {
    fn next_entry(&mut self) -> Option<EntryRef> {
        if self.done {
            return None;
        }
        self.done = true;
        (!excluded(&self.filter, &self.entry)).then(|| self.entry.clone())
    }

    fn rewind(&mut self) {
        self.done = false;
    }

    fn count_entries(&mut self) -> usize {
        self.rewind();
        usize::from(!excluded(&self.filter, &self.entry))
    }

    fn box_clone(&self) -> Box<dyn EntryIterator> {
        let mut clone = self.clone();
        clone.rewind();
        Box::new(clone)
    }

    fn filter(&self) -> Option<&EntryFilter> {
        self.filter.as_ref()
    }

    fn set_filter(&mut self, filter: Option<EntryFilter>) {
        self.filter = filter;
    }
}

/// Yields a fixed selection of entries in order.
#[derive(Debug, Clone, Default)]
pub struct EntryListIterator {
    entries: Vec<EntryRef>,
    position: usize,
    filter: Option<EntryFilter>,
}

impl EntryListIterator {
    /// Create a cursor over a list of entries.
    pub fn new(entries: Vec<EntryRef>) -> Self {
        Self {
            entries,
            position: 0,
            filter: None,
        }
    }

    /// Create a cursor over a selection of paths.
    pub fn from_paths<I, P>(paths: I) -> io::Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let entries = paths
            .into_iter()
            .map(EntryRef::from_path)
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self::new(entries))
    }

    /// Number of entries in the selection, ignoring the filter.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the selection is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl EntryIterator for EntryListIterator {
    fn next_entry(&mut self) -> Option<EntryRef> {
        while let Some(entry) = self.entries.get(self.position) {
            self.position += 1;
            if !excluded(&self.filter, entry) {
                return Some(entry.clone());
            }
        }
        None
    }

    fn rewind(&mut self) {
        self.position = 0;
    }

    fn count_entries(&mut self) -> usize {
        debug_assert_eq!(self.position, 0, "count_entries called while iterating");
        self.rewind();
        self.entries
            .iter()
            .filter(|entry| !excluded(&self.filter, entry))
            .count()
    }

    fn box_clone(&self) -> Box<dyn EntryIterator> {
        let mut clone = self.clone();
        clone.rewind();
        Box::new(clone)
    }

    fn filter(&self) -> Option<&EntryFilter> {
        self.filter.as_ref()
    }

    fn set_filter(&mut self, filter: Option<EntryFilter>) {
        self.filter = filter;
    }
}

/// Yields the children of a directory, lazily, in `read_dir` order.
///
/// Entries that cannot be read are skipped; problems with an entry surface
/// when the caller inspects it.
#[derive(Debug)]
pub struct DirectoryIterator {
    path: Arc<Path>,
    id: DirId,
    entries: Option<fs::ReadDir>,
    started: bool,
    filter: Option<EntryFilter>,
}

impl DirectoryIterator {
    /// Open a cursor over the children of `path`.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = std::path::absolute(path.as_ref())?;
        let path = path.as_path();
        let metadata = fs::metadata(path)?;
        if !metadata.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("{} is not a directory", path.display()),
            ));
        }
        let entries = fs::read_dir(path)?;
        Ok(Self {
            path: Arc::from(path),
            id: DirId::from_metadata(&metadata),
            entries: Some(entries),
            started: false,
            filter: None,
        })
    }

    /// Directory being listed.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identity of the directory being listed.
    pub fn id(&self) -> DirId {
        self.id
    }
}

impl EntryIterator for DirectoryIterator {
    fn next_entry(&mut self) -> Option<EntryRef> {
        if self.entries.is_none() {
            match fs::read_dir(&self.path) {
                Ok(entries) => self.entries = Some(entries),
                Err(e) => {
                    tracing::debug!("cannot reopen {}: {e}", self.path.display());
                    return None;
                }
            }
        }
        self.started = true;
        let entries = self.entries.as_mut()?;
        for item in entries.by_ref() {
            let dir_entry = match item {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!("skipping unreadable entry in {}: {e}", self.path.display());
                    continue;
                }
            };
            let entry = EntryRef::new(self.id, Arc::clone(&self.path), &dir_entry.file_name());
            if !excluded(&self.filter, &entry) {
                return Some(entry);
            }
        }
        None
    }

    fn rewind(&mut self) {
        if self.started {
            self.entries = None;
            self.started = false;
        }
    }

    fn count_entries(&mut self) -> usize {
        debug_assert!(!self.started, "count_entries called while iterating");
        let mut count = 0;
        while self.next_entry().is_some() {
            count += 1;
        }
        self.rewind();
        count
    }

    fn box_clone(&self) -> Box<dyn EntryIterator> {
        Box::new(Self {
            path: Arc::clone(&self.path),
            id: self.id,
            entries: None,
            started: false,
            filter: self.filter.clone(),
        })
    }

    fn filter(&self) -> Option<&EntryFilter> {
        self.filter.as_ref()
    }

    fn set_filter(&mut self, filter: Option<EntryFilter>) {
        self.filter = filter;
    }
}

/// Runs several cursors back to back as one sequence.
#[derive(Default)]
pub struct ChainIterator {
    parts: Vec<Box<dyn EntryIterator>>,
    current: usize,
    filter: Option<EntryFilter>,
}

impl ChainIterator {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a cursor to the chain. It inherits the chain's filter.
    pub fn push(&mut self, mut part: Box<dyn EntryIterator>) {
        if self.filter.is_some() {
            part.set_filter(self.filter.clone());
        }
        self.parts.push(part);
    }

    /// Number of chained cursors.
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Whether no cursors are chained.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

impl EntryIterator for ChainIterator {
    fn next_entry(&mut self) -> Option<EntryRef> {
        while let Some(part) = self.parts.get_mut(self.current) {
            if let Some(entry) = part.next_entry() {
                return Some(entry);
            }
            self.current += 1;
        }
        None
    }

    fn rewind(&mut self) {
        for part in &mut self.parts {
            part.rewind();
        }
        self.current = 0;
    }

    fn count_entries(&mut self) -> usize {
        self.parts.iter_mut().map(|part| part.count_entries()).sum()
    }

    fn box_clone(&self) -> Box<dyn EntryIterator> {
        Box::new(Self {
            parts: self.parts.iter().map(|part| part.box_clone()).collect(),
            current: 0,
            filter: self.filter.clone(),
        })
    }

    fn filter(&self) -> Option<&EntryFilter> {
        self.filter.as_ref()
    }

    fn set_filter(&mut self, filter: Option<EntryFilter>) {
        for part in &mut self.parts {
            part.set_filter(filter.clone());
        }
        self.filter = filter;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn names(iter: &mut dyn EntryIterator) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        while let Some(entry) = iter.next_entry() {
            out.insert(entry.name().to_string_lossy().into_owned());
        }
        out
    }

    #[test]
    fn test_single_iterator_yields_once() {
        let temp = TempDir::new().unwrap();
        let mut iter = SingleEntryIterator::from_path(temp.path().join("x")).unwrap();
        assert!(iter.next_entry().is_some());
        assert!(iter.next_entry().is_none());
        assert!(iter.next_entry().is_none());
        iter.rewind();
        assert!(iter.next_entry().is_some());
    }

    #[test]
    fn test_list_iterator_filter_and_count() {
        let temp = TempDir::new().unwrap();
        let mut iter = EntryListIterator::from_paths([
            temp.path().join("a.txt"),
            temp.path().join("b.log"),
            temp.path().join("c.txt"),
        ])
        .unwrap();
        iter.set_filter(Some(EntryFilter::from_patterns(&["*.log".into()], true).unwrap()));

        assert_eq!(iter.count_entries(), 2);
        let seen = names(&mut iter);
        assert_eq!(seen, BTreeSet::from(["a.txt".to_string(), "c.txt".to_string()]));
    }

    #[test]
    fn test_directory_iterator_rewind_and_clone() {
        let temp = TempDir::new().unwrap();
        for name in ["one", "two", ".hidden"] {
            fs::write(temp.path().join(name), b"").unwrap();
        }

        let mut iter = DirectoryIterator::open(temp.path()).unwrap();
        assert_eq!(iter.count_entries(), 3);
        let first = names(&mut iter);
        iter.rewind();
        let second = names(&mut iter);
        assert_eq!(first, second);

        iter.set_filter(Some(EntryFilter::from_patterns(&[], false).unwrap()));
        let mut clone = iter.box_clone();
        assert_eq!(clone.count_entries(), 2);
    }

    #[test]
    fn test_directory_iterator_rejects_file() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("f");
        fs::write(&file, b"").unwrap();
        assert!(DirectoryIterator::open(&file).is_err());
    }

    #[test]
    fn test_register_nested_inherits_filter() {
        let temp = TempDir::new().unwrap();
        let sub = temp.path().join("sub");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("keep"), b"").unwrap();
        fs::write(sub.join("drop.tmp"), b"").unwrap();

        let mut parent = DirectoryIterator::open(temp.path()).unwrap();
        parent.set_filter(Some(EntryFilter::from_patterns(&["*.tmp".into()], true).unwrap()));

        let mut nested = DirectoryIterator::open(&sub).unwrap();
        parent.register_nested(&mut nested);
        assert_eq!(names(&mut nested), BTreeSet::from(["keep".to_string()]));
    }

    #[test]
    fn test_chain_iterator() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        fs::write(a.path().join("1"), b"").unwrap();
        fs::write(b.path().join("2"), b"").unwrap();
        fs::write(b.path().join("3"), b"").unwrap();

        let mut chain = ChainIterator::new();
        chain.push(Box::new(DirectoryIterator::open(a.path()).unwrap()));
        chain.push(Box::new(DirectoryIterator::open(b.path()).unwrap()));

        assert_eq!(chain.count_entries(), 3);
        assert_eq!(names(&mut chain).len(), 3);
        assert!(chain.next_entry().is_none());
        chain.rewind();
        assert_eq!(names(&mut chain).len(), 3);
    }
}
