//! Lightweight references to filesystem entries.

use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// Identity of a directory: the device it lives on and its inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirId {
    /// Device ID.
    pub device: u64,
    /// Inode number of the directory.
    pub inode: u64,
}

impl DirId {
    /// Create a new directory identity.
    pub fn new(device: u64, inode: u64) -> Self {
        Self { device, inode }
    }

    /// Read the identity of the directory at `path`.
    pub fn of(path: &Path) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        Ok(Self::from_metadata(&metadata))
    }

    #[cfg(unix)]
    pub(crate) fn from_metadata(metadata: &fs::Metadata) -> Self {
        Self::new(metadata.dev(), metadata.ino())
    }

    #[cfg(not(unix))]
    pub(crate) fn from_metadata(_metadata: &fs::Metadata) -> Self {
        Self::new(0, 0)
    }
}

/// Entry name. UTF-8 names up to 24 bytes live inline; other names go
/// to the heap.
#[derive(Clone, PartialEq, Eq, Hash)]
enum EntryName {
    Text(CompactString),
    Raw(Arc<OsStr>),
}

impl EntryName {
    fn new(name: &OsStr) -> Self {
        match name.to_str() {
            Some(text) => Self::Text(CompactString::new(text)),
            None => Self::Raw(Arc::from(name)),
        }
    }

    fn as_os_str(&self) -> &OsStr {
        match self {
            Self::Text(text) => OsStr::new(text.as_str()),
            Self::Raw(raw) => raw,
        }
    }
}

/// A reference to one filesystem entry, held as parent directory plus name.
///
/// An `EntryRef` never keeps the entry open. Cloning is cheap: the parent
/// path is shared and short names are stored inline.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EntryRef {
    directory: DirId,
    parent: Arc<Path>,
    name: EntryName,
}

impl EntryRef {
    /// Build a reference to a child of an already identified directory.
    pub fn new(directory: DirId, parent: Arc<Path>, name: &OsStr) -> Self {
        Self {
            directory,
            parent,
            name: EntryName::new(name),
        }
    }

    /// Build a reference from a path.
    ///
    /// The path is made absolute (without resolving symlinks) and the parent
    /// directory is stat'ed for its identity. A path without a final
    /// component (such as `/`) refers to the directory itself and has an
    /// empty name.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = std::path::absolute(path.as_ref())?;
        match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => {
                let directory = DirId::of(parent)?;
                Ok(Self::new(directory, Arc::from(parent), name))
            }
            _ => {
                let directory = DirId::of(&path)?;
                Ok(Self::new(directory, Arc::from(path.as_path()), OsStr::new("")))
            }
        }
    }

    /// Device the entry lives on.
    pub fn device(&self) -> u64 {
        self.directory.device
    }

    /// Identity of the parent directory.
    pub fn directory(&self) -> DirId {
        self.directory
    }

    /// Path of the parent directory.
    pub fn parent(&self) -> &Path {
        &self.parent
    }

    /// Shared handle to the parent path.
    pub fn parent_arc(&self) -> Arc<Path> {
        Arc::clone(&self.parent)
    }

    /// Entry name (empty for a filesystem root).
    pub fn name(&self) -> &OsStr {
        self.name.as_os_str()
    }

    /// Whether this reference names a directory without a parent.
    pub fn is_root(&self) -> bool {
        self.name().is_empty()
    }

    /// Full path of the entry.
    pub fn path(&self) -> PathBuf {
        if self.is_root() {
            self.parent.to_path_buf()
        } else {
            self.parent.join(self.name())
        }
    }

    /// A reference to a sibling with a different name.
    pub fn with_name(&self, name: &OsStr) -> Self {
        Self {
            directory: self.directory,
            parent: Arc::clone(&self.parent),
            name: EntryName::new(name),
        }
    }
}

impl fmt::Debug for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryRef")
            .field("device", &self.directory.device)
            .field("directory", &self.directory.inode)
            .field("path", &self.path())
            .finish()
    }
}

impl fmt::Display for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path().display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_from_path_splits_parent_and_name() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("notes.txt");
        fs::write(&file, b"hi").unwrap();

        let entry = EntryRef::from_path(&file).unwrap();
        assert_eq!(entry.name(), OsStr::new("notes.txt"));
        assert_eq!(entry.path(), std::path::absolute(&file).unwrap());
        assert_eq!(entry.directory(), DirId::of(temp.path()).unwrap());
        assert!(!entry.is_root());
    }

    #[test]
    fn test_root_reference() {
        let entry = EntryRef::from_path("/").unwrap();
        assert!(entry.is_root());
        assert_eq!(entry.path(), PathBuf::from("/"));
    }

    #[test]
    fn test_with_name_shares_parent() {
        let temp = TempDir::new().unwrap();
        let entry = EntryRef::from_path(temp.path().join("a")).unwrap();
        let sibling = entry.with_name(OsStr::new("b"));
        assert_eq!(sibling.parent(), entry.parent());
        assert_eq!(sibling.name(), OsStr::new("b"));
        assert_ne!(sibling, entry);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_name_round_trips() {
        use std::os::unix::ffi::OsStrExt;

        let temp = TempDir::new().unwrap();
        let raw = OsStr::from_bytes(b"caf\xe9");
        let entry = EntryRef::new(DirId::of(temp.path()).unwrap(), Arc::from(temp.path()), raw);
        assert_eq!(entry.name(), raw);
    }
}
