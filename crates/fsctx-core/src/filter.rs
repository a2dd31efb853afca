//! Exclude predicates attached to entry iterators.

use std::fmt;
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::entry::EntryRef;
use crate::error::FsError;

type Predicate = dyn Fn(&EntryRef) -> bool + Send + Sync;

/// Decides which entries an iterator silently skips.
///
/// A filter returns `true` for entries that must be excluded. Filters are
/// shared by reference count so nested iterators can inherit them.
#[derive(Clone)]
pub struct EntryFilter {
    excludes: Arc<Predicate>,
}

impl EntryFilter {
    /// Create a filter from an exclude predicate.
    pub fn new(excludes: impl Fn(&EntryRef) -> bool + Send + Sync + 'static) -> Self {
        Self {
            excludes: Arc::new(excludes),
        }
    }

    /// Build a filter from glob patterns matched against entry names.
    ///
    /// When `include_hidden` is false, names starting with `.` are excluded
    /// as well.
    pub fn from_patterns(patterns: &[String], include_hidden: bool) -> Result<Self, FsError> {
        let globs = build_glob_set(patterns)?;
        Ok(Self::new(move |entry| {
            let name = entry.name().to_string_lossy();
            (!include_hidden && name.starts_with('.')) || globs.is_match(name.as_ref())
        }))
    }

    /// Check whether `entry` is excluded.
    pub fn excludes(&self, entry: &EntryRef) -> bool {
        (self.excludes)(entry)
    }

    /// Combine two filters; an entry excluded by either is excluded.
    pub fn or(self, other: EntryFilter) -> Self {
        Self::new(move |entry| self.excludes(entry) || other.excludes(entry))
    }
}

impl fmt::Debug for EntryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryFilter").finish_non_exhaustive()
    }
}

fn build_glob_set(patterns: &[String]) -> Result<GlobSet, FsError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| FsError::InvalidConfig {
            message: format!("bad ignore pattern '{pattern}': {e}"),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| FsError::InvalidConfig {
        message: e.to_string(),
    })
}
