//! Progress accounting for file operations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::operation::{OperationError, OperationKind};

/// Entry and byte counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub entries: u64,
    pub files: u64,
    pub directories: u64,
    pub links: u64,
    pub bytes: u64,
}

impl Counts {
    fn raise_to(&mut self, other: &Counts) {
        self.entries = self.entries.max(other.entries);
        self.files = self.files.max(other.files);
        self.directories = self.directories.max(other.directories);
        self.links = self.links.max(other.links);
        self.bytes = self.bytes.max(other.bytes);
    }
}

/// Saved `current` counters, used to undo the accounting of a retried entry.
#[derive(Debug, Clone, Copy)]
pub struct ProgressMark(Counts);

/// Totals and running counters of one call.
///
/// Totals come from the pre-pass and are adjusted when entries are skipped.
/// Once a directory is skipped the totals can no longer be trusted and are
/// marked invalid; the running counters keep going regardless.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    pub total: Counts,
    pub current: Counts,
    totals_valid: bool,
    dirty: bool,
    current_entry: Option<PathBuf>,
}

impl Default for ProgressInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressInfo {
    pub fn new() -> Self {
        Self {
            total: Counts::default(),
            current: Counts::default(),
            totals_valid: true,
            dirty: false,
            current_entry: None,
        }
    }

    /// Count a file found by the pre-pass.
    pub fn new_file(&mut self, size: u64) {
        self.total.entries += 1;
        self.total.files += 1;
        self.total.bytes += size;
        self.dirty = true;
    }

    /// Count a directory found by the pre-pass.
    pub fn new_directory(&mut self) {
        self.total.entries += 1;
        self.total.directories += 1;
        self.dirty = true;
    }

    /// Count a symbolic link found by the pre-pass.
    pub fn new_link(&mut self) {
        self.total.entries += 1;
        self.total.links += 1;
        self.dirty = true;
    }

    pub fn add_bytes(&mut self, bytes: u64) {
        self.current.bytes += bytes;
        self.settle();
    }

    pub fn file_done(&mut self) {
        self.current.entries += 1;
        self.current.files += 1;
        self.settle();
    }

    pub fn directory_done(&mut self) {
        self.current.entries += 1;
        self.current.directories += 1;
        self.settle();
    }

    pub fn link_done(&mut self) {
        self.current.entries += 1;
        self.current.links += 1;
        self.settle();
    }

    /// Remove a skipped file from the totals.
    pub fn skip_file(&mut self, size: u64) {
        self.total.entries = self.total.entries.saturating_sub(1);
        self.total.files = self.total.files.saturating_sub(1);
        self.total.bytes = self.total.bytes.saturating_sub(size);
        self.settle();
    }

    /// Remove a skipped link from the totals.
    pub fn skip_link(&mut self) {
        self.total.entries = self.total.entries.saturating_sub(1);
        self.total.links = self.total.links.saturating_sub(1);
        self.settle();
    }

    /// A skipped directory leaves the totals unknowable.
    pub fn skip_directory(&mut self) {
        self.disable_totals();
    }

    pub fn disable_totals(&mut self) {
        self.totals_valid = false;
        self.dirty = true;
    }

    pub fn totals_valid(&self) -> bool {
        self.totals_valid
    }

    pub fn current_entry(&self) -> Option<&Path> {
        self.current_entry.as_deref()
    }

    pub fn set_current_entry(&mut self, entry: Option<PathBuf>) {
        self.current_entry = entry;
        self.dirty = true;
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Return whether anything changed since the last call, and reset.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn mark(&self) -> ProgressMark {
        ProgressMark(self.current)
    }

    /// Roll the running counters back to `mark`.
    pub fn rewind_to(&mut self, mark: ProgressMark) {
        self.current = mark.0;
        self.dirty = true;
    }

    /// Completed fraction, by bytes when any are expected, else by entries.
    pub fn fraction(&self) -> Option<f64> {
        if !self.totals_valid {
            return None;
        }
        let (done, total) = if self.total.bytes > 0 {
            (self.current.bytes, self.total.bytes)
        } else {
            (self.current.entries, self.total.entries)
        };
        if total == 0 {
            return Some(1.0);
        }
        Some((done as f64 / total as f64).min(1.0))
    }

    /// Short "3 of 10" counter text.
    pub fn describe(&self) -> String {
        if self.totals_valid {
            format!("{} of {}", self.current.entries, self.total.entries)
        } else {
            format!("{} of ?", self.current.entries)
        }
    }

    // Running counters may overtake the pre-pass when the tree changes
    // underneath us; totals follow so they never report less than is done.
    fn settle(&mut self) {
        self.total.raise_to(&self.current);
        self.dirty = true;
    }
}

/// Result of a completed operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationComplete {
    /// The root operation.
    pub operation: OperationKind,
    /// Number of top-level entries processed without error.
    pub succeeded: usize,
    /// Number of top-level entries skipped.
    pub skipped: usize,
    /// Number of top-level entries that failed.
    pub failed: usize,
    /// Total bytes processed.
    pub bytes_processed: u64,
    /// Wall time spent, pauses included.
    pub elapsed: Duration,
    /// Errors that occurred, nested ones included.
    pub errors: Vec<OperationError>,
    /// The operation stopped early on a skip-operation answer.
    pub stopped: bool,
}

impl OperationComplete {
    pub(crate) fn new(operation: OperationKind) -> Self {
        Self {
            operation,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            bytes_processed: 0,
            elapsed: Duration::ZERO,
            errors: Vec::new(),
            stopped: false,
        }
    }

    /// Check if the operation was fully successful.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// The first error recorded, if any.
    pub fn status(&self) -> Option<&OperationError> {
        self.errors.first()
    }

    /// Number of entries the operation finished handling.
    pub fn processed(&self) -> usize {
        self.succeeded + self.skipped + self.failed
    }

    /// Get a human-readable summary of the operation.
    pub fn summary(&self) -> String {
        let action = self.operation.past_tense();
        let mut summary = format!("{} {} items", action, self.succeeded);
        if self.skipped > 0 {
            summary.push_str(&format!(", {} skipped", self.skipped));
        }
        if self.failed > 0 {
            summary.push_str(&format!(", {} failed", self.failed));
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skips_adjust_totals() {
        let mut progress = ProgressInfo::new();
        progress.new_file(100);
        progress.new_file(50);
        progress.new_link();

        progress.add_bytes(100);
        progress.file_done();
        progress.skip_file(50);
        progress.skip_link();

        assert!(progress.totals_valid());
        assert_eq!(progress.total.entries, 1);
        assert_eq!(progress.total.bytes, 100);
        assert_eq!(progress.fraction(), Some(1.0));
        assert_eq!(progress.describe(), "1 of 1");
    }

    #[test]
    fn test_skipped_directory_invalidates_totals() {
        let mut progress = ProgressInfo::new();
        progress.new_directory();
        progress.new_file(10);
        progress.skip_directory();

        assert!(!progress.totals_valid());
        assert_eq!(progress.fraction(), None);
        assert_eq!(progress.describe(), "0 of ?");
    }

    #[test]
    fn test_rewind_undoes_retried_entry() {
        let mut progress = ProgressInfo::new();
        progress.new_file(10);
        let mark = progress.mark();
        progress.add_bytes(6);
        progress.rewind_to(mark);
        progress.add_bytes(10);
        progress.file_done();

        assert_eq!(progress.current.bytes, 10);
        assert_eq!(progress.current.entries, 1);
    }

    #[test]
    fn test_totals_follow_current() {
        let mut progress = ProgressInfo::new();
        progress.new_file(1);
        progress.add_bytes(5);
        progress.file_done();
        progress.file_done();
        assert_eq!(progress.total.bytes, 5);
        assert_eq!(progress.total.entries, 2);
    }

    #[test]
    fn test_dirty_flag() {
        let mut progress = ProgressInfo::new();
        assert!(!progress.take_dirty());
        progress.file_done();
        assert!(progress.take_dirty());
        assert!(!progress.take_dirty());
    }

    #[test]
    fn test_summary() {
        let mut complete = OperationComplete::new(OperationKind::Copying);
        complete.succeeded = 3;
        complete.skipped = 1;
        assert_eq!(complete.summary(), "Copied 3 items, 1 skipped");
        assert!(complete.is_success());
        assert_eq!(complete.processed(), 4);
    }
}
