//! Filesystem-based progress estimation.
//!
//! External tools report no progress of their own. The estimate counts
//! output artifacts that already exist, which undercounts pages that failed
//! silently and never sees steps that happen after the tool exits. It is a
//! best-effort indicator; only the orchestrator reports 100.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

/// Progress value meaning "no meaningful progress" (not started, failed,
/// cancelled).
pub const PROGRESS_SENTINEL: i32 = -1;

/// Progress value of a completed execution.
pub const PROGRESS_COMPLETE: i32 = 100;

/// Percentage of `total` files in `output_dir` whose name ends with `suffix`.
///
/// Non-recursive. Returns 0 when `total` is 0 or the directory cannot be
/// read, and never more than `cap`.
pub fn estimate(output_dir: &Path, expected_suffix: &str, total: usize, cap: u8) -> i32 {
    if total == 0 {
        return 0;
    }

    let entries = match std::fs::read_dir(output_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::trace!(dir = %output_dir.display(), error = %e, "Progress directory not readable");
            return 0;
        }
    };

    let count = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(expected_suffix))
        .count();

    percent(count, total, cap)
}

/// Percentage of `pages` for which `<dir>/<page><suffix>` exists.
///
/// Used where the output directory is shared with earlier runs, so a plain
/// directory count would include pages outside this execution.
pub fn estimate_pages(dir: &Path, pages: &[String], suffix: &str, cap: u8) -> i32 {
    if pages.is_empty() {
        return 0;
    }
    let count = pages
        .iter()
        .filter(|page| dir.join(format!("{}{}", page, suffix)).exists())
        .count();
    percent(count, pages.len(), cap)
}

/// `done / total` as a percentage clamped to `[0, cap]`.
pub fn percent(done: usize, total: usize, cap: u8) -> i32 {
    if total == 0 {
        return 0;
    }
    let raw = (done as f64 / total as f64 * 100.0) as i32;
    raw.clamp(0, i32::from(cap))
}

/// Where a stage's progress can be observed while its tool runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressSource {
    /// Count files with `suffix` in a directory only this stage writes to.
    Directory {
        dir: PathBuf,
        suffix: String,
        cap: u8,
    },
    /// Check `<dir>/<page><suffix>` for each page of the execution.
    PageArtifacts {
        dir: PathBuf,
        suffix: String,
        cap: u8,
    },
    /// Progress is derived from finished invocations, one per page.
    PerInvocation { cap: u8 },
    /// Nothing observable; progress stays at 0 until completion.
    Unobservable,
}

impl ProgressSource {
    pub fn sample(&self, pages: &[String]) -> i32 {
        match self {
            ProgressSource::Directory { dir, suffix, cap } => {
                estimate(dir, suffix, pages.len(), *cap)
            }
            ProgressSource::PageArtifacts { dir, suffix, cap } => {
                estimate_pages(dir, pages, suffix, *cap)
            }
            ProgressSource::PerInvocation { .. } | ProgressSource::Unobservable => 0,
        }
    }

    /// Highest value the estimate may report.
    pub fn cap(&self) -> i32 {
        match self {
            ProgressSource::Directory { cap, .. }
            | ProgressSource::PageArtifacts { cap, .. }
            | ProgressSource::PerInvocation { cap } => i32::from(*cap),
            ProgressSource::Unobservable => 0,
        }
    }
}

/// Progress of one execution.
///
/// Only moves forward while running; `reset` is the single way back, used
/// on termination other than success.
#[derive(Debug)]
pub struct Progress {
    value: AtomicI32,
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress {
    pub fn new() -> Self {
        Self {
            value: AtomicI32::new(PROGRESS_SENTINEL),
        }
    }

    pub fn get(&self) -> i32 {
        self.value.load(Ordering::SeqCst)
    }

    pub(crate) fn start(&self) {
        self.value.store(0, Ordering::SeqCst);
    }

    /// Raise progress to `value` if higher. Returns the resulting value.
    pub(crate) fn advance(&self, value: i32) -> i32 {
        let value = value.clamp(0, PROGRESS_COMPLETE);
        let previous = self.value.fetch_max(value, Ordering::SeqCst);
        previous.max(value)
    }

    pub(crate) fn complete(&self) {
        self.value.store(PROGRESS_COMPLETE, Ordering::SeqCst);
    }

    pub(crate) fn reset(&self) {
        self.value.store(PROGRESS_SENTINEL, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"").unwrap();
    }

    #[test]
    fn test_estimate_counts_matching_files_only() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "0001.bin.png");
        touch(temp.path(), "0001.nrm.png");
        touch(temp.path(), "0002.bin.png");
        std::fs::create_dir(temp.path().join("nested.bin.png")).unwrap();

        assert_eq!(estimate(temp.path(), ".bin.png", 4, 90), 50);
    }

    #[test]
    fn test_estimate_clamps_to_cap() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "0001.bin.png");
        touch(temp.path(), "0002.bin.png");
        assert_eq!(estimate(temp.path(), ".bin.png", 2, 90), 90);
    }

    #[test]
    fn test_estimate_zero_total() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "0001.bin.png");
        assert_eq!(estimate(temp.path(), ".bin.png", 0, 90), 0);
    }

    #[test]
    fn test_estimate_missing_dir() {
        let temp = TempDir::new().unwrap();
        assert_eq!(estimate(&temp.path().join("absent"), ".png", 3, 90), 0);
    }

    #[test]
    fn test_estimate_pages_ignores_foreign_pages() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "0001.xml");
        touch(temp.path(), "0009.xml");
        let pages = vec!["0001".to_string(), "0002".to_string()];
        assert_eq!(estimate_pages(temp.path(), &pages, ".xml", 90), 50);
    }

    #[test]
    fn test_progress_is_monotonic_until_reset() {
        let progress = Progress::new();
        assert_eq!(progress.get(), PROGRESS_SENTINEL);

        progress.start();
        assert_eq!(progress.advance(40), 40);
        assert_eq!(progress.advance(10), 40);
        assert_eq!(progress.get(), 40);

        progress.complete();
        assert_eq!(progress.get(), PROGRESS_COMPLETE);

        progress.reset();
        assert_eq!(progress.get(), PROGRESS_SENTINEL);
    }

    #[test]
    fn test_per_invocation_source_samples_zero() {
        let source = ProgressSource::PerInvocation { cap: 95 };
        assert_eq!(source.sample(&["0001".to_string()]), 0);
        assert_eq!(source.cap(), 95);
    }
}
