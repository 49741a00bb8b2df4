//! Test discovery and filtering.
//!
//! Discovery has two halves:
//!
//! 1. **Listing**: [`list_all_tests`] walks a directory tree and yields the
//!    relative paths of files named like tests, skipping hidden entries.
//! 2. **Filtering**: [`filter_tests`] narrows the list with include and
//!    exclude substrings, then applies exactly one [`Selection`]: ad-hoc
//!    filters, a smoke sample, or a shard.
//!
//! Third-party suites are resolved separately in [`vendor`].
//!
//! # Example
//!
//! ```no_run
//! use runlane::discovery::{FilterOptions, Selection, TestMatcher, filter_tests, list_all_tests};
//! use std::path::Path;
//!
//! let all: Vec<String> = list_all_tests(Path::new("test"), TestMatcher::default())?.collect();
//! let options = FilterOptions {
//!     include: vec!["js/node".into()],
//!     exclude: vec!["fixtures".into()],
//!     selection: Selection::Shard { id: 0, count: 4 },
//! };
//! let tests = filter_tests(all, &options);
//! # Ok::<(), runlane::discovery::DiscoveryError>(())
//! ```

pub mod vendor;

use std::path::{Path, PathBuf};

use rand::Rng;
use rand::seq::index;
use regex::Regex;
use tracing::{debug, warn};

/// Default test-file convention: `name.test.ts`, `name.spec.mjs`, ...
pub const DEFAULT_TEST_PATTERN: &str = r"\.(?:test|spec)\.(?:[cm]?[jt]sx?)$";

/// Default smoke-sample fraction.
pub const DEFAULT_SMOKE_PERCENT: f64 = 0.01;

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors that abort a run before anything is spawned.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Tests root does not exist: {0}")]
    MissingTestsRoot(PathBuf),

    #[error("Vendor manifest not found: {0}")]
    MissingManifest(PathBuf),

    #[error("Invalid vendor manifest {path}: {reason}")]
    InvalidManifest { path: PathBuf, reason: String },

    #[error("Package manifest not found for {package}: {path}")]
    MissingPackageManifest { package: String, path: PathBuf },

    #[error("Test directory not found for {package}: {path}")]
    MissingTestDirectory { package: String, path: PathBuf },

    #[error("Unsupported test runner for {package}: {runner}")]
    UnsupportedRunner { package: String, runner: String },

    #[error("Unsupported package manager for {package}: {manager}")]
    UnsupportedPackageManager { package: String, manager: String },

    #[error("Skip pattern {pattern} for {package} has no reason")]
    MissingSkipReason { package: String, pattern: String },

    #[error("Invalid test pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Source control error: {0}")]
    SourceControl(#[from] crate::vcs::VcsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decides whether a file name marks a test.
#[derive(Debug, Clone)]
pub enum TestMatcher {
    /// File name matches the regex.
    Pattern(Regex),

    /// File name ends with one of the extensions (with or without dot).
    Extensions(Vec<String>),
}

impl TestMatcher {
    pub fn pattern(pattern: &str) -> DiscoveryResult<Self> {
        Ok(Self::Pattern(Regex::new(pattern)?))
    }

    pub fn extensions<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::Extensions(
            extensions
                .into_iter()
                .map(|ext| format!(".{}", ext.as_ref().trim_start_matches('.')))
                .collect(),
        )
    }

    pub fn is_test_file(&self, file_name: &str) -> bool {
        match self {
            Self::Pattern(pattern) => pattern.is_match(file_name),
            Self::Extensions(extensions) => extensions.iter().any(|ext| file_name.ends_with(ext)),
        }
    }
}

impl Default for TestMatcher {
    fn default() -> Self {
        Self::Pattern(Regex::new(DEFAULT_TEST_PATTERN).expect("valid default pattern"))
    }
}

/// Dot-prefixed entries and dependency folders are never walked.
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.') || name == "node_modules"
}

/// Lazy depth-first walk over a test tree.
///
/// Uses an explicit directory stack. Siblings are ordered with a trailing
/// `/` on directory names, so the whole sequence comes out sorted by its
/// slash-joined path. Symlinked directories are not followed. The walk
/// cannot be resumed once dropped; call [`list_all_tests`] again.
#[derive(Debug)]
pub struct TestWalker {
    root: PathBuf,
    matcher: TestMatcher,

    /// Pending entries relative to `root`, next one on top.
    stack: Vec<WalkEntry>,
}

#[derive(Debug)]
struct WalkEntry {
    relative: PathBuf,
    is_dir: bool,
}

impl TestWalker {
    fn push_dir(&mut self, relative: &Path) {
        let dir = self.root.join(relative);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Skipping unreadable directory {}: {}", dir.display(), e);
                return;
            }
        };

        let mut children: Vec<(String, bool)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                if is_hidden(&name) {
                    return None;
                }
                let file_type = entry.file_type().ok()?;
                if file_type.is_symlink() {
                    // Linked files count, linked directories are never entered.
                    let target = std::fs::metadata(entry.path()).ok()?;
                    if target.is_dir() {
                        debug!("Not following symlinked directory {}", entry.path().display());
                        return None;
                    }
                    return Some((name, false));
                }
                Some((name, file_type.is_dir()))
            })
            .collect();
        children.sort_by_cached_key(|(name, is_dir)| {
            if *is_dir {
                format!("{}/", name)
            } else {
                name.clone()
            }
        });

        self.stack
            .extend(children.into_iter().rev().map(|(name, is_dir)| WalkEntry {
                relative: relative.join(name),
                is_dir,
            }));
    }
}

impl Iterator for TestWalker {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        while let Some(entry) = self.stack.pop() {
            if entry.is_dir {
                self.push_dir(&entry.relative);
                continue;
            }

            let is_test = entry
                .relative
                .file_name()
                .map(|name| self.matcher.is_test_file(&name.to_string_lossy()))
                .unwrap_or(false);
            if is_test {
                return Some(to_slash(&entry.relative));
            }
        }
        None
    }
}

/// Lists test files under `root`, relative to it, in sorted order.
///
/// # Errors
///
/// Fails if `root` is not a directory.
pub fn list_all_tests(root: &Path, matcher: TestMatcher) -> DiscoveryResult<TestWalker> {
    if !root.is_dir() {
        return Err(DiscoveryError::MissingTestsRoot(root.to_path_buf()));
    }

    let mut walker = TestWalker {
        root: root.to_path_buf(),
        matcher,
        stack: Vec::new(),
    };
    walker.push_dir(Path::new(""));
    Ok(walker)
}

/// Joins path components with `/` on every platform.
pub fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// The one narrowing step applied after include/exclude.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Selection {
    #[default]
    All,

    /// Keep paths containing any of these substrings.
    Only(Vec<String>),

    /// Uniform random sample of `ceil(len * percent)` paths.
    Smoke(f64),

    /// Keep paths whose global index `i` has `i % count == id`.
    Shard { id: usize, count: usize },
}

/// Filters applied to a discovered test list.
#[derive(Debug, Clone, Default)]
pub struct FilterOptions {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub selection: Selection,
}

/// Applies include, exclude, then the selection, preserving order.
pub fn filter_tests(all: Vec<String>, options: &FilterOptions) -> Vec<String> {
    filter_tests_with_rng(all, options, &mut rand::thread_rng())
}

/// [`filter_tests`] with a caller-supplied RNG for smoke sampling.
pub fn filter_tests_with_rng<R: Rng + ?Sized>(
    all: Vec<String>,
    options: &FilterOptions,
    rng: &mut R,
) -> Vec<String> {
    let tests = apply_include_exclude(all, &options.include, &options.exclude);

    match &options.selection {
        Selection::All => tests,
        Selection::Only(filters) => tests
            .into_iter()
            .filter(|path| contains_any(path, filters))
            .collect(),
        Selection::Smoke(percent) => smoke_sample(tests, *percent, rng),
        Selection::Shard { id, count } => select_shard(tests, *id, *count),
    }
}

/// Include keeps matching paths (all if empty); exclude then removes
/// matching paths from what include kept.
pub fn apply_include_exclude(all: Vec<String>, include: &[String], exclude: &[String]) -> Vec<String> {
    all.into_iter()
        .filter(|path| include.is_empty() || contains_any(path, include))
        .filter(|path| exclude.is_empty() || !contains_any(path, exclude))
        .collect()
}

/// Keeps items whose index in `items` falls in bucket `id` of `count`.
///
/// Over `id in 0..count` the buckets cover `items` exactly once.
pub fn select_shard<T>(items: Vec<T>, id: usize, count: usize) -> Vec<T> {
    let count = count.max(1);
    items
        .into_iter()
        .enumerate()
        .filter(|(index, _)| shard_of(*index, count) == id)
        .map(|(_, item)| item)
        .collect()
}

/// Shard bucket for a global index.
pub fn shard_of(index: usize, count: usize) -> usize {
    index % count.max(1)
}

fn smoke_sample<R: Rng + ?Sized>(tests: Vec<String>, percent: f64, rng: &mut R) -> Vec<String> {
    let amount = ((tests.len() as f64) * percent).ceil() as usize;
    let amount = amount.min(tests.len());

    let mut picked: Vec<usize> = index::sample(rng, tests.len(), amount).into_vec();
    picked.sort_unstable();

    let mut picked = picked.into_iter().peekable();
    tests
        .into_iter()
        .enumerate()
        .filter_map(|(i, path)| {
            if picked.peek() == Some(&i) {
                picked.next();
                Some(path)
            } else {
                None
            }
        })
        .collect()
}

fn contains_any(path: &str, needles: &[String]) -> bool {
    needles.iter().any(|needle| path.contains(needle.as_str()))
}
