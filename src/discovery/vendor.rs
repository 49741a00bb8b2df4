//! Third-party ("vendor") test suites.
//!
//! A JSON manifest lists packages whose own test suites run alongside the
//! local ones:
//!
//! ```json
//! [
//!   {
//!     "package": "elysia",
//!     "repository": "https://github.com/elysiajs/elysia",
//!     "tag": "1.1.24",
//!     "testPath": "test",
//!     "skipTests": { "test/ws/*.test.ts": "flaky websocket server" }
//!   }
//! ]
//! ```
//!
//! The manifest itself is sharded like local tests. Each selected package is
//! cloned (once), fetched at its tag, checked for a package manifest and a
//! test directory, and its test files are enumerated, skip-listed and
//! filtered with the global include/exclude lists.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use tracing::info;

use super::{
    DiscoveryError, DiscoveryResult, TestMatcher, apply_include_exclude, list_all_tests,
    select_shard, to_slash,
};
use crate::config::{PackageManagerConfig, VendorConfig};
use crate::vcs::SourceControl;

const DEFAULT_TEST_PATH: &str = "test";
const DEFAULT_RUNNER: &str = "bun";
const DEFAULT_PACKAGE_MANAGER: &str = "bun";

/// One package entry of the vendor manifest.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorDescriptor {
    pub package: String,
    pub repository: String,
    pub tag: String,
    pub test_path: Option<String>,
    pub test_extensions: Option<Vec<String>>,
    pub test_runner: Option<String>,
    pub package_manager: Option<String>,
    pub skip_tests: Option<SkipTests>,
}

/// Either skip the whole package, or skip paths by wildcard with a reason.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SkipTests {
    All(bool),
    Patterns(BTreeMap<String, String>),
}

/// A resolved vendor package ready to be partitioned into lanes.
#[derive(Debug, Clone)]
pub struct VendorSuite {
    pub package: String,
    pub repository: String,
    pub tag: String,

    /// Local checkout; tests are spawned from here.
    pub cwd: PathBuf,
    pub package_manager: String,
    pub test_runner: String,

    /// Test paths relative to `cwd`, sorted.
    pub test_paths: Vec<String>,

    /// Prefix used to name this suite's tests in results and filters.
    pub display_root: String,
}

impl VendorSuite {
    /// The name a test of this suite carries in results.
    pub fn display_path(&self, test_path: &str) -> String {
        format!("{}/{}", self.display_root, test_path)
    }
}

/// Inputs for [`resolve_vendor_suites`].
#[derive(Debug, Clone)]
pub struct VendorOptions<'a> {
    pub config: &'a VendorConfig,
    pub include: &'a [String],
    pub exclude: &'a [String],

    /// `(id, count)` when the run is sharded.
    pub shard: Option<(usize, usize)>,

    /// Default test-file convention.
    pub matcher: TestMatcher,
}

/// A compiled `skipTests` entry.
#[derive(Debug, Clone)]
pub struct SkipRule {
    pub pattern: String,
    pub reason: String,
    regex: Regex,
}

impl SkipRule {
    /// Translates a `*` wildcard pattern into an exact-match regex.
    pub fn new(pattern: &str, reason: &str) -> DiscoveryResult<Self> {
        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        Ok(Self {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
            regex: Regex::new(&format!("^{}$", body))?,
        })
    }

    pub fn matches(&self, test_path: &str) -> bool {
        self.regex.is_match(test_path)
    }
}

/// Reads and parses the vendor manifest.
pub fn load_manifest(path: &Path) -> DiscoveryResult<Vec<VendorDescriptor>> {
    if !path.is_file() {
        return Err(DiscoveryError::MissingManifest(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| DiscoveryError::InvalidManifest {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Resolves every vendor package selected for this shard.
///
/// # Errors
///
/// Any missing manifest, checkout problem, missing package manifest or test
/// directory, unknown runner or package manager, or skip pattern without a
/// reason aborts discovery.
pub async fn resolve_vendor_suites<S: SourceControl + ?Sized>(
    cwd: &Path,
    options: &VendorOptions<'_>,
    vcs: &S,
) -> DiscoveryResult<Vec<VendorSuite>> {
    let descriptors = load_manifest(&cwd.join(&options.config.manifest))?;
    let descriptors = match options.shard {
        Some((id, count)) => select_shard(descriptors, id, count),
        None => descriptors,
    };

    let mut suites = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors {
        if let Some(suite) = resolve_one(cwd, options, vcs, descriptor).await? {
            suites.push(suite);
        }
    }
    Ok(suites)
}

async fn resolve_one<S: SourceControl + ?Sized>(
    cwd: &Path,
    options: &VendorOptions<'_>,
    vcs: &S,
    descriptor: VendorDescriptor,
) -> DiscoveryResult<Option<VendorSuite>> {
    let VendorDescriptor {
        package,
        repository,
        tag,
        test_path,
        test_extensions,
        test_runner,
        package_manager,
        skip_tests,
    } = descriptor;

    let rules = match skip_tests {
        Some(SkipTests::All(true)) => {
            info!("Skipping vendor package {}", package);
            return Ok(None);
        }
        Some(SkipTests::Patterns(patterns)) => skip_rules(&package, &patterns)?,
        Some(SkipTests::All(false)) | None => Vec::new(),
    };

    let test_runner = test_runner.unwrap_or_else(|| DEFAULT_RUNNER.to_string());
    if !options.config.runners.contains_key(&test_runner) {
        return Err(DiscoveryError::UnsupportedRunner {
            package,
            runner: test_runner,
        });
    }

    let package_manager = package_manager.unwrap_or_else(|| DEFAULT_PACKAGE_MANAGER.to_string());
    let Some(manager) = options.config.package_managers.get(&package_manager) else {
        return Err(DiscoveryError::UnsupportedPackageManager {
            package,
            manager: package_manager,
        });
    };

    let checkout = cwd.join(&options.config.checkout_dir).join(&package);
    if !checkout.exists() {
        if let Some(parent) = checkout.parent() {
            std::fs::create_dir_all(parent)?;
        }
        vcs.clone_shallow(&repository, &checkout).await?;
    }
    vcs.fetch_tag(&checkout, &tag).await?;

    verify_package_manifest(&package, &checkout, manager)?;

    let test_path = test_path.unwrap_or_else(|| DEFAULT_TEST_PATH.to_string());
    let test_dir = checkout.join(&test_path);
    if !test_dir.is_dir() {
        return Err(DiscoveryError::MissingTestDirectory {
            package,
            path: test_dir,
        });
    }

    let matcher = match test_extensions {
        Some(extensions) if !extensions.is_empty() => TestMatcher::extensions(extensions),
        _ => options.matcher.clone(),
    };

    let mut test_paths: Vec<String> = list_all_tests(&test_dir, matcher)?
        .map(|relative| to_slash(&Path::new(&test_path).join(relative)))
        .filter(|path| match rules.iter().find(|rule| rule.matches(path)) {
            Some(rule) => {
                info!("Skipping {}/{}: {}", package, path, rule.reason);
                false
            }
            None => true,
        })
        .collect();
    test_paths.sort();

    let display_root = to_slash(&options.config.checkout_dir.join(&package));
    let displayed: Vec<String> = test_paths
        .iter()
        .map(|path| format!("{}/{}", display_root, path))
        .collect();
    let kept = apply_include_exclude(displayed, options.include, options.exclude);
    let prefix = format!("{}/", display_root);
    let test_paths: Vec<String> = kept
        .into_iter()
        .filter_map(|path| path.strip_prefix(&prefix).map(str::to_string))
        .collect();

    info!(
        "Vendor {}@{}: {} tests ({} runner)",
        package,
        tag,
        test_paths.len(),
        test_runner
    );

    Ok(Some(VendorSuite {
        package,
        repository,
        tag,
        cwd: checkout,
        package_manager,
        test_runner,
        test_paths,
        display_root,
    }))
}

fn skip_rules(package: &str, patterns: &BTreeMap<String, String>) -> DiscoveryResult<Vec<SkipRule>> {
    patterns
        .iter()
        .map(|(pattern, reason)| {
            if reason.trim().is_empty() {
                return Err(DiscoveryError::MissingSkipReason {
                    package: package.to_string(),
                    pattern: pattern.clone(),
                });
            }
            SkipRule::new(pattern, reason)
        })
        .collect()
}

fn verify_package_manifest(
    package: &str,
    checkout: &Path,
    manager: &PackageManagerConfig,
) -> DiscoveryResult<()> {
    let manifest = checkout.join(&manager.manifest);
    if manifest.is_file() {
        Ok(())
    } else {
        Err(DiscoveryError::MissingPackageManifest {
            package: package.to_string(),
            path: manifest,
        })
    }
}
