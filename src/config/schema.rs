//! Configuration schema definitions for runlane.
//!
//! Every section and field carries a serde default, so an empty file (or no
//! file at all) yields a usable configuration.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── RunnerConfig     - cwd, test command, timeouts, attempts, parallelism
//! ├── InstallConfig    - one-time dependency install before any test runs
//! ├── FilterConfig     - include / exclude / only / smoke
//! ├── ShardConfig      - CI-level split across invocations
//! ├── VendorConfig     - third-party suites, runners, package managers
//! └── ReportConfig     - JUnit and GitHub output
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::discovery::{DEFAULT_TEST_PATTERN, FilterOptions, Selection};

/// Root configuration structure for runlane.
///
/// # Example
///
/// ```
/// use runlane::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [runner]
///     tests_root = "test"
///     max_attempts = 2
///
///     [shard]
///     id = 1
///     count = 4
/// "#).unwrap();
///
/// assert_eq!(config.runner.max_attempts, 2);
/// assert_eq!(config.shard.count, 4);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub runner: RunnerConfig,
    pub install: InstallConfig,
    pub filters: FilterConfig,
    pub shard: ShardConfig,
    pub vendor: VendorConfig,
    pub report: ReportConfig,
}

impl Config {
    /// Checks cross-field constraints serde cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.shard.count == 0 {
            anyhow::bail!("shard.count must be at least 1");
        }
        if self.shard.id >= self.shard.count {
            anyhow::bail!(
                "shard.id ({}) must be less than shard.count ({})",
                self.shard.id,
                self.shard.count
            );
        }
        if self.runner.max_attempts == 0 {
            anyhow::bail!("runner.max_attempts must be at least 1");
        }
        if let Some(smoke) = self.filters.smoke
            && !(smoke > 0.0 && smoke <= 1.0)
        {
            anyhow::bail!("filters.smoke must be in (0, 1], got {}", smoke);
        }
        if self.runner.test_command.is_empty() {
            anyhow::bail!("runner.test_command must not be empty");
        }
        regex::Regex::new(&self.runner.test_file_pattern).map_err(|e| {
            anyhow::anyhow!(
                "runner.test_file_pattern is not a valid regex ({}): {}",
                self.runner.test_file_pattern,
                e
            )
        })?;
        Ok(())
    }

    /// Builds the filter options used for both local and vendor tests.
    ///
    /// Ad-hoc `only` filters win over smoke sampling, which wins over
    /// sharding.
    pub fn filter_options(&self) -> FilterOptions {
        let selection = if !self.filters.only.is_empty() {
            Selection::Only(self.filters.only.clone())
        } else if let Some(percent) = self.filters.smoke {
            Selection::Smoke(percent)
        } else if self.shard.count > 1 {
            Selection::Shard {
                id: self.shard.id,
                count: self.shard.count,
            }
        } else {
            Selection::All
        };

        FilterOptions {
            include: self.filters.include.clone(),
            exclude: self.filters.exclude.clone(),
            selection,
        }
    }

    /// Lane width: the configured override, else available parallelism.
    pub fn parallelism(&self) -> usize {
        self.runner
            .parallelism
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1)
    }
}

/// Core execution settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `cwd` | `.` |
/// | `tests_root` | `test` |
/// | `exec_path` | `bun` |
/// | `test_command` | `["{exec}", "test", "{test}"]` |
/// | `test_timeout_secs` | 300 |
/// | `spawn_timeout_secs` | 600 |
/// | `max_attempts` | 3 |
/// | `max_spawn_retries` | 3 |
/// | `spawn_retry_backoff_ms` | 1000 |
/// | `bail` | false |
/// | `results_dir` | `.runlane` |
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Directory tests are spawned from and paths are resolved against.
    pub cwd: PathBuf,

    /// Directory (relative to `cwd`) walked for local tests.
    pub tests_root: PathBuf,

    /// Executable substituted for `{exec}` in command templates.
    pub exec_path: String,

    /// Argv template for one test. `{exec}` and `{test}` are substituted.
    pub test_command: Vec<String>,

    /// Extra environment for every test process.
    pub env: BTreeMap<String, String>,

    /// Deadline for a single test process.
    pub test_timeout_secs: u64,

    /// Deadline for install and source-control processes.
    pub spawn_timeout_secs: u64,

    /// Test-level attempts, including the first run.
    pub max_attempts: u32,

    /// Spawn-level retries for busy or unknown spawn failures.
    pub max_spawn_retries: u32,

    /// Base backoff between spawn-level retries; multiplied by the attempt.
    pub spawn_retry_backoff_ms: u64,

    /// Overrides the lane width.
    pub parallelism: Option<usize>,

    /// Stop the whole run on the first failing test.
    pub bail: bool,

    /// Where per-lane logs are written, relative to `cwd`.
    pub results_dir: PathBuf,

    /// File-name regex that marks a file as a test.
    pub test_file_pattern: String,

    /// Run test processes through `sudo -n -E`.
    pub privileged: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            cwd: PathBuf::from("."),
            tests_root: PathBuf::from("test"),
            exec_path: "bun".to_string(),
            test_command: vec!["{exec}".into(), "test".into(), "{test}".into()],
            env: BTreeMap::new(),
            test_timeout_secs: 300,
            spawn_timeout_secs: 600,
            max_attempts: 3,
            max_spawn_retries: 3,
            spawn_retry_backoff_ms: 1000,
            parallelism: None,
            bail: false,
            results_dir: PathBuf::from(".runlane"),
            test_file_pattern: DEFAULT_TEST_PATTERN.to_string(),
            privileged: false,
        }
    }
}

impl RunnerConfig {
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout_secs)
    }

    pub fn spawn_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.spawn_retry_backoff_ms)
    }

    /// `exec_path` with a leading `~` expanded.
    pub fn exec_path(&self) -> String {
        shellexpand::tilde(&self.exec_path).into_owned()
    }
}

/// Dependency install run once per root before any test.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Argv template; `{exec}` is substituted. Empty disables the step.
    pub command: Vec<String>,

    /// Roots (relative to `cwd`) the install command runs in.
    pub roots: Vec<PathBuf>,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            roots: vec![PathBuf::from(".")],
        }
    }
}

/// Path filters applied after discovery.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Keep only paths containing one of these substrings.
    pub include: Vec<String>,

    /// Drop paths containing one of these substrings.
    pub exclude: Vec<String>,

    /// Ad-hoc filters; when set, sharding and smoke sampling are skipped.
    pub only: Vec<String>,

    /// Random sample fraction in (0, 1].
    pub smoke: Option<f64>,
}

/// CI-level sharding across separate invocations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShardConfig {
    pub id: usize,
    pub count: usize,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self { id: 0, count: 1 }
    }
}

/// Third-party suites fetched and run alongside the local ones.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VendorConfig {
    pub enabled: bool,

    /// JSON manifest, relative to `cwd`.
    pub manifest: PathBuf,

    /// Where checkouts live, relative to `cwd`.
    pub checkout_dir: PathBuf,

    /// Test-runner id to argv template.
    pub runners: BTreeMap<String, Vec<String>>,

    /// Package-manager id to install settings.
    pub package_managers: BTreeMap<String, PackageManagerConfig>,
}

impl Default for VendorConfig {
    fn default() -> Self {
        let runners = BTreeMap::from([
            (
                "bun".to_string(),
                vec!["{exec}".into(), "test".into(), "{test}".into()],
            ),
            (
                "node".to_string(),
                vec!["node".into(), "--test".into(), "{test}".into()],
            ),
        ]);
        let package_managers = BTreeMap::from([
            ("bun".to_string(), PackageManagerConfig::new(["{exec}", "install"])),
            ("npm".to_string(), PackageManagerConfig::new(["npm", "install"])),
            ("pnpm".to_string(), PackageManagerConfig::new(["pnpm", "install"])),
            ("yarn".to_string(), PackageManagerConfig::new(["yarn", "install"])),
        ]);

        Self {
            enabled: false,
            manifest: PathBuf::from("test/vendor.json"),
            checkout_dir: PathBuf::from("vendor"),
            runners,
            package_managers,
        }
    }
}

/// How a package manager installs a vendor checkout.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PackageManagerConfig {
    pub install: Vec<String>,

    /// File that must exist at the checkout root.
    #[serde(default = "default_manifest_file")]
    pub manifest: String,
}

impl PackageManagerConfig {
    fn new<const N: usize>(install: [&str; N]) -> Self {
        Self {
            install: install.iter().map(|s| s.to_string()).collect(),
            manifest: default_manifest_file(),
        }
    }
}

fn default_manifest_file() -> String {
    "package.json".to_string()
}

/// Report output settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Write a JUnit XML report at the end of the run.
    pub junit: Option<PathBuf>,

    /// Emit GitHub annotations and a step summary; defaults to detecting
    /// `GITHUB_ACTIONS`.
    pub github: Option<bool>,

    /// Keep per-lane logs after a run.
    pub keep_logs: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.runner.max_attempts, 3);
        assert_eq!(config.shard.count, 1);
        assert_eq!(config.install.roots, vec![PathBuf::from(".")]);
        assert!(config.vendor.runners.contains_key("bun"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_selection_precedence() {
        let mut config = Config::default();
        config.shard = ShardConfig { id: 1, count: 3 };
        config.filters.smoke = Some(0.5);
        config.filters.only = vec!["net".into()];
        assert!(matches!(config.filter_options().selection, Selection::Only(_)));

        config.filters.only.clear();
        assert!(matches!(
            config.filter_options().selection,
            Selection::Smoke(p) if p == 0.5
        ));

        config.filters.smoke = None;
        assert!(matches!(
            config.filter_options().selection,
            Selection::Shard { id: 1, count: 3 }
        ));
    }

    #[test]
    fn test_validate_rejects_bad_shard() {
        let mut config = Config::default();
        config.shard = ShardConfig { id: 2, count: 2 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_smoke() {
        let mut config = Config::default();
        config.filters.smoke = Some(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parallelism_override() {
        let mut config = Config::default();
        config.runner.parallelism = Some(0);
        assert_eq!(config.parallelism(), 1);
        config.runner.parallelism = Some(6);
        assert_eq!(config.parallelism(), 6);
    }
}
