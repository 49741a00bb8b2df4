//! Test execution engine and orchestration.
//!
//! The orchestrator ties discovery, the spawner and the reporters together
//! and owns the lifecycle of one run.
//!
//! # Architecture
//!
//! ```text
//!   discovery                partition              lanes (tokio_scoped)
//!       │                        │                         │
//!       │ local + vendor tests   │                         │
//!       ▼                        │                         │
//!   Vec<String> ────────────────►│ ceil(total / width)     │
//!                                ▼                         │
//!                       Vec<Partition<LaneTest>> ─────────►│ lane 0 .. lane N
//!                                                          │   for each test:
//!                                                          │     run_one_test
//!                                                          │       └─ Spawner::spawn_safe (x max_attempts)
//!                                                          │     LaneLog::append ──► lane-<i>.jsonl
//!                                                          │     Reporter::report
//!                                                          ▼
//!                                              all lanes joined
//!                                                          │
//!                                    read lane-0 .. lane-N, RunSummary::fold
//!                                                          │
//!                                                          ▼
//!                                              Reporter::report_summary
//! ```
//!
//! # Execution Flow
//!
//! 1. **Discovery**: local tests are walked and filtered; vendor suites are
//!    resolved when enabled. Discovery errors abort the run.
//! 2. **Install**: the install command runs once per configured root. A
//!    failure here aborts the run.
//! 3. **Local lanes**: the local list is partitioned into contiguous slices,
//!    one lane each, all running concurrently. A lane never cancels its
//!    siblings unless bail mode is on.
//! 4. **Vendor lanes**: each vendor suite is installed with its package
//!    manager (skipped on failure) and then run the same way.
//! 5. **Aggregation**: once every lane has joined, each lane log is read
//!    and folded into a [`RunSummary`].
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | All tests passed |
//! | 1 | Some tests failed |
//! | 2 | Bailed on the first failure |
//! | 130 | Cancelled by a signal |

pub mod lane_log;
pub mod partition;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::discovery::vendor::{VendorOptions, VendorSuite, resolve_vendor_suites};
use crate::discovery::{DiscoveryResult, TestMatcher, filter_tests, list_all_tests, to_slash};
use crate::report::{ExitHint, ReportStyle, Reporter};
use crate::result::{RunSummary, TestResult};
use crate::spawn::{Launcher, ProcessLauncher, SpawnRequest, Spawner};
use crate::vcs::SourceControl;

pub use lane_log::{LaneLog, read_all, read_lane_log};
pub use partition::{Partition, partition, partition_from};

pub const EXIT_FAILED: i32 = 1;
pub const EXIT_BAIL: i32 = 2;
pub const EXIT_CANCELLED: i32 = 130;

/// Environment variable carrying the lane index into each test process.
pub const LANE_ENV: &str = "RUNLANE_LANE";

/// How a run ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Every lane finished and the logs were aggregated.
    Completed(RunSummary),

    /// Bail mode stopped the run at this failure.
    Bailed(TestResult),
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed(summary) if summary.is_success() => 0,
            Self::Completed(_) => EXIT_FAILED,
            Self::Bailed(_) => EXIT_BAIL,
        }
    }
}

/// Everything a run will execute.
#[derive(Debug, Clone, Default)]
pub struct Discovered {
    /// Local test paths relative to the working directory.
    pub local: Vec<String>,
    pub vendor: Vec<VendorSuite>,
}

impl Discovered {
    /// Names of every test, vendor tests prefixed by their checkout.
    pub fn display_paths(&self) -> Vec<String> {
        let vendor = self
            .vendor
            .iter()
            .flat_map(|suite| suite.test_paths.iter().map(|path| suite.display_path(path)));
        self.local.iter().cloned().chain(vendor).collect()
    }

    pub fn len(&self) -> usize {
        self.local.len()
            + self
                .vendor
                .iter()
                .map(|suite| suite.test_paths.len())
                .sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One test scheduled on a lane.
#[derive(Debug, Clone)]
pub struct LaneTest {
    /// Name used in results and reports.
    pub title: String,
    pub request: SpawnRequest,
}

/// Shared between lanes of one run.
#[derive(Default)]
struct RunState {
    cancel: CancellationToken,
    bailed: Mutex<Option<TestResult>>,

    /// Set when a lane can no longer persist results.
    fatal: Mutex<Option<anyhow::Error>>,
}

impl RunState {
    fn abort(&self, err: anyhow::Error) {
        let mut fatal = self
            .fatal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if fatal.is_none() {
            *fatal = Some(err);
        }
        self.cancel.cancel();
    }

    fn take_fatal(&self) -> Option<anyhow::Error> {
        self.fatal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn bail(&self, result: &TestResult) {
        let mut bailed = self
            .bailed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if bailed.is_none() {
            *bailed = Some(result.clone());
        }
        self.cancel.cancel();
    }

    fn take_bailed(&self) -> Option<TestResult> {
        self.bailed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// The main orchestrator that coordinates a test run.
///
/// # Type Parameters
///
/// - `R`: The reporter type
/// - `V`: Source control used to fetch vendor suites
/// - `L`: The process launcher behind the spawner
pub struct Orchestrator<R, V, L = ProcessLauncher> {
    config: Config,
    reporter: R,
    vcs: V,
    spawner: Spawner<L>,
    run_id: String,
    stream: bool,
    keep_logs: bool,
}

impl<R, V> Orchestrator<R, V, ProcessLauncher>
where
    R: Reporter,
    V: SourceControl,
{
    pub fn new(config: Config, reporter: R, vcs: V) -> Self {
        Self::with_spawner(config, reporter, vcs, Spawner::new())
    }
}

impl<R, V, L> Orchestrator<R, V, L>
where
    R: Reporter,
    V: SourceControl,
    L: Launcher,
{
    pub fn with_spawner(config: Config, reporter: R, vcs: V, spawner: Spawner<L>) -> Self {
        let keep_logs = config.report.keep_logs;
        Self {
            config,
            reporter,
            vcs,
            spawner,
            run_id: uuid::Uuid::new_v4().to_string(),
            stream: false,
            keep_logs,
        }
    }

    /// Also print every test's output to the terminal.
    pub fn stream_output(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn keep_logs(mut self, keep: bool) -> Self {
        self.keep_logs = keep;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Directory holding this run's lane logs.
    pub fn results_dir(&self) -> PathBuf {
        self.config
            .runner
            .cwd
            .join(&self.config.runner.results_dir)
            .join(&self.run_id)
    }

    /// Finds and filters every test this run would execute.
    ///
    /// # Errors
    ///
    /// Missing tests root, bad vendor manifest, failed clone or fetch, and
    /// the other [`DiscoveryError`](crate::discovery::DiscoveryError)s.
    pub async fn discover(&self) -> DiscoveryResult<Discovered> {
        let local = discover_local_tests(&self.config)?;

        let vendor = if self.config.vendor.enabled {
            let shard = (self.config.shard.count > 1)
                .then_some((self.config.shard.id, self.config.shard.count));
            let options = VendorOptions {
                config: &self.config.vendor,
                include: &self.config.filters.include,
                exclude: &self.config.filters.exclude,
                shard,
                matcher: TestMatcher::pattern(&self.config.runner.test_file_pattern)?,
            };
            resolve_vendor_suites(&self.config.runner.cwd, &options, &self.vcs).await?
        } else {
            Vec::new()
        };

        Ok(Discovered { local, vendor })
    }

    /// Runs the whole suite.
    ///
    /// # Errors
    ///
    /// Only discovery errors, a failed primary install, and an unusable
    /// results directory abort the run. Test failures are part of the
    /// returned [`RunOutcome`].
    pub async fn run(&self) -> Result<RunOutcome> {
        let discovered = self.discover().await?;
        let names = discovered.display_paths();
        info!(
            "Discovered {} local and {} vendor tests",
            discovered.local.len(),
            names.len() - discovered.local.len()
        );

        if discovered.is_empty() {
            warn!("No tests to run");
            let summary = RunSummary::default();
            self.reporter
                .report_summary(&summary, ExitHint::Success)
                .await;
            return Ok(RunOutcome::Completed(summary));
        }

        let results_dir = self.results_dir();
        std::fs::create_dir_all(&results_dir).with_context(|| {
            format!("Failed to create results directory {}", results_dir.display())
        })?;
        debug!("Lane logs in {}", results_dir.display());

        self.reporter.on_discovery_complete(&names).await;

        self.install_primary().await?;

        let state = RunState::default();
        let width = self.config.parallelism();
        let mut lanes = 0;

        let local = self.local_lane_tests(&discovered.local);
        let partitions = partition_from(local, width, lanes);
        lanes += partitions.len();
        info!(
            "Running {} local tests on {} lanes",
            discovered.local.len(),
            partitions.len()
        );
        self.run_lanes(&results_dir, partitions, &state)?;

        for suite in &discovered.vendor {
            if state.cancel.is_cancelled() {
                break;
            }
            if suite.test_paths.is_empty() {
                continue;
            }
            if let Err(reason) = self.install_vendor(suite).await {
                warn!("Skipping vendor {}: install failed: {}", suite.package, reason);
                continue;
            }

            let tests = self.vendor_lane_tests(suite);
            let partitions = partition_from(tests, width, lanes);
            lanes += partitions.len();
            info!(
                "Running {} tests of vendor {} on {} lanes",
                suite.test_paths.len(),
                suite.package,
                partitions.len()
            );
            self.run_lanes(&results_dir, partitions, &state)?;
        }

        if let Some(err) = state.take_fatal() {
            return Err(err);
        }

        if let Some(failure) = state.take_bailed() {
            error!("Bailing after {} failed", failure.test_path);
            let summary = RunSummary::fold(vec![failure.clone()]);
            self.reporter.report_summary(&summary, ExitHint::Bail).await;
            return Ok(RunOutcome::Bailed(failure));
        }

        let summary = RunSummary::fold(read_all(&results_dir, lanes)?);
        info!(
            "{} passed ({} flaky), {} failed",
            summary.success,
            summary.flaky,
            summary.fail.len()
        );
        self.reporter
            .report_summary(&summary, ExitHint::for_summary(&summary))
            .await;

        if summary.is_success() && !self.keep_logs {
            if let Err(e) = std::fs::remove_dir_all(&results_dir) {
                warn!("Failed to remove {}: {}", results_dir.display(), e);
            }
        } else {
            info!("Lane logs kept in {}", results_dir.display());
        }

        Ok(RunOutcome::Completed(summary))
    }

    /// Runs one test up to `max_attempts` times, stopping at the first pass.
    ///
    /// Every failed attempt that is followed by another is kept in
    /// `executions`. The final result is appended to the lane log and
    /// reported.
    ///
    /// # Errors
    ///
    /// Fails when the result cannot be appended to the lane log, since the
    /// summary is built from those logs alone.
    pub async fn run_one_test<F, Fut>(
        &self,
        title: &str,
        log: &mut LaneLog,
        mut attempt: F,
    ) -> Result<TestResult>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = TestResult>,
    {
        let max_attempts = self.config.runner.max_attempts.max(1);
        let mut executions = Vec::new();
        let mut number = 1;

        let mut result = loop {
            log.begin_test(title, number);
            let result = attempt(number).await;
            if result.ok || number >= max_attempts {
                break result;
            }
            debug!(
                "{} failed on attempt {}/{}: {}",
                title,
                number,
                max_attempts,
                result.error.as_deref().unwrap_or("unknown")
            );
            executions.push(result.to_execution(number));
            number += 1;
        };

        result.test_path = title.to_string();
        result.lane = log.lane();
        result.attempts = number;
        result.executions = executions;

        log.append(&result)
            .with_context(|| format!("Lane {}: failed to persist {}", log.lane(), title))?;
        self.reporter.report(&result, ReportStyle::of(&result)).await;
        Ok(result)
    }

    /// Runs every partition on its own lane and waits for all of them.
    ///
    /// All lane logs are created before any test starts; failing to create
    /// one aborts the run.
    fn run_lanes(
        &self,
        results_dir: &Path,
        partitions: Vec<Partition<LaneTest>>,
        state: &RunState,
    ) -> Result<()> {
        let lanes = partitions
            .into_iter()
            .map(|partition| Ok((LaneLog::create(results_dir, partition.lane)?, partition)))
            .collect::<Result<Vec<_>>>()?;

        tokio_scoped::scope(|scope| {
            for (log, partition) in lanes {
                scope.spawn(async move {
                    self.run_lane(log, partition, state).await;
                });
            }
        });
        Ok(())
    }

    async fn run_lane(&self, mut log: LaneLog, partition: Partition<LaneTest>, state: &RunState) {
        let lane = partition.lane;
        let spawner = self.spawner.with_output_callback(log.output_sink(self.stream));

        info!("Lane {} starting {} tests", lane, partition.items.len());
        let mut finished = 0;
        for test in &partition.items {
            let request = test.request.clone().env(LANE_ENV, lane.to_string());
            let (spawner, request, title) = (&spawner, &request, &test.title);
            let run = self.run_one_test(title, &mut log, move |_attempt| async move {
                let spawn = spawner.spawn_safe(request).await;
                TestResult::from_spawn(title.clone(), &spawn, lane)
            });

            let result = select! {
                _ = state.cancel.cancelled() => break,
                result = run => result,
            };
            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    error!("{:#}", e);
                    state.abort(e);
                    break;
                }
            };
            finished += 1;

            if !result.ok && self.config.runner.bail {
                state.bail(&result);
                break;
            }
        }
        info!(
            "Lane {} finished {}/{} tests",
            lane,
            finished,
            partition.items.len()
        );
    }

    fn local_lane_tests(&self, tests: &[String]) -> Vec<LaneTest> {
        let cwd = &self.config.runner.cwd;
        tests
            .iter()
            .map(|test| LaneTest {
                title: test.clone(),
                request: self.test_request(&self.config.runner.test_command, cwd, test),
            })
            .collect()
    }

    fn vendor_lane_tests(&self, suite: &VendorSuite) -> Vec<LaneTest> {
        let template = self
            .config
            .vendor
            .runners
            .get(&suite.test_runner)
            .unwrap_or(&self.config.runner.test_command);
        suite
            .test_paths
            .iter()
            .map(|test| LaneTest {
                title: suite.display_path(test),
                request: self.test_request(template, &suite.cwd, test),
            })
            .collect()
    }

    /// Builds the request for one test from a command template.
    pub fn test_request(&self, template: &[String], cwd: &Path, test: &str) -> SpawnRequest {
        let runner = &self.config.runner;
        let argv = expand_template(template, &runner.exec_path(), test);
        let mut request = SpawnRequest::from_argv(&argv)
            .unwrap_or_else(|| SpawnRequest::new(runner.exec_path()).arg(test))
            .cwd(cwd)
            .timeout(runner.test_timeout())
            .max_retries(runner.max_spawn_retries)
            .retry_backoff(runner.spawn_retry_backoff())
            .privileged(runner.privileged);
        for (key, value) in &runner.env {
            request = request.env(key, value);
        }
        request
    }

    async fn install_primary(&self) -> Result<()> {
        let template = &self.config.install.command;
        if template.is_empty() {
            return Ok(());
        }
        for root in &self.config.install.roots {
            let dir = self.config.runner.cwd.join(root);
            info!("Installing dependencies in {}", dir.display());
            self.install(template, &dir)
                .await
                .map_err(|reason| anyhow::anyhow!("Install failed in {}: {}", dir.display(), reason))?;
        }
        Ok(())
    }

    async fn install_vendor(&self, suite: &VendorSuite) -> std::result::Result<(), String> {
        let Some(manager) = self.config.vendor.package_managers.get(&suite.package_manager) else {
            return Err(format!("unknown package manager {}", suite.package_manager));
        };
        info!(
            "Installing vendor {} with {}",
            suite.package, suite.package_manager
        );
        self.install(&manager.install, &suite.cwd).await
    }

    async fn install(&self, template: &[String], dir: &Path) -> std::result::Result<(), String> {
        let runner = &self.config.runner;
        let argv = expand_template(template, &runner.exec_path(), "");
        let Some(request) = SpawnRequest::from_argv(&argv) else {
            return Ok(());
        };
        let request = request
            .cwd(dir)
            .timeout(runner.spawn_timeout())
            .max_retries(runner.max_spawn_retries)
            .retry_backoff(runner.spawn_retry_backoff());

        let result = self.spawner.spawn_safe(&request).await;
        if result.ok {
            debug!("`{}` done in {:?}", request.to_shell_string(), result.duration);
            return Ok(());
        }

        let tail: Vec<&str> = result.stderr.lines().rev().take(5).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        Err(format!(
            "`{}`: {}{}",
            request.to_shell_string(),
            result.error.as_deref().unwrap_or("failed"),
            if tail.is_empty() {
                String::new()
            } else {
                format!("\n{}", tail.join("\n"))
            }
        ))
    }
}

/// Walks and filters the local tests root.
///
/// Paths are returned relative to `runner.cwd`, so they name the file the
/// test command receives.
pub fn discover_local_tests(config: &Config) -> DiscoveryResult<Vec<String>> {
    let runner = &config.runner;
    let root = runner.cwd.join(&runner.tests_root);
    let matcher = TestMatcher::pattern(&runner.test_file_pattern)?;
    let all: Vec<String> = list_all_tests(&root, matcher)?
        .map(|relative| to_slash(&runner.tests_root.join(relative)))
        .collect();
    debug!("Found {} test files under {}", all.len(), root.display());
    Ok(filter_tests(all, &config.filter_options()))
}

/// Substitutes `{exec}` and `{test}` in an argv template.
///
/// Arguments that become empty after substitution are dropped.
pub fn expand_template(template: &[String], exec: &str, test: &str) -> Vec<String> {
    template
        .iter()
        .map(|arg| arg.replace("{exec}", exec).replace("{test}", test))
        .filter(|arg| !arg.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::spawn::{Exit, OutputCallback, OutputStream, SpawnError, SpawnErrorKind};
    use crate::vcs::{GitMetadata, VcsError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Scripted in place of an exit code: the launch fails as busy.
    const BUSY: i32 = i32::MIN;

    /// Answers each launch with the next scripted exit code for its key
    /// (the last argument, or the program when there are none).
    #[derive(Default)]
    struct ScriptedLauncher {
        exits: HashMap<String, Vec<i32>>,
        launches: Mutex<Vec<String>>,
        lane_env: Mutex<HashMap<String, String>>,
    }

    impl ScriptedLauncher {
        fn with(mut self, key: &str, codes: &[i32]) -> Self {
            self.exits.insert(key.to_string(), codes.to_vec());
            self
        }
    }

    #[async_trait]
    impl Launcher for ScriptedLauncher {
        async fn launch(&self, request: &SpawnRequest, output: Option<&OutputCallback>) -> Exit {
            let key = request
                .args
                .last()
                .cloned()
                .unwrap_or_else(|| request.program.clone());
            let attempt = {
                let mut launches = self.launches.lock().unwrap();
                let attempt = launches.iter().filter(|k| **k == key).count();
                launches.push(key.clone());
                attempt
            };
            if let Some((_, lane)) = request.env.iter().find(|(k, _)| k == LANE_ENV) {
                self.lane_env
                    .lock()
                    .unwrap()
                    .insert(key.clone(), lane.clone());
            }
            let code = self
                .exits
                .get(&key)
                .and_then(|codes| codes.get(attempt).or(codes.last()))
                .copied()
                .unwrap_or(0);
            if code == BUSY {
                return Exit::spawn_failed(
                    SpawnError::new(SpawnErrorKind::Busy, "resource busy or locked"),
                    Duration::ZERO,
                );
            }

            let stdout = format!("ran {}\n", key);
            if let Some(callback) = output {
                callback(OutputStream::Stdout, stdout.as_bytes());
            }
            Exit {
                exit_code: Some(code),
                stdout,
                ..Default::default()
            }
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        results: Mutex<Vec<(TestResult, ReportStyle)>>,
        summaries: Mutex<Vec<ExitHint>>,
    }

    #[async_trait]
    impl Reporter for Arc<RecordingReporter> {
        async fn on_discovery_complete(&self, _tests: &[String]) {}

        async fn report(&self, result: &TestResult, style: ReportStyle) {
            self.results.lock().unwrap().push((result.clone(), style));
        }

        async fn report_summary(&self, _summary: &RunSummary, hint: ExitHint) {
            self.summaries.lock().unwrap().push(hint);
        }
    }

    /// Lays out a checkout with one test instead of cloning.
    struct FakeGit;

    #[async_trait]
    impl SourceControl for FakeGit {
        async fn clone_shallow(&self, _repository: &str, dest: &Path) -> Result<(), VcsError> {
            fs::create_dir_all(dest.join("test")).unwrap();
            fs::write(dest.join("package.json"), "{}").unwrap();
            fs::write(dest.join("test/v.test.ts"), "").unwrap();
            Ok(())
        }

        async fn fetch_tag(&self, _checkout: &Path, _tag: &str) -> Result<(), VcsError> {
            Ok(())
        }

        async fn metadata(&self, _dir: &Path) -> Option<GitMetadata> {
            None
        }
    }

    fn workspace(tests: &[&str]) -> (TempDir, Config) {
        let temp = TempDir::new().unwrap();
        for test in tests {
            let path = temp.path().join("test").join(test);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, "").unwrap();
        }

        let mut config = Config::default();
        config.runner.cwd = temp.path().to_path_buf();
        config.runner.parallelism = Some(2);
        config.runner.spawn_retry_backoff_ms = 0;
        (temp, config)
    }

    fn orchestrator(
        config: Config,
        launcher: ScriptedLauncher,
    ) -> (
        Orchestrator<Arc<RecordingReporter>, FakeGit, ScriptedLauncher>,
        Arc<RecordingReporter>,
    ) {
        let reporter = Arc::new(RecordingReporter::default());
        let orchestrator = Orchestrator::with_spawner(
            config,
            reporter.clone(),
            FakeGit,
            Spawner::with_launcher(launcher),
        );
        (orchestrator, reporter)
    }

    #[test]
    fn test_expand_template() {
        let template = vec!["{exec}".to_string(), "test".to_string(), "{test}".to_string()];
        assert_eq!(
            expand_template(&template, "bun", "test/a.test.ts"),
            vec!["bun", "test", "test/a.test.ts"]
        );
        assert_eq!(expand_template(&template, "bun", ""), vec!["bun", "test"]);
    }

    #[test]
    fn test_discover_local_is_relative_to_cwd() {
        let (_temp, config) = workspace(&["b.test.ts", "a/one.test.ts", "a/helper.ts"]);
        let tests = discover_local_tests(&config).unwrap();
        assert_eq!(tests, vec!["test/a/one.test.ts", "test/b.test.ts"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fails_twice_then_passes() {
        let (_temp, mut config) = workspace(&["a.test.ts"]);
        config.runner.max_attempts = 3;
        let launcher = ScriptedLauncher::default().with("test/a.test.ts", &[1, 1, 0]);
        let (orchestrator, reporter) = orchestrator(config, launcher);

        let outcome = orchestrator.run().await.unwrap();
        assert_eq!(outcome.exit_code(), 0);
        let RunOutcome::Completed(summary) = outcome else {
            panic!("expected a completed run");
        };
        assert_eq!(summary.success, 1);
        assert_eq!(summary.flaky, 1);

        let results = reporter.results.lock().unwrap();
        let (result, style) = &results[0];
        assert!(result.ok);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.executions.len(), 2);
        assert_eq!(result.executions[0].error.as_deref(), Some("code 1"));
        assert_eq!(*style, ReportStyle::Flaky);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_attempts_never_exceed_max() {
        let (_temp, mut config) = workspace(&["a.test.ts"]);
        config.runner.max_attempts = 2;
        let launcher = ScriptedLauncher::default().with("test/a.test.ts", &[1]);
        let (orchestrator, reporter) = orchestrator(config, launcher);

        let outcome = orchestrator.run().await.unwrap();
        assert_eq!(outcome.exit_code(), EXIT_FAILED);

        let results = reporter.results.lock().unwrap();
        assert_eq!(results[0].0.attempts, 2);
        assert_eq!(results[0].0.executions.len(), 1);
        assert_eq!(
            orchestrator.spawner.launcher().launches.lock().unwrap().len(),
            2
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_each_attempt_gets_fresh_spawn_retries() {
        let (_temp, mut config) = workspace(&["a.test.ts"]);
        config.runner.max_attempts = 2;
        config.runner.max_spawn_retries = 1;
        let launcher = ScriptedLauncher::default().with("test/a.test.ts", &[BUSY, 1, BUSY, 1]);
        let (orchestrator, reporter) = orchestrator(config, launcher);

        let outcome = orchestrator.run().await.unwrap();
        assert_eq!(outcome.exit_code(), EXIT_FAILED);
        assert_eq!(
            orchestrator.spawner.launcher().launches.lock().unwrap().len(),
            4
        );

        let results = reporter.results.lock().unwrap();
        assert_eq!(results[0].0.attempts, 2);
        assert_eq!(results[0].0.error.as_deref(), Some("code 1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unwritable_lane_log_aborts_before_running() {
        let (temp, mut config) = workspace(&["a.test.ts", "b.test.ts"]);
        config.runner.parallelism = Some(1);
        let launcher = ScriptedLauncher::default().with("test/a.test.ts", &[1]);
        let (orchestrator, reporter) = orchestrator(config, launcher);
        let dir = temp.path().join(".runlane").join(orchestrator.run_id());
        fs::create_dir_all(lane_log::output_log_path(&dir, 0)).unwrap();

        let err = orchestrator.run().await.unwrap_err();
        assert!(format!("{:#}", err).contains("lane-0.log"));
        assert!(orchestrator.spawner.launcher().launches.lock().unwrap().is_empty());
        assert!(reporter.results.lock().unwrap().is_empty());
        assert!(reporter.summaries.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_summary_counts_every_lane_once() {
        let names = ["a.test.ts", "b.test.ts", "c.test.ts", "d.test.ts", "e.test.ts"];
        let (temp, mut config) = workspace(&names);
        config.runner.max_attempts = 1;
        config.runner.parallelism = Some(3);
        let launcher = ScriptedLauncher::default()
            .with("test/b.test.ts", &[1])
            .with("test/e.test.ts", &[2]);
        let (orchestrator, reporter) = orchestrator(config, launcher);
        let orchestrator = orchestrator.keep_logs(true);

        let RunOutcome::Completed(summary) = orchestrator.run().await.unwrap() else {
            panic!("expected a completed run");
        };
        assert_eq!(summary.success, 3);
        assert_eq!(summary.total(), names.len());
        let failed: Vec<&str> = summary.fail.iter().map(|r| r.test_path.as_str()).collect();
        assert_eq!(failed, vec!["test/b.test.ts", "test/e.test.ts"]);
        assert_eq!(summary.fail[1].error.as_deref(), Some("code 2"));

        // 5 tests over width 3 -> lanes of 2, 2, 1.
        let dir = temp
            .path()
            .join(".runlane")
            .join(orchestrator.run_id());
        assert_eq!(read_lane_log(&dir, 0).unwrap().len(), 2);
        assert_eq!(read_lane_log(&dir, 2).unwrap().len(), 1);
        assert_eq!(read_lane_log(&dir, 2).unwrap()[0].lane, 2);
        let raw = fs::read_to_string(lane_log::output_log_path(&dir, 0)).unwrap();
        assert!(raw.contains("ran test/a.test.ts"));
        let lane_env = orchestrator.spawner.launcher().lane_env.lock().unwrap();
        assert_eq!(lane_env["test/e.test.ts"], "2");
        assert_eq!(lane_env["test/a.test.ts"], "0");
        drop(lane_env);

        assert_eq!(reporter.results.lock().unwrap().len(), 5);
        assert_eq!(*reporter.summaries.lock().unwrap(), vec![ExitHint::Failure]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_passing_run_removes_logs() {
        let (temp, config) = workspace(&["a.test.ts"]);
        let (orchestrator, _reporter) = orchestrator(config, ScriptedLauncher::default());

        orchestrator.run().await.unwrap();
        assert!(!temp.path().join(".runlane").join(orchestrator.run_id()).exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bail_stops_at_first_failure() {
        let (_temp, mut config) = workspace(&["a.test.ts", "b.test.ts", "c.test.ts"]);
        config.runner.bail = true;
        config.runner.max_attempts = 1;
        config.runner.parallelism = Some(1);
        let launcher = ScriptedLauncher::default().with("test/a.test.ts", &[1]);
        let (orchestrator, reporter) = orchestrator(config, launcher);

        let outcome = orchestrator.run().await.unwrap();
        assert_eq!(outcome.exit_code(), EXIT_BAIL);
        let RunOutcome::Bailed(failure) = outcome else {
            panic!("expected bail");
        };
        assert_eq!(failure.test_path, "test/a.test.ts");
        assert_eq!(
            *orchestrator.spawner.launcher().launches.lock().unwrap(),
            vec!["test/a.test.ts"]
        );
        assert_eq!(*reporter.summaries.lock().unwrap(), vec![ExitHint::Bail]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_install_aborts_run() {
        let (_temp, mut config) = workspace(&["a.test.ts"]);
        config.install.command = vec!["install-deps".to_string()];
        let launcher = ScriptedLauncher::default().with("install-deps", &[1]);
        let (orchestrator, reporter) = orchestrator(config, launcher);

        let err = orchestrator.run().await.unwrap_err();
        assert!(err.to_string().contains("Install failed"));
        assert!(reporter.results.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_vendor_install_failure_skips_only_that_vendor() {
        let (temp, mut config) = workspace(&["a.test.ts"]);
        fs::write(
            temp.path().join("test/vendor.json"),
            r#"[
                {"package": "good", "repository": "r", "tag": "t"},
                {"package": "bad", "repository": "r", "tag": "t", "packageManager": "npm"}
            ]"#,
        )
        .unwrap();
        config.vendor.enabled = true;
        config
            .vendor
            .package_managers
            .get_mut("bun")
            .unwrap()
            .install = vec!["bun-install".to_string()];
        config
            .vendor
            .package_managers
            .get_mut("npm")
            .unwrap()
            .install = vec!["npm-install".to_string()];
        let launcher = ScriptedLauncher::default()
            .with("npm-install", &[1])
            .with("test/v.test.ts", &[0]);
        let (orchestrator, reporter) = orchestrator(config, launcher);

        let RunOutcome::Completed(summary) = orchestrator.run().await.unwrap() else {
            panic!("expected a completed run");
        };
        assert_eq!(summary.success, 2);

        let titles: Vec<String> = reporter
            .results
            .lock()
            .unwrap()
            .iter()
            .map(|(r, _)| r.test_path.clone())
            .collect();
        assert!(titles.contains(&"test/a.test.ts".to_string()));
        assert!(titles.contains(&"vendor/good/test/v.test.ts".to_string()));
        assert!(!titles.iter().any(|t| t.contains("bad")));
    }

    #[tokio::test]
    async fn test_no_tests_is_success() {
        let (_temp, config) = workspace(&[]);
        fs::create_dir_all(config.runner.cwd.join("test")).unwrap();
        let (orchestrator, _reporter) = orchestrator(config, ScriptedLauncher::default());
        assert_eq!(orchestrator.run().await.unwrap().exit_code(), 0);
    }
}
