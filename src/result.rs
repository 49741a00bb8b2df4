//! Test results and the run summary.
//!
//! A [`TestResult`] is created once per test file, gains one [`Execution`]
//! per failed attempt that was retried, and is then persisted as one JSON
//! line in its lane's log. The [`RunSummary`] is folded from every
//! persisted result after all lanes have joined.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::spawn::SpawnResult;

/// Maximum number of lines kept in [`TestResult::stdout_preview`].
pub const PREVIEW_LINES: usize = 100;

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("valid regex"));

static SUB_TEST_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:\((pass|fail|skip|todo)\)|(✓|✗|»|✎))\s+(.+?)(?:\s+\[([\d.]+)(ms|s)\])?\s*$",
    )
    .expect("valid regex")
});

static FILE_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S+\.\w+):$").expect("valid regex"));

/// Outcome of a test file or of one test inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Fail,
    Skip,
    Todo,
}

impl TestStatus {
    fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            "pass" | "✓" => Some(Self::Pass),
            "fail" | "✗" => Some(Self::Fail),
            "skip" | "»" => Some(Self::Skip),
            "todo" | "✎" => Some(Self::Todo),
            _ => None,
        }
    }
}

/// One test reported by the runner inside a test file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTest {
    pub file: String,
    pub test: String,
    pub status: TestStatus,
    pub duration_ms: Option<f64>,
}

/// A failed attempt that was followed by a retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub attempt: u32,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub duration_ms: u64,
    pub stdout_preview: String,
}

/// The final record for one test file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_path: String,
    pub ok: bool,
    pub status: TestStatus,
    pub error: Option<String>,
    pub tests: Vec<SubTest>,
    pub stdout: String,
    pub stdout_preview: String,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub duration_ms: u64,
    pub attempts: u32,
    pub executions: Vec<Execution>,
    pub lane: usize,
}

impl TestResult {
    /// Builds a result from one spawn of the test runner.
    ///
    /// A zero exit with failing sub-tests is still a failure.
    pub fn from_spawn(test_path: impl Into<String>, spawn: &SpawnResult, lane: usize) -> Self {
        let test_path = test_path.into();
        let tests = parse_test_stdout(&spawn.stdout, &test_path);
        let failing = tests.iter().filter(|t| t.status == TestStatus::Fail).count();

        let mut ok = spawn.ok;
        let mut error = spawn.error.clone();
        if ok && failing > 0 {
            ok = false;
            error = Some(format!("{} failing", failing));
        }

        Self {
            stdout_preview: stdout_preview(&spawn.stdout),
            stdout: spawn.stdout.clone(),
            test_path,
            ok,
            status: if ok { TestStatus::Pass } else { TestStatus::Fail },
            error,
            tests,
            exit_code: spawn.exit_code,
            signal: spawn.signal.clone(),
            duration_ms: spawn.duration.as_millis() as u64,
            attempts: 1,
            executions: Vec::new(),
            lane,
        }
    }

    /// A failed result that never reached a spawn.
    pub fn failed(test_path: impl Into<String>, error: impl Into<String>, lane: usize) -> Self {
        Self {
            test_path: test_path.into(),
            ok: false,
            status: TestStatus::Fail,
            error: Some(error.into()),
            tests: Vec::new(),
            stdout: String::new(),
            stdout_preview: String::new(),
            exit_code: None,
            signal: None,
            duration_ms: 0,
            attempts: 1,
            executions: Vec::new(),
            lane,
        }
    }

    /// Passed, but only after at least one failed attempt.
    pub fn is_flaky(&self) -> bool {
        self.ok && !self.executions.is_empty()
    }

    /// Snapshot of this attempt for the history of a retried test.
    pub fn to_execution(&self, attempt: u32) -> Execution {
        Execution {
            attempt,
            error: self.error.clone(),
            exit_code: self.exit_code,
            signal: self.signal.clone(),
            duration_ms: self.duration_ms,
            stdout_preview: self.stdout_preview.clone(),
        }
    }
}

/// Counts and failures across every lane of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub success: usize,

    /// Successes that needed a retry; a subset of `success`.
    pub flaky: usize,

    /// Failing results, sorted by path.
    pub fail: Vec<TestResult>,
}

impl RunSummary {
    /// Folds persisted results into a summary.
    pub fn fold(results: impl IntoIterator<Item = TestResult>) -> Self {
        let mut summary = results
            .into_iter()
            .fold(Self::default(), |mut summary, result| {
                if result.ok {
                    summary.success += 1;
                    if result.is_flaky() {
                        summary.flaky += 1;
                    }
                } else {
                    summary.fail.push(result);
                }
                summary
            });
        summary
            .fail
            .sort_by(|a, b| a.test_path.cmp(&b.test_path));
        summary
    }

    pub fn total(&self) -> usize {
        self.success + self.fail.len()
    }

    pub fn is_success(&self) -> bool {
        self.fail.is_empty()
    }
}

/// Removes ANSI escape sequences.
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// The last [`PREVIEW_LINES`] lines of `stdout`, without colors.
pub fn stdout_preview(stdout: &str) -> String {
    let plain = strip_ansi(stdout);
    let lines: Vec<&str> = plain.lines().collect();
    let start = lines.len().saturating_sub(PREVIEW_LINES);
    lines[start..].join("\n")
}

/// Extracts per-test lines from test-runner output.
///
/// Understands `(pass) name [1.23ms]` and the glyph form `✓ name`, and
/// `path/to/file.test.ts:` headers that switch the current file. Lines
/// before any header belong to `test_path`.
pub fn parse_test_stdout(stdout: &str, test_path: &str) -> Vec<SubTest> {
    let plain = strip_ansi(stdout);
    let mut file = test_path.to_string();
    let mut tests = Vec::new();

    for line in plain.lines() {
        if let Some(captures) = FILE_HEADER.captures(line.trim_end()) {
            file = captures[1].to_string();
            continue;
        }

        let Some(captures) = SUB_TEST_LINE.captures(line) else {
            continue;
        };
        let marker = captures
            .get(1)
            .or_else(|| captures.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        let Some(status) = TestStatus::from_marker(marker) else {
            continue;
        };

        let duration_ms = captures.get(4).and_then(|value| {
            let value: f64 = value.as_str().parse().ok()?;
            match captures.get(5).map(|unit| unit.as_str()) {
                Some("s") => Some(value * 1000.0),
                _ => Some(value),
            }
        });

        tests.push(SubTest {
            file: file.clone(),
            test: captures[3].to_string(),
            status,
            duration_ms,
        });
    }

    tests
}
