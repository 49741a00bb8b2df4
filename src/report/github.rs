//! GitHub Actions output.
//!
//! Failing and flaky tests become workflow annotations on stdout
//! (`::error` / `::warning`). At the end of the run a markdown table of the
//! failures is appended to the file named by `GITHUB_STEP_SUMMARY`.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{ExitHint, ReportStyle, Reporter};
use crate::result::{RunSummary, TestResult};
use crate::vcs::RunContext;

/// Characters of stdout preview kept per failure in the step summary.
const SUMMARY_PREVIEW_CHARS: usize = 4000;

pub struct GithubReporter {
    context: RunContext,
    step_summary: Option<PathBuf>,
}

impl GithubReporter {
    /// Writes the step summary to `GITHUB_STEP_SUMMARY` if it is set.
    pub fn new(context: RunContext) -> Self {
        let step_summary = std::env::var_os("GITHUB_STEP_SUMMARY").map(PathBuf::from);
        Self::with_step_summary(context, step_summary)
    }

    pub fn with_step_summary(context: RunContext, step_summary: Option<PathBuf>) -> Self {
        Self {
            context,
            step_summary,
        }
    }

    /// True when running inside GitHub Actions.
    pub fn detect() -> bool {
        std::env::var("GITHUB_ACTIONS").is_ok_and(|value| value == "true")
    }

    fn render_summary(&self, summary: &RunSummary, hint: ExitHint) -> String {
        let mut out = String::new();
        let title = match hint {
            ExitHint::Success => "Tests passed",
            ExitHint::Failure => "Tests failed",
            ExitHint::Bail => "Tests bailed",
        };
        let _ = write!(out, "## {}", title);
        if let Some(git) = &self.context.git {
            let _ = write!(out, " on `{}`", git.short_sha());
            if let Some(branch) = &git.branch {
                let _ = write!(out, " ({})", branch);
            }
        }
        out.push_str("\n\n");

        let _ = writeln!(
            out,
            "{} passed, {} flaky, {} failed (started {})\n",
            summary.success,
            summary.flaky,
            summary.fail.len(),
            self.context.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        );

        if summary.fail.is_empty() {
            return out;
        }

        out.push_str("| Test | Error | Attempts |\n|---|---|---|\n");
        for result in &summary.fail {
            let _ = writeln!(
                out,
                "| `{}` | {} | {} |",
                result.test_path,
                result.error.as_deref().unwrap_or("unknown").replace('|', "\\|"),
                result.attempts
            );
        }

        for result in &summary.fail {
            if result.stdout_preview.is_empty() {
                continue;
            }
            let preview = tail_chars(&result.stdout_preview, SUMMARY_PREVIEW_CHARS);
            let _ = write!(
                out,
                "\n<details><summary><code>{}</code></summary>\n\n```\n{}\n```\n\n</details>\n",
                result.test_path, preview
            );
        }

        out
    }
}

#[async_trait]
impl Reporter for GithubReporter {
    async fn on_discovery_complete(&self, _tests: &[String]) {}

    async fn report(&self, result: &TestResult, style: ReportStyle) {
        if let Some(line) = annotation(result, style) {
            println!("{}", line);
        }
    }

    async fn report_summary(&self, summary: &RunSummary, hint: ExitHint) {
        let Some(path) = &self.step_summary else {
            debug!("GITHUB_STEP_SUMMARY not set, skipping step summary");
            return;
        };

        let markdown = self.render_summary(summary, hint);
        let written = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(markdown.as_bytes()));
        if let Err(e) = written {
            warn!("Failed to write step summary {}: {}", path.display(), e);
        }
    }
}

/// The workflow command for a result, or `None` for a clean pass.
pub fn annotation(result: &TestResult, style: ReportStyle) -> Option<String> {
    let (level, title) = match style {
        ReportStyle::Pass => return None,
        ReportStyle::Flaky => ("warning", format!("{} is flaky", result.test_path)),
        ReportStyle::Fail => (
            "error",
            format!(
                "{} - {}",
                result.test_path,
                result.error.as_deref().unwrap_or("failed")
            ),
        ),
    };

    let message = match style {
        ReportStyle::Flaky => result
            .executions
            .iter()
            .map(|e| {
                format!(
                    "attempt {}: {}",
                    e.attempt,
                    e.error.as_deref().unwrap_or("failed")
                )
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => result.stdout_preview.clone(),
    };

    Some(format!(
        "::{} file={},title={}::{}",
        level,
        escape_property(&result.test_path),
        escape_property(&title),
        escape_data(&message)
    ))
}

fn escape_data(s: &str) -> String {
    s.replace('%', "%25").replace('\r', "%0D").replace('\n', "%0A")
}

fn escape_property(s: &str) -> String {
    escape_data(s).replace(':', "%3A").replace(',', "%2C")
}

fn tail_chars(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    let skip = count - max;
    let start = s.char_indices().nth(skip).map(|(i, _)| i).unwrap_or(0);
    &s[start..]
}
