//! Test reporting and output generation.
//!
//! Reporters are side-effect sinks: the orchestrator calls them for every
//! finished test and once with the summary, and ignores what they do. A
//! reporter must never influence aggregation or exit codes.
//!
//! | Reporter | Output |
//! |----------|--------|
//! | [`ConsoleReporter`] | progress bar and failure list on the terminal |
//! | [`GithubReporter`] | workflow annotations and a step-summary table |
//! | [`JUnitReporter`] | JUnit XML file |
//! | [`MultiReporter`] | fans out to several of the above |

pub mod github;
pub mod junit;

use async_trait::async_trait;

use crate::result::{RunSummary, TestResult};

pub use github::GithubReporter;
pub use junit::JUnitReporter;

/// How a finished test should be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStyle {
    Pass,

    /// Passed after at least one failed attempt.
    Flaky,

    Fail,
}

impl ReportStyle {
    pub fn of(result: &TestResult) -> Self {
        if !result.ok {
            Self::Fail
        } else if result.is_flaky() {
            Self::Flaky
        } else {
            Self::Pass
        }
    }
}

/// How the run is about to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitHint {
    Success,
    Failure,

    /// Stopped at the first failure.
    Bail,
}

impl ExitHint {
    pub fn for_summary(summary: &RunSummary) -> Self {
        if summary.is_success() {
            Self::Success
        } else {
            Self::Failure
        }
    }
}

/// A test reporter receives events during a run.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once with every test about to run, local and vendor.
    async fn on_discovery_complete(&self, tests: &[String]);

    /// Called when a test has its final result.
    async fn report(&self, result: &TestResult, style: ReportStyle);

    /// Called once after aggregation, or at bail with only the failing test.
    async fn report_summary(&self, summary: &RunSummary, hint: ExitHint);
}

/// A reporter that does nothing.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_discovery_complete(&self, _tests: &[String]) {}
    async fn report(&self, _result: &TestResult, _style: ReportStyle) {}
    async fn report_summary(&self, _summary: &RunSummary, _hint: ExitHint) {}
}

/// A reporter that combines multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_discovery_complete(&self, tests: &[String]) {
        for reporter in &self.reporters {
            reporter.on_discovery_complete(tests).await;
        }
    }

    async fn report(&self, result: &TestResult, style: ReportStyle) {
        for reporter in &self.reporters {
            reporter.report(result, style).await;
        }
    }

    async fn report_summary(&self, summary: &RunSummary, hint: ExitHint) {
        for reporter in &self.reporters {
            reporter.report_summary(summary, hint).await;
        }
    }
}

/// Console reporter that shows progress in the terminal.
pub struct ConsoleReporter {
    progress: std::sync::Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: std::sync::Mutex::new(None),
            verbose,
        }
    }

    fn println(&self, line: String) {
        match self.progress.lock().ok().as_deref().and_then(Option::as_ref) {
            Some(pb) => pb.println(line),
            None => println!("{}", line),
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_discovery_complete(&self, tests: &[String]) {
        println!("Running {} tests", tests.len());

        let pb = indicatif::ProgressBar::new(tests.len() as u64);
        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        if let Ok(mut progress) = self.progress.lock() {
            *progress = Some(pb);
        }
    }

    async fn report(&self, result: &TestResult, style: ReportStyle) {
        if let Ok(progress) = self.progress.lock()
            && let Some(pb) = progress.as_ref()
        {
            pb.inc(1);
        }

        let label = match style {
            ReportStyle::Pass => console::style("PASS ").green(),
            ReportStyle::Flaky => console::style("FLAKY").yellow(),
            ReportStyle::Fail => console::style("FAIL ").red().bold(),
        };

        if self.verbose || style != ReportStyle::Pass {
            let mut line = format!(
                "{} {} {}",
                label,
                result.test_path,
                console::style(format!("[{}ms]", result.duration_ms)).dim()
            );
            if let Some(error) = &result.error
                && !result.ok
            {
                line.push_str(&format!(" {}", console::style(error).red()));
            }
            if result.attempts > 1 {
                line.push_str(&format!(" (attempt {})", result.attempts));
            }
            self.println(line);
        }
    }

    async fn report_summary(&self, summary: &RunSummary, hint: ExitHint) {
        if let Ok(mut progress) = self.progress.lock()
            && let Some(pb) = progress.take()
        {
            pb.finish_and_clear();
        }

        println!();
        println!("Test Results:");
        println!("  Total:   {}", summary.total());
        println!("  Passed:  {}", console::style(summary.success).green());
        println!("  Failed:  {}", console::style(summary.fail.len()).red());
        if summary.flaky > 0 {
            println!("  Flaky:   {}", console::style(summary.flaky).yellow());
        }

        println!();
        match hint {
            ExitHint::Success => {
                println!("{}", console::style("All tests passed!").green().bold());
                return;
            }
            ExitHint::Bail => {
                println!("{}", console::style("Bailed on first failure.").red().bold());
            }
            ExitHint::Failure => {
                println!("{}", console::style("Some tests failed.").red().bold());
            }
        }

        println!();
        println!("Failed tests:");
        for result in &summary.fail {
            println!("  - {}", result.test_path);
            if let Some(error) = &result.error {
                println!("    {}", console::style(error).dim());
            }
            if self.verbose && !result.stdout_preview.is_empty() {
                println!();
                for line in result.stdout_preview.lines() {
                    println!("      {}", line);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::Execution;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingReporter {
        reported: AtomicUsize,
        styles: Mutex<Vec<ReportStyle>>,
    }

    #[async_trait]
    impl Reporter for std::sync::Arc<CountingReporter> {
        async fn on_discovery_complete(&self, _tests: &[String]) {}

        async fn report(&self, _result: &TestResult, style: ReportStyle) {
            self.reported.fetch_add(1, Ordering::SeqCst);
            self.styles.lock().unwrap().push(style);
        }

        async fn report_summary(&self, _summary: &RunSummary, _hint: ExitHint) {}
    }

    fn flaky_result() -> TestResult {
        let mut result = TestResult::failed("test/a.test.ts", "code 1", 0);
        result.ok = true;
        result.error = None;
        result.executions.push(Execution {
            attempt: 1,
            error: Some("code 1".into()),
            exit_code: Some(1),
            signal: None,
            duration_ms: 3,
            stdout_preview: String::new(),
        });
        result
    }

    #[test]
    fn test_report_style() {
        assert_eq!(
            ReportStyle::of(&TestResult::failed("t", "x", 0)),
            ReportStyle::Fail
        );
        assert_eq!(ReportStyle::of(&flaky_result()), ReportStyle::Flaky);
    }

    #[test]
    fn test_exit_hint_for_summary() {
        assert_eq!(ExitHint::for_summary(&RunSummary::default()), ExitHint::Success);
        let summary = RunSummary::fold(vec![TestResult::failed("t", "x", 0)]);
        assert_eq!(ExitHint::for_summary(&summary), ExitHint::Failure);
    }

    #[tokio::test]
    async fn test_multi_reporter_fans_out() {
        let counting = std::sync::Arc::new(CountingReporter {
            reported: AtomicUsize::new(0),
            styles: Mutex::new(Vec::new()),
        });
        let multi = MultiReporter::new()
            .with_reporter(counting.clone())
            .with_reporter(counting.clone())
            .with_reporter(NullReporter);
        assert_eq!(multi.len(), 3);

        multi.report(&flaky_result(), ReportStyle::Flaky).await;
        assert_eq!(counting.reported.load(Ordering::SeqCst), 2);
        assert_eq!(
            *counting.styles.lock().unwrap(),
            vec![ReportStyle::Flaky, ReportStyle::Flaky]
        );
    }
}
