//! JUnit XML report generation.
//!
//! One `<testcase>` per test file. The classname is the file's directory
//! with `/` turned into `.`, the name is the file name:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="3" failures="1" time="4.210">
//!   <testsuite name="runlane" tests="3" failures="1" skipped="0" time="4.210">
//!     <testcase classname="test.js.web" name="fetch.test.ts" time="1.100"/>
//!     <testcase classname="test.js.web" name="url.test.ts" time="0.400">
//!       <failure message="2 failing" type="code 1">...stdout preview...</failure>
//!     </testcase>
//!     <testcase classname="test.cli" name="run.test.ts" time="2.710">
//!       <system-out>passed on attempt 2; earlier: timeout</system-out>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! # Example
//!
//! ```
//! use runlane::report::JUnitReporter;
//!
//! let reporter = JUnitReporter::new("test-results/junit.xml".into())
//!     .with_testsuite_name("bun-tests");
//! ```

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::{ExitHint, ReportStyle, Reporter};
use crate::result::{RunSummary, TestResult};

/// Collects every reported result and writes the XML at the end of the run.
///
/// Parent directories of the output path are created as needed.
pub struct JUnitReporter {
    output_path: PathBuf,
    results: Mutex<Vec<TestResult>>,
    testsuite_name: String,
}

impl JUnitReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            results: Mutex::new(Vec::new()),
            testsuite_name: "runlane".to_string(),
        }
    }

    /// Sets the test suite name in the XML output.
    pub fn with_testsuite_name(mut self, name: impl Into<String>) -> Self {
        self.testsuite_name = name.into();
        self
    }

    /// Generates JUnit XML for `results`.
    pub fn generate_xml(&self, results: &[TestResult]) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let tests = results.len();
        let failures = results.iter().filter(|r| !r.ok).count();
        let time: u64 = results.iter().map(|r| r.duration_ms).sum();
        let time = format!("{:.3}", time as f64 / 1000.0);

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("tests", tests.to_string().as_str()));
        testsuites.push_attribute(("failures", failures.to_string().as_str()));
        testsuites.push_attribute(("time", time.as_str()));
        writer.write_event(Event::Start(testsuites))?;

        let mut testsuite = BytesStart::new("testsuite");
        testsuite.push_attribute(("name", self.testsuite_name.as_str()));
        testsuite.push_attribute(("tests", tests.to_string().as_str()));
        testsuite.push_attribute(("failures", failures.to_string().as_str()));
        testsuite.push_attribute(("skipped", "0"));
        testsuite.push_attribute(("time", time.as_str()));
        writer.write_event(Event::Start(testsuite))?;

        for result in results {
            write_testcase(&mut writer, result)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        Ok(String::from_utf8(writer.into_inner())?)
    }

    fn write(&self) -> anyhow::Result<()> {
        let mut results = self
            .results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        results.sort_by(|a, b| a.test_path.cmp(&b.test_path));
        let xml = self.generate_xml(&results)?;

        if let Some(parent) = self.output_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.output_path, xml)?;
        Ok(())
    }
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    result: &TestResult,
) -> anyhow::Result<()> {
    let (classname, name) = split_test_path(&result.test_path);

    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", classname.as_str()));
    testcase.push_attribute(("name", name.as_str()));
    testcase.push_attribute((
        "time",
        format!("{:.3}", result.duration_ms as f64 / 1000.0).as_str(),
    ));

    if result.ok && result.executions.is_empty() {
        writer.write_event(Event::Empty(testcase))?;
        return Ok(());
    }

    writer.write_event(Event::Start(testcase))?;

    if result.ok {
        let earlier: Vec<&str> = result
            .executions
            .iter()
            .map(|e| e.error.as_deref().unwrap_or("failed"))
            .collect();
        let note = format!(
            "passed on attempt {}; earlier: {}",
            result.attempts,
            earlier.join(", ")
        );
        writer.write_event(Event::Start(BytesStart::new("system-out")))?;
        writer.write_event(Event::Text(BytesText::new(&sanitize(&note))))?;
        writer.write_event(Event::End(BytesEnd::new("system-out")))?;
    } else {
        let message = result.error.as_deref().unwrap_or("failed");
        let kind = match (result.exit_code, &result.signal) {
            (_, Some(signal)) => signal.clone(),
            (Some(code), None) => format!("code {}", code),
            (None, None) => "error".to_string(),
        };

        let mut failure = BytesStart::new("failure");
        failure.push_attribute(("message", sanitize(message).as_str()));
        failure.push_attribute(("type", kind.as_str()));
        writer.write_event(Event::Start(failure))?;
        if !result.stdout_preview.is_empty() {
            writer.write_event(Event::Text(BytesText::new(&sanitize(
                &result.stdout_preview,
            ))))?;
        }
        writer.write_event(Event::End(BytesEnd::new("failure")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_discovery_complete(&self, _tests: &[String]) {}

    async fn report(&self, result: &TestResult, _style: ReportStyle) {
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(result.clone());
    }

    async fn report_summary(&self, _summary: &RunSummary, _hint: ExitHint) {
        match self.write() {
            Ok(()) => tracing::info!("JUnit XML written to: {}", self.output_path.display()),
            Err(e) => tracing::error!("Failed to write JUnit XML: {}", e),
        }
    }
}

/// Splits `dir/sub/file.test.ts` into (`dir.sub`, `file.test.ts`).
fn split_test_path(path: &str) -> (String, String) {
    match path.rsplit_once('/') {
        Some((dir, file)) => (dir.replace('/', "."), file.to_string()),
        None => ("root".to_string(), path.to_string()),
    }
}

/// Drops characters XML 1.0 cannot carry, including ANSI escapes' ESC.
fn sanitize(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::Execution;
    use tempfile::TempDir;

    fn pass(path: &str) -> TestResult {
        let mut result = TestResult::failed(path, "", 0);
        result.ok = true;
        result.error = None;
        result.exit_code = Some(0);
        result.duration_ms = 1500;
        result
    }

    #[test]
    fn test_split_test_path() {
        assert_eq!(
            split_test_path("test/js/web/fetch.test.ts"),
            ("test.js.web".to_string(), "fetch.test.ts".to_string())
        );
        assert_eq!(
            split_test_path("a.test.ts"),
            ("root".to_string(), "a.test.ts".to_string())
        );
    }

    #[test]
    fn test_sanitize_drops_control_chars() {
        assert_eq!(sanitize("\x1b[31mred\x1b[0m\n"), "[31mred[0m\n");
    }

    #[test]
    fn test_generate_xml() {
        let reporter = JUnitReporter::new("unused.xml".into());
        let mut failed = TestResult::failed("test/b.test.ts", "2 failing", 0);
        failed.exit_code = Some(1);
        failed.stdout_preview = "expected <a> & <b>".into();

        let mut flaky = pass("test/c.test.ts");
        flaky.attempts = 2;
        flaky.executions.push(Execution {
            attempt: 1,
            error: Some("timeout".into()),
            exit_code: None,
            signal: None,
            duration_ms: 1,
            stdout_preview: String::new(),
        });

        let xml = reporter
            .generate_xml(&[pass("test/a.test.ts"), failed, flaky])
            .unwrap();

        assert!(xml.contains(r#"<testsuites tests="3" failures="1""#));
        assert!(xml.contains(r#"<testcase classname="test" name="a.test.ts" time="1.500"/>"#));
        assert!(xml.contains(r#"<failure message="2 failing" type="code 1">"#));
        assert!(xml.contains("expected &lt;a&gt; &amp; &lt;b&gt;"));
        assert!(xml.contains("passed on attempt 2; earlier: timeout"));
    }

    #[tokio::test]
    async fn test_writes_file_on_summary() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/junit.xml");
        let reporter = JUnitReporter::new(path.clone());

        reporter
            .report(&pass("test/a.test.ts"), ReportStyle::Pass)
            .await;
        reporter
            .report_summary(&RunSummary::default(), ExitHint::Success)
            .await;

        let xml = std::fs::read_to_string(path).unwrap();
        assert!(xml.contains(r#"name="runlane""#));
        assert!(xml.contains(r#"name="a.test.ts""#));
    }
}
