//! Per-lane result logs.
//!
//! Each lane owns `lane-<i>.jsonl` (one [`TestResult`] per line) and
//! `lane-<i>.log` (raw test output). A lane is the only writer of its files;
//! they are read back only after every lane has joined.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing::warn;

use crate::result::TestResult;
use crate::spawn::{OutputCallback, OutputStream};

pub fn result_log_path(dir: &Path, lane: usize) -> PathBuf {
    dir.join(format!("lane-{}.jsonl", lane))
}

pub fn output_log_path(dir: &Path, lane: usize) -> PathBuf {
    dir.join(format!("lane-{}.log", lane))
}

/// Append-only writer for one lane.
pub struct LaneLog {
    lane: usize,
    results: File,
    output: Arc<Mutex<File>>,
}

impl LaneLog {
    /// Creates (or truncates) both files for `lane` under `dir`.
    pub fn create(dir: &Path, lane: usize) -> Result<Self> {
        let results_path = result_log_path(dir, lane);
        let results = File::create(&results_path)
            .with_context(|| format!("Failed to create {}", results_path.display()))?;

        let output_path = output_log_path(dir, lane);
        let output = File::create(&output_path)
            .with_context(|| format!("Failed to create {}", output_path.display()))?;

        Ok(Self {
            lane,
            results,
            output: Arc::new(Mutex::new(output)),
        })
    }

    pub fn lane(&self) -> usize {
        self.lane
    }

    /// Appends one result as a single JSON line.
    pub fn append(&mut self, result: &TestResult) -> Result<()> {
        let line = serde_json::to_string(result)?;
        writeln!(self.results, "{}", line)?;
        self.results.flush()?;
        Ok(())
    }

    /// Writes a header line to the raw output log before a test starts.
    pub fn begin_test(&self, test_path: &str, attempt: u32) {
        let header = format!("\n=== {} (attempt {}) ===\n", test_path, attempt);
        self.write_output(header.as_bytes());
    }

    /// Sink that tees spawn output into the raw log, and to the terminal
    /// when `stream` is set.
    pub fn output_sink(&self, stream: bool) -> OutputCallback {
        let file = self.output.clone();
        let lane = self.lane;
        Arc::new(move |kind: OutputStream, bytes: &[u8]| {
            if let Ok(mut file) = file.lock()
                && let Err(e) = file.write_all(bytes)
            {
                warn!("Lane {}: failed to write output log: {}", lane, e);
            }
            if stream {
                let text = String::from_utf8_lossy(bytes);
                match kind {
                    OutputStream::Stdout => print!("{}", text),
                    OutputStream::Stderr => eprint!("{}", text),
                }
            }
        })
    }

    fn write_output(&self, bytes: &[u8]) {
        if let Ok(mut file) = self.output.lock()
            && let Err(e) = file.write_all(bytes)
        {
            warn!("Lane {}: failed to write output log: {}", self.lane, e);
        }
    }
}

/// Reads every result of one lane.
///
/// A missing file means the lane never ran and yields nothing. Lines that
/// fail to parse are logged and skipped.
pub fn read_lane_log(dir: &Path, lane: usize) -> Result<Vec<TestResult>> {
    let path = result_log_path(dir, lane);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut results = Vec::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TestResult>(&line) {
            Ok(result) => results.push(result),
            Err(e) => warn!("{}:{}: unreadable result: {}", path.display(), number + 1, e),
        }
    }
    Ok(results)
}

/// Reads lanes `0..lanes` in order.
pub fn read_all(dir: &Path, lanes: usize) -> Result<Vec<TestResult>> {
    let mut all = Vec::new();
    for lane in 0..lanes {
        all.extend(read_lane_log(dir, lane)?);
    }
    Ok(all)
}
