//! Outcome classification for finished processes.
//!
//! [`classify`] maps raw exit data to a normalized error string. The
//! precedence is fixed:
//!
//! | Step | Condition | Error |
//! |------|-----------|-------|
//! | 1 | exit 0, no signal, no spawn error | none |
//! | 2 | spawn error | `timeout` or `spawn error` |
//! | 3 | crash signature in stderr | the crash message, lowercased |
//! | 4 | terminated by signal | `timeout` or the signal name |
//! | 5 | exit 1 | `<N> failing` or `code 1` |
//! | 6 | no exit code | `timeout` |
//! | 7 | any other exit | `code <reason or number>` |

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use super::Exit;

/// Signal a process gets when something asks it to stop.
pub const TERMINATE_SIGNAL: &str = "SIGTERM";

static TIMEOUT_MESSAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)timed? ?out").expect("valid regex"));

static CRASH_SIGNATURES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)thread \d+ panic: (.*)(?:\r\n|\r|\n|\\n)",
        r"(?i)panic\(.*\): (.*)(?:\r\n|\r|\n|\\n)",
        r"(?i)(Segmentation fault) at address",
        r"(?i)(Internal assertion failure)",
        r"(?i)(Illegal instruction) at address",
        r"(?i)panic: (.*) at address",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid regex"))
    .collect()
});

static FAIL_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\x1b\[31m)?\s(\d+) fail").expect("valid regex"));

/// The normalized view of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub ok: bool,
    pub error: Option<String>,

    /// Replaces captured stderr when set (the spawn error's detail).
    pub detail: Option<String>,
}

impl Classification {
    fn pass() -> Self {
        Self {
            ok: true,
            error: None,
            detail: None,
        }
    }

    fn fail(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            detail: None,
        }
    }
}

/// Classifies a finished process against the deadline it ran under.
pub fn classify(exit: &Exit, timeout: Duration) -> Classification {
    if exit.exit_code == Some(0) && exit.signal.is_none() && exit.spawn_error.is_none() {
        return Classification::pass();
    }

    if let Some(spawn_error) = &exit.spawn_error {
        if TIMEOUT_MESSAGE.is_match(&spawn_error.message) {
            return Classification::fail("timeout");
        }
        return Classification {
            ok: false,
            error: Some("spawn error".to_string()),
            detail: Some(spawn_error.detail.clone()),
        };
    }

    if let Some(crash) = crash_message(&exit.stderr) {
        return Classification::fail(crash);
    }

    if let Some(signal) = &exit.signal {
        if signal == TERMINATE_SIGNAL && exit.duration >= timeout {
            return Classification::fail("timeout");
        }
        return Classification::fail(signal.clone());
    }

    match exit.exit_code {
        Some(1) => match failing_count(&exit.stderr) {
            Some(count) => Classification::fail(format!("{} failing", count)),
            None => Classification::fail("code 1"),
        },
        None => Classification::fail("timeout"),
        Some(code) => match exit_reason(code, cfg!(windows)) {
            Some(reason) => Classification::fail(format!("code {}", reason)),
            None => Classification::fail(format!("code {}", code)),
        },
    }
}

/// First crash signature found in `stderr`, lowercased and cut at the first
/// escaped newline.
pub fn crash_message(stderr: &str) -> Option<String> {
    let message = CRASH_SIGNATURES
        .iter()
        .find_map(|pattern| pattern.captures(stderr))
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str())?;

    let message = match message.find("\\n") {
        Some(i) => &message[..i],
        None => message,
    };
    Some(message.to_lowercase())
}

/// The `<N> fail` marker a test runner prints, ignoring zero counts.
fn failing_count(stderr: &str) -> Option<u64> {
    FAIL_COUNT
        .captures_iter(stderr)
        .filter_map(|captures| captures[1].parse::<u64>().ok())
        .find(|count| *count > 0)
}

/// Symbolic name for a Windows NTSTATUS exit code.
///
/// Only consulted when `windows` is true; other platforms report signals
/// separately and exit codes stay numeric.
pub fn exit_reason(code: i32, windows: bool) -> Option<&'static str> {
    if !windows {
        return None;
    }
    let reason = match code as u32 {
        0xC000_0005 => "STATUS_ACCESS_VIOLATION",
        0xC000_00FD => "STATUS_STACK_OVERFLOW",
        0xC000_0409 => "STATUS_STACK_BUFFER_OVERRUN",
        0xC000_001D => "STATUS_ILLEGAL_INSTRUCTION",
        0xC000_0094 => "STATUS_INTEGER_DIVIDE_BY_ZERO",
        0xC000_0374 => "STATUS_HEAP_CORRUPTION",
        0x8000_0003 => "STATUS_BREAKPOINT",
        0xC000_013A => "STATUS_CONTROL_C_EXIT",
        0xC000_0135 => "STATUS_DLL_NOT_FOUND",
        _ => return None,
    };
    Some(reason)
}
