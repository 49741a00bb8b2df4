//! Safe spawning of external processes.
//!
//! [`Spawner::spawn_safe`] runs one command to completion under a deadline
//! and always returns a [`SpawnResult`]; it never returns an error. Output
//! is drained as it arrives, forwarded to an optional [`OutputCallback`],
//! and buffered for classification.
//!
//! # Lifecycle of one spawn
//!
//! ```text
//!  SpawnRequest ──► Launcher::launch ──► Exit ──► classify() ──► SpawnResult
//!       ▲                                  │
//!       │   busy/unknown spawn error,      │
//!       └── retries < max_retries ◄────────┘
//!           (sleep backoff * attempt)
//! ```
//!
//! The deadline timer starts only once the child has actually started. A
//! spawn is finished when the child has exited *and* both pipes are
//! drained; on timeout the child (and on Unix its whole process group) is
//! killed first.

pub mod classify;

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use classify::{Classification, classify, crash_message, exit_reason};

/// How long to wait for pipes to close after the child has exited.
///
/// A grandchild that escaped the process group can hold a pipe open
/// forever; after this grace the drain is abandoned with what it has.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

const READ_CHUNK: usize = 8 * 1024;

/// One command to run, immutable per attempt.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use runlane::spawn::SpawnRequest;
///
/// let request = SpawnRequest::new("bun")
///     .args(["test", "test/js/web/fetch.test.ts"])
///     .env("FORCE_COLOR", "1")
///     .timeout(Duration::from_secs(60))
///     .max_retries(2);
///
/// assert_eq!(request.retries, 0);
/// assert_eq!(request.to_shell_string(), "bun test test/js/web/fetch.test.ts");
/// ```
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,

    /// Spawn-level retries already taken.
    pub retries: u32,

    /// Spawn-level retry budget for busy or unknown spawn failures.
    pub max_retries: u32,

    /// Base backoff; the wait before retry `n` is `retry_backoff * n`.
    pub retry_backoff: Duration,

    /// Run through `sudo -n -E` on Unix.
    pub privileged: bool,
}

impl SpawnRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout: Duration::from_secs(600),
            retries: 0,
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            privileged: false,
        }
    }

    /// Builds a request from an argv list; the first element is the program.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone()).args(args.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Program and arguments actually executed.
    pub fn argv(&self) -> (String, Vec<String>) {
        if self.privileged && cfg!(unix) {
            let mut args = vec!["-n".to_string(), "-E".to_string(), self.program.clone()];
            args.extend(self.args.iter().cloned());
            return ("sudo".to_string(), args);
        }
        (self.program.clone(), self.args.clone())
    }

    /// The command as a copy-pasteable shell string.
    pub fn to_shell_string(&self) -> String {
        let (program, args) = self.argv();
        shell_words::join(std::iter::once(program).chain(args))
    }
}

/// Why a process could not be started (or was stopped by the spawner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnErrorKind {
    /// The executable or a resource it needs is busy.
    Busy,
    /// The OS reported an error it could not categorize.
    Unknown,
    NotFound,
    PermissionDenied,
    TimedOut,
    Other,
}

/// A spawn failure, carried inside a [`SpawnResult`] rather than returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct SpawnError {
    pub kind: SpawnErrorKind,
    pub message: String,

    /// Debug rendering of the underlying error.
    pub detail: String,
}

impl SpawnError {
    pub fn new(kind: SpawnErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind,
            detail: message.clone(),
            message,
        }
    }

    /// OS errors outside the known classes count as `Unknown`; errors with
    /// no OS code are `Other`.
    pub fn from_io(err: &io::Error) -> Self {
        let kind = match err.kind() {
            _ if is_busy_os_error(err) => SpawnErrorKind::Busy,
            io::ErrorKind::ResourceBusy | io::ErrorKind::ExecutableFileBusy => {
                SpawnErrorKind::Busy
            }
            io::ErrorKind::NotFound => SpawnErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => SpawnErrorKind::PermissionDenied,
            io::ErrorKind::TimedOut => SpawnErrorKind::TimedOut,
            _ if err.raw_os_error().is_some() => SpawnErrorKind::Unknown,
            _ => SpawnErrorKind::Other,
        };
        Self {
            kind,
            message: err.to_string(),
            detail: format!("{:?}", err),
        }
    }

    /// The error recorded when the spawner kills a child at its deadline.
    pub fn timed_out(after: Duration) -> Self {
        Self::new(
            SpawnErrorKind::TimedOut,
            format!("process timed out after {}s", after.as_secs_f64()),
        )
    }

    /// Busy and unknown failures are worth retrying at the spawn level.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, SpawnErrorKind::Busy | SpawnErrorKind::Unknown)
    }
}

#[cfg(unix)]
fn is_busy_os_error(err: &io::Error) -> bool {
    use nix::errno::Errno;

    err.raw_os_error().is_some_and(|code| {
        matches!(
            Errno::from_i32(code),
            Errno::EBUSY | Errno::ETXTBSY | Errno::EAGAIN
        )
    })
}

#[cfg(not(unix))]
fn is_busy_os_error(_err: &io::Error) -> bool {
    false
}

/// Raw data about one finished launch, before classification.
#[derive(Debug, Clone, Default)]
pub struct Exit {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub spawn_error: Option<SpawnError>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl Exit {
    /// A launch that never produced a process.
    pub fn spawn_failed(error: SpawnError, duration: Duration) -> Self {
        Self {
            spawn_error: Some(error),
            duration,
            ..Default::default()
        }
    }
}

/// Exactly one per spawn attempt chain; never thrown, only returned.
#[derive(Debug, Clone)]
pub struct SpawnResult {
    pub ok: bool,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub spawn_error: Option<SpawnError>,
    pub error: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,

    /// Launches made, counting spawn-level retries.
    pub launches: u32,
}

impl SpawnResult {
    fn from_exit(exit: Exit, timestamp: DateTime<Utc>, timeout: Duration, launches: u32) -> Self {
        let Classification { ok, error, detail } = classify(&exit, timeout);
        Self {
            ok,
            exit_code: exit.exit_code,
            signal: exit.signal,
            spawn_error: exit.spawn_error,
            error,
            stdout: exit.stdout,
            stderr: detail.unwrap_or(exit.stderr),
            timestamp,
            duration: exit.duration,
            launches,
        }
    }
}

/// Which pipe a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Receives output bytes as they arrive, e.g. to tee them into a log file.
pub type OutputCallback = Arc<dyn Fn(OutputStream, &[u8]) + Send + Sync>;

/// Starts a process and waits for it; the seam tests replace.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, request: &SpawnRequest, output: Option<&OutputCallback>) -> Exit;
}

/// Launches real child processes with tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, request: &SpawnRequest, output: Option<&OutputCallback>) -> Exit {
        let (program, args) = request.argv();
        if request.privileged && !cfg!(unix) {
            warn!("Privileged spawns are only supported on Unix, running unprivileged");
        }

        let mut process = tokio::process::Command::new(&program);
        process.args(&args);
        if let Some(dir) = &request.cwd {
            process.current_dir(dir);
        }
        for (key, value) in &request.env {
            process.env(key, value);
        }
        process.stdin(Stdio::null());
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process.kill_on_drop(true);
        #[cfg(unix)]
        process.process_group(0);

        debug!("Spawning: {}", request.to_shell_string());
        let start = Instant::now();

        let mut child = match process.spawn() {
            Ok(child) => child,
            Err(e) => {
                debug!("Failed to spawn {}: {}", program, e);
                return Exit::spawn_failed(SpawnError::from_io(&e), start.elapsed());
            }
        };

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let mut drains: Vec<JoinHandle<()>> = [
            child.stdout.take().map(|pipe| {
                tokio::spawn(drain(
                    pipe,
                    OutputStream::Stdout,
                    output.cloned(),
                    stdout_buf.clone(),
                ))
            }),
            child.stderr.take().map(|pipe| {
                tokio::spawn(drain(
                    pipe,
                    OutputStream::Stderr,
                    output.cloned(),
                    stderr_buf.clone(),
                ))
            }),
        ]
        .into_iter()
        .flatten()
        .collect();

        let mut spawn_error = None;
        let status = match tokio::time::timeout(request.timeout, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(
                    "Killing {} after {}s deadline",
                    program,
                    request.timeout.as_secs_f64()
                );
                kill_tree(&mut child);
                spawn_error = Some(SpawnError::timed_out(request.timeout));
                child.wait().await
            }
        };

        // Exit alone is not completion: both pipes must be drained too.
        let drained =
            tokio::time::timeout(DRAIN_GRACE, futures::future::join_all(drains.iter_mut())).await;
        if drained.is_err() {
            warn!("Output of {} still open after exit, abandoning drain", program);
            drains.iter().for_each(JoinHandle::abort);
        }

        let duration = start.elapsed();
        let mut exit = Exit {
            exit_code: None,
            signal: None,
            spawn_error,
            stdout: take_lossy(&stdout_buf),
            stderr: take_lossy(&stderr_buf),
            duration,
        };

        match status {
            Ok(status) => {
                exit.exit_code = status.code();
                exit.signal = exit_signal(&status);
            }
            Err(e) => {
                if exit.spawn_error.is_none() {
                    exit.spawn_error = Some(SpawnError::from_io(&e));
                }
            }
        }

        debug!(
            "{} finished in {:?} (code {:?}, signal {:?})",
            program, duration, exit.exit_code, exit.signal
        );
        exit
    }
}

async fn drain<R>(
    mut pipe: R,
    stream: OutputStream,
    output: Option<OutputCallback>,
    buffer: Arc<Mutex<Vec<u8>>>,
) where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if let Some(callback) = &output {
                    callback(stream, &chunk[..n]);
                }
                if let Ok(mut buffer) = buffer.lock() {
                    buffer.extend_from_slice(&chunk[..n]);
                }
            }
            Err(e) => {
                debug!("Error reading {:?}: {}", stream, e);
                break;
            }
        }
    }
}

fn take_lossy(buffer: &Mutex<Vec<u8>>) -> String {
    buffer
        .lock()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Best-effort kill of the child and, on Unix, its process group.
///
/// "No such process" is expected when the child beat us to it.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => debug!("killpg({}) failed: {}", pid, e),
        }
    }

    if let Err(e) = child.start_kill() {
        debug!("kill failed: {}", e);
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    status.signal().map(|signal| {
        nix::sys::signal::Signal::try_from(signal)
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|_| format!("SIG{}", signal))
    })
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

/// Runs requests to completion, retrying transient spawn failures.
///
/// Cheap to clone; clones share the launcher.
pub struct Spawner<L = ProcessLauncher> {
    launcher: Arc<L>,
    output: Option<OutputCallback>,
}

impl<L> Clone for Spawner<L> {
    fn clone(&self) -> Self {
        Self {
            launcher: self.launcher.clone(),
            output: self.output.clone(),
        }
    }
}

impl Spawner<ProcessLauncher> {
    pub fn new() -> Self {
        Self::with_launcher(ProcessLauncher)
    }
}

impl Default for Spawner<ProcessLauncher> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: Launcher> Spawner<L> {
    pub fn with_launcher(launcher: L) -> Self {
        Self {
            launcher: Arc::new(launcher),
            output: None,
        }
    }

    /// A spawner sharing this launcher whose output goes to `callback`.
    pub fn with_output_callback(&self, callback: OutputCallback) -> Self {
        Self {
            launcher: self.launcher.clone(),
            output: Some(callback),
        }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Runs `request` to completion. Never fails: every outcome, including
    /// a process that could not start, becomes a [`SpawnResult`].
    pub async fn spawn_safe(&self, request: &SpawnRequest) -> SpawnResult {
        let mut request = request.clone();
        loop {
            let timestamp = Utc::now();
            let exit = self.launcher.launch(&request, self.output.as_ref()).await;

            if let Some(error) = &exit.spawn_error
                && error.is_transient()
                && request.retries < request.max_retries
            {
                request.retries += 1;
                let backoff = request.retry_backoff * request.retries;
                warn!(
                    "Spawn of {} failed ({}), retry {}/{} in {:?}",
                    request.program, error, request.retries, request.max_retries, backoff
                );
                tokio::time::sleep(backoff).await;
                continue;
            }

            return SpawnResult::from_exit(exit, timestamp, request.timeout, request.retries + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails every launch with the given spawn error kind.
    struct FailingLauncher {
        kind: SpawnErrorKind,
        launches: AtomicU32,
    }

    impl FailingLauncher {
        fn new(kind: SpawnErrorKind) -> Self {
            Self {
                kind,
                launches: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Launcher for FailingLauncher {
        async fn launch(&self, _request: &SpawnRequest, _output: Option<&OutputCallback>) -> Exit {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Exit {
                exit_code: Some(1),
                spawn_error: Some(SpawnError::new(self.kind, "resource busy or locked")),
                ..Default::default()
            }
        }
    }

    fn quick(program: &str) -> SpawnRequest {
        SpawnRequest::new(program)
            .timeout(Duration::from_secs(10))
            .retry_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_busy_spawn_is_retried_within_budget() {
        let spawner = Spawner::with_launcher(FailingLauncher::new(SpawnErrorKind::Busy));
        let result = spawner.spawn_safe(&quick("busy").max_retries(1)).await;

        assert_eq!(spawner.launcher().launches.load(Ordering::SeqCst), 2);
        assert_eq!(result.launches, 2);
        assert!(!result.ok);
        assert_eq!(result.error.as_deref(), Some("spawn error"));
    }

    #[tokio::test]
    async fn test_non_transient_spawn_error_is_not_retried() {
        let spawner = Spawner::with_launcher(FailingLauncher::new(SpawnErrorKind::NotFound));
        let result = spawner.spawn_safe(&quick("missing").max_retries(3)).await;

        assert_eq!(spawner.launcher().launches.load(Ordering::SeqCst), 1);
        assert!(!result.ok);
    }

    #[test]
    fn test_io_error_kinds() {
        let not_found = io::Error::from(io::ErrorKind::NotFound);
        assert_eq!(SpawnError::from_io(&not_found).kind, SpawnErrorKind::NotFound);

        let other = io::Error::other("no os code");
        assert_eq!(SpawnError::from_io(&other).kind, SpawnErrorKind::Other);
        assert!(!SpawnError::from_io(&other).is_transient());
    }

    #[cfg(unix)]
    #[test]
    fn test_busy_and_unknown_os_errors_are_transient() {
        use nix::errno::Errno;

        for errno in [Errno::EBUSY, Errno::ETXTBSY] {
            let err = SpawnError::from_io(&io::Error::from_raw_os_error(errno as i32));
            assert_eq!(err.kind, SpawnErrorKind::Busy, "{}", errno);
            assert!(err.is_transient());
        }

        let err = SpawnError::from_io(&io::Error::from_raw_os_error(Errno::EIO as i32));
        assert_eq!(err.kind, SpawnErrorKind::Unknown);
        assert!(err.is_transient());

        let err = SpawnError::from_io(&io::Error::from_raw_os_error(Errno::ENOENT as i32));
        assert_eq!(err.kind, SpawnErrorKind::NotFound);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_privileged_argv() {
        let request = SpawnRequest::new("bun").arg("test").privileged(true);
        let (program, args) = request.argv();
        if cfg!(unix) {
            assert_eq!(program, "sudo");
            assert_eq!(args, vec!["-n", "-E", "bun", "test"]);
        } else {
            assert_eq!(program, "bun");
        }
    }

    #[test]
    fn test_shell_string_quotes() {
        let request = SpawnRequest::new("echo").arg("hello world");
        assert_eq!(request.to_shell_string(), "echo 'hello world'");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_process_success() {
        let result = Spawner::new()
            .spawn_safe(&quick("sh").args(["-c", "echo out; echo err >&2"]))
            .await;

        assert!(result.ok, "{:?}", result);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert_eq!(result.launches, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_process_exit_code() {
        let result = Spawner::new()
            .spawn_safe(&quick("sh").args(["-c", "exit 7"]))
            .await;

        assert!(!result.ok);
        assert_eq!(result.exit_code, Some(7));
        assert_eq!(result.error.as_deref(), Some("code 7"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_process_timeout_kills_group() {
        let request = quick("sh")
            .args(["-c", "sleep 30 & sleep 30"])
            .timeout(Duration::from_millis(200));
        let start = Instant::now();
        let result = Spawner::new().spawn_safe(&request).await;

        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(!result.ok);
        assert_eq!(result.error.as_deref(), Some("timeout"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let result = Spawner::new()
            .spawn_safe(&quick("definitely-not-a-real-binary-runlane").max_retries(0))
            .await;

        assert!(!result.ok);
        assert_eq!(result.error.as_deref(), Some("spawn error"));
        assert_eq!(
            result.spawn_error.map(|e| e.kind),
            Some(SpawnErrorKind::NotFound)
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_callback_receives_stream() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let spawner = Spawner::new().with_output_callback(Arc::new(move |stream: OutputStream, bytes: &[u8]| {
            if stream == OutputStream::Stdout {
                sink.lock().unwrap().extend_from_slice(bytes);
            }
        }));

        let result = spawner
            .spawn_safe(&quick("sh").args(["-c", "printf 'a\\nb\\n'"]))
            .await;

        assert!(result.ok);
        assert_eq!(String::from_utf8(seen.lock().unwrap().clone()).unwrap(), "a\nb\n");
    }
}
