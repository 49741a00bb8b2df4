//! Source-control access and the per-run context.
//!
//! [`SourceControl`] is the fetch primitive vendor discovery needs: a
//! shallow clone, a single-tag fetch, and read-only metadata. [`GitCli`]
//! implements it by spawning `git` through the [`Spawner`], so git calls
//! get the same deadline, classification and spawn-level retries as tests.
//!
//! [`RunContext`] is built once at startup and passed to whoever needs git
//! metadata, instead of each caller looking it up lazily.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::spawn::{Launcher, ProcessLauncher, SpawnRequest, SpawnResult, Spawner};

/// Lines of stderr kept in a [`VcsError`].
const STDERR_TAIL_LINES: usize = 20;

/// A failed source-control operation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("`{command}` failed ({reason}): {stderr}")]
pub struct VcsError {
    pub command: String,
    pub reason: String,
    pub stderr: String,
}

impl VcsError {
    fn from_spawn(request: &SpawnRequest, result: &SpawnResult) -> Self {
        let lines: Vec<&str> = result.stderr.lines().collect();
        let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
        Self {
            command: request.to_shell_string(),
            reason: result.error.clone().unwrap_or_else(|| "unknown".to_string()),
            stderr: tail,
        }
    }
}

/// Commit and branch of a checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitMetadata {
    pub sha: String,
    pub branch: Option<String>,
}

impl GitMetadata {
    pub fn short_sha(&self) -> &str {
        &self.sha[..self.sha.len().min(8)]
    }
}

/// Clone, fetch and inspect repositories.
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Shallow, single-branch clone of `repository` into `dest`.
    async fn clone_shallow(&self, repository: &str, dest: &Path) -> Result<(), VcsError>;

    /// Fetches only `tag` into `checkout` and checks it out.
    async fn fetch_tag(&self, checkout: &Path, tag: &str) -> Result<(), VcsError>;

    /// Commit and branch of `dir`, or `None` if it is not a checkout.
    async fn metadata(&self, dir: &Path) -> Option<GitMetadata>;
}

/// [`SourceControl`] backed by the `git` executable.
pub struct GitCli<L = ProcessLauncher> {
    spawner: Spawner<L>,
    program: String,
    timeout: Duration,
}

impl GitCli<ProcessLauncher> {
    pub fn new(timeout: Duration) -> Self {
        Self::with_spawner(Spawner::new(), timeout)
    }
}

impl<L: Launcher> GitCli<L> {
    pub fn with_spawner(spawner: Spawner<L>, timeout: Duration) -> Self {
        Self {
            spawner,
            program: "git".to_string(),
            timeout,
        }
    }

    fn request<I, S>(&self, cwd: Option<&Path>, args: I) -> SpawnRequest
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut request = SpawnRequest::new(&self.program)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .timeout(self.timeout);
        if let Some(cwd) = cwd {
            request = request.cwd(cwd);
        }
        request
    }

    async fn git<I, S>(&self, cwd: Option<&Path>, args: I) -> Result<SpawnResult, VcsError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = self.request(cwd, args);
        let result = self.spawner.spawn_safe(&request).await;
        if result.ok {
            Ok(result)
        } else {
            Err(VcsError::from_spawn(&request, &result))
        }
    }
}

#[async_trait]
impl<L: Launcher> SourceControl for GitCli<L> {
    async fn clone_shallow(&self, repository: &str, dest: &Path) -> Result<(), VcsError> {
        info!("Cloning {} into {}", repository, dest.display());
        let dest = dest.to_string_lossy().into_owned();
        self.git(
            None,
            [
                "clone",
                "--depth",
                "1",
                "--single-branch",
                "--no-tags",
                repository,
                dest.as_str(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn fetch_tag(&self, checkout: &Path, tag: &str) -> Result<(), VcsError> {
        debug!("Fetching tag {} in {}", tag, checkout.display());
        self.git(
            Some(checkout),
            ["fetch", "--depth", "1", "--no-tags", "origin", "tag", tag],
        )
        .await?;
        self.git(Some(checkout), ["checkout", "--quiet", "--force", "FETCH_HEAD"])
            .await?;
        Ok(())
    }

    async fn metadata(&self, dir: &Path) -> Option<GitMetadata> {
        let sha = self
            .git(Some(dir), ["rev-parse", "HEAD"])
            .await
            .ok()?
            .stdout
            .trim()
            .to_string();
        if sha.is_empty() {
            return None;
        }

        let branch = self
            .git(Some(dir), ["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .ok()
            .map(|result| result.stdout.trim().to_string())
            .filter(|branch| !branch.is_empty() && branch != "HEAD");

        Some(GitMetadata { sha, branch })
    }
}

/// Facts about the run computed once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub cwd: PathBuf,
    pub git: Option<GitMetadata>,
    pub ci: bool,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub async fn detect<S: SourceControl + ?Sized>(cwd: &Path, vcs: &S) -> Self {
        let git = vcs.metadata(cwd).await;
        let ci = is_ci();
        debug!("Run context: git={:?}, ci={}", git, ci);
        Self {
            cwd: cwd.to_path_buf(),
            git,
            ci,
            started_at: Utc::now(),
        }
    }
}

/// True under a CI system that sets `CI` or `GITHUB_ACTIONS`.
pub fn is_ci() -> bool {
    ["CI", "GITHUB_ACTIONS"].iter().any(|key| {
        std::env::var(key)
            .map(|value| !value.is_empty() && value != "0" && value != "false")
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawn::{Exit, OutputCallback};
    use std::sync::Mutex;

    /// Records every git invocation and answers `rev-parse`.
    #[derive(Default)]
    struct RecordingLauncher {
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl Launcher for RecordingLauncher {
        async fn launch(&self, request: &SpawnRequest, _output: Option<&OutputCallback>) -> Exit {
            self.calls.lock().unwrap().push(request.args.clone());
            let stdout = match request.args.as_slice() {
                [cmd, flag, _] if cmd == "rev-parse" && flag == "--abbrev-ref" => "main\n",
                [cmd, _] if cmd == "rev-parse" => "0123456789abcdef\n",
                _ => "",
            };
            Exit {
                exit_code: Some(0),
                stdout: stdout.to_string(),
                ..Default::default()
            }
        }
    }

    struct FailingGit;

    #[async_trait]
    impl Launcher for FailingGit {
        async fn launch(&self, _request: &SpawnRequest, _output: Option<&OutputCallback>) -> Exit {
            Exit {
                exit_code: Some(128),
                stderr: "fatal: couldn't find remote ref v9\n".to_string(),
                ..Default::default()
            }
        }
    }

    #[tokio::test]
    async fn test_fetch_tag_runs_fetch_then_checkout() {
        let git = GitCli::with_spawner(
            Spawner::with_launcher(RecordingLauncher::default()),
            Duration::from_secs(5),
        );
        git.fetch_tag(Path::new("/tmp/x"), "v1.2.3").await.unwrap();

        let calls = git.spawner.launcher().calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0][0], "fetch");
        assert!(calls[0].contains(&"v1.2.3".to_string()));
        assert_eq!(calls[1], vec!["checkout", "--quiet", "--force", "FETCH_HEAD"]);
    }

    #[tokio::test]
    async fn test_metadata() {
        let git = GitCli::with_spawner(
            Spawner::with_launcher(RecordingLauncher::default()),
            Duration::from_secs(5),
        );
        let meta = git.metadata(Path::new(".")).await.unwrap();
        assert_eq!(meta.sha, "0123456789abcdef");
        assert_eq!(meta.short_sha(), "01234567");
        assert_eq!(meta.branch.as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn test_failed_git_is_error() {
        let git = GitCli::with_spawner(Spawner::with_launcher(FailingGit), Duration::from_secs(5));
        let err = git.fetch_tag(Path::new("."), "v9").await.unwrap_err();
        assert_eq!(err.reason, "code 128");
        assert!(err.stderr.contains("couldn't find remote ref"));
        assert!(git.metadata(Path::new(".")).await.is_none());
    }
}
