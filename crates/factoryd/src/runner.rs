//! Execution driver interface and the default agent runner.
//!
//! `AgentRunner` prepares a worktree for the task, runs the configured agent
//! command inside it with a timeout and cancellation, then commits, pushes
//! and opens a pull request for whatever the agent changed.

use async_trait::async_trait;
use factory_core::{AttemptOutcome, FactoryConfig, Id, Project, Run, Task};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::git;
use crate::host::{self, HostError, SourceControlHost};
use crate::storage::Storage;
use crate::worktree::{WorktreeError, WorktreeManager};

/// Interval between heartbeat log messages while a command runs.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for collecting stdout/stderr after the process exits or is killed.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum bytes captured from each of stdout and stderr.
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Lines of stderr quoted in a failed attempt's error.
const ERROR_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("agent command is not configured (set agent_cmd)")]
    AgentNotConfigured,
    #[error("no base branch could be resolved for {0}")]
    NoBaseBranch(String),
    #[error("agent exited with code {code:?}: {tail}")]
    AgentFailed { code: Option<i32>, tail: String },
    #[error("agent timed out after {0}s")]
    TimedOut(u64),
    #[error("attempt cancelled")]
    Cancelled,
    #[error("agent produced no changes")]
    NoChanges,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("worktree error: {0}")]
    Worktree(#[from] WorktreeError),
    #[error("host error: {0}")]
    Host(#[from] HostError),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

// --- Command execution ---

/// A shell command to run in a directory.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub command: String,
    pub dir: PathBuf,
    pub env: Vec<(String, String)>,
    /// `None` waits forever.
    pub timeout: Option<Duration>,
}

#[derive(Debug)]
pub enum ProcessEnd {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

#[derive(Debug)]
pub struct CommandOutput {
    pub end: ProcessEnd,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        matches!(&self.end, ProcessEnd::Exited(status) if status.success())
    }

    pub fn exit_code(&self) -> Option<i32> {
        match &self.end {
            ProcessEnd::Exited(status) => status.code(),
            _ => None,
        }
    }

    /// Last lines of stderr, falling back to stdout.
    pub fn tail(&self, lines: usize) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let all: Vec<&str> = source.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }
}

async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            warn!(max_bytes, "output exceeded limit, truncating");
            // Drain so the child never blocks on a full pipe.
            while reader.read(&mut chunk).await? > 0 {}
            break;
        }

        buf.extend_from_slice(&chunk[..n.min(remaining)]);
    }

    Ok(buf)
}

async fn collect(task: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>, stream: &str) -> String {
    let Some(task) = task else {
        return String::new();
    };
    match timeout(IO_CAPTURE_TIMEOUT, task).await {
        Ok(Ok(Ok(buf))) => String::from_utf8_lossy(&buf).into_owned(),
        Ok(Ok(Err(err))) => {
            warn!(stream, error = %err, "output capture failed");
            String::new()
        }
        Ok(Err(err)) => {
            warn!(stream, error = %err, "output capture task panicked");
            String::new()
        }
        Err(_) => {
            warn!(stream, "output capture timed out");
            String::new()
        }
    }
}

/// Run `spec.command` through `sh -c`, killing it on timeout or cancellation.
pub async fn run_command(spec: &CommandSpec, cancel: &CancellationToken) -> Result<CommandOutput> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&spec.command)
        .current_dir(&spec.dir)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(command = %spec.command, dir = %spec.dir.display(), "spawning command");
    let mut child = cmd.spawn()?;

    let stdout_task = child
        .stdout
        .take()
        .map(|stdout| tokio::spawn(read_bounded(stdout, MAX_OUTPUT_BYTES)));
    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(read_bounded(stderr, MAX_OUTPUT_BYTES)));

    let started = Instant::now();
    let end = loop {
        let elapsed = started.elapsed();
        if let Some(limit) = spec.timeout {
            if elapsed >= limit {
                warn!(command = %spec.command, timeout_sec = limit.as_secs(), "command timed out; killing");
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "failed to kill timed-out process");
                }
                let _ = child.wait().await;
                break ProcessEnd::TimedOut;
            }
        }

        let remaining = spec
            .timeout
            .map_or(Duration::MAX, |limit| limit.saturating_sub(elapsed));
        let sleep_for = HEARTBEAT_INTERVAL.min(remaining);

        tokio::select! {
            result = child.wait() => break ProcessEnd::Exited(result?),
            () = cancel.cancelled() => {
                info!(command = %spec.command, "cancellation requested; killing process");
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "failed to kill cancelled process");
                }
                let _ = child.wait().await;
                break ProcessEnd::Cancelled;
            }
            () = tokio::time::sleep(sleep_for) => {
                info!(
                    command = %spec.command,
                    elapsed_sec = started.elapsed().as_secs(),
                    dir = %spec.dir.display(),
                    "command still running"
                );
            }
        }
    };

    let stdout = collect(stdout_task, "stdout").await;
    let stderr = collect(stderr_task, "stderr").await;

    Ok(CommandOutput {
        end,
        stdout,
        stderr,
        duration: started.elapsed(),
    })
}

// --- Execution driver ---

/// Everything a driver needs to execute one attempt.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub project: Project,
    pub run: Run,
    pub task: Task,
    pub attempt_id: Id,
    /// Fires when the attempt is cancelled.
    pub cancel: CancellationToken,
    pub workspace: WorkspaceRecorder,
}

/// Persists an attempt's branch and worktree the moment they exist, so a
/// cancelled or orphaned attempt still leaves GC something to reclaim.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceRecorder {
    target: Option<(Storage, Id)>,
}

impl WorkspaceRecorder {
    pub fn new(storage: Storage, attempt_id: Id) -> Self {
        Self {
            target: Some((storage, attempt_id)),
        }
    }

    /// Best effort; the final outcome carries the same values.
    pub async fn record(&self, branch: &str, worktree: &Path) {
        let Some((storage, attempt_id)) = &self.target else {
            return;
        };
        let path = worktree.to_string_lossy();
        if let Err(err) = storage.set_attempt_workspace(attempt_id, branch, &path).await {
            warn!(attempt_id = %attempt_id, error = %err, "failed to record attempt workspace");
        }
    }
}

/// Executes one task attempt to completion.
#[async_trait]
pub trait ExecutionDriver: Send + Sync {
    async fn run_task_attempt(&self, ctx: AttemptContext) -> Result<AttemptOutcome>;
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> git::Result<T> + Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}

/// Default driver: worktree + agent command + push + pull request.
pub struct AgentRunner {
    config: Arc<FactoryConfig>,
    worktrees: Arc<dyn WorktreeManager>,
    host: Arc<dyn SourceControlHost>,
}

impl std::fmt::Debug for AgentRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRunner")
            .field("agent_cmd", &self.config.agent_cmd)
            .finish_non_exhaustive()
    }
}

impl AgentRunner {
    pub fn new(
        config: Arc<FactoryConfig>,
        worktrees: Arc<dyn WorktreeManager>,
        host: Arc<dyn SourceControlHost>,
    ) -> Self {
        Self {
            config,
            worktrees,
            host,
        }
    }

    async fn resolve_base(&self, project: &Project, repo: &Path) -> Result<String> {
        if let Some(base) = &project.base_branch {
            return Ok(base.clone());
        }
        let (repo_buf, remote) = (repo.to_path_buf(), self.config.remote.clone());
        blocking(move || git::detect_default_branch(&repo_buf, &remote))
            .await?
            .ok_or_else(|| RunnerError::NoBaseBranch(repo.display().to_string()))
    }

    fn agent_env(ctx: &AttemptContext, base: &str, branch: &str) -> Vec<(String, String)> {
        [
            ("FACTORY_PROJECT_ID", ctx.project.id.to_string()),
            ("FACTORY_RUN_ID", ctx.run.id.to_string()),
            ("FACTORY_ATTEMPT_ID", ctx.attempt_id.to_string()),
            ("FACTORY_TASK_ID", ctx.task.id.to_string()),
            ("FACTORY_TASK_TITLE", ctx.task.title.clone()),
            ("FACTORY_TASK_DESCRIPTION", ctx.task.description.clone()),
            ("FACTORY_BASE_BRANCH", base.to_string()),
            ("FACTORY_BRANCH", branch.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    /// Agent run through pull request. Fills `outcome` as it goes so a
    /// failure still reports the branch and worktree for cleanup.
    async fn drive(
        &self,
        ctx: &AttemptContext,
        agent_cmd: &str,
        worktree: &Path,
        base: &str,
        branch: &str,
        outcome: &mut AttemptOutcome,
    ) -> Result<()> {
        let dir = worktree.to_path_buf();
        let base_commit = blocking(move || git::rev_parse(&dir, "HEAD")).await?;
        outcome.base_commit = Some(base_commit.clone());

        let spec = CommandSpec {
            command: agent_cmd.to_string(),
            dir: worktree.to_path_buf(),
            env: Self::agent_env(ctx, base, branch),
            timeout: (self.config.agent_timeout_sec > 0)
                .then(|| Duration::from_secs(self.config.agent_timeout_sec)),
        };
        let output = run_command(&spec, &ctx.cancel).await?;
        outcome.exit_code = output.exit_code();
        info!(
            attempt_id = %ctx.attempt_id,
            exit_code = ?output.exit_code(),
            duration_ms = output.duration.as_millis() as u64,
            "agent finished"
        );
        match output.end {
            ProcessEnd::Cancelled => return Err(RunnerError::Cancelled),
            ProcessEnd::TimedOut => return Err(RunnerError::TimedOut(self.config.agent_timeout_sec)),
            ProcessEnd::Exited(_) if !output.success() => {
                return Err(RunnerError::AgentFailed {
                    code: output.exit_code(),
                    tail: output.tail(ERROR_TAIL_LINES),
                });
            }
            ProcessEnd::Exited(_) => {}
        }

        let (dir, message) = (worktree.to_path_buf(), format!("factory: {}", ctx.task.title));
        blocking(move || git::commit_all(&dir, &message)).await?;
        let (dir, from) = (worktree.to_path_buf(), base_commit);
        let ahead = blocking(move || git::commits_ahead(&dir, &from, "HEAD")).await?;
        if ahead == 0 {
            return Err(RunnerError::NoChanges);
        }
        let dir = worktree.to_path_buf();
        outcome.head_commit = Some(blocking(move || git::rev_parse(&dir, "HEAD")).await?);

        if self.config.create_pull_requests {
            let (dir, remote, name) = (
                worktree.to_path_buf(),
                self.config.remote.clone(),
                branch.to_string(),
            );
            blocking(move || git::push_branch(&dir, &remote, &name)).await?;

            let url = self
                .host
                .create_pull_request(worktree, &ctx.task.title, &ctx.task.description, branch, base)
                .await?;
            outcome.pr_number = host::parse_pr_url(&url).map(|pr| pr.number);
            outcome.pr_url = Some(url);
        }

        Ok(())
    }
}

#[async_trait]
impl ExecutionDriver for AgentRunner {
    async fn run_task_attempt(&self, ctx: AttemptContext) -> Result<AttemptOutcome> {
        let agent_cmd = self
            .config
            .agent_cmd
            .clone()
            .ok_or(RunnerError::AgentNotConfigured)?;
        let repo = PathBuf::from(&ctx.project.repo_path);
        let base = self.resolve_base(&ctx.project, &repo).await?;
        let branch = git::branch_for_attempt(
            &self.config.branch_prefix,
            &ctx.task.title,
            ctx.attempt_id.as_ref(),
        );
        let worktree = git::worktree_path_for(&self.config.worktree_root(&repo), &branch);

        self.worktrees
            .create_worktree(&repo, &worktree, &branch, &base)
            .await?;
        ctx.workspace.record(&branch, &worktree).await;
        info!(
            attempt_id = %ctx.attempt_id,
            branch = %branch,
            worktree = %worktree.display(),
            "worktree ready"
        );

        let mut outcome = AttemptOutcome {
            branch: Some(branch.clone()),
            worktree_path: Some(worktree.to_string_lossy().to_string()),
            ..AttemptOutcome::default()
        };
        match self
            .drive(&ctx, &agent_cmd, &worktree, &base, &branch, &mut outcome)
            .await
        {
            Ok(()) => outcome.success = true,
            Err(err) => {
                warn!(attempt_id = %ctx.attempt_id, error = %err, "attempt failed");
                outcome.success = false;
                outcome.error = Some(err.to_string());
            }
        }
        Ok(outcome)
    }
}
