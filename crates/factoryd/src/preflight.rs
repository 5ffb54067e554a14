//! Readiness checks gating a new run.
//!
//! Checks run in a fixed order and stop at the first failure. A check that
//! errors (as opposed to failing) reports `PREFLIGHT_FAILED`.

use async_trait::async_trait;
use factory_core::config::validate_max_parallel;
use factory_core::{ErrorCode, Project};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tracing::{debug, info};

use crate::git;
use crate::storage::Storage;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("probe task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("{0}")]
    Other(String),
}

pub type ProbeResult<T> = std::result::Result<T, ProbeError>;

/// Repository and host probes used by preflight.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn working_tree_clean(&self, repo: &Path) -> ProbeResult<bool>;

    async fn default_branch(&self, repo: &Path, remote: &str) -> ProbeResult<Option<String>>;

    /// True if the source-control CLI has a logged-in session.
    async fn host_authenticated(&self) -> ProbeResult<bool>;

    async fn push_permitted(&self, repo: &Path, remote: &str) -> ProbeResult<bool>;
}

/// Spend gate consulted before a run starts.
#[async_trait]
pub trait BudgetService: Send + Sync {
    async fn is_within_budget(&self, project: &Project) -> ProbeResult<bool>;
}

/// Budget answer fixed by configuration (`budget_ok`).
#[derive(Debug, Clone, Copy)]
pub struct StaticBudget(pub bool);

#[async_trait]
impl BudgetService for StaticBudget {
    async fn is_within_budget(&self, _project: &Project) -> ProbeResult<bool> {
        Ok(self.0)
    }
}

/// `git` and `gh` backed probe.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitProbe;

async fn blocking<T, F>(f: F) -> ProbeResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> git::Result<T> + Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}

#[async_trait]
impl ReadinessProbe for GitProbe {
    async fn working_tree_clean(&self, repo: &Path) -> ProbeResult<bool> {
        let repo = repo.to_path_buf();
        blocking(move || git::is_working_tree_clean(&repo)).await
    }

    async fn default_branch(&self, repo: &Path, remote: &str) -> ProbeResult<Option<String>> {
        let (repo, remote) = (repo.to_path_buf(), remote.to_string());
        blocking(move || git::detect_default_branch(&repo, &remote)).await
    }

    async fn host_authenticated(&self) -> ProbeResult<bool> {
        let status = tokio::process::Command::new("gh")
            .args(["auth", "status"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        Ok(status.success())
    }

    async fn push_permitted(&self, repo: &Path, remote: &str) -> ProbeResult<bool> {
        let (repo, remote) = (repo.to_path_buf(), remote.to_string());
        blocking(move || git::can_push(&repo, &remote)).await
    }
}

/// One evaluated check.
#[derive(Debug, Clone, Serialize)]
pub struct PreflightCheck {
    pub name: &'static str,
    pub passed: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreflightResult {
    pub ok: bool,
    /// Checks evaluated up to and including the first failure.
    pub checks: Vec<PreflightCheck>,
    pub error_code: Option<ErrorCode>,
}

impl PreflightResult {
    /// Message of the failing check, if any.
    pub fn failure_message(&self) -> Option<&str> {
        self.checks
            .iter()
            .find(|c| !c.passed)
            .map(|c| c.message.as_str())
    }
}

/// Inputs to a preflight pass.
#[derive(Debug)]
pub struct PreflightRequest<'a> {
    pub project: &'a Project,
    pub max_parallel: u32,
    pub remote: &'a str,
}

/// A check's verdict: pass/fail with a message, or an error.
type Verdict = ProbeResult<(bool, String)>;

fn verdict(ok: bool, pass: &str, fail: impl Into<String>) -> (bool, String) {
    if ok {
        (true, pass.to_string())
    } else {
        (false, fail.into())
    }
}

#[derive(Debug, Clone, Copy)]
enum Check {
    RepoClean,
    DefaultBranch,
    HostAuth,
    PushPermitted,
    Budget,
    NoActiveRun,
    MaxParallel,
}

impl Check {
    const ORDER: [Check; 7] = [
        Self::RepoClean,
        Self::DefaultBranch,
        Self::HostAuth,
        Self::PushPermitted,
        Self::Budget,
        Self::NoActiveRun,
        Self::MaxParallel,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::RepoClean => "repo_clean",
            Self::DefaultBranch => "default_branch",
            Self::HostAuth => "cli_authenticated",
            Self::PushPermitted => "push_permitted",
            Self::Budget => "budget",
            Self::NoActiveRun => "no_active_run",
            Self::MaxParallel => "max_parallel",
        }
    }

    fn failure_code(self) -> ErrorCode {
        match self {
            Self::RepoClean => ErrorCode::RepoDirty,
            Self::DefaultBranch => ErrorCode::NoDefaultBranch,
            Self::HostAuth => ErrorCode::CliUnauthenticated,
            Self::PushPermitted => ErrorCode::PermissionDenied,
            Self::Budget => ErrorCode::BudgetExceeded,
            Self::NoActiveRun => ErrorCode::AlreadyRunning,
            Self::MaxParallel => ErrorCode::InvalidConfig,
        }
    }
}

/// Preflight collaborators.
#[derive(Clone, Copy)]
pub struct Preflight<'a> {
    pub probe: &'a dyn ReadinessProbe,
    pub budget: &'a dyn BudgetService,
    pub storage: &'a Storage,
}

impl std::fmt::Debug for Preflight<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preflight").finish_non_exhaustive()
    }
}

impl Preflight<'_> {
    async fn evaluate(&self, check: Check, req: &PreflightRequest<'_>, repo: &Path) -> Verdict {
        match check {
            Check::RepoClean => {
                let clean = self.probe.working_tree_clean(repo).await?;
                Ok(verdict(
                    clean,
                    "working tree is clean",
                    format!("{} has uncommitted changes", repo.display()),
                ))
            }
            Check::DefaultBranch => {
                if let Some(base) = &req.project.base_branch {
                    return Ok((true, format!("using configured base branch {base}")));
                }
                Ok(match self.probe.default_branch(repo, req.remote).await? {
                    Some(branch) => (true, format!("default branch is {branch}")),
                    None => (false, "no default branch could be resolved".to_string()),
                })
            }
            Check::HostAuth => {
                let authed = self.probe.host_authenticated().await?;
                Ok(verdict(authed, "gh is authenticated", "gh is not logged in; run `gh auth login`"))
            }
            Check::PushPermitted => {
                let allowed = self.probe.push_permitted(repo, req.remote).await?;
                Ok(verdict(
                    allowed,
                    "push permitted",
                    format!("push to {} was rejected", req.remote),
                ))
            }
            Check::Budget => {
                let ok = self.budget.is_within_budget(req.project).await?;
                Ok(verdict(ok, "within budget", "project budget exceeded"))
            }
            Check::NoActiveRun => {
                let active = self
                    .storage
                    .active_run_for_project(&req.project.id)
                    .await
                    .map_err(|e| ProbeError::Other(e.to_string()))?;
                Ok(match active {
                    Some(run) => (false, format!("run {} is already active", run.id)),
                    None => (true, "no active run".to_string()),
                })
            }
            Check::MaxParallel => Ok(match validate_max_parallel(req.max_parallel) {
                Ok(()) => (true, format!("max_parallel = {}", req.max_parallel)),
                Err(message) => (false, message),
            }),
        }
    }

    /// Run every check in order, stopping at the first failure or error.
    pub async fn run(&self, req: &PreflightRequest<'_>) -> PreflightResult {
        let repo = PathBuf::from(&req.project.repo_path);
        let mut checks = Vec::new();

        for check in Check::ORDER {
            let (passed, message, code) = match self.evaluate(check, req, &repo).await {
                Ok((true, message)) => (true, message, None),
                Ok((false, message)) => (false, message, Some(check.failure_code())),
                Err(err) => (
                    false,
                    format!("check errored: {err}"),
                    Some(ErrorCode::PreflightFailed),
                ),
            };
            debug!(check = check.name(), passed, message = %message, "preflight check");
            checks.push(PreflightCheck {
                name: check.name(),
                passed,
                message,
            });
            if let Some(code) = code {
                info!(project_id = %req.project.id, check = check.name(), code = code.as_str(), "preflight failed");
                return PreflightResult {
                    ok: false,
                    checks,
                    error_code: Some(code),
                };
            }
        }

        PreflightResult {
            ok: true,
            checks,
            error_code: None,
        }
    }
}
