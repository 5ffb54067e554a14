//! CI auto-fix loop.
//!
//! For each pull request opened by a run, remediation is attempted at most
//! once: only when CI is failing and no autofix record exists yet. The
//! record and a report artifact are written whatever the remediation result.

use async_trait::async_trait;
use chrono::Utc;
use factory_core::artifacts::{sanitize_filename, write_artifact};
use factory_core::ci::{classify_failure, normalize_fetch, truncate_log, CiStatus, FailureCategory};
use factory_core::events::{AutofixRecordedPayload, EventPayload};
use factory_core::{
    Attempt, AttemptStatus, AutofixOutcome, AutofixRecord, AutofixStrategy, FactoryConfig, Id,
    Project,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::factory::Factory;
use crate::git;
use crate::host::{self, HostError};
use crate::runner::{self, CommandSpec, ProcessEnd, RunnerError};

#[derive(Debug, Error)]
pub enum AutofixError {
    #[error("host error: {0}")]
    Host(#[from] HostError),
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("command error: {0}")]
    Runner(#[from] RunnerError),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("autofix_fix_cmd is not configured")]
    FixerNotConfigured,
    #[error("fix command failed: {0}")]
    FixFailed(String),
    #[error("tests failed after fix")]
    TestsFailed,
    #[error("fix produced no changes")]
    NoChanges,
    #[error("attempt has no branch to fix")]
    NoBranch,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AutofixError>;

/// Applies and verifies a code fix inside a checkout.
#[async_trait]
pub trait CodeFixer: Send + Sync {
    async fn fix(&self, worktree: &Path, failure_log: &str, category: FailureCategory) -> Result<()>;

    /// True if the checkout passes its tests.
    async fn test(&self, worktree: &Path) -> Result<bool>;
}

/// Shell-command fixer driven by `autofix_fix_cmd` and `autofix_test_cmd`.
///
/// The fix command sees `FACTORY_FAILURE_CATEGORY` and
/// `FACTORY_FAILURE_LOG_FILE`.
#[derive(Debug, Clone, Default)]
pub struct CommandFixer {
    fix_cmd: Option<String>,
    test_cmd: Option<String>,
    timeout: Option<Duration>,
}

impl CommandFixer {
    pub fn new(fix_cmd: Option<String>, test_cmd: Option<String>, timeout: Option<Duration>) -> Self {
        Self {
            fix_cmd,
            test_cmd,
            timeout,
        }
    }

    pub fn from_config(config: &FactoryConfig) -> Self {
        Self::new(
            config.autofix_fix_cmd.clone(),
            config.autofix_test_cmd.clone(),
            (config.agent_timeout_sec > 0).then(|| Duration::from_secs(config.agent_timeout_sec)),
        )
    }
}

#[async_trait]
impl CodeFixer for CommandFixer {
    async fn fix(&self, worktree: &Path, failure_log: &str, category: FailureCategory) -> Result<()> {
        let command = self.fix_cmd.clone().ok_or(AutofixError::FixerNotConfigured)?;
        let log_file = std::env::temp_dir().join(format!("factory-failure-{}.log", Id::new()));
        std::fs::write(&log_file, failure_log)?;

        let spec = CommandSpec {
            command,
            dir: worktree.to_path_buf(),
            env: vec![
                ("FACTORY_FAILURE_CATEGORY".to_string(), category.as_str().to_string()),
                (
                    "FACTORY_FAILURE_LOG_FILE".to_string(),
                    log_file.to_string_lossy().to_string(),
                ),
            ],
            timeout: self.timeout,
        };
        let output = runner::run_command(&spec, &CancellationToken::new()).await;
        if let Err(err) = std::fs::remove_file(&log_file) {
            debug!(path = %log_file.display(), error = %err, "failed to remove failure log");
        }
        let output = output?;
        match output.end {
            ProcessEnd::Exited(_) if output.success() => Ok(()),
            ProcessEnd::TimedOut => Err(AutofixError::FixFailed("timed out".to_string())),
            _ => Err(AutofixError::FixFailed(output.tail(20))),
        }
    }

    async fn test(&self, worktree: &Path) -> Result<bool> {
        let Some(command) = self.test_cmd.clone() else {
            return Ok(true);
        };
        let spec = CommandSpec {
            command,
            dir: worktree.to_path_buf(),
            env: Vec::new(),
            timeout: self.timeout,
        };
        Ok(runner::run_command(&spec, &CancellationToken::new()).await?.success())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoPr,
    NotFailed,
    AlreadyFixed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AutofixAction {
    Skipped {
        reason: SkipReason,
    },
    Remediated {
        strategy: AutofixStrategy,
        outcome: AutofixOutcome,
        category: FailureCategory,
        report_path: Option<String>,
        error: Option<String>,
    },
    /// The loop could not decide what to do (e.g. storage unavailable).
    Errored {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutofixResult {
    pub attempt_id: Id,
    pub pr_url: Option<String>,
    #[serde(flatten)]
    pub action: AutofixAction,
}

fn owner_and_repo(project: &Project, pr_url: &str) -> Option<(String, String)> {
    if let Some((owner, repo)) = project.github_repo.as_deref().and_then(|s| s.split_once('/')) {
        return Some((owner.to_string(), repo.to_string()));
    }
    host::parse_pr_url(pr_url).map(|pr| (pr.owner, pr.repo))
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> git::Result<T> + Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}

impl Factory {
    /// Run the auto-fix loop over every finished attempt of `run_id`.
    pub async fn run_autofix(&self, run_id: &Id) -> Vec<AutofixResult> {
        if !self.config.autofix_enabled {
            debug!(run_id = %run_id, "autofix disabled");
            return Vec::new();
        }
        let run = match self.storage.get_run(run_id).await {
            Ok(run) => run,
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "autofix: run lookup failed");
                return Vec::new();
            }
        };
        let project = match self.storage.get_project(&run.project_id).await {
            Ok(project) => project,
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "autofix: project lookup failed");
                return Vec::new();
            }
        };
        let attempts = match self.storage.list_attempts(run_id).await {
            Ok(attempts) => attempts,
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "autofix: attempt lookup failed");
                return Vec::new();
            }
        };

        let mut results = Vec::new();
        for attempt in attempts
            .iter()
            .filter(|a| matches!(a.status, AttemptStatus::Completed | AttemptStatus::Failed))
        {
            let action = self.autofix_attempt(&project, attempt).await;
            results.push(AutofixResult {
                attempt_id: attempt.id.clone(),
                pr_url: attempt.pr_url.clone(),
                action,
            });
        }
        results
    }

    async fn ci_status(&self, project: &Project, repo: &Path, pr_url: &str) -> CiStatus {
        let Some((owner, name)) = owner_and_repo(project, pr_url) else {
            warn!(pr_url, "autofix: cannot determine owner/repo");
            return CiStatus::Failed;
        };
        let fetched = match self.collab.host.pr_head_sha(repo, pr_url).await {
            Ok(sha) => self.collab.host.list_check_runs(&owner, &name, &sha).await,
            Err(err) => Err(err),
        };
        if let Err(err) = &fetched {
            warn!(pr_url, error = %err, "autofix: check-run fetch failed; treating as failed");
        }
        normalize_fetch(fetched)
    }

    async fn autofix_attempt(&self, project: &Project, attempt: &Attempt) -> AutofixAction {
        let skip = |reason| AutofixAction::Skipped { reason };
        let Some(pr_url) = attempt.pr_url.as_deref() else {
            return skip(SkipReason::NoPr);
        };
        let repo = PathBuf::from(&project.repo_path);

        let status = self.ci_status(project, &repo, pr_url).await;
        if status != CiStatus::Failed {
            debug!(pr_url, status = status.as_str(), "autofix: CI not failing");
            return skip(SkipReason::NotFailed);
        }
        match self.storage.has_autofix_record(&attempt.run_id, pr_url).await {
            Ok(true) => return skip(SkipReason::AlreadyFixed),
            Ok(false) => {}
            Err(err) => {
                return AutofixAction::Errored {
                    error: err.to_string(),
                }
            }
        }

        let logs = match self.collab.host.failed_check_logs(&repo, pr_url).await {
            Ok(logs) => logs,
            Err(err) => format!("failed to fetch check logs: {err}"),
        };
        let category = classify_failure(&logs);
        let strategy = self.config.autofix_strategy;
        info!(pr_url, category = category.as_str(), strategy = strategy.as_str(), "autofix: remediating");

        let remediation = match strategy {
            AutofixStrategy::Diagnostic => self
                .collab
                .host
                .rerun_failed_checks(&repo, pr_url)
                .await
                .map_err(AutofixError::from),
            AutofixStrategy::AiFix => self.ai_fix(&repo, attempt, &logs, category).await,
        };
        let outcome = if remediation.is_ok() {
            AutofixOutcome::Success
        } else {
            AutofixOutcome::Failed
        };
        let error = remediation.err().map(|e| e.to_string());
        if let Some(error) = &error {
            warn!(pr_url, error = %error, "autofix: remediation failed");
        }

        let report_path = self
            .write_report(&repo, attempt, pr_url, strategy, outcome, category, error.as_deref(), &logs)
            .await;
        self.record(attempt, pr_url, strategy, outcome, category, report_path.clone())
            .await;

        AutofixAction::Remediated {
            strategy,
            outcome,
            category,
            report_path,
            error,
        }
    }

    /// Checkout the PR head, fix, test, commit and push.
    async fn ai_fix(
        &self,
        repo: &Path,
        attempt: &Attempt,
        logs: &str,
        category: FailureCategory,
    ) -> Result<()> {
        let branch = attempt.branch.clone().ok_or(AutofixError::NoBranch)?;
        let path = self
            .config
            .worktree_root(repo)
            .join(format!("autofix-{}", git::sanitize_branch_name(&branch)));
        let remote = self.config.remote.clone();

        let (repo_buf, path_buf, remote_name, name) =
            (repo.to_path_buf(), path.clone(), remote.clone(), branch.clone());
        blocking(move || git::create_detached_worktree(&repo_buf, &path_buf, &remote_name, &name))
            .await?;

        let result = async {
            self.collab.fixer.fix(&path, logs, category).await?;
            if !self.collab.fixer.test(&path).await? {
                return Err(AutofixError::TestsFailed);
            }
            let (dir, message) = (path.clone(), format!("factory: autofix {}", category.as_str()));
            if !blocking(move || git::commit_all(&dir, &message)).await? {
                return Err(AutofixError::NoChanges);
            }
            let dir = path.clone();
            blocking(move || git::push_head(&dir, &remote, &branch)).await
        }
        .await;

        if let Err(err) = self.collab.worktrees.remove_worktree(repo, &path).await {
            warn!(path = %path.display(), error = %err, "autofix: failed to remove fix worktree");
        }
        result
    }

    async fn write_report(
        &self,
        repo: &Path,
        attempt: &Attempt,
        pr_url: &str,
        strategy: AutofixStrategy,
        outcome: AutofixOutcome,
        category: FailureCategory,
        error: Option<&str>,
        logs: &str,
    ) -> Option<String> {
        let report = format!(
            "# Autofix report\n\n\
             - PR: {pr_url}\n\
             - Attempt: {}\n\
             - Strategy: {}\n\
             - Category: {}\n\
             - Outcome: {}\n\
             - Error: {}\n\n\
             ## Failure log\n\n```\n{}\n```\n",
            attempt.id,
            strategy.as_str(),
            category.as_str(),
            outcome.as_str(),
            error.unwrap_or("none"),
            truncate_log(logs, self.config.autofix_log_max_bytes),
        );
        let filename = format!("autofix-{}.md", sanitize_filename(&attempt.id.to_string()));
        let root = self.config.artifacts_root(repo);

        let artifact = match write_artifact(&root, &attempt.run_id, "autofix_report", &filename, report.as_bytes()) {
            Ok(artifact) => artifact,
            Err(err) => {
                warn!(pr_url, error = %err, "autofix: failed to write report");
                return None;
            }
        };
        if let Err(err) = self.storage.insert_artifact(&artifact).await {
            warn!(pr_url, error = %err, "autofix: failed to record report artifact");
        }
        Some(artifact.path)
    }

    async fn record(
        &self,
        attempt: &Attempt,
        pr_url: &str,
        strategy: AutofixStrategy,
        outcome: AutofixOutcome,
        category: FailureCategory,
        report_path: Option<String>,
    ) {
        let record = AutofixRecord {
            id: Id::new(),
            run_id: attempt.run_id.clone(),
            pr_url: pr_url.to_string(),
            outcome,
            category: category.as_str().to_string(),
            strategy,
            report_path,
            created_at: Utc::now(),
        };
        match self.storage.insert_autofix_record(&record).await {
            Ok(true) => {}
            Ok(false) => debug!(pr_url, "autofix: record already present"),
            Err(err) => {
                warn!(pr_url, error = %err, "autofix: failed to persist record");
                return;
            }
        }
        let payload = EventPayload::AutofixRecorded(AutofixRecordedPayload {
            pr_url: pr_url.to_string(),
            strategy,
            outcome,
            category: category.as_str().to_string(),
        });
        if let Err(err) = self.storage.append_event(&attempt.run_id, &payload).await {
            warn!(pr_url, error = %err, "autofix: failed to record event");
        }
    }
}
