//! Source-control host interface and the `gh` CLI implementation.
//!
//! Pull requests, check runs and workflow logs all go through this trait so
//! the runner and the auto-fix loop can be tested without a network.

use async_trait::async_trait;
use factory_core::ci::{CheckRun, CheckRunStatus};
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to run gh: {0}")]
    Io(#[from] std::io::Error),
    #[error("gh {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("invalid gh output: {0}")]
    Parse(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HostError>;

/// Source-control host operations used by the factory.
#[async_trait]
pub trait SourceControlHost: Send + Sync {
    /// Open a pull request from `head` into `base` and return its URL.
    async fn create_pull_request(
        &self,
        repo: &Path,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> Result<String>;

    /// Check runs reported for commit `sha` of `owner/repo`.
    async fn list_check_runs(&self, owner: &str, repo: &str, sha: &str) -> Result<Vec<CheckRun>>;

    /// Current head commit of the pull request.
    async fn pr_head_sha(&self, repo: &Path, pr_url: &str) -> Result<String>;

    /// Concatenated logs of the failed workflow runs on the pull request head.
    async fn failed_check_logs(&self, repo: &Path, pr_url: &str) -> Result<String>;

    /// Re-run the failed workflow runs on the pull request head.
    async fn rerun_failed_checks(&self, repo: &Path, pr_url: &str) -> Result<()>;
}

/// A parsed `https://github.com/<owner>/<repo>/pull/<n>` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrRef {
    pub owner: String,
    pub repo: String,
    pub number: i64,
}

pub fn parse_pr_url(url: &str) -> Option<PrRef> {
    let path = url
        .trim()
        .trim_end_matches('/')
        .split_once("://")
        .map_or(url, |(_, rest)| rest);
    let mut parts = path.split('/');
    let _host = parts.next()?;
    let owner = parts.next()?;
    let repo = parts.next()?;
    if parts.next()? != "pull" {
        return None;
    }
    let number = parts.next()?.parse().ok()?;
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some(PrRef {
        owner: owner.to_string(),
        repo: repo.to_string(),
        number,
    })
}

/// `gh` CLI backed host.
#[derive(Debug, Default, Clone, Copy)]
pub struct GhCli;

#[derive(Debug, Deserialize)]
struct ApiCheckRun {
    name: String,
    status: String,
    conclusion: Option<String>,
}

/// Parse `gh api --paginate --jq '.check_runs[]'` output: one JSON object
/// per check run, across every page.
fn parse_check_run_stream(output: &str) -> Result<Vec<CheckRun>> {
    serde_json::Deserializer::from_str(output)
        .into_iter::<ApiCheckRun>()
        .map(|run| Ok(run?.into_check_run()))
        .collect()
}

#[derive(Debug, Deserialize)]
struct WorkflowRun {
    #[serde(rename = "databaseId")]
    database_id: u64,
}

impl ApiCheckRun {
    fn into_check_run(self) -> CheckRun {
        let status = match self.status.as_str() {
            "completed" => CheckRunStatus::Completed,
            "in_progress" => CheckRunStatus::InProgress,
            // queued, waiting, requested, pending
            _ => CheckRunStatus::Queued,
        };
        CheckRun {
            name: self.name,
            status,
            conclusion: self.conclusion,
        }
    }
}

async fn gh(dir: Option<&Path>, args: &[&str]) -> Result<String> {
    let mut cmd = tokio::process::Command::new("gh");
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    debug!(args = ?args, "running gh");

    let output = cmd.output().await?;
    if !output.status.success() {
        return Err(HostError::CommandFailed {
            command: args.iter().take(2).copied().collect::<Vec<_>>().join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    String::from_utf8(output.stdout)
        .map(|s| s.trim().to_string())
        .map_err(|_| HostError::Parse("invalid utf-8".to_string()))
}

impl GhCli {
    async fn failed_runs(&self, repo: &Path, pr_url: &str) -> Result<Vec<u64>> {
        let sha = self.pr_head_sha(repo, pr_url).await?;
        let json = gh(
            Some(repo),
            &[
                "run", "list", "--commit", &sha, "--status", "failure", "--limit", "100", "--json",
                "databaseId",
            ],
        )
        .await?;
        let runs: Vec<WorkflowRun> = serde_json::from_str(&json)?;
        Ok(runs.into_iter().map(|r| r.database_id).collect())
    }
}

#[async_trait]
impl SourceControlHost for GhCli {
    async fn create_pull_request(
        &self,
        repo: &Path,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> Result<String> {
        let stdout = gh(
            Some(repo),
            &["pr", "create", "--title", title, "--body", body, "--head", head, "--base", base],
        )
        .await?;
        stdout
            .lines()
            .rev()
            .find(|line| line.starts_with("http"))
            .map(str::to_string)
            .ok_or_else(|| HostError::Parse(format!("no pull request url in: {stdout}")))
    }

    async fn list_check_runs(&self, owner: &str, repo: &str, sha: &str) -> Result<Vec<CheckRun>> {
        let endpoint = format!("repos/{owner}/{repo}/commits/{sha}/check-runs");
        let output = gh(
            None,
            &[
                "api",
                "--paginate",
                "-X",
                "GET",
                "-f",
                "per_page=100",
                "--jq",
                ".check_runs[]",
                &endpoint,
            ],
        )
        .await?;
        parse_check_run_stream(&output)
    }

    async fn pr_head_sha(&self, repo: &Path, pr_url: &str) -> Result<String> {
        let sha = gh(
            Some(repo),
            &["pr", "view", pr_url, "--json", "headRefOid", "-q", ".headRefOid"],
        )
        .await?;
        if sha.is_empty() {
            return Err(HostError::Parse(format!("empty head sha for {pr_url}")));
        }
        Ok(sha)
    }

    async fn failed_check_logs(&self, repo: &Path, pr_url: &str) -> Result<String> {
        let mut logs = String::new();
        for run_id in self.failed_runs(repo, pr_url).await? {
            let id = run_id.to_string();
            let log = gh(Some(repo), &["run", "view", &id, "--log-failed"]).await?;
            logs.push_str(&format!("=== workflow run {id} ===\n{log}\n"));
        }
        Ok(logs)
    }

    async fn rerun_failed_checks(&self, repo: &Path, pr_url: &str) -> Result<()> {
        for run_id in self.failed_runs(repo, pr_url).await? {
            gh(Some(repo), &["run", "rerun", &run_id.to_string(), "--failed"]).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_github_pr_url() {
        let pr = parse_pr_url("https://github.com/acme/widgets/pull/42").unwrap();
        assert_eq!(pr.owner, "acme");
        assert_eq!(pr.repo, "widgets");
        assert_eq!(pr.number, 42);
    }

    #[test]
    fn rejects_non_pr_urls() {
        assert!(parse_pr_url("https://github.com/acme/widgets/issues/42").is_none());
        assert!(parse_pr_url("https://github.com/acme").is_none());
        assert!(parse_pr_url("https://github.com/acme/widgets/pull/abc").is_none());
    }

    #[test]
    fn api_check_run_status_mapping() {
        let output = r#"{"name":"build","status":"completed","conclusion":"failure"}
{"name":"lint","status":"in_progress","conclusion":null}
{"name":"e2e","status":"waiting","conclusion":null}"#;
        let runs = parse_check_run_stream(output).unwrap();
        assert_eq!(runs[0], CheckRun::completed("build", "failure"));
        assert_eq!(runs[1].status, CheckRunStatus::InProgress);
        assert_eq!(runs[2].status, CheckRunStatus::Queued);
    }

    #[test]
    fn failure_past_the_first_page_is_kept() {
        let mut output: String = (0..100)
            .map(|i| format!("{{\"name\":\"job-{i}\",\"status\":\"completed\",\"conclusion\":\"success\"}}\n"))
            .collect();
        output.push_str(r#"{"name":"late","status":"completed","conclusion":"failure","id":101}"#);

        let runs = parse_check_run_stream(&output).unwrap();
        assert_eq!(runs.len(), 101);
        assert_eq!(
            factory_core::ci::normalize_check_runs(&runs),
            factory_core::ci::CiStatus::Failed
        );
    }

    #[test]
    fn empty_check_run_stream_is_no_runs() {
        assert!(parse_check_run_stream("").unwrap().is_empty());
        assert!(matches!(
            parse_check_run_stream("{\"name\":"),
            Err(HostError::Json(_))
        ));
    }
}
