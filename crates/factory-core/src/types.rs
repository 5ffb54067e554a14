//! Core types for the factory engine.
//!
//! Runs, attempts and the records hanging off them. Status strings are the
//! persisted representation, so `as_str`/`parse` must stay in sync with the
//! schema in `migrations/`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for projects, tasks, runs, attempts, events, and artifacts.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// How a run selects its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Every task sitting in a board column.
    Column,
    /// An explicit list of task ids.
    Selection,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Column => "column",
            Self::Selection => "selection",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "column" => Some(Self::Column),
            "selection" => Some(Self::Selection),
            _ => None,
        }
    }
}

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// `pending` and `running` runs count as the project's active run.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

/// Attempt lifecycle status.
///
/// `queued -> running -> {completed|failed}`, `queued -> stopped`,
/// `running -> stopped`. Only `running` occupies a concurrency slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Queued,
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Waiting for a slot.
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Queued | Self::Pending)
    }

    pub fn occupies_slot(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub const TERMINAL: [AttemptStatus; 3] = [Self::Completed, Self::Failed, Self::Stopped];
}

/// Outcome stored on an autofix record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutofixOutcome {
    Success,
    Failed,
}

impl AutofixOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Remediation strategy used by the auto-fix loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutofixStrategy {
    /// Re-run the failed checks on the host.
    #[default]
    Diagnostic,
    /// Checkout, AI fix, test, commit, push.
    AiFix,
}

impl AutofixStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Diagnostic => "diagnostic",
            Self::AiFix => "ai_fix",
        }
    }
}

// --- Core Types ---

/// A repository the factory dispatches work against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Id,
    pub name: String,
    /// Absolute path of the primary checkout.
    pub repo_path: String,
    /// Base branch override; detected when `None`.
    pub base_branch: Option<String>,
    /// `owner/repo` slug on the source-control host.
    pub github_repo: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A unit of work on the project board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Id,
    pub project_id: Id,
    pub title: String,
    pub description: String,
    /// Board column the task currently sits in.
    pub column_name: String,
    pub created_at: DateTime<Utc>,
}

/// Which tasks a run covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TaskSelector {
    Column(String),
    Selection(Vec<Id>),
}

impl TaskSelector {
    pub fn mode(&self) -> RunMode {
        match self {
            Self::Column(_) => RunMode::Column,
            Self::Selection(_) => RunMode::Selection,
        }
    }
}

/// One execution campaign over a task set for a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Id,
    pub project_id: Id,
    pub mode: RunMode,
    pub max_parallel: u32,
    pub selector: TaskSelector,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// One execution of one task within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub id: Id,
    pub task_id: Id,
    pub run_id: Id,
    pub status: AttemptStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub branch: Option<String>,
    pub base_commit: Option<String>,
    pub head_commit: Option<String>,
    pub worktree_path: Option<String>,
    pub exit_code: Option<i32>,
    pub pr_url: Option<String>,
    pub pr_number: Option<i64>,
    pub error: Option<String>,
    pub worktree_cleaned_at: Option<DateTime<Utc>>,
}

impl Attempt {
    /// A fresh `queued` attempt for a task.
    pub fn queued(run_id: &Id, task_id: &Id) -> Self {
        Self {
            id: Id::new(),
            task_id: task_id.clone(),
            run_id: run_id.clone(),
            status: AttemptStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            branch: None,
            base_commit: None,
            head_commit: None,
            worktree_path: None,
            exit_code: None,
            pr_url: None,
            pr_number: None,
            error: None,
            worktree_cleaned_at: None,
        }
    }

    /// Duration in seconds, if the attempt both started and finished.
    pub fn duration_secs(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) if end >= start => {
                Some((end - start).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }
}

/// What the execution driver reports back for one attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttemptOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub branch: Option<String>,
    pub base_commit: Option<String>,
    pub head_commit: Option<String>,
    pub worktree_path: Option<String>,
    pub pr_url: Option<String>,
    pub pr_number: Option<i64>,
}

impl AttemptOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Anti-loop guard row: remediation was attempted for this PR in this run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutofixRecord {
    pub id: Id,
    pub run_id: Id,
    pub pr_url: String,
    pub outcome: AutofixOutcome,
    pub category: String,
    pub strategy: AutofixStrategy,
    pub report_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Id,
    pub run_id: Id,
    pub attempt_id: Option<Id>,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload_json: String,
}

/// Stored file reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Id,
    pub run_id: Id,
    pub kind: String,
    pub path: String,
    pub checksum: Option<String>,
}
