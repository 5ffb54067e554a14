//! Error taxonomy shared by every factory component.
//!
//! Raw errors crossing a component boundary are normalized into a
//! [`FactoryFault`] carrying a closed [`ErrorCode`]. Severity and remediation
//! are pure functions of the code.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Upper bound on [`FactoryFault::detail`] in bytes.
pub const MAX_DETAIL_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BudgetExceeded,
    ProviderNotConfigured,
    QueueCorrupted,
    AttemptStartFailed,
    AttemptCancelFailed,
    WorkerCrashed,
    RepoDirty,
    NoDefaultBranch,
    CliUnauthenticated,
    PermissionDenied,
    InvalidConfig,
    AlreadyRunning,
    PreflightFailed,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Critical,
    Error,
    Warning,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 14] = [
        Self::BudgetExceeded,
        Self::ProviderNotConfigured,
        Self::QueueCorrupted,
        Self::AttemptStartFailed,
        Self::AttemptCancelFailed,
        Self::WorkerCrashed,
        Self::RepoDirty,
        Self::NoDefaultBranch,
        Self::CliUnauthenticated,
        Self::PermissionDenied,
        Self::InvalidConfig,
        Self::AlreadyRunning,
        Self::PreflightFailed,
        Self::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
            Self::ProviderNotConfigured => "PROVIDER_NOT_CONFIGURED",
            Self::QueueCorrupted => "QUEUE_CORRUPTED",
            Self::AttemptStartFailed => "ATTEMPT_START_FAILED",
            Self::AttemptCancelFailed => "ATTEMPT_CANCEL_FAILED",
            Self::WorkerCrashed => "WORKER_CRASHED",
            Self::RepoDirty => "REPO_DIRTY",
            Self::NoDefaultBranch => "NO_DEFAULT_BRANCH",
            Self::CliUnauthenticated => "CLI_UNAUTHENTICATED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::InvalidConfig => "INVALID_CONFIG",
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::PreflightFailed => "PREFLIGHT_FAILED",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::QueueCorrupted | Self::WorkerCrashed => ErrorSeverity::Critical,
            Self::AlreadyRunning | Self::RepoDirty | Self::AttemptCancelFailed => {
                ErrorSeverity::Warning
            }
            _ => ErrorSeverity::Error,
        }
    }

    /// Ordered operator steps for recovering from this code.
    pub fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::BudgetExceeded => &[
                "Check current usage against the project budget",
                "Raise the budget limit or wait for the next billing window",
                "Re-run the factory once the budget is available",
            ],
            Self::ProviderNotConfigured => &[
                "Set `agent_cmd` in the factory config",
                "Verify the agent image or binary is installed",
                "Run `factoryd preflight` to confirm the setup",
            ],
            Self::QueueCorrupted => &[
                "Stop the factory run for this project",
                "Inspect attempts listed as both queued and running",
                "Mark the stale attempts as stopped or failed",
                "Start a fresh run",
            ],
            Self::AttemptStartFailed => &[
                "Read the attempt error and agent logs",
                "Confirm the worktree directory is writable",
                "Check that the execution runtime is available",
                "Retry the task",
            ],
            Self::AttemptCancelFailed => &[
                "Check whether the agent process is still alive",
                "Kill the process manually if needed",
                "Retry the cancellation",
            ],
            Self::WorkerCrashed => &[
                "Read the run error for the crash message",
                "Check daemon logs around the failure time",
                "Fix the underlying cause",
                "Start a new run for the remaining tasks",
            ],
            Self::RepoDirty => &[
                "Run `git status` in the repository",
                "Commit or stash local changes",
                "Retry the run",
            ],
            Self::NoDefaultBranch => &[
                "Verify the repository has a remote named in `remote`",
                "Run `git remote set-head origin --auto`",
                "Or set the project's base branch explicitly",
            ],
            Self::CliUnauthenticated => &[
                "Run `gh auth login`",
                "Confirm with `gh auth status`",
                "Retry the run",
            ],
            Self::PermissionDenied => &[
                "Check push access to the remote repository",
                "Refresh credentials or SSH keys",
                "Confirm with `git push --dry-run`",
            ],
            Self::InvalidConfig => &[
                "Check `max_parallel` is between 1 and 20",
                "Fix the offending config value",
                "Retry the run",
            ],
            Self::AlreadyRunning => &[
                "Wait for the active run to finish",
                "Or stop it before starting a new run",
            ],
            Self::PreflightFailed => &[
                "Read the failing check message",
                "Verify git and gh are installed and on PATH",
                "Retry the preflight",
            ],
            Self::Unknown => &[
                "Read the error detail and daemon logs",
                "Retry the operation",
                "Report the failure if it persists",
            ],
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized, user-presentable error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryFault {
    pub code: ErrorCode,
    pub message: String,
    /// Diagnostic text such as stderr; never shown as the message.
    pub detail: Option<String>,
}

impl FactoryFault {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl AsRef<str>) -> Self {
        self.detail = Some(cap_detail(detail.as_ref()));
        self
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.code.severity()
    }

    pub fn remediation(&self) -> &'static [&'static str] {
        self.code.remediation()
    }
}

impl std::fmt::Display for FactoryFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for FactoryFault {}

fn cap_detail(detail: &str) -> String {
    if detail.len() <= MAX_DETAIL_BYTES {
        return detail.to_string();
    }
    let mut end = MAX_DETAIL_BYTES;
    while !detail.is_char_boundary(end) {
        end -= 1;
    }
    detail[..end].to_string()
}

/// A 403 reported as an HTTP status, not any "403" inside an id or sha.
fn forbidden_status_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\b(?:http(?:/[\d.]+)?|status(?: code)?|error|code)[\s:=]*403\b|\b403\s+forbidden\b")
            .expect("valid regex")
    })
}

/// Map a raw error message onto the taxonomy.
pub fn classify_message(message: &str) -> ErrorCode {
    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["budget", "quota exceeded", "insufficient credit"]) {
        ErrorCode::BudgetExceeded
    } else if has(&["queue corrupted", "both queued and running"]) {
        ErrorCode::QueueCorrupted
    } else if has(&["not logged in", "gh auth login", "authentication required"]) {
        ErrorCode::CliUnauthenticated
    } else if has(&["permission denied", "access denied"]) || forbidden_status_pattern().is_match(&lower) {
        ErrorCode::PermissionDenied
    } else if has(&["uncommitted changes", "working tree is dirty", "repo dirty"]) {
        ErrorCode::RepoDirty
    } else if has(&["default branch"]) {
        ErrorCode::NoDefaultBranch
    } else if has(&["agent_cmd", "provider not configured", "no provider"]) {
        ErrorCode::ProviderNotConfigured
    } else if has(&["max_parallel", "invalid config"]) {
        ErrorCode::InvalidConfig
    } else if has(&["already running", "active run"]) {
        ErrorCode::AlreadyRunning
    } else if has(&["failed to spawn", "failed to start", "worktree add"]) {
        ErrorCode::AttemptStartFailed
    } else if has(&["panicked", "worker crashed"]) {
        ErrorCode::WorkerCrashed
    } else {
        ErrorCode::Unknown
    }
}

/// Normalize any error into a [`FactoryFault`].
///
/// The message is the first line of the error's display text; the full text
/// is kept, capped, as detail when it has more than one line.
pub fn normalize_error(err: &(dyn std::error::Error + 'static)) -> FactoryFault {
    normalize_message(&err.to_string())
}

pub fn normalize_message(raw: &str) -> FactoryFault {
    let code = classify_message(raw);
    let first_line = raw.lines().next().unwrap_or_default().trim();
    let message = if first_line.is_empty() {
        code.as_str().to_string()
    } else {
        first_line.to_string()
    };
    let fault = FactoryFault::new(code, message);
    if raw.lines().nth(1).is_some() {
        fault.with_detail(raw)
    } else {
        fault
    }
}
