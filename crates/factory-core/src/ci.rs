//! CI check-run normalization and failure classification.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Lifecycle of a single check run on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckRunStatus {
    Queued,
    InProgress,
    Completed,
}

/// One check run as reported by the source-control host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRun {
    pub name: String,
    pub status: CheckRunStatus,
    /// Set once `status` is `completed` (`success`, `failure`, `cancelled`,
    /// `skipped`, `neutral`, `timed_out`, ...).
    pub conclusion: Option<String>,
}

impl CheckRun {
    pub fn completed(name: &str, conclusion: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckRunStatus::Completed,
            conclusion: Some(conclusion.to_string()),
        }
    }
}

/// Folded CI status for a commit.
///
/// Variant order is the fold priority: the maximum wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiStatus {
    Success,
    Pending,
    Cancelled,
    Failed,
}

impl CiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Pending => "pending",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

fn classify_check(check: &CheckRun) -> CiStatus {
    if check.status != CheckRunStatus::Completed {
        return CiStatus::Pending;
    }
    match check.conclusion.as_deref() {
        Some("success" | "skipped" | "neutral") => CiStatus::Success,
        Some("cancelled") => CiStatus::Cancelled,
        Some("stale") | None => CiStatus::Pending,
        Some(_) => CiStatus::Failed,
    }
}

/// Fold check runs into one status: `failed > cancelled > pending > success`.
///
/// No check runs means CI has not started yet.
pub fn normalize_check_runs(checks: &[CheckRun]) -> CiStatus {
    checks
        .iter()
        .map(classify_check)
        .max()
        .unwrap_or(CiStatus::Pending)
}

/// Fail-closed wrapper around a check-run fetch.
pub fn normalize_fetch<E>(fetched: Result<Vec<CheckRun>, E>) -> CiStatus {
    match fetched {
        Ok(checks) => normalize_check_runs(&checks),
        Err(_) => CiStatus::Failed,
    }
}

/// Heuristic category of a CI failure log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCategory {
    #[serde(rename = "TS_error")]
    TsError,
    #[serde(rename = "Unit_test_failure")]
    UnitTestFailure,
    #[serde(rename = "Build_failed")]
    BuildFailed,
    #[serde(rename = "E2E_failed")]
    E2eFailed,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TsError => "TS_error",
            Self::UnitTestFailure => "Unit_test_failure",
            Self::BuildFailed => "Build_failed",
            Self::E2eFailed => "E2E_failed",
            Self::Unknown => "Unknown",
        }
    }
}

fn ts_error_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)\berror TS\d{4}\b|\bTS\d{4}:").expect("valid regex"))
}

/// Classify failure text. First matching rule wins; TypeScript diagnostics
/// are checked before the broader test and build markers.
pub fn classify_failure(log: &str) -> FailureCategory {
    if ts_error_pattern().is_match(log) {
        return FailureCategory::TsError;
    }

    let lower = log.to_lowercase();
    let e2e_markers = ["playwright", "cypress", "e2e", "end-to-end"];
    if e2e_markers.iter().any(|m| lower.contains(m)) {
        return FailureCategory::E2eFailed;
    }

    let test_markers = [
        "tests failed",
        "test failed",
        "failing tests",
        "assertionerror",
        "assertion failed",
        "test result: failed",
        "● ",
        "fail ",
    ];
    if test_markers.iter().any(|m| lower.contains(m)) {
        return FailureCategory::UnitTestFailure;
    }

    let build_markers = [
        "build failed",
        "compilation failed",
        "could not compile",
        "error[e",
        "module not found",
        "cannot find module",
        "exit code 1",
    ];
    if build_markers.iter().any(|m| lower.contains(m)) {
        return FailureCategory::BuildFailed;
    }

    FailureCategory::Unknown
}

/// Keep the last `max_bytes` of a log, on a char boundary.
pub fn truncate_log(log: &str, max_bytes: usize) -> String {
    if log.len() <= max_bytes {
        return log.to_string();
    }
    let mut start = log.len() - max_bytes;
    while !log.is_char_boundary(start) {
        start += 1;
    }
    format!("[... truncated {start} bytes ...]\n{}", &log[start..])
}
