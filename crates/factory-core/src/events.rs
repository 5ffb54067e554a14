//! Event types for the audit log.

use crate::types::{AutofixOutcome, AutofixStrategy, Id, RunMode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunCreated,
    RunStarted,
    AttemptQueued,
    AttemptStarted,
    AttemptFinished,
    AttemptStopped,
    RunCompleted,
    RunFailed,
    RunCancelled,
    WorktreeCleaned,
    AutofixRecorded,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCreated => "RUN_CREATED",
            Self::RunStarted => "RUN_STARTED",
            Self::AttemptQueued => "ATTEMPT_QUEUED",
            Self::AttemptStarted => "ATTEMPT_STARTED",
            Self::AttemptFinished => "ATTEMPT_FINISHED",
            Self::AttemptStopped => "ATTEMPT_STOPPED",
            Self::RunCompleted => "RUN_COMPLETED",
            Self::RunFailed => "RUN_FAILED",
            Self::RunCancelled => "RUN_CANCELLED",
            Self::WorktreeCleaned => "WORKTREE_CLEANED",
            Self::AutofixRecorded => "AUTOFIX_RECORDED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCreatedPayload {
    pub run_id: Id,
    pub project_id: Id,
    pub mode: RunMode,
    pub max_parallel: u32,
    pub task_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartedPayload {
    pub run_id: Id,
    pub worker_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptQueuedPayload {
    pub attempt_id: Id,
    pub task_id: Id,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptStartedPayload {
    pub attempt_id: Id,
    pub task_id: Id,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptFinishedPayload {
    pub attempt_id: Id,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub pr_url: Option<String>,
    pub error: Option<String>,
}

/// Soft (`queued -> stopped`) or hard (`running -> stopped`) cancel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptStoppedPayload {
    pub attempt_id: Id,
    pub previous_status: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCompletedPayload {
    pub run_id: Id,
    pub completed: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailedPayload {
    pub run_id: Id,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCancelledPayload {
    pub run_id: Id,
    pub stopped_attempts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeCleanedPayload {
    pub attempt_id: Id,
    pub worktree_path: String,
    pub branch_deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutofixRecordedPayload {
    pub pr_url: String,
    pub strategy: AutofixStrategy,
    pub outcome: AutofixOutcome,
    pub category: String,
}

/// Union type for all event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    RunCreated(RunCreatedPayload),
    RunStarted(RunStartedPayload),
    AttemptQueued(AttemptQueuedPayload),
    AttemptStarted(AttemptStartedPayload),
    AttemptFinished(AttemptFinishedPayload),
    AttemptStopped(AttemptStoppedPayload),
    RunCompleted(RunCompletedPayload),
    RunFailed(RunFailedPayload),
    RunCancelled(RunCancelledPayload),
    WorktreeCleaned(WorktreeCleanedPayload),
    AutofixRecorded(AutofixRecordedPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::RunCreated(_) => EventType::RunCreated,
            Self::RunStarted(_) => EventType::RunStarted,
            Self::AttemptQueued(_) => EventType::AttemptQueued,
            Self::AttemptStarted(_) => EventType::AttemptStarted,
            Self::AttemptFinished(_) => EventType::AttemptFinished,
            Self::AttemptStopped(_) => EventType::AttemptStopped,
            Self::RunCompleted(_) => EventType::RunCompleted,
            Self::RunFailed(_) => EventType::RunFailed,
            Self::RunCancelled(_) => EventType::RunCancelled,
            Self::WorktreeCleaned(_) => EventType::WorktreeCleaned,
            Self::AutofixRecorded(_) => EventType::AutofixRecorded,
        }
    }

    /// Attempt the event is about, if any.
    pub fn attempt_id(&self) -> Option<&Id> {
        match self {
            Self::AttemptQueued(p) => Some(&p.attempt_id),
            Self::AttemptStarted(p) => Some(&p.attempt_id),
            Self::AttemptFinished(p) => Some(&p.attempt_id),
            Self::AttemptStopped(p) => Some(&p.attempt_id),
            Self::WorktreeCleaned(p) => Some(&p.attempt_id),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
