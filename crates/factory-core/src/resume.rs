//! Queue reconstruction from persisted rows.
//!
//! Pure: the latest run plus its attempts determine what should be happening
//! now. Called on every worker iteration and after restarts.

use serde::Serialize;

use crate::types::{Attempt, AttemptStatus, Id, Run, RunStatus};

/// Coarse state of the project's latest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeStatus {
    /// No run exists.
    Idle,
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl From<RunStatus> for ResumeStatus {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Pending => Self::Pending,
            RunStatus::Running => Self::Running,
            RunStatus::Completed => Self::Completed,
            RunStatus::Failed => Self::Failed,
            RunStatus::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumeState {
    pub run_id: Option<Id>,
    pub status: ResumeStatus,
    /// `queued`/`pending` attempts in creation order.
    pub queued_task_ids: Vec<Id>,
    /// `running` attempts in start order.
    pub running_task_ids: Vec<Id>,
}

impl ResumeState {
    pub fn idle() -> Self {
        Self {
            run_id: None,
            status: ResumeStatus::Idle,
            queued_task_ids: Vec::new(),
            running_task_ids: Vec::new(),
        }
    }

    pub fn is_drained(&self) -> bool {
        self.queued_task_ids.is_empty() && self.running_task_ids.is_empty()
    }
}

/// Partition a run's attempts into queued and running task ids.
///
/// Terminal attempts are excluded.
pub fn derive_state(run: Option<&Run>, attempts: &[Attempt]) -> ResumeState {
    let Some(run) = run else {
        return ResumeState::idle();
    };

    let mut waiting: Vec<&Attempt> = attempts
        .iter()
        .filter(|a| a.run_id == run.id && a.status.is_waiting())
        .collect();
    waiting.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let mut running: Vec<&Attempt> = attempts
        .iter()
        .filter(|a| a.run_id == run.id && a.status == AttemptStatus::Running)
        .collect();
    running.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.id.cmp(&b.id))
    });

    ResumeState {
        run_id: Some(run.id.clone()),
        status: run.status.into(),
        queued_task_ids: waiting.into_iter().map(|a| a.task_id.clone()).collect(),
        running_task_ids: running.into_iter().map(|a| a.task_id.clone()).collect(),
    }
}
