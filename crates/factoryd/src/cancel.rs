//! Attempt cancellation.
//!
//! Waiting attempts are soft-cancelled in storage. Running attempts are
//! stopped through their runtime handle; a failed stop leaves the attempt
//! running so the caller can retry.

use factory_core::events::{AttemptStoppedPayload, EventPayload};
use factory_core::{AttemptStatus, Id};
use serde::Serialize;
use tracing::{info, warn};

use crate::factory::Factory;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelOutcome {
    Stopped {
        attempt_id: Id,
        previous_status: AttemptStatus,
    },
    NotFound,
    AlreadyFinished {
        status: AttemptStatus,
    },
    CancelFailed {
        message: String,
    },
}

impl CancelOutcome {
    fn failed(message: impl Into<String>) -> Self {
        Self::CancelFailed {
            message: message.into(),
        }
    }
}

impl Factory {
    /// Cancel one attempt. Every failure is reported in the outcome.
    pub async fn cancel_attempt(&self, attempt_id: &Id) -> CancelOutcome {
        let attempt = match self.storage.find_attempt(attempt_id).await {
            Ok(Some(attempt)) => attempt,
            Ok(None) => return CancelOutcome::NotFound,
            Err(err) => return CancelOutcome::failed(err.to_string()),
        };

        match attempt.status {
            status if status.is_terminal() => CancelOutcome::AlreadyFinished { status },
            AttemptStatus::Running => self.stop_running(&attempt.run_id, attempt_id).await,
            waiting => {
                self.mark_stopped(&attempt.run_id, attempt_id, waiting, "cancelled before start")
                    .await
            }
        }
    }

    async fn stop_running(&self, run_id: &Id, attempt_id: &Id) -> CancelOutcome {
        let Some(handle) = self.handles.get(attempt_id) else {
            return CancelOutcome::failed("handle not found; may have restarted");
        };

        let stopped = handle.stop();
        self.handles.unregister(attempt_id);
        match stopped {
            Ok(()) => {
                self.mark_stopped(run_id, attempt_id, AttemptStatus::Running, "cancelled by user")
                    .await
            }
            Err(err) => {
                warn!(attempt_id = %attempt_id, error = %err, "runtime stop failed");
                CancelOutcome::failed(err.to_string())
            }
        }
    }

    async fn mark_stopped(
        &self,
        run_id: &Id,
        attempt_id: &Id,
        expected: AttemptStatus,
        reason: &str,
    ) -> CancelOutcome {
        match self.storage.stop_attempt(attempt_id, expected, reason).await {
            Ok(true) => {}
            Ok(false) => {
                return match self.storage.find_attempt(attempt_id).await {
                    Ok(Some(current)) if current.status.is_terminal() => {
                        CancelOutcome::AlreadyFinished {
                            status: current.status,
                        }
                    }
                    _ => CancelOutcome::failed("attempt changed state during cancel; retry"),
                };
            }
            Err(err) => return CancelOutcome::failed(err.to_string()),
        }

        let payload = EventPayload::AttemptStopped(AttemptStoppedPayload {
            attempt_id: attempt_id.clone(),
            previous_status: expected.as_str().to_string(),
            reason: reason.to_string(),
        });
        if let Err(err) = self.storage.append_event(run_id, &payload).await {
            warn!(attempt_id = %attempt_id, error = %err, "failed to record stop event");
        }
        info!(attempt_id = %attempt_id, previous = expected.as_str(), "attempt cancelled");
        CancelOutcome::Stopped {
            attempt_id: attempt_id.clone(),
            previous_status: expected,
        }
    }
}
