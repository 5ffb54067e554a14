//! Per-project worker loop.
//!
//! Each iteration rebuilds the queue from persisted attempts, completes the
//! run once nothing is left, and otherwise starts attempts until the slots
//! are full. Attempts run on the shared task tracker; the loop never awaits
//! them and observes completions on the next iteration.

use factory_core::events::{
    AttemptFinishedPayload, AttemptStartedPayload, AttemptStoppedPayload, EventPayload,
    RunCancelledPayload, RunCompletedPayload, RunFailedPayload,
};
use factory_core::queue::QueueError;
use factory_core::{
    derive_state, Attempt, AttemptOutcome, AttemptStatus, Id, Queue, Run, RunStatus,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::registry::{HandleRegistry, TokenHandle, WorkerGuard, WorkerHandle};
use crate::runner::{AttemptContext, ExecutionDriver, WorkspaceRecorder};
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Shared collaborators of every worker loop.
#[derive(Clone)]
pub struct WorkerDeps {
    pub storage: Storage,
    pub driver: Arc<dyn ExecutionDriver>,
    pub handles: Arc<HandleRegistry>,
    pub tracker: TaskTracker,
    /// Daemon shutdown. Exits loops without touching run status.
    pub shutdown: CancellationToken,
    pub interval: Duration,
}

impl std::fmt::Debug for WorkerDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerDeps")
            .field("interval", &self.interval)
            .field("running_attempts", &self.handles.len())
            .finish_non_exhaustive()
    }
}

enum Step {
    Continue,
    Exit,
}

/// Drive `handle.run_id` until it completes, fails, or is stopped.
///
/// `guard` deregisters the worker when the loop ends, however it ends.
pub async fn run_worker_loop(deps: WorkerDeps, handle: WorkerHandle, guard: WorkerGuard) {
    let _guard = guard;
    let mut queue = Queue::new(handle.max_parallel);
    info!(
        project_id = %handle.project_id,
        run_id = %handle.run_id,
        max_parallel = handle.max_parallel,
        "worker loop started"
    );

    loop {
        if deps.shutdown.is_cancelled() {
            info!(run_id = %handle.run_id, "daemon shutting down; leaving run for resume");
            break;
        }
        if handle.stop.is_cancelled() {
            if let Err(err) = cancel_run(&deps.storage, &handle.run_id, &mut queue).await {
                error!(run_id = %handle.run_id, error = %err, "failed to cancel run");
            }
            break;
        }

        match iterate(&deps, &handle, &mut queue).await {
            Ok(Step::Continue) => {}
            Ok(Step::Exit) => break,
            Err(err) => {
                error!(run_id = %handle.run_id, error = %err, "worker iteration failed");
                fail_run(&deps.storage, &handle.run_id, &err.to_string()).await;
                break;
            }
        }

        tokio::select! {
            () = handle.stop.cancelled() => {}
            () = deps.shutdown.cancelled() => {}
            () = tokio::time::sleep(deps.interval) => {}
        }
    }

    info!(run_id = %handle.run_id, "worker loop exited");
}

async fn iterate(deps: &WorkerDeps, handle: &WorkerHandle, queue: &mut Queue) -> Result<Step> {
    let run = match deps.storage.get_run(&handle.run_id).await {
        Ok(run) => run,
        Err(StorageError::RunNotFound(_)) => {
            warn!(run_id = %handle.run_id, "run disappeared; exiting worker");
            return Ok(Step::Exit);
        }
        Err(err) => return Err(err.into()),
    };
    if run.status != RunStatus::Running {
        debug!(run_id = %run.id, status = run.status.as_str(), "run no longer running");
        return Ok(Step::Exit);
    }

    let attempts = deps.storage.list_attempts(&run.id).await?;
    let state = derive_state(Some(&run), &attempts);
    queue.resume(&state, handle.max_parallel)?;

    if state.is_drained() {
        return complete_run(&deps.storage, &run, &attempts).await;
    }

    tick(deps, &run, queue).await?;
    Ok(Step::Continue)
}

/// Start attempts until the queue has no free slot or nothing is waiting.
async fn tick(deps: &WorkerDeps, run: &Run, queue: &mut Queue) -> Result<()> {
    if queue.free_slots() == 0 || queue.queued_len() == 0 {
        return Ok(());
    }
    let project = deps.storage.get_project(&run.project_id).await?;

    while let Some(task_id) = queue.pop_next() {
        let Some(attempt) = deps.storage.oldest_waiting_attempt(&run.id, &task_id).await? else {
            continue;
        };
        let task = deps.storage.get_task(&task_id).await?;
        if !deps.storage.mark_attempt_running(&attempt.id).await? {
            debug!(attempt_id = %attempt.id, "attempt left waiting state before start");
            continue;
        }
        queue.mark_running(task_id.clone());

        deps.storage
            .append_event(
                &run.id,
                &EventPayload::AttemptStarted(AttemptStartedPayload {
                    attempt_id: attempt.id.clone(),
                    task_id: task_id.clone(),
                }),
            )
            .await?;
        info!(run_id = %run.id, attempt_id = %attempt.id, task_id = %task_id, "attempt started");

        spawn_attempt(
            deps,
            AttemptContext {
                project: project.clone(),
                run: run.clone(),
                task,
                workspace: WorkspaceRecorder::new(deps.storage.clone(), attempt.id.clone()),
                attempt_id: attempt.id,
                cancel: deps.shutdown.child_token(),
            },
        );
    }
    Ok(())
}

fn spawn_attempt(deps: &WorkerDeps, ctx: AttemptContext) {
    let attempt_id = ctx.attempt_id.clone();
    let run_id = ctx.run.id.clone();
    deps.handles.register(
        attempt_id.clone(),
        Arc::new(TokenHandle::new(ctx.cancel.clone())),
    );

    let (storage, driver, handles) = (
        deps.storage.clone(),
        Arc::clone(&deps.driver),
        Arc::clone(&deps.handles),
    );
    deps.tracker.spawn(async move {
        let started = Instant::now();
        let outcome = match tokio::spawn(async move { driver.run_task_attempt(ctx).await }).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => AttemptOutcome::failed(err.to_string()),
            Err(err) => AttemptOutcome::failed(format!("attempt task panicked: {err}")),
        };
        handles.unregister(&attempt_id);
        record_outcome(&storage, &run_id, &attempt_id, &outcome, started.elapsed()).await;
    });
}

async fn record_outcome(
    storage: &Storage,
    run_id: &Id,
    attempt_id: &Id,
    outcome: &AttemptOutcome,
    elapsed: Duration,
) {
    match storage.finish_attempt(attempt_id, outcome).await {
        Ok(true) => {
            info!(
                attempt_id = %attempt_id,
                success = outcome.success,
                error = outcome.error.as_deref().unwrap_or(""),
                "attempt finished"
            );
            let payload = EventPayload::AttemptFinished(AttemptFinishedPayload {
                attempt_id: attempt_id.clone(),
                success: outcome.success,
                exit_code: outcome.exit_code,
                duration_ms: elapsed.as_millis() as u64,
                pr_url: outcome.pr_url.clone(),
                error: outcome.error.clone(),
            });
            if let Err(err) = storage.append_event(run_id, &payload).await {
                warn!(attempt_id = %attempt_id, error = %err, "failed to record attempt event");
            }
        }
        Ok(false) => {
            debug!(attempt_id = %attempt_id, "attempt no longer running; outcome dropped");
        }
        Err(err) => {
            error!(attempt_id = %attempt_id, error = %err, "failed to persist attempt outcome");
        }
    }
}

/// Complete a drained run. Keeps the loop going if an attempt was queued
/// after `attempts` was read.
async fn complete_run(storage: &Storage, run: &Run, attempts: &[Attempt]) -> Result<Step> {
    let count = |status: AttemptStatus| attempts.iter().filter(|a| a.status == status).count() as u32;
    let (completed, failed) = (count(AttemptStatus::Completed), count(AttemptStatus::Failed));

    if !storage.finish_run(&run.id, RunStatus::Completed, None).await? {
        debug!(run_id = %run.id, "run not completed; re-checking");
        return Ok(Step::Continue);
    }
    storage
        .append_event(
            &run.id,
            &EventPayload::RunCompleted(RunCompletedPayload {
                run_id: run.id.clone(),
                completed,
                failed,
            }),
        )
        .await?;
    info!(run_id = %run.id, completed, failed, "run completed");
    Ok(Step::Exit)
}

/// Soft stop: waiting attempts become `stopped`, running ones finish on
/// their own, and the run is `cancelled`.
pub(crate) async fn cancel_run(
    storage: &Storage,
    run_id: &Id,
    queue: &mut Queue,
) -> std::result::Result<(), StorageError> {
    queue.stop();
    let stopped = storage.stop_waiting_attempts(run_id, "run stopped").await?;
    for attempt_id in &stopped {
        storage
            .append_event(
                run_id,
                &EventPayload::AttemptStopped(AttemptStoppedPayload {
                    attempt_id: attempt_id.clone(),
                    previous_status: "waiting".to_string(),
                    reason: "run stopped".to_string(),
                }),
            )
            .await?;
    }

    if storage.finish_run(run_id, RunStatus::Cancelled, None).await? {
        storage
            .append_event(
                run_id,
                &EventPayload::RunCancelled(RunCancelledPayload {
                    run_id: run_id.clone(),
                    stopped_attempts: stopped.len() as u64,
                }),
            )
            .await?;
    }
    queue.clear_all();
    info!(run_id = %run_id, stopped = stopped.len(), "run cancelled");
    Ok(())
}

async fn fail_run(storage: &Storage, run_id: &Id, reason: &str) {
    match storage.finish_run(run_id, RunStatus::Failed, Some(reason)).await {
        Ok(true) => {
            let payload = EventPayload::RunFailed(RunFailedPayload {
                run_id: run_id.clone(),
                reason: reason.to_string(),
            });
            if let Err(err) = storage.append_event(run_id, &payload).await {
                warn!(run_id = %run_id, error = %err, "failed to record run failure event");
            }
        }
        Ok(false) => {}
        Err(err) => error!(run_id = %run_id, error = %err, "failed to mark run failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::{create_test_storage, project, run, task};

    #[tokio::test]
    async fn attempt_queued_after_drain_check_keeps_run_open() {
        let ts = create_test_storage().await;
        let project = project("/repo");
        ts.storage.insert_project(&project).await.unwrap();
        let run = run(&project.id, RunStatus::Pending, Vec::new());
        ts.storage.insert_run(&run).await.unwrap();
        ts.storage.mark_run_running(&run.id).await.unwrap();

        // The worker saw no attempts; an enqueue lands before completion.
        let seen: Vec<Attempt> = Vec::new();
        let task = task(&project.id, "ready");
        ts.storage.insert_task(&task).await.unwrap();
        ts.storage.insert_attempt(&Attempt::queued(&run.id, &task.id)).await.unwrap();

        let step = complete_run(&ts.storage, &run, &seen).await.unwrap();
        assert!(matches!(step, Step::Continue));
        let stored = ts.storage.get_run(&run.id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Running);
        assert!(ts.storage.active_run_for_project(&project.id).await.unwrap().is_some());

        ts.storage
            .stop_waiting_attempts(&run.id, "run stopped")
            .await
            .unwrap();
        let step = complete_run(&ts.storage, &run, &seen).await.unwrap();
        assert!(matches!(step, Step::Exit));
        let stored = ts.storage.get_run(&run.id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
    }
}
