//! Run creation: explicit runs and auto-enqueue of single tasks.
//!
//! Both paths gate new runs behind preflight. Failures come back as a
//! [`FactoryFault`] value; nothing here panics or propagates raw errors.

use factory_core::errors::normalize_error;
use factory_core::events::{
    AttemptQueuedPayload, EventPayload, RunCreatedPayload, RunStartedPayload,
};
use factory_core::{
    Attempt, ErrorCode, FactoryFault, Id, Project, Run, RunStatus, Task, TaskSelector,
};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::factory::Factory;
use crate::preflight::{Preflight, PreflightRequest, PreflightResult};
use crate::storage::StorageError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueOutcome {
    pub run_id: Id,
    /// False if the task already had a live attempt in the run.
    pub enqueued: bool,
}

pub type FaultResult<T> = std::result::Result<T, FactoryFault>;

fn fault(err: &StorageError) -> FactoryFault {
    normalize_error(err)
}

fn preflight_fault(result: &PreflightResult) -> FactoryFault {
    let code = result.error_code.unwrap_or(ErrorCode::PreflightFailed);
    let message = result.failure_message().unwrap_or("preflight failed");
    FactoryFault::new(code, message)
}

impl Factory {
    /// Evaluate readiness of `project_id` for a run of `max_parallel`.
    pub async fn run_preflight_checks(
        &self,
        project_id: &Id,
        max_parallel: u32,
    ) -> FaultResult<PreflightResult> {
        let project = self.storage.get_project(project_id).await.map_err(|e| fault(&e))?;
        Ok(self.preflight(&project, max_parallel).await)
    }

    async fn preflight(&self, project: &Project, max_parallel: u32) -> PreflightResult {
        let preflight = Preflight {
            probe: self.collab.probe.as_ref(),
            budget: self.collab.budget.as_ref(),
            storage: &self.storage,
        };
        preflight
            .run(&PreflightRequest {
                project,
                max_parallel,
                remote: &self.config.remote,
            })
            .await
    }

    /// Queue `task_id` on the project's active run, creating a run when
    /// none is active.
    pub async fn auto_enqueue_task(&self, project_id: &Id, task_id: &Id) -> FaultResult<EnqueueOutcome> {
        let _lock = self.enqueue_lock.lock().await;
        let project = self.storage.get_project(project_id).await.map_err(|e| fault(&e))?;
        let task = self.storage.get_task(task_id).await.map_err(|e| fault(&e))?;
        if task.project_id != project.id {
            return Err(FactoryFault::new(
                ErrorCode::InvalidConfig,
                format!("task {} does not belong to project {}", task.id, project.id),
            ));
        }

        let active = self
            .storage
            .active_run_for_project(&project.id)
            .await
            .map_err(|e| fault(&e))?;
        if let Some(run) = active {
            return self.enqueue_on_run(&project, &run, &task).await;
        }

        let max_parallel = self.config.default_max_parallel;
        let result = self.preflight(&project, max_parallel).await;
        if !result.ok {
            return Err(preflight_fault(&result));
        }

        let selector = TaskSelector::Selection(vec![task.id.clone()]);
        let run = self
            .create_run(&project, selector, &[task], max_parallel)
            .await
            .map_err(|e| fault(&e))?;
        Ok(EnqueueOutcome {
            run_id: run.id,
            enqueued: true,
        })
    }

    async fn enqueue_on_run(&self, project: &Project, run: &Run, task: &Task) -> FaultResult<EnqueueOutcome> {
        let attempt = Attempt::queued(&run.id, &task.id);
        let inserted = self
            .storage
            .insert_attempt_if_absent(&attempt)
            .await
            .map_err(|e| fault(&e))?;
        if inserted {
            let payload = EventPayload::AttemptQueued(AttemptQueuedPayload {
                attempt_id: attempt.id.clone(),
                task_id: task.id.clone(),
            });
            if let Err(err) = self.storage.append_event(&run.id, &payload).await {
                warn!(run_id = %run.id, error = %err, "failed to record queued event");
            }
            info!(run_id = %run.id, task_id = %task.id, "task enqueued on active run");
        }

        if run.status == RunStatus::Running {
            self.start_or_attach(&project.id, &run.id, run.max_parallel);
        }
        Ok(EnqueueOutcome {
            run_id: run.id.clone(),
            enqueued: inserted,
        })
    }

    /// Create a run over the tasks matched by `selector` and start it.
    pub async fn start_run(
        &self,
        project_id: &Id,
        selector: TaskSelector,
        max_parallel: u32,
    ) -> FaultResult<Run> {
        let _lock = self.enqueue_lock.lock().await;
        let project = self.storage.get_project(project_id).await.map_err(|e| fault(&e))?;

        let result = self.preflight(&project, max_parallel).await;
        if !result.ok {
            return Err(preflight_fault(&result));
        }

        let tasks = self.resolve_selector(&project, &selector).await?;
        if tasks.is_empty() {
            return Err(FactoryFault::new(
                ErrorCode::InvalidConfig,
                "selector matched no tasks",
            ));
        }
        self.create_run(&project, selector, &tasks, max_parallel)
            .await
            .map_err(|e| fault(&e))
    }

    async fn resolve_selector(&self, project: &Project, selector: &TaskSelector) -> FaultResult<Vec<Task>> {
        match selector {
            TaskSelector::Column(column) => self
                .storage
                .list_tasks_in_column(&project.id, column)
                .await
                .map_err(|e| fault(&e)),
            TaskSelector::Selection(ids) => {
                let mut tasks = Vec::with_capacity(ids.len());
                for id in ids {
                    let task = self.storage.get_task(id).await.map_err(|e| fault(&e))?;
                    if task.project_id != project.id {
                        return Err(FactoryFault::new(
                            ErrorCode::InvalidConfig,
                            format!("task {id} does not belong to project {}", project.id),
                        ));
                    }
                    if !tasks.iter().any(|t: &Task| t.id == task.id) {
                        tasks.push(task);
                    }
                }
                Ok(tasks)
            }
        }
    }

    async fn create_run(
        &self,
        project: &Project,
        selector: TaskSelector,
        tasks: &[Task],
        max_parallel: u32,
    ) -> Result<Run, StorageError> {
        let mut run = Run {
            id: Id::new(),
            project_id: project.id.clone(),
            mode: selector.mode(),
            max_parallel,
            selector,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        };
        self.storage.insert_run(&run).await?;
        self.storage
            .append_event(
                &run.id,
                &EventPayload::RunCreated(RunCreatedPayload {
                    run_id: run.id.clone(),
                    project_id: project.id.clone(),
                    mode: run.mode,
                    max_parallel,
                    task_count: tasks.len(),
                }),
            )
            .await?;

        for task in tasks {
            let attempt = Attempt::queued(&run.id, &task.id);
            self.storage.insert_attempt(&attempt).await?;
            self.storage
                .append_event(
                    &run.id,
                    &EventPayload::AttemptQueued(AttemptQueuedPayload {
                        attempt_id: attempt.id,
                        task_id: task.id.clone(),
                    }),
                )
                .await?;
        }

        self.storage.mark_run_running(&run.id).await?;
        self.storage
            .append_event(
                &run.id,
                &EventPayload::RunStarted(RunStartedPayload {
                    run_id: run.id.clone(),
                    worker_id: format!("factoryd-{}", std::process::id()),
                }),
            )
            .await?;
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());

        info!(
            run_id = %run.id,
            project_id = %project.id,
            mode = run.mode.as_str(),
            tasks = tasks.len(),
            max_parallel,
            "run started"
        );
        self.start_or_attach(&project.id, &run.id, max_parallel);
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use crate::factory::test_support::{test_factory, BlockingDriver};
    use crate::preflight::test_support::FakeProbe;
    use crate::storage::test_support::{project, task};
    use factory_core::{AttemptStatus, ErrorCode, RunMode, RunStatus, TaskSelector};
    use std::sync::Arc;

    #[tokio::test]
    async fn auto_enqueue_creates_run_then_dedupes() {
        let driver = Arc::new(BlockingDriver::default());
        let tf = test_factory(driver.clone(), FakeProbe::default()).await;
        let project = project("/repo");
        tf.factory.storage().insert_project(&project).await.unwrap();
        let task = task(&project.id, "ready");
        tf.factory.storage().insert_task(&task).await.unwrap();

        let first = tf.factory.auto_enqueue_task(&project.id, &task.id).await.unwrap();
        assert!(first.enqueued);
        let run = tf.factory.storage().get_run(&first.run_id).await.unwrap();
        assert_eq!(run.mode, RunMode::Selection);
        assert_eq!(run.status, RunStatus::Running);
        assert!(tf.factory.workers().is_live(&project.id));

        let second = tf.factory.auto_enqueue_task(&project.id, &task.id).await.unwrap();
        assert_eq!(second.run_id, first.run_id);
        assert!(!second.enqueued);

        let other = crate::storage::test_support::task(&project.id, "ready");
        tf.factory.storage().insert_task(&other).await.unwrap();
        let third = tf.factory.auto_enqueue_task(&project.id, &other.id).await.unwrap();
        assert_eq!(third.run_id, first.run_id);
        assert!(third.enqueued);

        driver.release();
        tf.factory.shutdown().await;
    }

    #[tokio::test]
    async fn auto_enqueue_returns_preflight_code() {
        let probe = FakeProbe {
            clean: Some(false),
            ..FakeProbe::default()
        };
        let tf = test_factory(Arc::new(BlockingDriver::default()), probe).await;
        let project = project("/repo");
        tf.factory.storage().insert_project(&project).await.unwrap();
        let task = task(&project.id, "ready");
        tf.factory.storage().insert_task(&task).await.unwrap();

        let fault = tf.factory.auto_enqueue_task(&project.id, &task.id).await.unwrap_err();
        assert_eq!(fault.code, ErrorCode::RepoDirty);
        assert!(tf
            .factory
            .storage()
            .active_run_for_project(&project.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn start_run_resolves_column_selector() {
        let driver = Arc::new(BlockingDriver::default());
        let tf = test_factory(driver.clone(), FakeProbe::default()).await;
        let project = project("/repo");
        tf.factory.storage().insert_project(&project).await.unwrap();
        for column in ["ready", "ready", "done"] {
            tf.factory
                .storage()
                .insert_task(&task(&project.id, column))
                .await
                .unwrap();
        }

        let run = tf
            .factory
            .start_run(&project.id, TaskSelector::Column("ready".to_string()), 2)
            .await
            .unwrap();
        assert_eq!(run.mode, RunMode::Column);

        let attempts = tf.factory.storage().list_attempts(&run.id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert!(attempts.iter().all(|a| a.status != AttemptStatus::Stopped));

        driver.release();
        tf.factory.shutdown().await;
    }

    #[tokio::test]
    async fn start_run_rejects_empty_selection_and_bad_parallelism() {
        let tf = test_factory(Arc::new(BlockingDriver::default()), FakeProbe::default()).await;
        let project = project("/repo");
        tf.factory.storage().insert_project(&project).await.unwrap();

        let fault = tf
            .factory
            .start_run(&project.id, TaskSelector::Column("empty".to_string()), 2)
            .await
            .unwrap_err();
        assert_eq!(fault.code, ErrorCode::InvalidConfig);

        let fault = tf
            .factory
            .start_run(&project.id, TaskSelector::Column("empty".to_string()), 50)
            .await
            .unwrap_err();
        assert_eq!(fault.code, ErrorCode::InvalidConfig);
        assert!(fault.message.contains("max_parallel"));
    }
}
