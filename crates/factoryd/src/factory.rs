//! The `Factory` facade: shared state plus worker start/stop.
//!
//! Scheduling, cancellation, GC, auto-fix and diagnostics operations are
//! implemented on `Factory` in their own modules.

use factory_core::{FactoryConfig, Id, Queue};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::autofix::{CodeFixer, CommandFixer};
use crate::host::{GhCli, SourceControlHost};
use crate::preflight::{BudgetService, GitProbe, ReadinessProbe, StaticBudget};
use crate::registry::{GcLocks, HandleRegistry, WorkerGuard, WorkerHandle, WorkerRegistry};
use crate::runner::{AgentRunner, ExecutionDriver};
use crate::storage::{Storage, StorageError};
use crate::worker::{self, WorkerDeps};
use crate::worktree::{GitWorktrees, WorktreeManager};

/// External collaborators. Tests replace any of them with fakes.
#[derive(Clone)]
pub struct Collaborators {
    pub driver: Arc<dyn ExecutionDriver>,
    pub host: Arc<dyn SourceControlHost>,
    pub worktrees: Arc<dyn WorktreeManager>,
    pub probe: Arc<dyn ReadinessProbe>,
    pub budget: Arc<dyn BudgetService>,
    pub fixer: Arc<dyn CodeFixer>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

impl Collaborators {
    /// Production wiring: git worktrees, `gh`, and the agent runner.
    pub fn from_config(config: &Arc<FactoryConfig>) -> Self {
        let host: Arc<dyn SourceControlHost> = Arc::new(GhCli);
        let worktrees: Arc<dyn WorktreeManager> = Arc::new(GitWorktrees);
        let driver = Arc::new(AgentRunner::new(
            Arc::clone(config),
            Arc::clone(&worktrees),
            Arc::clone(&host),
        ));
        Self {
            driver,
            host,
            worktrees,
            probe: Arc::new(GitProbe),
            budget: Arc::new(StaticBudget(config.budget_ok)),
            fixer: Arc::new(CommandFixer::from_config(config)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StartOutcome {
    /// False if the project already had a live worker loop.
    pub started: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
    pub ok: bool,
}

/// Owns the registries and collaborators for every project.
pub struct Factory {
    pub(crate) storage: Storage,
    pub(crate) config: Arc<FactoryConfig>,
    pub(crate) collab: Collaborators,
    pub(crate) workers: Arc<WorkerRegistry>,
    pub(crate) handles: Arc<HandleRegistry>,
    pub(crate) gc_locks: Arc<GcLocks>,
    pub(crate) tracker: TaskTracker,
    pub(crate) shutdown: CancellationToken,
    /// Serializes run creation so two enqueues cannot both create a run.
    pub(crate) enqueue_lock: tokio::sync::Mutex<()>,
    /// False for one-shot CLI processes; the daemon picks their runs up.
    spawn_workers: bool,
}

impl std::fmt::Debug for Factory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factory")
            .field("workers", &self.workers.len())
            .field("running_attempts", &self.handles.len())
            .finish_non_exhaustive()
    }
}

impl Factory {
    pub fn new(storage: Storage, config: Arc<FactoryConfig>, collab: Collaborators) -> Self {
        Self {
            storage,
            config,
            collab,
            workers: Arc::new(WorkerRegistry::new()),
            handles: Arc::new(HandleRegistry::new()),
            gc_locks: Arc::new(GcLocks::new()),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            enqueue_lock: tokio::sync::Mutex::new(()),
            spawn_workers: true,
        }
    }

    /// Never spawn worker loops from this process.
    pub fn without_workers(mut self) -> Self {
        self.spawn_workers = false;
        self
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    pub fn workers(&self) -> &Arc<WorkerRegistry> {
        &self.workers
    }

    pub fn handles(&self) -> &Arc<HandleRegistry> {
        &self.handles
    }

    pub fn gc_locks(&self) -> &Arc<GcLocks> {
        &self.gc_locks
    }

    fn worker_deps(&self) -> WorkerDeps {
        WorkerDeps {
            storage: self.storage.clone(),
            driver: Arc::clone(&self.collab.driver),
            handles: Arc::clone(&self.handles),
            tracker: self.tracker.clone(),
            shutdown: self.shutdown.clone(),
            interval: Duration::from_millis(self.config.worker_interval_ms.max(1)),
        }
    }

    /// Start a worker loop for `run_id` unless the project already has one.
    pub fn start_or_attach(&self, project_id: &Id, run_id: &Id, max_parallel: u32) -> StartOutcome {
        if !self.spawn_workers {
            debug!(run_id = %run_id, "worker spawning disabled; leaving run to the daemon");
            return StartOutcome { started: false };
        }
        let handle = WorkerHandle::new(
            project_id.clone(),
            run_id.clone(),
            max_parallel.max(1) as usize,
        );
        if !self.workers.try_register(handle.clone()) {
            info!(project_id = %project_id, run_id = %run_id, "worker already live; attached");
            return StartOutcome { started: false };
        }

        let guard = WorkerGuard::new(Arc::clone(&self.workers), project_id.clone(), run_id.clone());
        tokio::spawn(worker::run_worker_loop(self.worker_deps(), handle, guard));
        StartOutcome { started: true }
    }

    /// Ask the project's worker to stop after its current iteration.
    ///
    /// With no live worker, an active run left over from a previous process
    /// is cancelled directly.
    pub async fn request_stop(&self, project_id: &Id) -> StopOutcome {
        if self.workers.request_stop(project_id) {
            info!(project_id = %project_id, "stop requested");
            return StopOutcome { ok: true };
        }

        match self.storage.active_run_for_project(project_id).await {
            Ok(Some(run)) => {
                let mut queue = Queue::new(run.max_parallel as usize);
                match worker::cancel_run(&self.storage, &run.id, &mut queue).await {
                    Ok(()) => StopOutcome { ok: true },
                    Err(err) => {
                        warn!(run_id = %run.id, error = %err, "failed to cancel detached run");
                        StopOutcome { ok: false }
                    }
                }
            }
            Ok(None) => StopOutcome { ok: false },
            Err(err) => {
                warn!(project_id = %project_id, error = %err, "failed to look up active run");
                StopOutcome { ok: false }
            }
        }
    }

    /// Fail attempts left `running` by a previous process.
    pub async fn recover_orphaned_attempts(&self) -> Result<u64, StorageError> {
        let failed = self
            .storage
            .fail_running_attempts("daemon restarted while attempt was running")
            .await?;
        if failed > 0 {
            warn!(failed, "failed orphaned running attempts");
        }
        Ok(failed)
    }

    /// Attach a worker loop to every `running` run without one.
    pub async fn reattach_running_runs(&self) -> Result<usize, StorageError> {
        let mut started = 0;
        for run in self
            .storage
            .list_runs_with_status(factory_core::RunStatus::Running)
            .await?
        {
            if self
                .start_or_attach(&run.project_id, &run.id, run.max_parallel)
                .started
            {
                started += 1;
            }
        }
        if started > 0 {
            info!(started, "attached worker loops to running runs");
        }
        Ok(started)
    }

    /// Stop worker loops and wait for in-flight attempts to wind down.
    pub async fn shutdown(&self) {
        info!(attempts = self.handles.len(), "factory shutting down");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Reset every in-memory registry.
    pub fn clear_registries(&self) {
        self.workers.clear();
        self.handles.clear();
        self.gc_locks.clear();
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{test_factory, BlockingDriver};
    use super::*;
    use crate::preflight::test_support::FakeProbe;
    use crate::storage::test_support::{project, run, task};
    use factory_core::{Attempt, AttemptStatus, Run, RunStatus};

    async fn running_run(factory: &Factory, tasks: usize) -> Run {
        let storage = factory.storage();
        let project = project("/repo");
        storage.insert_project(&project).await.unwrap();
        let run = run(&project.id, RunStatus::Pending, Vec::new());
        storage.insert_run(&run).await.unwrap();
        for _ in 0..tasks {
            let task = task(&project.id, "ready");
            storage.insert_task(&task).await.unwrap();
            storage.insert_attempt(&Attempt::queued(&run.id, &task.id)).await.unwrap();
        }
        storage.mark_run_running(&run.id).await.unwrap();
        storage.get_run(&run.id).await.unwrap()
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn second_start_attaches() {
        let driver = Arc::new(BlockingDriver::default());
        let tf = test_factory(driver.clone(), FakeProbe::default()).await;
        let run = running_run(&tf.factory, 1).await;

        assert!(tf.factory.start_or_attach(&run.project_id, &run.id, 2).started);
        assert!(!tf.factory.start_or_attach(&run.project_id, &run.id, 2).started);
        assert_eq!(tf.factory.workers().len(), 1);

        driver.release();
        let workers = Arc::clone(tf.factory.workers());
        wait_for(|| workers.is_empty()).await;
        let stored = tf.factory.storage().get_run(&run.id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn stop_cancels_detached_run() {
        let tf = test_factory(Arc::new(BlockingDriver::default()), FakeProbe::default()).await;
        assert!(!tf.factory.request_stop(&Id::new()).await.ok);

        let run = running_run(&tf.factory, 2).await;
        assert!(tf.factory.request_stop(&run.project_id).await.ok);

        let stored = tf.factory.storage().get_run(&run.id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Cancelled);
        let attempts = tf.factory.storage().list_attempts(&run.id).await.unwrap();
        assert!(attempts.iter().all(|a| a.status == AttemptStatus::Stopped));
    }

    #[tokio::test]
    async fn stop_reaches_live_worker() {
        let driver = Arc::new(BlockingDriver::default());
        let tf = test_factory(driver.clone(), FakeProbe::default()).await;
        let run = running_run(&tf.factory, 3).await;
        tf.factory.start_or_attach(&run.project_id, &run.id, 1);
        wait_for(|| driver.started() == 1).await;

        assert!(tf.factory.request_stop(&run.project_id).await.ok);
        let workers = Arc::clone(tf.factory.workers());
        wait_for(|| workers.is_empty()).await;

        let stored = tf.factory.storage().get_run(&run.id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Cancelled);
        let attempts = tf.factory.storage().list_attempts(&run.id).await.unwrap();
        let stopped = attempts.iter().filter(|a| a.status == AttemptStatus::Stopped).count();
        assert_eq!(stopped, 2);
        driver.release();
        tf.factory.shutdown().await;
    }

    #[tokio::test]
    async fn orphaned_running_attempts_fail_on_recovery() {
        let tf = test_factory(Arc::new(BlockingDriver::default()), FakeProbe::default()).await;
        let run = running_run(&tf.factory, 1).await;
        let attempt = &tf.factory.storage().list_attempts(&run.id).await.unwrap()[0];
        tf.factory.storage().mark_attempt_running(&attempt.id).await.unwrap();

        assert_eq!(tf.factory.recover_orphaned_attempts().await.unwrap(), 1);
        let stored = tf.factory.storage().get_attempt(&attempt.id).await.unwrap();
        assert_eq!(stored.status, AttemptStatus::Failed);
        assert!(stored.error.unwrap().contains("restarted"));
    }

    #[tokio::test]
    async fn shutdown_fails_in_flight_attempts() {
        let driver = Arc::new(BlockingDriver::default());
        let tf = test_factory(driver.clone(), FakeProbe::default()).await;
        let run = running_run(&tf.factory, 1).await;
        tf.factory.start_or_attach(&run.project_id, &run.id, 1);
        wait_for(|| driver.started() == 1).await;

        tf.factory.shutdown().await;
        assert!(tf.factory.handles().is_empty());
        let attempts = tf.factory.storage().list_attempts(&run.id).await.unwrap();
        assert_eq!(attempts[0].status, AttemptStatus::Failed);
        let stored = tf.factory.storage().get_run(&run.id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn one_shot_factory_never_spawns() {
        let tf = test_factory(Arc::new(BlockingDriver::default()), FakeProbe::default()).await;
        let run = running_run(&tf.factory, 1).await;
        let factory = tf.factory.without_workers();
        assert!(!factory.start_or_attach(&run.project_id, &run.id, 1).started);
        assert!(factory.workers().is_empty());
    }
}
