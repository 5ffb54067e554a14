//! factoryd - autonomous task factory daemon
//!
//! Library components for the daemon process: storage, the per-project
//! worker loops, and the maintenance passes run by `serve`.

pub mod autofix;
pub mod cancel;
pub mod diagnostics;
pub mod factory;
pub mod gc;
pub mod git;
pub mod host;
pub mod preflight;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod storage;
pub mod worker;
pub mod worktree;

use std::sync::Arc;
use std::time::Duration;

use factory_core::{FactoryConfig, Id};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use factory::{Collaborators, Factory, StartOutcome, StopOutcome};
use storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, DaemonError>;

/// Open the database at `config.db_path` and apply the schema.
pub async fn open_storage(config: &FactoryConfig) -> Result<Storage> {
    let storage = Storage::new(&config.db_path).await?;
    storage.migrate_embedded().await?;
    Ok(storage)
}

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    factory: Arc<Factory>,
    shutdown: CancellationToken,
}

impl Daemon {
    pub async fn new(config: FactoryConfig) -> Result<Self> {
        let storage = open_storage(&config).await?;
        let config = Arc::new(config);
        let collab = Collaborators::from_config(&config);
        Ok(Self::with_factory(Factory::new(storage, config, collab)))
    }

    pub fn with_factory(factory: Factory) -> Self {
        Self {
            factory: Arc::new(factory),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn factory(&self) -> &Arc<Factory> {
        &self.factory
    }

    /// Recover, then run maintenance until shutdown is requested. In-flight
    /// attempts are drained before this returns.
    pub async fn run(&self) -> Result<()> {
        let config = self.factory.config();
        info!(db = %config.db_path.display(), "factoryd starting");

        if config.fail_orphaned_attempts_on_start {
            self.factory.recover_orphaned_attempts().await?;
        }
        self.factory.reattach_running_runs().await?;

        let mut ticker =
            tokio::time::interval(Duration::from_secs(config.maintenance_interval_sec.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.maintain().await,
            }
        }

        self.factory.shutdown().await;
        info!("factoryd stopped");
        Ok(())
    }

    /// One maintenance pass. Failures are logged; the next pass retries.
    pub async fn maintain(&self) {
        let projects = match self.factory.storage().list_projects().await {
            Ok(projects) => projects,
            Err(err) => {
                warn!(error = %err, "maintenance: failed to list projects");
                return;
            }
        };

        for project in &projects {
            let report = self.factory.run_worktree_gc_guarded(&project.id).await;
            debug!(project_id = %project.id, cleaned = report.cleaned.len(), skipped = report.skipped, "maintenance: gc");
        }

        if let Err(err) = self.factory.find_stuck_runs().await {
            warn!(error = %err, "maintenance: stuck-run scan failed");
        }
        if let Err(err) = self.factory.reattach_running_runs().await {
            warn!(error = %err, "maintenance: reattach failed");
        }

        if !self.factory.config().autofix_enabled {
            return;
        }
        for project in &projects {
            self.autofix_sweep(&project.id).await;
        }
    }

    /// Auto-fix every run of the project that still has unrecorded pull
    /// requests. Returns the number of runs visited.
    pub async fn autofix_sweep(&self, project_id: &Id) -> usize {
        let runs = match self.factory.storage().runs_awaiting_autofix(project_id).await {
            Ok(runs) => runs,
            Err(err) => {
                warn!(project_id = %project_id, error = %err, "maintenance: run lookup failed");
                return 0;
            }
        };
        for run in &runs {
            let results = self.factory.run_autofix(&run.id).await;
            debug!(run_id = %run.id, results = results.len(), "maintenance: autofix sweep");
        }
        runs.len()
    }

    /// Signal the daemon to shut down.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
    }
}
