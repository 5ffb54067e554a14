//! Worktree garbage collection.
//!
//! Removes worktrees of attempts that finished more than `gc_delay_minutes`
//! ago. Cleanup failures are logged and skipped; a GC pass never errors.

use chrono::{DateTime, Duration, Utc};
use factory_core::events::{EventPayload, WorktreeCleanedPayload};
use factory_core::{Attempt, Id};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::factory::Factory;
use crate::storage::Storage;
use crate::worktree::WorktreeManager;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    /// Attempts whose worktree was removed.
    pub cleaned: Vec<Id>,
    /// True if another guarded pass held the project's lock.
    pub skipped: bool,
}

/// One GC pass over `project_id` as of `now`.
pub async fn collect_worktrees(
    storage: &Storage,
    worktrees: &dyn WorktreeManager,
    project_id: &Id,
    delay: Duration,
    now: DateTime<Utc>,
) -> Vec<Id> {
    let project = match storage.get_project(project_id).await {
        Ok(project) => project,
        Err(err) => {
            warn!(project_id = %project_id, error = %err, "gc: project lookup failed");
            return Vec::new();
        }
    };
    let candidates = match storage.gc_candidates(project_id, now - delay).await {
        Ok(candidates) => candidates,
        Err(err) => {
            warn!(project_id = %project_id, error = %err, "gc: candidate query failed");
            return Vec::new();
        }
    };

    let repo = PathBuf::from(&project.repo_path);
    let mut cleaned = Vec::new();
    for attempt in candidates {
        let Some(path) = attempt.worktree_path.as_deref().map(PathBuf::from) else {
            continue;
        };
        if !path.exists() {
            debug!(attempt_id = %attempt.id, path = %path.display(), "gc: worktree already gone");
            continue;
        }
        if clean_one(storage, worktrees, &repo, &attempt, &path).await {
            cleaned.push(attempt.id);
        }
    }

    if !cleaned.is_empty() {
        info!(project_id = %project_id, cleaned = cleaned.len(), "gc: worktrees removed");
    }
    cleaned
}

async fn clean_one(
    storage: &Storage,
    worktrees: &dyn WorktreeManager,
    repo: &Path,
    attempt: &Attempt,
    path: &Path,
) -> bool {
    if let Err(err) = worktrees.remove_worktree(repo, path).await {
        warn!(attempt_id = %attempt.id, path = %path.display(), error = %err, "gc: worktree removal failed");
        return false;
    }

    let mut branch_deleted = false;
    if let Some(branch) = &attempt.branch {
        match worktrees.delete_branch(repo, branch).await {
            Ok(()) => branch_deleted = true,
            Err(err) => warn!(attempt_id = %attempt.id, branch = %branch, error = %err, "gc: branch delete failed"),
        }
    }

    if let Err(err) = storage.mark_worktree_cleaned(&attempt.id).await {
        warn!(attempt_id = %attempt.id, error = %err, "gc: failed to mark worktree cleaned");
    }
    let payload = EventPayload::WorktreeCleaned(WorktreeCleanedPayload {
        attempt_id: attempt.id.clone(),
        worktree_path: path.to_string_lossy().to_string(),
        branch_deleted,
    });
    if let Err(err) = storage.append_event(&attempt.run_id, &payload).await {
        warn!(attempt_id = %attempt.id, error = %err, "gc: failed to record cleanup event");
    }
    true
}

/// Ten years. Larger configured delays are clamped.
const MAX_GC_DELAY_MINUTES: u64 = 60 * 24 * 365 * 10;

impl Factory {
    fn gc_delay(&self) -> Duration {
        Duration::minutes(self.config.gc_delay_minutes.min(MAX_GC_DELAY_MINUTES) as i64)
    }

    /// Unguarded GC pass.
    pub async fn run_worktree_gc(&self, project_id: &Id) -> GcReport {
        let cleaned = collect_worktrees(
            &self.storage,
            self.collab.worktrees.as_ref(),
            project_id,
            self.gc_delay(),
            Utc::now(),
        )
        .await;
        GcReport {
            cleaned,
            skipped: false,
        }
    }

    /// GC pass that is skipped if one is already running for the project.
    pub async fn run_worktree_gc_guarded(&self, project_id: &Id) -> GcReport {
        let Some(_guard) = self.gc_locks.try_acquire(project_id) else {
            debug!(project_id = %project_id, "gc: pass already in flight");
            return GcReport {
                cleaned: Vec::new(),
                skipped: true,
            };
        };
        self.run_worktree_gc(project_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::test_support::test_factory_with;
    use crate::storage::test_support::{create_test_storage, project, run, task};
    use crate::worktree::{self, WorktreeError};
    use async_trait::async_trait;
    use factory_core::{AttemptOutcome, RunStatus};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Deletes the directory itself; fails for paths listed in `fail`.
    #[derive(Default)]
    struct FakeWorktrees {
        fail: Vec<PathBuf>,
        removed: Mutex<Vec<PathBuf>>,
        deleted_branches: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WorktreeManager for FakeWorktrees {
        async fn create_worktree(&self, _: &Path, path: &Path, _: &str, _: &str) -> worktree::Result<()> {
            std::fs::create_dir_all(path).map_err(|e| WorktreeError::Git(e.into()))
        }

        async fn remove_worktree(&self, _repo: &Path, path: &Path) -> worktree::Result<()> {
            if self.fail.iter().any(|p| p == path) {
                return Err(WorktreeError::Git(crate::git::GitError::CommandFailed(
                    "locked".to_string(),
                )));
            }
            std::fs::remove_dir_all(path).map_err(|e| WorktreeError::Git(e.into()))?;
            self.removed.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }

        async fn delete_branch(&self, _repo: &Path, branch: &str) -> worktree::Result<()> {
            self.deleted_branches.lock().unwrap().push(branch.to_string());
            Ok(())
        }
    }

    /// Store a finished attempt with a real directory as its worktree.
    async fn finished_attempt(storage: &Storage, run_id: &Id, project_id: &Id, dir: &Path, name: &str) -> (Attempt, PathBuf) {
        let task = task(project_id, "ready");
        storage.insert_task(&task).await.unwrap();
        let attempt = Attempt::queued(run_id, &task.id);
        storage.insert_attempt(&attempt).await.unwrap();
        storage.mark_attempt_running(&attempt.id).await.unwrap();

        let path = dir.join(name);
        std::fs::create_dir_all(&path).unwrap();
        let outcome = AttemptOutcome {
            success: true,
            branch: Some(format!("factory/{name}")),
            worktree_path: Some(path.to_string_lossy().to_string()),
            ..AttemptOutcome::default()
        };
        storage.finish_attempt(&attempt.id, &outcome).await.unwrap();
        let stored = storage.get_attempt(&attempt.id).await.unwrap();
        (stored, path)
    }

    #[tokio::test]
    async fn respects_delay_boundary() {
        let ts = create_test_storage().await;
        let dir = TempDir::new().unwrap();
        let project = project(dir.path().to_str().unwrap());
        ts.storage.insert_project(&project).await.unwrap();
        let run = run(&project.id, RunStatus::Completed, Vec::new());
        ts.storage.insert_run(&run).await.unwrap();
        let (attempt, path) = finished_attempt(&ts.storage, &run.id, &project.id, dir.path(), "a").await;
        let finished = attempt.finished_at.unwrap();
        let delay = Duration::minutes(30);
        let fake = FakeWorktrees::default();

        let early = finished + delay - Duration::seconds(1);
        let cleaned = collect_worktrees(&ts.storage, &fake, &project.id, delay, early).await;
        assert!(cleaned.is_empty());
        assert!(path.exists());

        let late = finished + delay + Duration::seconds(1);
        let cleaned = collect_worktrees(&ts.storage, &fake, &project.id, delay, late).await;
        assert_eq!(cleaned, vec![attempt.id.clone()]);
        assert!(!path.exists());
        assert_eq!(*fake.deleted_branches.lock().unwrap(), vec!["factory/a".to_string()]);

        let stored = ts.storage.get_attempt(&attempt.id).await.unwrap();
        assert!(stored.worktree_cleaned_at.is_some());
        let again = collect_worktrees(&ts.storage, &fake, &project.id, delay, late).await;
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn removal_failure_is_skipped() {
        let ts = create_test_storage().await;
        let dir = TempDir::new().unwrap();
        let project = project(dir.path().to_str().unwrap());
        ts.storage.insert_project(&project).await.unwrap();
        let run = run(&project.id, RunStatus::Completed, Vec::new());
        ts.storage.insert_run(&run).await.unwrap();
        let (stuck, stuck_path) = finished_attempt(&ts.storage, &run.id, &project.id, dir.path(), "stuck").await;
        let (ok, _) = finished_attempt(&ts.storage, &run.id, &project.id, dir.path(), "ok").await;

        let fake = FakeWorktrees {
            fail: vec![stuck_path.clone()],
            ..FakeWorktrees::default()
        };
        let later = Utc::now() + Duration::hours(1);
        let cleaned = collect_worktrees(&ts.storage, &fake, &project.id, Duration::minutes(30), later).await;

        assert_eq!(cleaned, vec![ok.id]);
        assert!(stuck_path.exists());
        let stored = ts.storage.get_attempt(&stuck.id).await.unwrap();
        assert!(stored.worktree_cleaned_at.is_none());
    }

    #[tokio::test]
    async fn guarded_pass_skips_while_another_holds_the_project() {
        let tf = test_factory_with(
            |collab| collab.worktrees = std::sync::Arc::new(FakeWorktrees::default()),
            |config| config.gc_delay_minutes = 0,
        )
        .await;
        let storage = tf.factory.storage();
        let dir = TempDir::new().unwrap();
        let project = project(dir.path().to_str().unwrap());
        storage.insert_project(&project).await.unwrap();
        let run = run(&project.id, RunStatus::Completed, Vec::new());
        storage.insert_run(&run).await.unwrap();
        let (attempt, path) = finished_attempt(storage, &run.id, &project.id, dir.path(), "held").await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let held = tf.factory.gc_locks().try_acquire(&project.id).unwrap();
        let report = tf.factory.run_worktree_gc_guarded(&project.id).await;
        assert!(report.skipped);
        assert!(report.cleaned.is_empty());
        assert!(path.exists());

        // Other projects are not blocked by this one's pass.
        let other = tf.factory.run_worktree_gc_guarded(&Id::new()).await;
        assert!(!other.skipped);

        drop(held);
        assert!(!tf.factory.gc_locks().is_held(&project.id));
        let report = tf.factory.run_worktree_gc_guarded(&project.id).await;
        assert!(!report.skipped);
        assert_eq!(report.cleaned, vec![attempt.id]);
        assert!(!tf.factory.gc_locks().is_held(&project.id));
    }

    #[tokio::test]
    async fn missing_worktree_is_not_a_candidate() {
        let ts = create_test_storage().await;
        let dir = TempDir::new().unwrap();
        let project = project(dir.path().to_str().unwrap());
        ts.storage.insert_project(&project).await.unwrap();
        let run = run(&project.id, RunStatus::Completed, Vec::new());
        ts.storage.insert_run(&run).await.unwrap();
        let (_, path) = finished_attempt(&ts.storage, &run.id, &project.id, dir.path(), "gone").await;
        std::fs::remove_dir_all(&path).unwrap();

        let fake = FakeWorktrees::default();
        let later = Utc::now() + Duration::hours(1);
        let cleaned = collect_worktrees(&ts.storage, &fake, &project.id, Duration::minutes(30), later).await;
        assert!(cleaned.is_empty());
        assert!(fake.removed.lock().unwrap().is_empty());
    }
}
