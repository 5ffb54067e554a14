//! Worktree manager interface and the git-backed implementation.
//!
//! The runner creates worktrees through this trait and GC removes them, so
//! tests can swap in a fake that fails on demand.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::git;

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("worktree task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// Worktree lifecycle operations.
#[async_trait]
pub trait WorktreeManager: Send + Sync {
    /// Create `worktree_path` on a new `branch` cut from `base`.
    async fn create_worktree(
        &self,
        repo: &Path,
        worktree_path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<()>;

    async fn remove_worktree(&self, repo: &Path, worktree_path: &Path) -> Result<()>;

    async fn delete_branch(&self, repo: &Path, branch: &str) -> Result<()>;
}

/// Native `git worktree` implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitWorktrees;

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> git::Result<T> + Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}

#[async_trait]
impl WorktreeManager for GitWorktrees {
    async fn create_worktree(
        &self,
        repo: &Path,
        worktree_path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<()> {
        let (repo, path): (PathBuf, PathBuf) = (repo.to_path_buf(), worktree_path.to_path_buf());
        let (branch, base) = (branch.to_string(), base.to_string());
        blocking(move || git::create_worktree(&repo, &path, &branch, &base)).await
    }

    async fn remove_worktree(&self, repo: &Path, worktree_path: &Path) -> Result<()> {
        let (repo, path) = (repo.to_path_buf(), worktree_path.to_path_buf());
        blocking(move || git::remove_worktree(&repo, &path)).await
    }

    async fn delete_branch(&self, repo: &Path, branch: &str) -> Result<()> {
        let (repo, branch) = (repo.to_path_buf(), branch.to_string());
        blocking(move || git::delete_branch(&repo, &branch)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_repo::setup_test_repo;

    #[tokio::test]
    async fn git_worktrees_round_trip() {
        let dir = setup_test_repo();
        let path = dir.path().join(".factory/worktrees/factory-a");
        let manager = GitWorktrees;

        manager
            .create_worktree(dir.path(), &path, "factory/a", "main")
            .await
            .unwrap();
        assert!(path.exists());

        manager.remove_worktree(dir.path(), &path).await.unwrap();
        manager.delete_branch(dir.path(), "factory/a").await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn delete_unknown_branch_errors() {
        let dir = setup_test_repo();
        let err = GitWorktrees
            .delete_branch(dir.path(), "factory/missing")
            .await
            .unwrap_err();
        assert!(matches!(err, WorktreeError::Git(_)));
    }
}
