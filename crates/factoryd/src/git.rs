//! Git operations for the factory daemon.
//!
//! Thin synchronous wrappers over the `git` CLI. Async callers go through
//! `tokio::task::spawn_blocking` (see `worktree.rs` and `preflight.rs`).

use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Run git in `dir` and return trimmed stdout, failing on non-zero exit.
fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git").args(args).current_dir(dir).output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.first().copied().unwrap_or_default(),
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)?;
    Ok(stdout.trim().to_string())
}

/// Run git in `dir` and report only whether it exited successfully.
fn git_succeeds(dir: &Path, args: &[&str]) -> Result<bool> {
    let output = Command::new("git").args(args).current_dir(dir).output()?;
    Ok(output.status.success())
}

/// Detect the default branch for a repository.
///
/// Tries `refs/remotes/<remote>/HEAD` first, then local `main` and `master`.
/// `None` means nothing resolvable exists.
pub fn detect_default_branch(repo: &Path, remote: &str) -> Result<Option<String>> {
    let remote_head = format!("refs/remotes/{remote}/HEAD");
    let output = Command::new("git")
        .args(["symbolic-ref", &remote_head])
        .current_dir(repo)
        .output()?;

    if output.status.success() {
        let full_ref = String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)?;
        let prefix = format!("refs/remotes/{remote}/");
        if let Some(branch) = full_ref.trim().strip_prefix(&prefix) {
            return Ok(Some(branch.to_string()));
        }
    }

    for candidate in ["main", "master"] {
        if branch_exists(repo, candidate)? {
            return Ok(Some(candidate.to_string()));
        }
    }

    Ok(None)
}

/// Check if a branch exists locally.
pub fn branch_exists(repo: &Path, branch: &str) -> Result<bool> {
    git_succeeds(repo, &["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")])
}

/// Check if the working tree is clean (no uncommitted or untracked changes).
pub fn is_working_tree_clean(repo: &Path) -> Result<bool> {
    Ok(run_git(repo, &["status", "--porcelain"])?.is_empty())
}

/// Resolve a revision to a commit sha.
pub fn rev_parse(dir: &Path, rev: &str) -> Result<String> {
    run_git(dir, &["rev-parse", rev])
}

/// Create a worktree at `worktree_path` on a new branch `branch` from `base`.
///
/// An existing branch of the same name is reused.
pub fn create_worktree(repo: &Path, worktree_path: &Path, branch: &str, base: &str) -> Result<()> {
    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let path = worktree_path.to_string_lossy();
    if branch_exists(repo, branch)? {
        run_git(repo, &["worktree", "add", path.as_ref(), branch])?;
    } else {
        run_git(repo, &["worktree", "add", "-b", branch, path.as_ref(), base])?;
    }
    Ok(())
}

/// Create a detached worktree at the tip of `<remote>/<branch>`.
///
/// Detached so it works while `branch` is still checked out elsewhere.
pub fn create_detached_worktree(
    repo: &Path,
    worktree_path: &Path,
    remote: &str,
    branch: &str,
) -> Result<()> {
    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    run_git(repo, &["fetch", remote, branch])?;
    let upstream = format!("{remote}/{branch}");
    run_git(
        repo,
        &["worktree", "add", "--detach", worktree_path.to_string_lossy().as_ref(), &upstream],
    )?;
    Ok(())
}

/// Force remove a git worktree, discarding local changes.
pub fn remove_worktree(repo: &Path, worktree_path: &Path) -> Result<()> {
    run_git(
        repo,
        &["worktree", "remove", "--force", worktree_path.to_string_lossy().as_ref()],
    )?;
    Ok(())
}

/// Delete a local branch regardless of merge state.
pub fn delete_branch(repo: &Path, branch: &str) -> Result<()> {
    run_git(repo, &["branch", "-D", branch])?;
    Ok(())
}

/// Stage and commit everything in `dir`. Returns false if there was
/// nothing to commit.
pub fn commit_all(dir: &Path, message: &str) -> Result<bool> {
    run_git(dir, &["add", "-A"])?;
    if git_succeeds(dir, &["diff", "--cached", "--quiet"])? {
        return Ok(false);
    }
    run_git(dir, &["commit", "-m", message])?;
    Ok(true)
}

/// Number of commits on `head` that are not on `base`.
pub fn commits_ahead(dir: &Path, base: &str, head: &str) -> Result<u32> {
    let range = format!("{base}..{head}");
    let count = run_git(dir, &["rev-list", "--count", &range])?;
    count
        .parse()
        .map_err(|_| GitError::CommandFailed(format!("git rev-list: unexpected output {count}")))
}

pub fn push_branch(dir: &Path, remote: &str, branch: &str) -> Result<()> {
    run_git(dir, &["push", "--set-upstream", remote, branch])?;
    Ok(())
}

/// Push the detached HEAD of `dir` onto `branch` at `remote`.
pub fn push_head(dir: &Path, remote: &str, branch: &str) -> Result<()> {
    let refspec = format!("HEAD:refs/heads/{branch}");
    run_git(dir, &["push", remote, &refspec])?;
    Ok(())
}

/// `git push --dry-run` of HEAD. True if the remote would accept it.
pub fn can_push(repo: &Path, remote: &str) -> Result<bool> {
    git_succeeds(repo, &["push", "--dry-run", remote, "HEAD"])
}

/// Create a slug from free text (lowercase, alphanumeric, hyphens).
pub fn slugify(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// `<prefix><title-slug>-<attempt id suffix>`, e.g. `factory/add-login-3f2a9c1d`.
///
/// Keyed on the attempt so a retry never collides with the worktree or
/// branch of an earlier attempt that GC has not reclaimed yet.
pub fn branch_for_attempt(prefix: &str, title: &str, attempt_id: &str) -> String {
    let mut slug = slugify(title);
    slug.truncate(40);
    let slug = slug.trim_end_matches('-');
    let suffix: String = attempt_id
        .chars()
        .rev()
        .filter(char::is_ascii_alphanumeric)
        .take(8)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if slug.is_empty() {
        format!("{prefix}{suffix}")
    } else {
        format!("{prefix}{slug}-{suffix}")
    }
}

/// Filesystem-safe form of a branch name.
pub fn sanitize_branch_name(branch: &str) -> String {
    branch.replace('/', "-")
}

/// `<worktree_root>/<sanitized branch>`
pub fn worktree_path_for(worktree_root: &Path, branch: &str) -> PathBuf {
    worktree_root.join(sanitize_branch_name(branch))
}

#[cfg(test)]
pub(crate) mod test_repo {
    use std::process::Command;
    use tempfile::TempDir;

    pub(crate) fn git(dir: &std::path::Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap()
            .status;
        assert!(status.success(), "git {args:?} failed");
    }

    /// Create a test git repository with one commit on `main`.
    pub(crate) fn setup_test_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        git(dir.path(), &["init", "--initial-branch=main"]);
        git(dir.path(), &["config", "user.email", "test@test.com"]);
        git(dir.path(), &["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-m", "Initial commit"]);
        dir
    }
}

#[cfg(test)]
mod tests {
    use super::test_repo::*;
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("My Feature"), "my-feature");
        assert_eq!(slugify("Fix Bug #123"), "fix-bug-123");
        assert_eq!(slugify("  spaces  "), "spaces");
    }

    #[test]
    fn test_branch_for_attempt() {
        assert_eq!(
            branch_for_attempt("factory/", "Add login page", "0190-aaaa-3f2a9c1d"),
            "factory/add-login-page-3f2a9c1d"
        );
        assert_eq!(branch_for_attempt("factory/", "!!!", "abc"), "factory/abc");
        assert_ne!(
            branch_for_attempt("factory/", "Retry", "0190-aaaa-00000001"),
            branch_for_attempt("factory/", "Retry", "0190-aaaa-00000002")
        );
    }

    #[test]
    fn test_worktree_path_for() {
        assert_eq!(
            worktree_path_for(Path::new("/repo/.factory/worktrees"), "factory/x-1"),
            PathBuf::from("/repo/.factory/worktrees/factory-x-1")
        );
    }

    #[test]
    fn test_detect_default_branch() {
        let dir = setup_test_repo();
        assert_eq!(
            detect_default_branch(dir.path(), "origin").unwrap(),
            Some("main".to_string())
        );

        git(dir.path(), &["branch", "-m", "main", "trunk"]);
        assert_eq!(detect_default_branch(dir.path(), "origin").unwrap(), None);
    }

    #[test]
    fn test_is_working_tree_clean() {
        let dir = setup_test_repo();
        assert!(is_working_tree_clean(dir.path()).unwrap());

        std::fs::write(dir.path().join("untracked.txt"), "data").unwrap();
        assert!(!is_working_tree_clean(dir.path()).unwrap());
    }

    #[test]
    fn test_worktree_lifecycle() {
        let dir = setup_test_repo();
        let worktree = dir.path().join(".factory/worktrees/factory-t1");

        create_worktree(dir.path(), &worktree, "factory/t1", "main").unwrap();
        assert!(worktree.join("README.md").exists());
        assert!(branch_exists(dir.path(), "factory/t1").unwrap());

        std::fs::write(worktree.join("new.txt"), "hi").unwrap();
        assert!(commit_all(&worktree, "Add new.txt").unwrap());
        assert!(!commit_all(&worktree, "nothing").unwrap());
        assert_eq!(commits_ahead(&worktree, "main", "HEAD").unwrap(), 1);

        remove_worktree(dir.path(), &worktree).unwrap();
        assert!(!worktree.exists());
        delete_branch(dir.path(), "factory/t1").unwrap();
        assert!(!branch_exists(dir.path(), "factory/t1").unwrap());
    }

    #[test]
    fn test_remove_missing_worktree_fails() {
        let dir = setup_test_repo();
        let result = remove_worktree(dir.path(), &dir.path().join("nope"));
        assert!(matches!(result, Err(GitError::CommandFailed(_))));
    }

    #[test]
    fn test_detached_worktree_pushes_head() {
        let dir = setup_test_repo();
        let remote = tempfile::TempDir::new().unwrap();
        git(remote.path(), &["init", "--bare", "--initial-branch=main"]);
        git(dir.path(), &["remote", "add", "origin", remote.path().to_str().unwrap()]);
        git(dir.path(), &["checkout", "-b", "factory/pr"]);
        push_branch(dir.path(), "origin", "factory/pr").unwrap();

        let worktree = dir.path().join(".factory/worktrees/autofix-pr");
        create_detached_worktree(dir.path(), &worktree, "origin", "factory/pr").unwrap();
        std::fs::write(worktree.join("fix.txt"), "fixed").unwrap();
        assert!(commit_all(&worktree, "Fix").unwrap());
        push_head(&worktree, "origin", "factory/pr").unwrap();

        let pushed = rev_parse(remote.path(), "refs/heads/factory/pr").unwrap();
        assert_eq!(pushed, rev_parse(&worktree, "HEAD").unwrap());
        remove_worktree(dir.path(), &worktree).unwrap();
    }

    #[test]
    fn test_rev_parse_head() {
        let dir = setup_test_repo();
        let sha = rev_parse(dir.path(), "HEAD").unwrap();
        assert_eq!(sha.len(), 40);
    }
}
