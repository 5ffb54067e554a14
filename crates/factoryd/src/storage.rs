//! SQLite storage for the factory daemon.
//!
//! Persists projects, tasks, runs, attempts, autofix records, events and
//! artifacts. Attempt rows are the source of truth for queue state; every
//! status transition here is a conditional update so concurrent writers
//! (worker tick, attempt completion, cancellation) cannot clobber each other.

use chrono::{DateTime, Utc};
use factory_core::{
    events::EventPayload, Artifact, Attempt, AttemptOutcome, AttemptStatus, AutofixOutcome,
    AutofixRecord, AutofixStrategy, Event, Id, Project, Run, RunMode, RunStatus, Task,
    TaskSelector,
};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use thiserror::Error;

const RUNS_COLUMNS: &str = "id, project_id, mode, max_parallel, selector_json, status, \
    created_at, started_at, finished_at, error";

const ATTEMPTS_COLUMNS: &str = "id, task_id, run_id, status, created_at, started_at, \
    finished_at, branch, base_commit, head_commit, worktree_path, exit_code, pr_url, \
    pr_number, error, worktree_cleaned_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("project not found: {0}")]
    ProjectNotFound(String),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("attempt not found: {0}")]
    AttemptNotFound(String),
    #[error("corrupt row in {table}: {detail}")]
    CorruptRow { table: &'static str, detail: String },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for the daemon.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Open (or create) the database at `db_path`.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Apply the embedded schema. Safe to run repeatedly.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    // --- Projects ---

    pub async fn insert_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            "INSERT INTO projects (id, name, repo_path, base_branch, github_repo, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(project.id.as_ref())
        .bind(&project.name)
        .bind(&project.repo_path)
        .bind(&project.base_branch)
        .bind(&project.github_repo)
        .bind(project.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_project(&self, id: &Id) -> Result<Project> {
        let row = sqlx::query_as::<_, ProjectRow>(
            "SELECT id, name, repo_path, base_branch, github_repo, created_at \
             FROM projects WHERE id = ?1",
        )
        .bind(id.as_ref())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::ProjectNotFound(id.to_string()))?;
        Ok(row.into_project())
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query_as::<_, ProjectRow>(
            "SELECT id, name, repo_path, base_branch, github_repo, created_at \
             FROM projects ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ProjectRow::into_project).collect())
    }

    // --- Tasks ---

    pub async fn insert_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            "INSERT INTO tasks (id, project_id, title, description, column_name, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(task.id.as_ref())
        .bind(task.project_id.as_ref())
        .bind(&task.title)
        .bind(&task.description)
        .bind(&task.column_name)
        .bind(task.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_task(&self, id: &Id) -> Result<Task> {
        let row = sqlx::query_as::<_, TaskRow>(
            "SELECT id, project_id, title, description, column_name, created_at \
             FROM tasks WHERE id = ?1",
        )
        .bind(id.as_ref())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::TaskNotFound(id.to_string()))?;
        Ok(row.into_task())
    }

    /// Tasks in a board column, oldest first.
    pub async fn list_tasks_in_column(&self, project_id: &Id, column: &str) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT id, project_id, title, description, column_name, created_at \
             FROM tasks WHERE project_id = ?1 AND column_name = ?2 \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(project_id.as_ref())
        .bind(column)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(TaskRow::into_task).collect())
    }

    // --- Runs ---

    pub async fn insert_run(&self, run: &Run) -> Result<()> {
        let selector_json = serde_json::to_string(&run.selector)?;
        sqlx::query(
            r#"
            INSERT INTO runs (id, project_id, mode, max_parallel, selector_json, status,
                              created_at, started_at, finished_at, error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(run.id.as_ref())
        .bind(run.project_id.as_ref())
        .bind(run.mode.as_str())
        .bind(i64::from(run.max_parallel))
        .bind(&selector_json)
        .bind(run.status.as_str())
        .bind(run.created_at.timestamp_millis())
        .bind(run.started_at.map(|t| t.timestamp_millis()))
        .bind(run.finished_at.map(|t| t.timestamp_millis()))
        .bind(&run.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_run(&self, id: &Id) -> Result<Run> {
        let query = format!("SELECT {RUNS_COLUMNS} FROM runs WHERE id = ?1");
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::RunNotFound(id.to_string()))?;
        row.into_run()
    }

    /// Most recent `pending` or `running` run of a project.
    pub async fn active_run_for_project(&self, project_id: &Id) -> Result<Option<Run>> {
        let query = format!(
            "SELECT {RUNS_COLUMNS} FROM runs WHERE project_id = ?1 \
             AND status IN ('pending', 'running') \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(project_id.as_ref())
            .fetch_optional(&self.pool)
            .await?;
        row.map(RunRow::into_run).transpose()
    }

    pub async fn list_runs_with_status(&self, status: RunStatus) -> Result<Vec<Run>> {
        let query = format!(
            "SELECT {RUNS_COLUMNS} FROM runs WHERE status = ?1 ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, RunRow>(&query)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(RunRow::into_run).collect()
    }

    /// Non-cancelled runs of a project with a finished attempt whose pull
    /// request has no autofix record yet.
    pub async fn runs_awaiting_autofix(&self, project_id: &Id) -> Result<Vec<Run>> {
        let query = format!(
            "SELECT {RUNS_COLUMNS} FROM runs WHERE project_id = ?1 AND status != 'cancelled' \
             AND id IN (SELECT a.run_id FROM attempts a \
                 WHERE a.status IN ('completed', 'failed') AND a.pr_url IS NOT NULL \
                 AND NOT EXISTS (SELECT 1 FROM autofix_records f \
                     WHERE f.run_id = a.run_id AND f.pr_url = a.pr_url)) \
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, RunRow>(&query)
            .bind(project_id.as_ref())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(RunRow::into_run).collect()
    }

    /// `pending -> running`. Returns false if the run is no longer active.
    pub async fn mark_run_running(&self, id: &Id) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE runs SET status = 'running', started_at = COALESCE(started_at, ?1) \
             WHERE id = ?2 AND status IN ('pending', 'running')",
        )
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move an active run to a terminal status. Returns false if the run was
    /// already terminal, or for `Completed` while it still has live attempts.
    pub async fn finish_run(&self, id: &Id, status: RunStatus, error: Option<&str>) -> Result<bool> {
        // An attempt queued after the caller saw the run drained keeps it open.
        let drained = if status == RunStatus::Completed {
            " AND NOT EXISTS (SELECT 1 FROM attempts WHERE run_id = ?4 \
             AND status IN ('queued', 'pending', 'running'))"
        } else {
            ""
        };
        let now = Utc::now().timestamp_millis();
        let query = format!(
            "UPDATE runs SET status = ?1, finished_at = ?2, error = ?3 \
             WHERE id = ?4 AND status IN ('pending', 'running'){drained}"
        );
        let result = sqlx::query(&query)
            .bind(status.as_str())
            .bind(now)
            .bind(error)
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // --- Attempts ---

    pub async fn insert_attempt(&self, attempt: &Attempt) -> Result<()> {
        let query = format!(
            "INSERT INTO attempts ({ATTEMPTS_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
        );
        bind_attempt(sqlx::query(&query), attempt)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert `attempt` unless its task already has a live attempt in the
    /// same run. Returns whether a row was written.
    pub async fn insert_attempt_if_absent(&self, attempt: &Attempt) -> Result<bool> {
        let query = format!(
            "INSERT INTO attempts ({ATTEMPTS_COLUMNS}) \
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16 \
             WHERE NOT EXISTS (SELECT 1 FROM attempts WHERE run_id = ?3 AND task_id = ?2 \
             AND status IN ('queued', 'pending', 'running'))"
        );
        let result = bind_attempt(sqlx::query(&query), attempt)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_attempt(&self, id: &Id) -> Result<Attempt> {
        let query = format!("SELECT {ATTEMPTS_COLUMNS} FROM attempts WHERE id = ?1");
        let row = sqlx::query_as::<_, AttemptRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::AttemptNotFound(id.to_string()))?;
        row.into_attempt()
    }

    pub async fn find_attempt(&self, id: &Id) -> Result<Option<Attempt>> {
        match self.get_attempt(id).await {
            Ok(attempt) => Ok(Some(attempt)),
            Err(StorageError::AttemptNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// All attempts of a run in creation order.
    pub async fn list_attempts(&self, run_id: &Id) -> Result<Vec<Attempt>> {
        let query = format!(
            "SELECT {ATTEMPTS_COLUMNS} FROM attempts WHERE run_id = ?1 \
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, AttemptRow>(&query)
            .bind(run_id.as_ref())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(AttemptRow::into_attempt).collect()
    }

    /// Oldest `queued`/`pending` attempt for a task within a run.
    pub async fn oldest_waiting_attempt(&self, run_id: &Id, task_id: &Id) -> Result<Option<Attempt>> {
        let query = format!(
            "SELECT {ATTEMPTS_COLUMNS} FROM attempts WHERE run_id = ?1 AND task_id = ?2 \
             AND status IN ('queued', 'pending') ORDER BY created_at ASC, id ASC LIMIT 1"
        );
        let row = sqlx::query_as::<_, AttemptRow>(&query)
            .bind(run_id.as_ref())
            .bind(task_id.as_ref())
            .fetch_optional(&self.pool)
            .await?;
        row.map(AttemptRow::into_attempt).transpose()
    }

    /// `queued|pending -> running`. Returns false if the attempt moved on.
    pub async fn mark_attempt_running(&self, id: &Id) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE attempts SET status = 'running', started_at = ?1 \
             WHERE id = ?2 AND status IN ('queued', 'pending')",
        )
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `running -> completed|failed` from a driver outcome. Returns false if
    /// the attempt is no longer running (e.g. it was hard-cancelled); the
    /// outcome's branch, commits and worktree are still filled in then.
    pub async fn finish_attempt(&self, id: &Id, outcome: &AttemptOutcome) -> Result<bool> {
        let status = if outcome.success {
            AttemptStatus::Completed
        } else {
            AttemptStatus::Failed
        };
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE attempts SET status = ?1, finished_at = ?2, exit_code = ?3,
                branch = COALESCE(?4, branch), base_commit = COALESCE(?5, base_commit),
                head_commit = COALESCE(?6, head_commit),
                worktree_path = COALESCE(?7, worktree_path),
                pr_url = COALESCE(?8, pr_url), pr_number = COALESCE(?9, pr_number),
                error = ?10
            WHERE id = ?11 AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(now)
        .bind(outcome.exit_code)
        .bind(&outcome.branch)
        .bind(&outcome.base_commit)
        .bind(&outcome.head_commit)
        .bind(&outcome.worktree_path)
        .bind(&outcome.pr_url)
        .bind(outcome.pr_number)
        .bind(&outcome.error)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }

        // Stopped or failed elsewhere; keep what the driver learned so GC can
        // still find the worktree.
        sqlx::query(
            r#"
            UPDATE attempts SET branch = COALESCE(branch, ?1),
                base_commit = COALESCE(base_commit, ?2),
                head_commit = COALESCE(head_commit, ?3),
                worktree_path = COALESCE(worktree_path, ?4),
                pr_url = COALESCE(pr_url, ?5), pr_number = COALESCE(pr_number, ?6)
            WHERE id = ?7
            "#,
        )
        .bind(&outcome.branch)
        .bind(&outcome.base_commit)
        .bind(&outcome.head_commit)
        .bind(&outcome.worktree_path)
        .bind(&outcome.pr_url)
        .bind(outcome.pr_number)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(false)
    }

    /// Record an attempt's branch and worktree once the worktree exists,
    /// before the agent runs.
    pub async fn set_attempt_workspace(&self, id: &Id, branch: &str, worktree_path: &str) -> Result<()> {
        let result = sqlx::query("UPDATE attempts SET branch = ?1, worktree_path = ?2 WHERE id = ?3")
            .bind(branch)
            .bind(worktree_path)
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::AttemptNotFound(id.to_string()));
        }
        Ok(())
    }

    /// `expected -> stopped`. Returns false if the attempt was not in
    /// `expected`.
    pub async fn stop_attempt(&self, id: &Id, expected: AttemptStatus, reason: &str) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE attempts SET status = 'stopped', finished_at = ?1, \
             error = COALESCE(error, ?2) WHERE id = ?3 AND status = ?4",
        )
        .bind(now)
        .bind(reason)
        .bind(id.as_ref())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Soft-cancel every waiting attempt of a run. Returns the stopped ids.
    pub async fn stop_waiting_attempts(&self, run_id: &Id, reason: &str) -> Result<Vec<Id>> {
        let now = Utc::now().timestamp_millis();
        let ids: Vec<String> = sqlx::query_scalar(
            "UPDATE attempts SET status = 'stopped', finished_at = ?1, \
             error = COALESCE(error, ?2) \
             WHERE run_id = ?3 AND status IN ('queued', 'pending') RETURNING id",
        )
        .bind(now)
        .bind(reason)
        .bind(run_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(Id::from_string).collect())
    }

    /// Fail every `running` attempt. Used at startup, when no process from a
    /// previous daemon can still be attached.
    pub async fn fail_running_attempts(&self, reason: &str) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE attempts SET status = 'failed', finished_at = ?1, error = ?2 \
             WHERE status = 'running'",
        )
        .bind(now)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Terminal attempts of a project finished strictly before `cutoff` whose
    /// worktree has not been cleaned.
    pub async fn gc_candidates(&self, project_id: &Id, cutoff: DateTime<Utc>) -> Result<Vec<Attempt>> {
        let query = format!(
            "SELECT {ATTEMPTS_COLUMNS} FROM attempts \
             WHERE run_id IN (SELECT id FROM runs WHERE project_id = ?1) \
             AND status IN ('completed', 'failed', 'stopped') \
             AND finished_at IS NOT NULL AND finished_at < ?2 \
             AND worktree_path IS NOT NULL AND worktree_cleaned_at IS NULL \
             ORDER BY finished_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, AttemptRow>(&query)
            .bind(project_id.as_ref())
            .bind(cutoff.timestamp_millis())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(AttemptRow::into_attempt).collect()
    }

    pub async fn mark_worktree_cleaned(&self, id: &Id) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query("UPDATE attempts SET worktree_cleaned_at = ?1 WHERE id = ?2")
            .bind(now)
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::AttemptNotFound(id.to_string()));
        }
        Ok(())
    }

    // --- Autofix records ---

    pub async fn has_autofix_record(&self, run_id: &Id, pr_url: &str) -> Result<bool> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM autofix_records WHERE run_id = ?1 AND pr_url = ?2")
                .bind(run_id.as_ref())
                .bind(pr_url)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0 > 0)
    }

    /// Insert a record. Returns false if one already exists for the PR.
    pub async fn insert_autofix_record(&self, record: &AutofixRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO autofix_records (id, run_id, pr_url, outcome, category, strategy,
                                         report_path, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(run_id, pr_url) DO NOTHING
            "#,
        )
        .bind(record.id.as_ref())
        .bind(record.run_id.as_ref())
        .bind(&record.pr_url)
        .bind(record.outcome.as_str())
        .bind(&record.category)
        .bind(record.strategy.as_str())
        .bind(&record.report_path)
        .bind(record.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_autofix_records(&self, run_id: &Id) -> Result<Vec<AutofixRecord>> {
        let rows = sqlx::query_as::<_, AutofixRow>(
            "SELECT id, run_id, pr_url, outcome, category, strategy, report_path, created_at \
             FROM autofix_records WHERE run_id = ?1 ORDER BY created_at ASC, id ASC",
        )
        .bind(run_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AutofixRow::into_record).collect()
    }

    // --- Events ---

    /// Append an event to the audit log.
    pub async fn append_event(&self, run_id: &Id, payload: &EventPayload) -> Result<Event> {
        let id = Id::new();
        let now = Utc::now();
        let event_type = payload.event_type().as_str().to_string();
        let payload_json = payload.to_json()?;
        let attempt_id = payload.attempt_id().cloned();

        sqlx::query(
            "INSERT INTO events (id, run_id, attempt_id, type, ts, payload_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(id.as_ref())
        .bind(run_id.as_ref())
        .bind(attempt_id.as_ref().map(|a| a.as_ref()))
        .bind(&event_type)
        .bind(now.timestamp_millis())
        .bind(&payload_json)
        .execute(&self.pool)
        .await?;

        Ok(Event {
            id,
            run_id: run_id.clone(),
            attempt_id,
            event_type,
            timestamp: now,
            payload_json,
        })
    }

    /// List events for a run.
    pub async fn list_events(&self, run_id: &Id) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, run_id, attempt_id, type, ts, payload_json FROM events \
             WHERE run_id = ?1 ORDER BY ts ASC, id ASC",
        )
        .bind(run_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }

    // --- Artifacts ---

    pub async fn insert_artifact(&self, artifact: &Artifact) -> Result<()> {
        sqlx::query(
            "INSERT INTO artifacts (id, run_id, kind, path, checksum) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(artifact.id.as_ref())
        .bind(artifact.run_id.as_ref())
        .bind(&artifact.kind)
        .bind(&artifact.path)
        .bind(&artifact.checksum)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_artifacts(&self, run_id: &Id) -> Result<Vec<Artifact>> {
        let rows = sqlx::query_as::<_, ArtifactRow>(
            "SELECT id, run_id, kind, path, checksum FROM artifacts WHERE run_id = ?1 ORDER BY kind, id",
        )
        .bind(run_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ArtifactRow::into_artifact).collect())
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_attempt<'q>(query: SqliteQuery<'q>, attempt: &'q Attempt) -> SqliteQuery<'q> {
    query
        .bind(attempt.id.as_ref())
        .bind(attempt.task_id.as_ref())
        .bind(attempt.run_id.as_ref())
        .bind(attempt.status.as_str())
        .bind(attempt.created_at.timestamp_millis())
        .bind(attempt.started_at.map(|t| t.timestamp_millis()))
        .bind(attempt.finished_at.map(|t| t.timestamp_millis()))
        .bind(&attempt.branch)
        .bind(&attempt.base_commit)
        .bind(&attempt.head_commit)
        .bind(&attempt.worktree_path)
        .bind(attempt.exit_code)
        .bind(&attempt.pr_url)
        .bind(attempt.pr_number)
        .bind(&attempt.error)
        .bind(attempt.worktree_cleaned_at.map(|t| t.timestamp_millis()))
}

fn millis(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts).unwrap_or_default()
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: String,
    name: String,
    repo_path: String,
    base_branch: Option<String>,
    github_repo: Option<String>,
    created_at: i64,
}

impl ProjectRow {
    fn into_project(self) -> Project {
        Project {
            id: Id::from_string(self.id),
            name: self.name,
            repo_path: self.repo_path,
            base_branch: self.base_branch,
            github_repo: self.github_repo,
            created_at: millis(self.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    project_id: String,
    title: String,
    description: String,
    column_name: String,
    created_at: i64,
}

impl TaskRow {
    fn into_task(self) -> Task {
        Task {
            id: Id::from_string(self.id),
            project_id: Id::from_string(self.project_id),
            title: self.title,
            description: self.description,
            column_name: self.column_name,
            created_at: millis(self.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    project_id: String,
    mode: String,
    max_parallel: i64,
    selector_json: String,
    status: String,
    created_at: i64,
    started_at: Option<i64>,
    finished_at: Option<i64>,
    error: Option<String>,
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        let corrupt = |detail: String| StorageError::CorruptRow {
            table: "runs",
            detail,
        };
        let mode = RunMode::parse(&self.mode)
            .ok_or_else(|| corrupt(format!("run {} has unknown mode {}", self.id, self.mode)))?;
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("run {} has unknown status {}", self.id, self.status)))?;
        let selector: TaskSelector = serde_json::from_str(&self.selector_json)?;

        Ok(Run {
            id: Id::from_string(self.id),
            project_id: Id::from_string(self.project_id),
            mode,
            max_parallel: u32::try_from(self.max_parallel).unwrap_or(1),
            selector,
            status,
            created_at: millis(self.created_at),
            started_at: self.started_at.and_then(DateTime::from_timestamp_millis),
            finished_at: self.finished_at.and_then(DateTime::from_timestamp_millis),
            error: self.error,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: String,
    task_id: String,
    run_id: String,
    status: String,
    created_at: i64,
    started_at: Option<i64>,
    finished_at: Option<i64>,
    branch: Option<String>,
    base_commit: Option<String>,
    head_commit: Option<String>,
    worktree_path: Option<String>,
    exit_code: Option<i32>,
    pr_url: Option<String>,
    pr_number: Option<i64>,
    error: Option<String>,
    worktree_cleaned_at: Option<i64>,
}

impl AttemptRow {
    fn into_attempt(self) -> Result<Attempt> {
        let status = AttemptStatus::parse(&self.status).ok_or_else(|| StorageError::CorruptRow {
            table: "attempts",
            detail: format!("attempt {} has unknown status {}", self.id, self.status),
        })?;

        Ok(Attempt {
            id: Id::from_string(self.id),
            task_id: Id::from_string(self.task_id),
            run_id: Id::from_string(self.run_id),
            status,
            created_at: millis(self.created_at),
            started_at: self.started_at.and_then(DateTime::from_timestamp_millis),
            finished_at: self.finished_at.and_then(DateTime::from_timestamp_millis),
            branch: self.branch,
            base_commit: self.base_commit,
            head_commit: self.head_commit,
            worktree_path: self.worktree_path,
            exit_code: self.exit_code,
            pr_url: self.pr_url,
            pr_number: self.pr_number,
            error: self.error,
            worktree_cleaned_at: self
                .worktree_cleaned_at
                .and_then(DateTime::from_timestamp_millis),
        })
    }
}

#[derive(sqlx::FromRow)]
struct AutofixRow {
    id: String,
    run_id: String,
    pr_url: String,
    outcome: String,
    category: String,
    strategy: String,
    report_path: Option<String>,
    created_at: i64,
}

impl AutofixRow {
    fn into_record(self) -> Result<AutofixRecord> {
        let outcome = AutofixOutcome::parse(&self.outcome).ok_or_else(|| StorageError::CorruptRow {
            table: "autofix_records",
            detail: format!("record {} has unknown outcome {}", self.id, self.outcome),
        })?;
        let strategy = match self.strategy.as_str() {
            "ai_fix" => AutofixStrategy::AiFix,
            _ => AutofixStrategy::Diagnostic,
        };

        Ok(AutofixRecord {
            id: Id::from_string(self.id),
            run_id: Id::from_string(self.run_id),
            pr_url: self.pr_url,
            outcome,
            category: self.category,
            strategy,
            report_path: self.report_path,
            created_at: millis(self.created_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    run_id: String,
    attempt_id: Option<String>,
    #[sqlx(rename = "type")]
    event_type: String,
    ts: i64,
    payload_json: String,
}

impl EventRow {
    fn into_event(self) -> Event {
        Event {
            id: Id::from_string(self.id),
            run_id: Id::from_string(self.run_id),
            attempt_id: self.attempt_id.map(Id::from_string),
            event_type: self.event_type,
            timestamp: millis(self.ts),
            payload_json: self.payload_json,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ArtifactRow {
    id: String,
    run_id: String,
    kind: String,
    path: String,
    checksum: Option<String>,
}

impl ArtifactRow {
    fn into_artifact(self) -> Artifact {
        Artifact {
            id: Id::from_string(self.id),
            run_id: Id::from_string(self.run_id),
            kind: self.kind,
            path: self.path,
            checksum: self.checksum,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    pub(crate) struct TestStorage {
        pub(crate) storage: Storage,
        pub(crate) _dir: TempDir,
    }

    pub(crate) async fn create_test_storage() -> TestStorage {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        TestStorage { storage, _dir: dir }
    }

    pub(crate) fn project(repo_path: &str) -> Project {
        Project {
            id: Id::new(),
            name: "demo".to_string(),
            repo_path: repo_path.to_string(),
            base_branch: Some("main".to_string()),
            github_repo: Some("acme/demo".to_string()),
            created_at: Utc::now(),
        }
    }

    pub(crate) fn task(project_id: &Id, column: &str) -> Task {
        Task {
            id: Id::new(),
            project_id: project_id.clone(),
            title: "Add a button".to_string(),
            description: "Make it blue".to_string(),
            column_name: column.to_string(),
            created_at: Utc::now(),
        }
    }

    pub(crate) fn run(project_id: &Id, status: RunStatus, task_ids: Vec<Id>) -> Run {
        Run {
            id: Id::new(),
            project_id: project_id.clone(),
            mode: RunMode::Selection,
            max_parallel: 2,
            selector: TaskSelector::Selection(task_ids),
            status,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use chrono::Duration;
    use factory_core::events::{AttemptStoppedPayload, RunCancelledPayload};

    async fn seeded(ts: &TestStorage) -> (Project, Task, Run) {
        let project = project("/repo");
        ts.storage.insert_project(&project).await.unwrap();
        let task = task(&project.id, "ready");
        ts.storage.insert_task(&task).await.unwrap();
        let run = run(&project.id, RunStatus::Pending, vec![task.id.clone()]);
        ts.storage.insert_run(&run).await.unwrap();
        (project, task, run)
    }

    #[tokio::test]
    async fn migrate_embedded_is_idempotent() {
        let ts = create_test_storage().await;
        ts.storage.migrate_embedded().await.unwrap();
        seeded(&ts).await;
    }

    #[tokio::test]
    async fn insert_and_get_run() {
        let ts = create_test_storage().await;
        let (project, task, run) = seeded(&ts).await;

        let retrieved = ts.storage.get_run(&run.id).await.unwrap();
        assert_eq!(retrieved.id, run.id);
        assert_eq!(retrieved.project_id, project.id);
        assert_eq!(retrieved.status, RunStatus::Pending);
        assert_eq!(retrieved.selector, TaskSelector::Selection(vec![task.id]));
    }

    #[tokio::test]
    async fn get_run_not_found() {
        let ts = create_test_storage().await;
        let result = ts.storage.get_run(&Id::new()).await;
        assert!(matches!(result, Err(StorageError::RunNotFound(_))));
    }

    #[tokio::test]
    async fn active_run_ignores_terminal_runs() {
        let ts = create_test_storage().await;
        let (project, _, run) = seeded(&ts).await;

        let active = ts.storage.active_run_for_project(&project.id).await.unwrap();
        assert_eq!(active.map(|r| r.id), Some(run.id.clone()));

        assert!(ts.storage.mark_run_running(&run.id).await.unwrap());
        assert!(ts
            .storage
            .finish_run(&run.id, RunStatus::Completed, None)
            .await
            .unwrap());
        assert!(ts.storage.active_run_for_project(&project.id).await.unwrap().is_none());

        // Terminal runs stay terminal.
        assert!(!ts.storage.mark_run_running(&run.id).await.unwrap());
        assert!(!ts
            .storage
            .finish_run(&run.id, RunStatus::Failed, Some("late"))
            .await
            .unwrap());
        let latest = ts.storage.get_run(&run.id).await.unwrap();
        assert_eq!(latest.status, RunStatus::Completed);
        assert!(latest.finished_at.is_some());
    }

    #[tokio::test]
    async fn runs_awaiting_autofix_skip_recorded_and_cancelled() {
        let ts = create_test_storage().await;
        let (project, task, older) = seeded(&ts).await;
        let with_pr = |run: &Run| {
            let attempt = Attempt::queued(&run.id, &task.id);
            let outcome = AttemptOutcome {
                success: true,
                pr_url: Some(format!("https://github.com/acme/demo/pull/{}", run.id)),
                ..AttemptOutcome::default()
            };
            (attempt, outcome)
        };

        let newer = super::test_support::run(&project.id, RunStatus::Running, Vec::new());
        let cancelled = super::test_support::run(&project.id, RunStatus::Cancelled, Vec::new());
        for run in [&newer, &cancelled] {
            ts.storage.insert_run(run).await.unwrap();
        }
        for run in [&older, &newer, &cancelled] {
            let (attempt, outcome) = with_pr(run);
            ts.storage.insert_attempt(&attempt).await.unwrap();
            ts.storage.mark_attempt_running(&attempt.id).await.unwrap();
            ts.storage.finish_attempt(&attempt.id, &outcome).await.unwrap();
        }

        let awaiting = ts.storage.runs_awaiting_autofix(&project.id).await.unwrap();
        let ids: Vec<Id> = awaiting.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![older.id.clone(), newer.id.clone()]);

        let record = AutofixRecord {
            id: Id::new(),
            run_id: older.id.clone(),
            pr_url: format!("https://github.com/acme/demo/pull/{}", older.id),
            outcome: AutofixOutcome::Success,
            category: "unknown".to_string(),
            strategy: AutofixStrategy::Diagnostic,
            report_path: None,
            created_at: Utc::now(),
        };
        ts.storage.insert_autofix_record(&record).await.unwrap();
        let awaiting = ts.storage.runs_awaiting_autofix(&project.id).await.unwrap();
        assert_eq!(awaiting.len(), 1);
        assert_eq!(awaiting[0].id, newer.id);
    }

    #[tokio::test]
    async fn completion_waits_for_late_enqueue() {
        let ts = create_test_storage().await;
        let (_, task, run) = seeded(&ts).await;
        ts.storage.mark_run_running(&run.id).await.unwrap();
        let late = Attempt::queued(&run.id, &task.id);
        ts.storage.insert_attempt(&late).await.unwrap();

        assert!(!ts
            .storage
            .finish_run(&run.id, RunStatus::Completed, None)
            .await
            .unwrap());
        assert_eq!(ts.storage.get_run(&run.id).await.unwrap().status, RunStatus::Running);

        // Other terminal transitions are not gated.
        assert!(ts
            .storage
            .finish_run(&run.id, RunStatus::Cancelled, None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn tasks_in_column_are_filtered() {
        let ts = create_test_storage().await;
        let (project, ready, _) = seeded(&ts).await;
        ts.storage.insert_task(&task(&project.id, "done")).await.unwrap();

        let tasks = ts.storage.list_tasks_in_column(&project.id, "ready").await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, ready.id);
    }

    #[tokio::test]
    async fn insert_attempt_if_absent_dedups_live_attempts() {
        let ts = create_test_storage().await;
        let (_, task, run) = seeded(&ts).await;

        let first = Attempt::queued(&run.id, &task.id);
        assert!(ts.storage.insert_attempt_if_absent(&first).await.unwrap());
        let second = Attempt::queued(&run.id, &task.id);
        assert!(!ts.storage.insert_attempt_if_absent(&second).await.unwrap());
        assert_eq!(ts.storage.list_attempts(&run.id).await.unwrap().len(), 1);

        // Once terminal, the task may be attempted again.
        ts.storage
            .stop_attempt(&first.id, AttemptStatus::Queued, "cancelled")
            .await
            .unwrap();
        assert!(ts.storage.insert_attempt_if_absent(&second).await.unwrap());
    }

    #[tokio::test]
    async fn attempt_transitions_are_conditional() {
        let ts = create_test_storage().await;
        let (_, task, run) = seeded(&ts).await;
        let attempt = Attempt::queued(&run.id, &task.id);
        ts.storage.insert_attempt(&attempt).await.unwrap();

        assert!(ts.storage.mark_attempt_running(&attempt.id).await.unwrap());
        assert!(!ts.storage.mark_attempt_running(&attempt.id).await.unwrap());

        assert!(ts
            .storage
            .stop_attempt(&attempt.id, AttemptStatus::Running, "stopped by user")
            .await
            .unwrap());

        // The driver finishing afterwards loses to the hard cancel.
        let outcome = AttemptOutcome {
            success: true,
            exit_code: Some(0),
            ..AttemptOutcome::default()
        };
        assert!(!ts.storage.finish_attempt(&attempt.id, &outcome).await.unwrap());

        let stored = ts.storage.get_attempt(&attempt.id).await.unwrap();
        assert_eq!(stored.status, AttemptStatus::Stopped);
        assert_eq!(stored.error.as_deref(), Some("stopped by user"));
    }

    #[tokio::test]
    async fn finish_attempt_records_outcome() {
        let ts = create_test_storage().await;
        let (_, task, run) = seeded(&ts).await;
        let attempt = Attempt::queued(&run.id, &task.id);
        ts.storage.insert_attempt(&attempt).await.unwrap();
        ts.storage.mark_attempt_running(&attempt.id).await.unwrap();

        let outcome = AttemptOutcome {
            success: true,
            exit_code: Some(0),
            branch: Some("factory/t1".to_string()),
            worktree_path: Some("/repo/.factory/worktrees/t1".to_string()),
            pr_url: Some("https://github.com/acme/demo/pull/7".to_string()),
            pr_number: Some(7),
            ..AttemptOutcome::default()
        };
        assert!(ts.storage.finish_attempt(&attempt.id, &outcome).await.unwrap());

        let stored = ts.storage.get_attempt(&attempt.id).await.unwrap();
        assert_eq!(stored.status, AttemptStatus::Completed);
        assert_eq!(stored.pr_number, Some(7));
        assert_eq!(stored.branch.as_deref(), Some("factory/t1"));
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn stopped_attempt_keeps_workspace_from_late_outcome() {
        let ts = create_test_storage().await;
        let (project, task, run) = seeded(&ts).await;
        let attempt = Attempt::queued(&run.id, &task.id);
        ts.storage.insert_attempt(&attempt).await.unwrap();
        ts.storage.mark_attempt_running(&attempt.id).await.unwrap();
        assert!(ts
            .storage
            .stop_attempt(&attempt.id, AttemptStatus::Running, "cancelled")
            .await
            .unwrap());

        let outcome = AttemptOutcome {
            branch: Some("factory/t1".to_string()),
            worktree_path: Some("/repo/.factory/worktrees/t1".to_string()),
            ..AttemptOutcome::failed("attempt cancelled")
        };
        assert!(!ts.storage.finish_attempt(&attempt.id, &outcome).await.unwrap());

        let stored = ts.storage.get_attempt(&attempt.id).await.unwrap();
        assert_eq!(stored.status, AttemptStatus::Stopped);
        assert_eq!(stored.error.as_deref(), Some("cancelled"));
        assert_eq!(stored.worktree_path.as_deref(), Some("/repo/.factory/worktrees/t1"));
        let candidates = ts
            .storage
            .gc_candidates(&project.id, Utc::now() + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
    }

    #[tokio::test]
    async fn workspace_recorded_before_finish_survives_orphan_failure() {
        let ts = create_test_storage().await;
        let (project, task, run) = seeded(&ts).await;
        let attempt = Attempt::queued(&run.id, &task.id);
        ts.storage.insert_attempt(&attempt).await.unwrap();
        ts.storage.mark_attempt_running(&attempt.id).await.unwrap();
        ts.storage
            .set_attempt_workspace(&attempt.id, "factory/t1-abc", "/repo/.factory/worktrees/factory-t1-abc")
            .await
            .unwrap();

        assert_eq!(ts.storage.fail_running_attempts("daemon restarted").await.unwrap(), 1);
        let stored = ts.storage.get_attempt(&attempt.id).await.unwrap();
        assert_eq!(stored.status, AttemptStatus::Failed);
        assert_eq!(stored.branch.as_deref(), Some("factory/t1-abc"));
        let candidates = ts
            .storage
            .gc_candidates(&project.id, Utc::now() + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);

        let missing = ts.storage.set_attempt_workspace(&Id::new(), "b", "/p").await;
        assert!(matches!(missing, Err(StorageError::AttemptNotFound(_))));
    }

    #[tokio::test]
    async fn stop_waiting_attempts_leaves_running_alone() {
        let ts = create_test_storage().await;
        let (project, task, run) = seeded(&ts).await;
        let other = super::test_support::task(&project.id, "ready");
        ts.storage.insert_task(&other).await.unwrap();

        let waiting = Attempt::queued(&run.id, &task.id);
        let running = Attempt::queued(&run.id, &other.id);
        ts.storage.insert_attempt(&waiting).await.unwrap();
        ts.storage.insert_attempt(&running).await.unwrap();
        ts.storage.mark_attempt_running(&running.id).await.unwrap();

        let stopped = ts.storage.stop_waiting_attempts(&run.id, "run cancelled").await.unwrap();
        assert_eq!(stopped, vec![waiting.id.clone()]);
        let still = ts.storage.get_attempt(&running.id).await.unwrap();
        assert_eq!(still.status, AttemptStatus::Running);

        assert_eq!(ts.storage.fail_running_attempts("restart").await.unwrap(), 1);
        let failed = ts.storage.get_attempt(&running.id).await.unwrap();
        assert_eq!(failed.status, AttemptStatus::Failed);
    }

    #[tokio::test]
    async fn gc_candidates_respect_cutoff_and_cleanup() {
        let ts = create_test_storage().await;
        let (project, task, run) = seeded(&ts).await;
        let finished_at = Utc::now() - Duration::minutes(40);

        let mut attempt = Attempt::queued(&run.id, &task.id);
        attempt.status = AttemptStatus::Completed;
        attempt.started_at = Some(finished_at - Duration::minutes(5));
        attempt.finished_at = Some(finished_at);
        attempt.worktree_path = Some("/repo/.factory/worktrees/a".to_string());
        ts.storage.insert_attempt(&attempt).await.unwrap();

        let before = ts
            .storage
            .gc_candidates(&project.id, finished_at)
            .await
            .unwrap();
        assert!(before.is_empty());

        let after = ts
            .storage
            .gc_candidates(&project.id, finished_at + Duration::milliseconds(1))
            .await
            .unwrap();
        assert_eq!(after.len(), 1);

        ts.storage.mark_worktree_cleaned(&attempt.id).await.unwrap();
        let cleaned = ts.storage.gc_candidates(&project.id, Utc::now()).await.unwrap();
        assert!(cleaned.is_empty());
    }

    #[tokio::test]
    async fn autofix_record_is_unique_per_pr() {
        let ts = create_test_storage().await;
        let (_, _, run) = seeded(&ts).await;
        let pr_url = "https://github.com/acme/demo/pull/7";
        let record = AutofixRecord {
            id: Id::new(),
            run_id: run.id.clone(),
            pr_url: pr_url.to_string(),
            outcome: AutofixOutcome::Failed,
            category: "TS_error".to_string(),
            strategy: AutofixStrategy::Diagnostic,
            report_path: None,
            created_at: Utc::now(),
        };

        assert!(!ts.storage.has_autofix_record(&run.id, pr_url).await.unwrap());
        assert!(ts.storage.insert_autofix_record(&record).await.unwrap());
        let duplicate = AutofixRecord {
            id: Id::new(),
            ..record.clone()
        };
        assert!(!ts.storage.insert_autofix_record(&duplicate).await.unwrap());
        assert!(ts.storage.has_autofix_record(&run.id, pr_url).await.unwrap());

        let records = ts.storage.list_autofix_records(&run.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, AutofixOutcome::Failed);
    }

    #[tokio::test]
    async fn events_record_attempt_id() {
        let ts = create_test_storage().await;
        let (_, _, run) = seeded(&ts).await;
        let attempt_id = Id::new();

        ts.storage
            .append_event(
                &run.id,
                &EventPayload::AttemptStopped(AttemptStoppedPayload {
                    attempt_id: attempt_id.clone(),
                    previous_status: "queued".to_string(),
                    reason: "cancelled".to_string(),
                }),
            )
            .await
            .unwrap();
        ts.storage
            .append_event(
                &run.id,
                &EventPayload::RunCancelled(RunCancelledPayload {
                    run_id: run.id.clone(),
                    stopped_attempts: 1,
                }),
            )
            .await
            .unwrap();

        let events = ts.storage.list_events(&run.id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "ATTEMPT_STOPPED");
        assert_eq!(events[0].attempt_id, Some(attempt_id));
        assert_eq!(events[1].attempt_id, None);
    }

    #[tokio::test]
    async fn insert_and_list_artifacts() {
        let ts = create_test_storage().await;
        let (_, _, run) = seeded(&ts).await;
        let artifact = Artifact {
            id: Id::new(),
            run_id: run.id.clone(),
            kind: "autofix_report".to_string(),
            path: "/tmp/report.md".to_string(),
            checksum: Some("abc".to_string()),
        };
        ts.storage.insert_artifact(&artifact).await.unwrap();

        let artifacts = ts.storage.list_artifacts(&run.id).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].checksum.as_deref(), Some("abc"));
    }
}
