//! Run metrics and stuck-run detection.

use chrono::{DateTime, Duration, Utc};
use factory_core::metrics::{compute_run_metrics, detect_bottlenecks, BottleneckHint, RunMetrics};
use factory_core::{Attempt, AttemptStatus, Id, Run, RunStatus};
use serde::Serialize;
use tracing::warn;

use crate::factory::Factory;
use crate::storage::StorageError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StuckReason {
    /// No worker loop in this process drives the run.
    NoWorker,
    /// Attempts are running but nothing started or finished recently.
    NoRecentActivity { idle_minutes: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StuckRun {
    pub run_id: Id,
    pub project_id: Id,
    pub reason: StuckReason,
}

/// Latest start or finish across the run's attempts, falling back to the
/// run's own start.
fn last_activity(run: &Run, attempts: &[Attempt]) -> Option<DateTime<Utc>> {
    attempts
        .iter()
        .flat_map(|a| [a.started_at, a.finished_at])
        .flatten()
        .chain(run.started_at)
        .max()
}

pub fn detect_stuck(
    run: &Run,
    attempts: &[Attempt],
    worker_live: bool,
    now: DateTime<Utc>,
    threshold: Duration,
) -> Option<StuckReason> {
    if run.status != RunStatus::Running {
        return None;
    }
    if !worker_live {
        return Some(StuckReason::NoWorker);
    }
    if !attempts.iter().any(|a| a.status == AttemptStatus::Running) {
        return None;
    }
    let last = last_activity(run, attempts)?;
    let idle = now - last;
    (idle > threshold).then(|| StuckReason::NoRecentActivity {
        idle_minutes: idle.num_minutes(),
    })
}

/// Ten years; larger thresholds are clamped.
const MAX_STUCK_MINUTES: u64 = 60 * 24 * 365 * 10;

impl Factory {
    /// Running runs that look stuck as of now.
    pub async fn find_stuck_runs(&self) -> Result<Vec<StuckRun>, StorageError> {
        let threshold = Duration::minutes(self.config.stuck_run_minutes.min(MAX_STUCK_MINUTES) as i64);
        let now = Utc::now();
        let mut stuck = Vec::new();
        for run in self.storage.list_runs_with_status(RunStatus::Running).await? {
            let attempts = self.storage.list_attempts(&run.id).await?;
            let worker_live = self.workers.drives_run(&run.id);
            if let Some(reason) = detect_stuck(&run, &attempts, worker_live, now, threshold) {
                warn!(run_id = %run.id, project_id = %run.project_id, ?reason, "run looks stuck");
                stuck.push(StuckRun {
                    run_id: run.id,
                    project_id: run.project_id,
                    reason,
                });
            }
        }
        Ok(stuck)
    }

    pub async fn get_factory_run_metrics(&self, run_id: &Id) -> Result<RunMetrics, StorageError> {
        // Surfaces RunNotFound for unknown ids.
        self.storage.get_run(run_id).await?;
        let attempts = self.storage.list_attempts(run_id).await?;
        Ok(compute_run_metrics(
            &attempts,
            Utc::now(),
            self.config.metrics_bucket_minutes,
        ))
    }

    pub fn get_factory_run_bottlenecks(&self, metrics: &RunMetrics) -> Vec<BottleneckHint> {
        detect_bottlenecks(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::test_support::{test_factory, BlockingDriver};
    use crate::preflight::test_support::FakeProbe;
    use crate::storage::test_support::{project, run, task};
    use factory_core::AttemptOutcome;
    use std::sync::Arc;

    fn attempt(status: AttemptStatus, started: Option<DateTime<Utc>>, finished: Option<DateTime<Utc>>) -> Attempt {
        let mut attempt = Attempt::queued(&Id::new(), &Id::new());
        attempt.status = status;
        attempt.started_at = started;
        attempt.finished_at = finished;
        attempt
    }

    #[test]
    fn orphaned_running_run_is_stuck() {
        let now = Utc::now();
        let run = run(&Id::new(), RunStatus::Running, Vec::new());
        let reason = detect_stuck(&run, &[], false, now, Duration::minutes(60));
        assert_eq!(reason, Some(StuckReason::NoWorker));
    }

    #[test]
    fn idle_threshold_is_strict() {
        let now = Utc::now();
        let mut run = run(&Id::new(), RunStatus::Running, Vec::new());
        run.started_at = Some(now - Duration::hours(3));
        let threshold = Duration::minutes(60);

        let at_threshold = [attempt(AttemptStatus::Running, Some(now - threshold), None)];
        assert_eq!(detect_stuck(&run, &at_threshold, true, now, threshold), None);

        let idle = [
            attempt(AttemptStatus::Running, Some(now - Duration::minutes(90)), None),
            attempt(
                AttemptStatus::Completed,
                Some(now - Duration::minutes(120)),
                Some(now - Duration::minutes(61)),
            ),
        ];
        assert_eq!(
            detect_stuck(&run, &idle, true, now, threshold),
            Some(StuckReason::NoRecentActivity { idle_minutes: 61 })
        );
    }

    #[test]
    fn quiet_run_without_running_attempts_is_fine() {
        let now = Utc::now();
        let mut run = run(&Id::new(), RunStatus::Running, Vec::new());
        run.started_at = Some(now - Duration::days(1));
        let queued = [attempt(AttemptStatus::Queued, None, None)];
        assert_eq!(detect_stuck(&run, &queued, true, now, Duration::minutes(60)), None);

        run.status = RunStatus::Completed;
        assert_eq!(detect_stuck(&run, &queued, false, now, Duration::minutes(60)), None);
    }

    #[tokio::test]
    async fn run_metrics_reflect_attempts() {
        let tf = test_factory(Arc::new(BlockingDriver::default()), FakeProbe::default()).await;
        let storage = tf.factory.storage();
        let project = project("/repo");
        storage.insert_project(&project).await.unwrap();
        let run = run(&project.id, RunStatus::Running, Vec::new());
        storage.insert_run(&run).await.unwrap();
        for success in [true, false] {
            let task = task(&project.id, "ready");
            storage.insert_task(&task).await.unwrap();
            let attempt = Attempt::queued(&run.id, &task.id);
            storage.insert_attempt(&attempt).await.unwrap();
            storage.mark_attempt_running(&attempt.id).await.unwrap();
            let outcome = if success {
                AttemptOutcome {
                    success: true,
                    ..AttemptOutcome::default()
                }
            } else {
                AttemptOutcome::failed("boom")
            };
            storage.finish_attempt(&attempt.id, &outcome).await.unwrap();
        }

        let metrics = tf.factory.get_factory_run_metrics(&run.id).await.unwrap();
        assert_eq!(metrics.total, 2);
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.bucket_minutes, 5);

        let hints = tf.factory.get_factory_run_bottlenecks(&metrics);
        assert!(hints
            .iter()
            .any(|h| h.code == factory_core::metrics::BottleneckCode::HighFailureRate));
    }

    #[tokio::test]
    async fn unknown_run_metrics_is_not_found() {
        let tf = test_factory(Arc::new(BlockingDriver::default()), FakeProbe::default()).await;
        let result = tf.factory.get_factory_run_metrics(&Id::new()).await;
        assert!(matches!(result, Err(StorageError::RunNotFound(_))));
    }

    #[tokio::test]
    async fn running_run_without_worker_is_reported() {
        let tf = test_factory(Arc::new(BlockingDriver::default()), FakeProbe::default()).await;
        let storage = tf.factory.storage();
        let project = project("/repo");
        storage.insert_project(&project).await.unwrap();
        let run = run(&project.id, RunStatus::Pending, Vec::new());
        storage.insert_run(&run).await.unwrap();
        storage.mark_run_running(&run.id).await.unwrap();

        let stuck = tf.factory.find_stuck_runs().await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].run_id, run.id);
        assert_eq!(stuck[0].reason, StuckReason::NoWorker);
    }
}
