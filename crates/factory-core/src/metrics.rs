//! Run metrics and bottleneck heuristics.
//!
//! Everything here is a pure function of attempt rows and a `now` instant.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Attempt, AttemptStatus};

/// Minimum duration samples before p95 is reported.
pub const P95_MIN_SAMPLES: usize = 5;

const FAILURE_RATE_WARNING: f64 = 0.3;
const FAILURE_RATE_CRITICAL: f64 = 0.5;
const THROUGHPUT_WARNING: f64 = 0.2;
const THROUGHPUT_CRITICAL: f64 = 0.1;
const NO_PROGRESS_BUCKETS: u32 = 3;
const LOW_PARALLELISM_MIN_STARTED: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsBucket {
    pub start: DateTime<Utc>,
    pub started: u32,
    pub completed: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub total: u32,
    pub queued: u32,
    pub running: u32,
    pub completed: u32,
    pub failed: u32,
    pub stopped: u32,
    /// Attempts that have a start timestamp.
    pub started: u32,
    pub mean_duration_secs: Option<f64>,
    pub p95_duration_secs: Option<f64>,
    /// Completed attempts per minute over the observed span (floored at 1 min).
    pub throughput_per_min: f64,
    pub peak_concurrency: u32,
    pub bucket_minutes: u32,
    /// Whole buckets elapsed between the first start and `now`.
    pub elapsed_buckets: u32,
    pub buckets: Vec<MetricsBucket>,
}

impl RunMetrics {
    pub fn finished(&self) -> u32 {
        self.completed + self.failed
    }

    /// `failed / (completed + failed)`, or `None` before anything finished.
    pub fn failure_ratio(&self) -> Option<f64> {
        match self.finished() {
            0 => None,
            n => Some(f64::from(self.failed) / f64::from(n)),
        }
    }
}

/// Build metrics for one run's attempts.
pub fn compute_run_metrics(
    attempts: &[Attempt],
    now: DateTime<Utc>,
    bucket_minutes: u32,
) -> RunMetrics {
    let bucket_minutes = bucket_minutes.max(1);
    let mut metrics = RunMetrics {
        total: attempts.len() as u32,
        queued: 0,
        running: 0,
        completed: 0,
        failed: 0,
        stopped: 0,
        started: 0,
        mean_duration_secs: None,
        p95_duration_secs: None,
        throughput_per_min: 0.0,
        peak_concurrency: 0,
        bucket_minutes,
        elapsed_buckets: 0,
        buckets: Vec::new(),
    };

    for attempt in attempts {
        match attempt.status {
            AttemptStatus::Queued | AttemptStatus::Pending => metrics.queued += 1,
            AttemptStatus::Running => metrics.running += 1,
            AttemptStatus::Completed => metrics.completed += 1,
            AttemptStatus::Failed => metrics.failed += 1,
            AttemptStatus::Stopped => metrics.stopped += 1,
        }
        if attempt.started_at.is_some() {
            metrics.started += 1;
        }
    }

    let mut durations: Vec<f64> = attempts
        .iter()
        .filter(|a| matches!(a.status, AttemptStatus::Completed | AttemptStatus::Failed))
        .filter_map(Attempt::duration_secs)
        .collect();
    durations.sort_by(f64::total_cmp);
    metrics.mean_duration_secs = mean(&durations);
    metrics.p95_duration_secs = p95(&durations);

    let Some(first_start) = attempts.iter().filter_map(|a| a.started_at).min() else {
        return metrics;
    };

    let last_finish = attempts.iter().filter_map(|a| a.finished_at).max();
    let span_end = if metrics.running > 0 {
        now
    } else {
        last_finish.unwrap_or(now)
    };
    let span_minutes = ((span_end - first_start).num_milliseconds() as f64 / 60_000.0).max(1.0);
    metrics.throughput_per_min = f64::from(metrics.completed) / span_minutes;

    metrics.peak_concurrency = peak_concurrency(attempts);

    let width = Duration::minutes(i64::from(bucket_minutes));
    let elapsed = (now - first_start).num_minutes().max(0);
    metrics.elapsed_buckets = (elapsed / i64::from(bucket_minutes)) as u32;
    metrics.buckets = bucketize(attempts, first_start, width);

    metrics
}

fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// Nearest-rank p95 over sorted samples, index `floor(0.95 * (n - 1))`.
pub fn p95(sorted: &[f64]) -> Option<f64> {
    if sorted.len() < P95_MIN_SAMPLES {
        return None;
    }
    let index = (0.95 * (sorted.len() - 1) as f64).floor() as usize;
    sorted.get(index).copied()
}

fn peak_concurrency(attempts: &[Attempt]) -> u32 {
    let mut deltas: Vec<(DateTime<Utc>, i32)> = Vec::new();
    for attempt in attempts {
        let Some(start) = attempt.started_at else {
            continue;
        };
        deltas.push((start, 1));
        if let Some(end) = attempt.finished_at {
            deltas.push((end, -1));
        }
    }
    // Starts sort before finishes at the same instant.
    deltas.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)));

    let mut current = 0i32;
    let mut peak = 0i32;
    for (_, delta) in deltas {
        current += delta;
        peak = peak.max(current);
    }
    peak.max(0) as u32
}

fn bucketize(attempts: &[Attempt], origin: DateTime<Utc>, width: Duration) -> Vec<MetricsBucket> {
    let last = attempts
        .iter()
        .flat_map(|a| [a.started_at, a.finished_at])
        .flatten()
        .max()
        .unwrap_or(origin);

    let index_of = |ts: DateTime<Utc>| -> usize {
        let offset = (ts - origin).num_milliseconds().max(0);
        (offset / width.num_milliseconds().max(1)) as usize
    };

    let mut buckets: Vec<MetricsBucket> = (0..=index_of(last))
        .map(|i| MetricsBucket {
            start: origin + width * i as i32,
            started: 0,
            completed: 0,
            failed: 0,
        })
        .collect();

    for attempt in attempts {
        if let Some(start) = attempt.started_at {
            buckets[index_of(start)].started += 1;
        }
        if let Some(end) = attempt.finished_at {
            match attempt.status {
                AttemptStatus::Completed => buckets[index_of(end)].completed += 1,
                AttemptStatus::Failed => buckets[index_of(end)].failed += 1,
                _ => {}
            }
        }
    }

    buckets
}

// --- Bottlenecks ---

/// Hint severity; declaration order is display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintSeverity {
    Critical,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BottleneckCode {
    NoProgress,
    HighFailureRate,
    LowThroughput,
    LowParallelism,
}

impl BottleneckCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoProgress => "NO_PROGRESS",
            Self::HighFailureRate => "HIGH_FAILURE_RATE",
            Self::LowThroughput => "LOW_THROUGHPUT",
            Self::LowParallelism => "LOW_PARALLELISM",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BottleneckHint {
    pub code: BottleneckCode,
    pub severity: HintSeverity,
    pub message: String,
}

/// Derive bottleneck hints, sorted critical first then by code.
pub fn detect_bottlenecks(metrics: &RunMetrics) -> Vec<BottleneckHint> {
    let mut hints = Vec::new();

    if metrics.started > 0 && metrics.finished() == 0 && metrics.elapsed_buckets >= NO_PROGRESS_BUCKETS
    {
        hints.push(BottleneckHint {
            code: BottleneckCode::NoProgress,
            severity: HintSeverity::Critical,
            message: format!(
                "{} attempts started but none finished after {} minutes",
                metrics.started,
                metrics.elapsed_buckets * metrics.bucket_minutes
            ),
        });
    }

    if let Some(ratio) = metrics.failure_ratio() {
        let severity = if ratio >= FAILURE_RATE_CRITICAL {
            Some(HintSeverity::Critical)
        } else if ratio >= FAILURE_RATE_WARNING {
            Some(HintSeverity::Warning)
        } else {
            None
        };
        if let Some(severity) = severity {
            hints.push(BottleneckHint {
                code: BottleneckCode::HighFailureRate,
                severity,
                message: format!(
                    "{:.0}% of finished attempts failed ({} of {})",
                    ratio * 100.0,
                    metrics.failed,
                    metrics.finished()
                ),
            });
        }
    }

    if metrics.finished() > 0 {
        let throughput = metrics.throughput_per_min;
        let severity = if throughput < THROUGHPUT_CRITICAL {
            Some(HintSeverity::Critical)
        } else if throughput < THROUGHPUT_WARNING {
            Some(HintSeverity::Warning)
        } else {
            None
        };
        if let Some(severity) = severity {
            hints.push(BottleneckHint {
                code: BottleneckCode::LowThroughput,
                severity,
                message: format!("throughput is {throughput:.2} completed attempts per minute"),
            });
        }
    }

    if metrics.peak_concurrency <= 1 && metrics.started >= LOW_PARALLELISM_MIN_STARTED {
        hints.push(BottleneckHint {
            code: BottleneckCode::LowParallelism,
            severity: HintSeverity::Info,
            message: format!(
                "{} attempts ran but never more than one at a time",
                metrics.started
            ),
        });
    }

    hints.sort_by(|a, b| {
        a.severity
            .cmp(&b.severity)
            .then_with(|| a.code.as_str().cmp(b.code.as_str()))
    });
    hints
}
