/*
 * Observability - Metrics
 *
 * Counters for the task and job phases of the commit protocol, with
 * Prometheus text exposition.
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Metrics registry shared by the task and job committers.
#[derive(Debug, Default)]
pub struct CommitMetrics {
    // Task phase
    pub tasks_committed: AtomicU64,
    pub tasks_aborted: AtomicU64,
    pub staged_files_written: AtomicU64,
    pub data_files_staged: AtomicU64,

    // Job phase
    pub staging_reads: AtomicU64,
    pub staging_read_failures: AtomicU64,
    pub commits_attempted: AtomicU64,
    pub commits_succeeded: AtomicU64,
    pub commits_failed: AtomicU64,
    pub files_published: AtomicU64,
    pub total_commit_time_us: AtomicU64,

    // Abort and cleanup
    pub files_deleted_on_abort: AtomicU64,
    pub cleanup_failures: AtomicU64,
}

impl CommitMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a staged commit file written by a task for one table.
    pub fn record_staged(&self, data_files: usize) {
        self.staged_files_written.fetch_add(1, Ordering::Relaxed);
        self.data_files_staged
            .fetch_add(data_files as u64, Ordering::Relaxed);
    }

    pub fn record_task_committed(&self) {
        self.tasks_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_aborted(&self) {
        self.tasks_aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one staging read attempt, retries included.
    pub fn record_staging_read(&self, success: bool) {
        self.staging_reads.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.staging_read_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a table commit attempt.
    pub fn record_commit(&self, success: bool, files: usize) {
        self.commits_attempted.fetch_add(1, Ordering::Relaxed);
        if success {
            self.commits_succeeded.fetch_add(1, Ordering::Relaxed);
            self.files_published.fetch_add(files as u64, Ordering::Relaxed);
        } else {
            self.commits_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_commit_time(&self, duration: Duration) {
        self.total_commit_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_abort_deletes(&self, files: usize) {
        self.files_deleted_on_abort
            .fetch_add(files as u64, Ordering::Relaxed);
    }

    pub fn record_cleanup_failures(&self, failures: usize) {
        self.cleanup_failures
            .fetch_add(failures as u64, Ordering::Relaxed);
    }

    /// Returns a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_committed: self.tasks_committed.load(Ordering::Relaxed),
            tasks_aborted: self.tasks_aborted.load(Ordering::Relaxed),
            staged_files_written: self.staged_files_written.load(Ordering::Relaxed),
            data_files_staged: self.data_files_staged.load(Ordering::Relaxed),
            staging_reads: self.staging_reads.load(Ordering::Relaxed),
            staging_read_failures: self.staging_read_failures.load(Ordering::Relaxed),
            commits_attempted: self.commits_attempted.load(Ordering::Relaxed),
            commits_succeeded: self.commits_succeeded.load(Ordering::Relaxed),
            commits_failed: self.commits_failed.load(Ordering::Relaxed),
            files_published: self.files_published.load(Ordering::Relaxed),
            total_commit_time_us: self.total_commit_time_us.load(Ordering::Relaxed),
            files_deleted_on_abort: self.files_deleted_on_abort.load(Ordering::Relaxed),
            cleanup_failures: self.cleanup_failures.load(Ordering::Relaxed),
        }
    }

    /// Formats metrics as Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let snap = self.snapshot();
        format!(
            r#"# HELP stagecommit_tasks_total Task attempts by outcome
# TYPE stagecommit_tasks_total counter
stagecommit_tasks_total{{status="committed"}} {}
stagecommit_tasks_total{{status="aborted"}} {}

# HELP stagecommit_staged_files_total Staging files written by tasks
# TYPE stagecommit_staged_files_total counter
stagecommit_staged_files_total {}

# HELP stagecommit_staging_reads_total Staging file reads by outcome
# TYPE stagecommit_staging_reads_total counter
stagecommit_staging_reads_total{{status="attempted"}} {}
stagecommit_staging_reads_total{{status="failed"}} {}

# HELP stagecommit_commits_total Table commits by status
# TYPE stagecommit_commits_total counter
stagecommit_commits_total{{status="attempted"}} {}
stagecommit_commits_total{{status="succeeded"}} {}
stagecommit_commits_total{{status="failed"}} {}

# HELP stagecommit_data_files_total Data files by stage
# TYPE stagecommit_data_files_total counter
stagecommit_data_files_total{{stage="staged"}} {}
stagecommit_data_files_total{{stage="published"}} {}
stagecommit_data_files_total{{stage="deleted_on_abort"}} {}

# HELP stagecommit_cleanup_failures_total Suppressed cleanup failures
# TYPE stagecommit_cleanup_failures_total counter
stagecommit_cleanup_failures_total {}

# HELP stagecommit_commit_time_seconds Total job commit time
# TYPE stagecommit_commit_time_seconds counter
stagecommit_commit_time_seconds {}
"#,
            snap.tasks_committed,
            snap.tasks_aborted,
            snap.staged_files_written,
            snap.staging_reads,
            snap.staging_read_failures,
            snap.commits_attempted,
            snap.commits_succeeded,
            snap.commits_failed,
            snap.data_files_staged,
            snap.files_published,
            snap.files_deleted_on_abort,
            snap.cleanup_failures,
            snap.total_commit_time_us as f64 / 1_000_000.0,
        )
    }
}

/// A point-in-time snapshot of metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub tasks_committed: u64,
    pub tasks_aborted: u64,
    pub staged_files_written: u64,
    pub data_files_staged: u64,
    pub staging_reads: u64,
    pub staging_read_failures: u64,
    pub commits_attempted: u64,
    pub commits_succeeded: u64,
    pub commits_failed: u64,
    pub files_published: u64,
    pub total_commit_time_us: u64,
    pub files_deleted_on_abort: u64,
    pub cleanup_failures: u64,
}

impl MetricsSnapshot {
    /// Returns the table commit success rate.
    pub fn commit_success_rate(&self) -> f64 {
        if self.commits_attempted == 0 {
            1.0
        } else {
            self.commits_succeeded as f64 / self.commits_attempted as f64
        }
    }
}

/// Timer guard recording job commit time on drop.
pub struct Timer {
    start: Instant,
    metrics: Arc<CommitMetrics>,
}

impl Timer {
    pub fn commit(metrics: Arc<CommitMetrics>) -> Self {
        Self {
            start: Instant::now(),
            metrics,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.metrics.record_commit_time(self.start.elapsed());
    }
}
