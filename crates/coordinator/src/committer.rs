/*
 * Output committer
 *
 * The lifecycle entry point the execution framework drives:
 *
 *   setup_job -> setup_task -> (commit_task | abort_task)* -> (commit_job | abort_job)
 *
 * Task-level calls run on the task side and only ever stage files. The
 * job-level calls run once, on the coordinator, and are the only place a
 * table is mutated. Each output table is published independently, so a
 * multi-table job is atomic per table, not across tables.
 */

use stagecommit_common::{
    BoundedTasks, CommitError, CommitMetrics, FailurePolicy, Result, Table, TableCatalog, Timer,
    WorkerPool,
};
use stagecommit_proto::{JobContext, JobId, JobStatus, TaskAttemptContext};
use stagecommit_worker::{TaskCommitSummary, TaskCommitter, WriterRegistry};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::aggregator::CommitAggregator;
use crate::cleanup::{remove_staging_dirs, JobCleaner, StagingDir};
use crate::publisher::{CommitMode, PublishKind, TableCommitSummary, TablePublisher};

/// Result of a successful job commit.
#[derive(Debug, Clone)]
pub struct JobCommitSummary {
    pub job_id: JobId,
    /// One entry per output table that exists in the catalog
    pub tables: Vec<TableCommitSummary>,
    pub elapsed: Duration,
}

impl JobCommitSummary {
    pub fn files_added(&self) -> usize {
        self.tables.iter().map(|t| t.files_added).sum()
    }

    pub fn table(&self, name: &str) -> Option<&TableCommitSummary> {
        self.tables.iter().find(|t| t.table == name)
    }
}

/// Commits the output of write jobs to catalog tables.
pub struct OutputCommitter {
    catalog: Arc<dyn TableCatalog>,
    writers: Arc<WriterRegistry>,
    metrics: Arc<CommitMetrics>,
    task_committer: TaskCommitter,
}

impl OutputCommitter {
    pub fn new(catalog: Arc<dyn TableCatalog>, writers: Arc<WriterRegistry>) -> Self {
        Self::with_metrics(catalog, writers, Arc::new(CommitMetrics::new()))
    }

    pub fn with_metrics(
        catalog: Arc<dyn TableCatalog>,
        writers: Arc<WriterRegistry>,
        metrics: Arc<CommitMetrics>,
    ) -> Self {
        let task_committer = TaskCommitter::new(catalog.clone(), metrics.clone());
        Self {
            catalog,
            writers,
            metrics,
            task_committer,
        }
    }

    pub fn writers(&self) -> &Arc<WriterRegistry> {
        &self.writers
    }

    pub fn metrics(&self) -> &Arc<CommitMetrics> {
        &self.metrics
    }

    /// Nothing is prepared ahead of time; staging directories are created
    /// on first write.
    pub fn setup_job(&self, ctx: &JobContext) {
        debug!(
            "Setting up job {} for output table(s) {:?}",
            ctx.job_id,
            ctx.output_tables()
        );
    }

    pub fn setup_task(&self, ctx: &TaskAttemptContext) {
        debug!("Setting up task attempt {}", ctx.attempt);
    }

    pub fn needs_task_commit(&self, ctx: &TaskAttemptContext) -> bool {
        self.task_committer.needs_task_commit(ctx)
    }

    /// Stages the attempt's data files for every output table.
    pub async fn commit_task(&self, ctx: &TaskAttemptContext) -> Result<TaskCommitSummary> {
        self.task_committer.commit_task(ctx, &self.writers).await
    }

    /// Deletes the attempt's data files. Never fails on cleanup errors.
    pub async fn abort_task(&self, ctx: &TaskAttemptContext) -> Result<()> {
        self.task_committer.abort_task(ctx, &self.writers).await
    }

    /// Publishes every task's staged output, one commit per output table.
    ///
    /// The first failing table fails the job and tables not yet started are
    /// left untouched. Staging files are removed only after every table
    /// was published; on failure they stay in place for diagnosis.
    pub async fn commit_job(&self, ctx: &JobContext) -> Result<JobCommitSummary> {
        let timer = Timer::commit(self.metrics.clone());
        let outputs = ctx.output_tables();
        let config = &ctx.config;
        info!(
            "Committing job {} has started for {} table(s)",
            ctx.job_id,
            outputs.len()
        );

        let table_pool = WorkerPool::new("commit-table", config.table_parallelism(outputs.len()));
        let file_pool = WorkerPool::new("commit-file", config.file_parallelism());
        let aggregator = CommitAggregator::new(&file_pool, config.retry_config(), self.metrics.clone());
        let publisher = TablePublisher::new(CommitMode::from_overwrite(ctx.overwrite));
        let staging_dirs = Mutex::new(Vec::new());

        let outcome = BoundedTasks::foreach(format!("commit job {}", ctx.job_id))
            .execute_with(&table_pool)
            .stop_on_failure()
            .run(outputs, |output| {
                self.commit_output(ctx, &aggregator, &publisher, &staging_dirs, output)
            })
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    "Commit of job {} failed after {:?}, leaving staging files in place: {}",
                    ctx.job_id,
                    timer.elapsed(),
                    e
                );
                return Err(e);
            }
        };

        let tables: Vec<TableCommitSummary> = outcome.results.into_iter().flatten().collect();
        info!("Commit took {:?} for job {}", timer.elapsed(), ctx.job_id);

        let dirs = take_dirs(staging_dirs)?;
        remove_staging_dirs(&ctx.job_id, dirs, &config.retry_config(), &self.metrics).await;

        Ok(JobCommitSummary {
            job_id: ctx.job_id.clone(),
            tables,
            elapsed: timer.elapsed(),
        })
    }

    async fn commit_output(
        &self,
        ctx: &JobContext,
        aggregator: &CommitAggregator<'_>,
        publisher: &TablePublisher,
        staging_dirs: &Mutex<Vec<StagingDir>>,
        output: String,
    ) -> Result<Option<TableCommitSummary>> {
        let table = match self.catalog.load_table(&output).await? {
            Some(table) => table,
            None => {
                info!("CommitJob found no table for output {}. Skipping job commit.", output);
                return Ok(None);
            }
        };
        push_dir(staging_dirs, table.as_ref(), &ctx.job_id)?;

        let start = Instant::now();
        let task_count = ctx.expected_task_count(&output);
        info!(
            "Committing job {} for table {} from {} task location(s)",
            ctx.job_id, output, task_count
        );

        let change_set = aggregator
            .collect(table.as_ref(), &ctx.job_id, 0..task_count, FailurePolicy::StopOnFailure)
            .await?;
        let file_count = change_set.len();
        let result = publisher.publish(table.as_ref(), change_set).await;

        match &result {
            Ok(summary) if summary.kind == PublishKind::Skipped => {}
            Ok(summary) => self.metrics.record_commit(true, summary.files_added),
            Err(e) => {
                self.metrics.record_commit(false, 0);
                warn!(
                    "Publishing {} file(s) to table {} failed: {}",
                    file_count, output, e
                );
            }
        }

        let summary = result?;
        debug!("Committing table {} took {:?}", output, start.elapsed());
        Ok(Some(summary))
    }

    /// Deletes everything the job's tasks staged and removes the staging
    /// directories.
    ///
    /// Every failure along the way is logged and suppressed; the call
    /// itself only fails if the commit state is unusable.
    pub async fn abort_job(&self, ctx: &JobContext, status: JobStatus) -> Result<()> {
        let outputs = ctx.output_tables();
        let config = &ctx.config;
        info!(
            "Job {} is aborted with status {:?}. Data file cleaning started",
            ctx.job_id, status
        );

        let table_pool = WorkerPool::new("abort-table", config.table_parallelism(outputs.len()));
        let file_pool = WorkerPool::new("abort-file", config.file_parallelism());
        let cleaner = JobCleaner::new(&file_pool, config.retry_config(), self.metrics.clone());
        let staging_dirs = Mutex::new(Vec::new());

        let result = BoundedTasks::foreach(format!("abort job {}", ctx.job_id))
            .execute_with(&table_pool)
            .suppress_failures()
            .run(outputs, |output| {
                self.abort_output(ctx, &cleaner, &staging_dirs, output)
            })
            .await;

        match result {
            Ok(outcome) => {
                let removed: usize = outcome.results.iter().sum();
                info!(
                    "Job {} is aborted. Data file cleaning finished: {} file(s) removed, {} table(s) failed",
                    ctx.job_id,
                    removed,
                    outcome.failures.len()
                );
            }
            Err(e) => warn!("Data file cleaning of job {} failed: {}", ctx.job_id, e),
        }

        let dirs = take_dirs(staging_dirs)?;
        cleaner.remove_staging_dirs(&ctx.job_id, dirs).await;
        Ok(())
    }

    async fn abort_output(
        &self,
        ctx: &JobContext,
        cleaner: &JobCleaner<'_>,
        staging_dirs: &Mutex<Vec<StagingDir>>,
        output: String,
    ) -> Result<usize> {
        let table = match self.catalog.load_table(&output).await? {
            Some(table) => table,
            None => {
                info!("AbortJob found no table for output {}. Skipping cleanup.", output);
                return Ok(0);
            }
        };
        push_dir(staging_dirs, table.as_ref(), &ctx.job_id)?;

        info!("Cleaning job {} for table {}", ctx.job_id, output);
        cleaner.abort_table(table.as_ref(), &ctx.job_id).await
    }
}

fn push_dir(dirs: &Mutex<Vec<StagingDir>>, table: &dyn Table, job_id: &JobId) -> Result<()> {
    dirs.lock()
        .map_err(|e| CommitError::Unexpected(format!("Lock poisoned: {}", e)))?
        .push(StagingDir::for_table(table, job_id));
    Ok(())
}

fn take_dirs(dirs: Mutex<Vec<StagingDir>>) -> Result<Vec<StagingDir>> {
    dirs.into_inner()
        .map_err(|e| CommitError::Unexpected(format!("Lock poisoned: {}", e)))
}
