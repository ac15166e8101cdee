/*
 * Task committer - stages a task's output for the job commit.
 *
 * On task commit every output table gets one staging file listing the
 * data files this task wrote for it (possibly none). On task abort the
 * task's writers delete whatever they wrote and nothing is staged.
 */

use stagecommit_common::{
    BoundedTasks, CommitMetrics, Result, ResultExt, TableCatalog, WorkerPool,
};
use stagecommit_proto::{StagedCommit, StagingStore, TaskAttemptContext, TaskAttemptId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::registry::{TableWriters, WriterRegistry};

/// A staging file written for one table.
#[derive(Debug, Clone)]
pub struct StagedTable {
    pub table: String,
    pub location: String,
    pub file_count: usize,
}

/// Result of a successful task commit.
#[derive(Debug, Clone)]
pub struct TaskCommitSummary {
    pub attempt: TaskAttemptId,
    pub staged: Vec<StagedTable>,
}

impl TaskCommitSummary {
    pub fn file_count(&self) -> usize {
        self.staged.iter().map(|s| s.file_count).sum()
    }
}

/// Runs the task-side half of the commit protocol.
pub struct TaskCommitter {
    catalog: Arc<dyn TableCatalog>,
    metrics: Arc<CommitMetrics>,
}

impl TaskCommitter {
    pub fn new(catalog: Arc<dyn TableCatalog>, metrics: Arc<CommitMetrics>) -> Self {
        Self { catalog, metrics }
    }

    /// Whether this attempt's output has to be staged at all.
    pub fn needs_task_commit(&self, ctx: &TaskAttemptContext) -> bool {
        ctx.needs_task_commit()
    }

    /// Stages the attempt's output for every output table.
    ///
    /// Any staging failure fails the task. The attempt's writers are
    /// released only after every table was staged.
    pub async fn commit_task(
        &self,
        ctx: &TaskAttemptContext,
        writers: &WriterRegistry,
    ) -> Result<TaskCommitSummary> {
        let attempt = &ctx.attempt;
        let outputs = ctx.job.output_tables();
        let task_writers = writers.lookup(attempt)?.unwrap_or_else(|| {
            info!(
                "CommitTask found no writers for output tables {:?}, attempt {}",
                outputs, attempt
            );
            HashMap::new()
        });

        let config = &ctx.job.config;
        let table_pool = WorkerPool::new(
            "commit-task-table",
            config.table_parallelism(outputs.len()),
        );

        let outcome = BoundedTasks::foreach(format!("stage {}", attempt))
            .execute_with(&table_pool)
            .retry(config.retry_config())
            .stop_on_failure()
            .run(outputs, |output| self.stage_table(ctx, &task_writers, output))
            .await
            .with_context(|| format!("commit task {}", attempt))?;

        writers.remove(attempt)?;
        self.metrics.record_task_committed();

        let staged: Vec<StagedTable> = outcome.results.into_iter().flatten().collect();
        info!(
            "Committed task {}: staged {} table(s)",
            attempt,
            staged.len()
        );
        Ok(TaskCommitSummary {
            attempt: attempt.clone(),
            staged,
        })
    }

    async fn stage_table(
        &self,
        ctx: &TaskAttemptContext,
        writers: &TableWriters,
        output: String,
    ) -> Result<Option<StagedTable>> {
        let table = match self.catalog.load_table(&output).await? {
            Some(table) => table,
            None => {
                // Multi-table jobs may list outputs this task never wrote to
                info!("CommitTask found no table for output {}, skipping", output);
                return Ok(None);
            }
        };

        let files = match writers.get(&output) {
            Some(writer) => writer.complete().await?,
            None => {
                info!(
                    "CommitTask found no writer for table {}, attempt {}",
                    output, ctx.attempt
                );
                Vec::new()
            }
        };

        let commit = StagedCommit::new(
            ctx.attempt.job_id.clone(),
            ctx.task_index(),
            output.clone(),
            files,
        );
        let location = StagingStore::new(table.io())
            .stage(table.location(), &commit)
            .await?;
        self.metrics.record_staged(commit.files.len());

        Ok(Some(StagedTable {
            table: output,
            location,
            file_count: commit.files.len(),
        }))
    }

    /// Discards everything the attempt's writers produced.
    ///
    /// Never stages anything. Discard failures are logged and suppressed, and
    /// calling this again for the same attempt is a no-op.
    pub async fn abort_task(&self, ctx: &TaskAttemptContext, writers: &WriterRegistry) -> Result<()> {
        let attempt = &ctx.attempt;
        let removed = writers.remove(attempt)?;

        match removed {
            None => debug!("AbortTask found no writers for attempt {}", attempt),
            Some(table_writers) => {
                for (table, writer) in table_writers {
                    if let Err(e) = writer.discard().await {
                        warn!(
                            "Failed to discard writer for table {} on abort of {}: {}",
                            table, attempt, e
                        );
                    }
                }
            }
        }

        self.metrics.record_task_aborted();
        Ok(())
    }
}
