/*
 * Commit aggregation
 *
 * Reads every task's staging file for a table on the shared file pool and
 * unions the recovered data files into one change set. A missing staging
 * file contributes nothing: the task count used for discovery is only an
 * upper bound on the tasks that actually ran.
 */

use stagecommit_common::{
    BoundedTasks, CommitMetrics, DataFileRecord, FailurePolicy, Result, ResultExt, RetryConfig,
    Table, WorkerPool,
};
use stagecommit_proto::{task_location, JobId, StagingStore};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Every data file staged for one table by the tasks of a job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub table: String,
    pub files: Vec<DataFileRecord>,
}

impl ChangeSet {
    pub fn new(table: impl Into<String>, files: Vec<DataFileRecord>) -> Self {
        Self {
            table: table.into(),
            files,
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.file_size_bytes).sum()
    }

    pub fn record_count(&self) -> u64 {
        self.files.iter().map(|f| f.record_count).sum()
    }
}

/// Reads staged commits of a job on a shared file pool.
pub struct CommitAggregator<'a> {
    file_pool: &'a WorkerPool,
    retry: RetryConfig,
    metrics: Arc<CommitMetrics>,
}

impl<'a> CommitAggregator<'a> {
    pub fn new(file_pool: &'a WorkerPool, retry: RetryConfig, metrics: Arc<CommitMetrics>) -> Self {
        Self {
            file_pool,
            retry,
            metrics,
        }
    }

    /// Collects the staged data files of `task_indices` for `table`.
    ///
    /// Each read is retried on transient failures. With
    /// `FailurePolicy::StopOnFailure` the first unrecoverable read fails the
    /// whole collection; with `SuppressFailures` failed reads are logged and
    /// their files are left out.
    pub async fn collect(
        &self,
        table: &dyn Table,
        job_id: &JobId,
        task_indices: impl IntoIterator<Item = u32>,
        policy: FailurePolicy,
    ) -> Result<ChangeSet> {
        let store = StagingStore::new(table.io());
        let location = table.location();
        let store = &store;
        let metrics = &self.metrics;

        let outcome = BoundedTasks::foreach(format!("read staged commits of {}", table.name()))
            .execute_with(self.file_pool)
            .retry(self.retry.clone())
            .policy(policy)
            .run(task_indices, move |task_index| async move {
                let path = task_location(location, job_id, task_index);
                let result = store.read(&path).await;
                metrics.record_staging_read(result.is_ok());
                result
            })
            .await
            .with_context(|| format!("collecting staged commits for table {}", table.name()))?;

        if !outcome.failures.is_empty() {
            warn!(
                "Ignored {} unreadable staging file(s) for table {}",
                outcome.failures.len(),
                table.name()
            );
        }

        let files: Vec<DataFileRecord> = outcome.results.into_iter().flatten().collect();
        info!(
            "Collected {} data file(s) for table {} of job {}",
            files.len(),
            table.name(),
            job_id
        );
        debug!("Collected files for {}: {:?}", table.name(), files);
        Ok(ChangeSet::new(table.name(), files))
    }
}
