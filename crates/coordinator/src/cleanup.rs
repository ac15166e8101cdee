/*
 * Job abort and staging cleanup.
 *
 * Abort discovers the tasks that actually staged something by listing the
 * job's staging directory, deletes every data file they recorded, and
 * keeps going past individual failures. Staging directories are removed
 * after a successful job commit and after every abort.
 */

use stagecommit_common::{
    BoundedTasks, CommitMetrics, DataFileRecord, FailurePolicy, FileIo, Result, RetryBuilder,
    RetryConfig, Table, WorkerPool,
};
use stagecommit_proto::{job_location, JobId, StagingStore};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::aggregator::CommitAggregator;

/// A job's staging directory under one table.
#[derive(Clone)]
pub struct StagingDir {
    pub table: String,
    pub location: String,
    io: Arc<dyn FileIo>,
}

impl StagingDir {
    pub fn for_table(table: &dyn Table, job_id: &JobId) -> Self {
        Self {
            table: table.name().to_string(),
            location: job_location(table.location(), job_id),
            io: table.io(),
        }
    }
}

impl fmt::Display for StagingDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.location)
    }
}

impl fmt::Debug for StagingDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingDir")
            .field("table", &self.table)
            .field("location", &self.location)
            .finish()
    }
}

/// Removes what an unsuccessful job left behind.
pub struct JobCleaner<'a> {
    file_pool: &'a WorkerPool,
    retry: RetryConfig,
    metrics: Arc<CommitMetrics>,
}

impl<'a> JobCleaner<'a> {
    pub fn new(file_pool: &'a WorkerPool, retry: RetryConfig, metrics: Arc<CommitMetrics>) -> Self {
        Self {
            file_pool,
            retry,
            metrics,
        }
    }

    /// Deletes every data file staged for `table` by the job.
    ///
    /// Unreadable staging files and failed deletes are logged and skipped.
    /// Returns the number of data files removed.
    pub async fn abort_table(&self, table: &dyn Table, job_id: &JobId) -> Result<usize> {
        let store = StagingStore::new(table.io());
        let dir = job_location(table.location(), job_id);
        let task_indices = RetryBuilder::new(&self.retry)
            .operation(format!("list {}", dir))
            .run(|| store.list_task_indices(&dir))
            .await?;
        info!(
            "Found {} staged task(s) for table {} under {}",
            task_indices.len(),
            table.name(),
            dir
        );

        let aggregator = CommitAggregator::new(self.file_pool, self.retry.clone(), self.metrics.clone());
        let change_set = aggregator
            .collect(table, job_id, task_indices, FailurePolicy::SuppressFailures)
            .await?;
        if change_set.is_empty() {
            return Ok(0);
        }

        let io = table.io();
        let io = &io;
        let outcome = BoundedTasks::foreach(format!("remove data files of {}", table.name()))
            .execute_with(self.file_pool)
            .retry(self.retry.clone())
            .suppress_failures()
            .run(change_set.files, move |file: DataFileRecord| async move {
                io.delete(&file.file_path).await
            })
            .await?;

        let removed = outcome.results.len();
        self.metrics.record_abort_deletes(removed);
        self.metrics.record_cleanup_failures(outcome.failures.len());
        info!(
            "Removed {} data file(s) of table {} ({} failed)",
            removed,
            table.name(),
            outcome.failures.len()
        );
        Ok(removed)
    }

    /// Removes staging directories one by one.
    pub async fn remove_staging_dirs(&self, job_id: &JobId, dirs: Vec<StagingDir>) {
        remove_staging_dirs(job_id, dirs, &self.retry, &self.metrics).await
    }
}

/// Removes a job's staging directories sequentially, retrying each one.
/// Failures are logged and never returned.
pub async fn remove_staging_dirs(
    job_id: &JobId,
    dirs: Vec<StagingDir>,
    retry: &RetryConfig,
    metrics: &CommitMetrics,
) {
    if dirs.is_empty() {
        return;
    }
    let count = dirs.len();

    let result = BoundedTasks::foreach(format!("cleanup of job {}", job_id))
        .retry(retry.clone())
        .suppress_failures()
        .run(dirs, |dir: StagingDir| async move {
            info!("Cleaning location {}", dir.location);
            StagingStore::new(dir.io.clone())
                .remove_job_location(&dir.location)
                .await
        })
        .await;

    match result {
        Ok(outcome) if outcome.failures.is_empty() => {
            info!("Removed {} staging location(s) of job {}", count, job_id);
        }
        Ok(outcome) => {
            for failure in &outcome.failures {
                warn!(
                    "Failed to remove directory {} on job cleanup: {}",
                    failure.item, failure.error
                );
            }
            metrics.record_cleanup_failures(outcome.failures.len());
        }
        Err(e) => {
            warn!("Cleanup of job {} failed: {}", job_id, e);
            metrics.record_cleanup_failures(count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use stagecommit_common::{FileFormat, InMemoryTable, OperatorFileIo, StorageConfig};
    use stagecommit_proto::{task_location, StagedCommit};
    use std::time::Duration;

    const LOCATION: &str = "wh/db/t";

    fn io() -> Arc<dyn FileIo> {
        Arc::new(OperatorFileIo::from_config(&StorageConfig::memory()).unwrap())
    }

    fn retry() -> RetryConfig {
        RetryConfig::fixed(3, Duration::from_millis(1))
    }

    async fn write_and_stage(io: &Arc<dyn FileIo>, job: &JobId, task: u32, names: &[&str]) -> Vec<String> {
        let mut files = Vec::new();
        for name in names {
            let path = format!("{}/data/{}", LOCATION, name);
            io.write(&path, Bytes::from_static(b"rows")).await.unwrap();
            files.push(DataFileRecord::new(path, FileFormat::Parquet, 4, 1));
        }
        let paths = files.iter().map(|f| f.file_path.clone()).collect();
        StagingStore::new(io.clone())
            .stage(LOCATION, &StagedCommit::new(job.clone(), task, "db.t", files))
            .await
            .unwrap();
        paths
    }

    #[tokio::test]
    async fn test_abort_table_deletes_staged_files_only() {
        let io = io();
        let table = InMemoryTable::new("db.t", LOCATION, io.clone());
        let job = JobId::new("job_3");
        let mut staged = write_and_stage(&io, &job, 0, &["a.parquet", "b.parquet"]).await;
        staged.extend(write_and_stage(&io, &job, 4, &["c.parquet"]).await);
        io.write(&format!("{}/data/keep.parquet", LOCATION), Bytes::from_static(b"x"))
            .await
            .unwrap();

        let pool = WorkerPool::new("files", 2);
        let metrics = Arc::new(CommitMetrics::new());
        let cleaner = JobCleaner::new(&pool, retry(), metrics.clone());

        let removed = cleaner.abort_table(&table, &job).await.unwrap();
        assert_eq!(removed, 3);
        for path in &staged {
            assert!(io.read(path).await.unwrap().is_none());
        }
        assert!(io
            .read(&format!("{}/data/keep.parquet", LOCATION))
            .await
            .unwrap()
            .is_some());
        assert_eq!(metrics.snapshot().files_deleted_on_abort, 3);
        assert!(table.snapshots().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abort_table_without_staging_is_noop() {
        let table = InMemoryTable::new("db.t", LOCATION, io());
        let pool = WorkerPool::new("files", 2);
        let cleaner = JobCleaner::new(&pool, retry(), Arc::new(CommitMetrics::new()));

        let removed = cleaner.abort_table(&table, &JobId::new("job_none")).await.unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_remove_staging_dirs() {
        let io = io();
        let table = InMemoryTable::new("db.t", LOCATION, io.clone());
        let job = JobId::new("job_5");
        write_and_stage(&io, &job, 1, &["a.parquet"]).await;

        let dir = StagingDir::for_table(&table, &job);
        assert_eq!(dir.location, "wh/db/t/temp/job_5");

        remove_staging_dirs(&job, vec![dir], &retry(), &CommitMetrics::new()).await;
        assert!(io.read(&task_location(LOCATION, &job, 1)).await.unwrap().is_none());
        // data files are left alone
        assert!(io
            .read(&format!("{}/data/a.parquet", LOCATION))
            .await
            .unwrap()
            .is_some());
    }
}
