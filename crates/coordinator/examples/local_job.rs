/*
 * Local job walkthrough.
 *
 * Runs a small write job against a table on the local filesystem: four
 * map tasks write data files, one attempt is aborted and retried, the job
 * commits in append mode and then a second job overwrites the table.
 *
 * Usage:
 *   cargo run --example local_job
 *
 * Optional flags:
 *   --dir <PATH>      Warehouse root [default: a temporary directory]
 *   --tasks <N>       Number of map tasks [default: 4]
 */

use bytes::Bytes;
use stagecommit_common::{
    DataFileRecord, FileFormat, FileIo, InMemoryCatalog, InMemoryTable, OperatorFileIo,
    StorageConfig,
};
use stagecommit_coordinator::OutputCommitter;
use stagecommit_proto::{JobContext, JobContextBuilder, JobId, TaskAttemptContext, TaskType};
use stagecommit_worker::{FileTrackingWriter, WriterRegistry};
use std::sync::Arc;

const TABLE: &str = "default.events";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stagecommit_coordinator=info".parse()?)
                .add_directive("stagecommit_worker=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let tasks: u32 = get_arg(&args, "--tasks").unwrap_or("4").parse()?;
    let tempdir = tempfile::tempdir()?;
    let root = match get_arg(&args, "--dir") {
        Some(dir) => dir.to_string(),
        None => tempdir.path().to_string_lossy().to_string(),
    };

    tracing::info!("Starting local job");
    tracing::info!("  Warehouse: {}", root);
    tracing::info!("  Tasks: {}", tasks);

    let io: Arc<dyn FileIo> = Arc::new(OperatorFileIo::from_config(&StorageConfig::local(&root))?);
    let table = InMemoryTable::new(TABLE, "default/events", io.clone());
    let catalog = Arc::new(InMemoryCatalog::new());
    catalog.register(table.clone())?;

    let committer = OutputCommitter::new(catalog, Arc::new(WriterRegistry::new()));

    // Job 1: append
    let job = job_context(JobId::generate(), tasks, false)?;
    committer.setup_job(&job);
    for index in 0..tasks {
        if index == 1 {
            // first attempt of task 1 fails and is retried
            let failed = TaskAttemptContext::new(job.clone(), TaskType::Map, index, 0);
            run_task(&committer, &io, &failed, 2).await?;
            committer.abort_task(&failed).await?;
            tracing::info!("Aborted attempt {}", failed.attempt);
        }
        let attempt = TaskAttemptContext::new(job.clone(), TaskType::Map, index, 1);
        run_task(&committer, &io, &attempt, 2).await?;
        let summary = committer.commit_task(&attempt).await?;
        tracing::info!("Task {} staged {} file(s)", attempt.attempt, summary.file_count());
    }

    let summary = committer.commit_job(&job).await?;
    tracing::info!(
        "Job {} committed {} file(s) in {:?}",
        summary.job_id,
        summary.files_added(),
        summary.elapsed
    );
    tracing::info!("Table rows after append: {}", table.row_count()?);

    // Job 2: overwrite with a single task
    let job = job_context(JobId::generate(), 1, true)?;
    committer.setup_job(&job);
    let attempt = TaskAttemptContext::new(job.clone(), TaskType::Map, 0, 0);
    run_task(&committer, &io, &attempt, 1).await?;
    committer.commit_task(&attempt).await?;
    committer.commit_job(&job).await?;
    tracing::info!("Table rows after overwrite: {}", table.row_count()?);

    for snapshot in table.snapshots()? {
        tracing::info!(
            "  snapshot {} {:?}: +{} -{} files",
            snapshot.snapshot_id,
            snapshot.operation,
            snapshot.added_files,
            snapshot.removed_files
        );
    }

    println!("{}", committer.metrics().to_prometheus());
    Ok(())
}

fn job_context(job_id: JobId, tasks: u32, overwrite: bool) -> Result<JobContext, Box<dyn std::error::Error>> {
    Ok(JobContextBuilder::default()
        .job_id(job_id)
        .outputs(vec![TABLE.to_string()])
        .overwrite(overwrite)
        .num_map_tasks(tasks)
        .build()?)
}

/// Writes `files` data files for one attempt and registers its writer.
async fn run_task(
    committer: &OutputCommitter,
    io: &Arc<dyn FileIo>,
    ctx: &TaskAttemptContext,
    files: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    committer.setup_task(ctx);
    let writer = Arc::new(
        FileTrackingWriter::new(TABLE, io.clone()).with_retry(ctx.job.config.retry_config()),
    );
    for n in 0..files {
        let path = format!("default/events/data/{}-{}.parquet", ctx.attempt, n);
        let contents = Bytes::from(format!("rows of {}", path));
        let record = DataFileRecord::new(&path, FileFormat::Parquet, contents.len() as u64, 100);
        writer.write_file(record, contents).await?;
    }
    committer.writers().register(&ctx.attempt, TABLE, writer)?;
    Ok(())
}

fn get_arg<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}
