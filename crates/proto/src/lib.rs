/*
 * Contract between the task and job phases of the staged commit.
 *
 * This crate contains:
 * - Job/task identity and the contexts passed to lifecycle calls
 * - Staging locations and the versioned staging file format
 */

pub mod identity;
pub mod staging;

pub use identity::{
    resolve_task_count, JobContext, JobContextBuilder, JobId, JobStatus, TaskAttemptContext,
    TaskAttemptId, TaskType,
};
pub use staging::{
    decode_records, encode_records, job_location, parse_task_index, task_location, StagedCommit,
    StagingStore, FOR_COMMIT_EXTENSION,
};
