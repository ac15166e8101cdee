/*
 * Staged Commit Protocol - Worker
 *
 * The task side of the protocol:
 * 1. Writers record the data files a task produces per table
 * 2. The writer registry maps task attempts to their writers
 * 3. Task commit stages each table's file list for the job commit
 * 4. Task abort discards everything the attempt wrote
 */

pub mod registry;
pub mod task_committer;
pub mod writer;

pub use registry::{TableWriters, WriterRegistry};
pub use task_committer::{StagedTable, TaskCommitSummary, TaskCommitter};
pub use writer::{FileTrackingWriter, TaskWriter};
