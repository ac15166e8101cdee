/*
 * Stagecommit Coordinator
 *
 * Job-side half of the staged commit protocol: aggregate every task's
 * staged files, publish them to each output table in one atomic commit,
 * and clean up staging (or, on abort, the staged data files too).
 */

pub mod aggregator;
pub mod cleanup;
pub mod committer;
pub mod publisher;

pub use aggregator::{ChangeSet, CommitAggregator};
pub use cleanup::{remove_staging_dirs, JobCleaner, StagingDir};
pub use committer::{JobCommitSummary, OutputCommitter};
pub use publisher::{
    plan_publish, CommitMode, PublishAction, PublishKind, TableCommitSummary, TablePublisher,
};
