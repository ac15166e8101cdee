/*
 * Table publisher
 *
 * Turns one table's change set into exactly one atomic table commit (or
 * none). The mapping is:
 *
 *   mode       files   partitioned   action
 *   Append     some    any           append
 *   Append     none    any           skip
 *   Overwrite  some    any           replace partitions
 *   Overwrite  none    no            delete all rows
 *   Overwrite  none    yes           skip
 *
 * Conflicts reported by the table are returned as-is and never retried.
 */

use stagecommit_common::{DataFileRecord, Result, ResultExt, RowFilter, Table};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::info;

use crate::aggregator::ChangeSet;

/// How a job's output replaces the table contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitMode {
    /// New files are added next to the existing ones.
    #[default]
    Append,
    /// Partitions written by the job replace their current contents.
    Overwrite,
}

impl CommitMode {
    pub fn from_overwrite(overwrite: bool) -> Self {
        if overwrite {
            CommitMode::Overwrite
        } else {
            CommitMode::Append
        }
    }
}

impl fmt::Display for CommitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitMode::Append => write!(f, "append"),
            CommitMode::Overwrite => write!(f, "overwrite"),
        }
    }
}

/// The single table operation a publish resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishAction {
    Append(Vec<DataFileRecord>),
    ReplacePartitions(Vec<DataFileRecord>),
    DeleteAllRows,
    Skip,
}

impl PublishAction {
    pub fn kind(&self) -> PublishKind {
        match self {
            PublishAction::Append(_) => PublishKind::Append,
            PublishAction::ReplacePartitions(_) => PublishKind::ReplacePartitions,
            PublishAction::DeleteAllRows => PublishKind::DeleteAllRows,
            PublishAction::Skip => PublishKind::Skipped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishKind {
    Append,
    ReplacePartitions,
    DeleteAllRows,
    Skipped,
}

impl PublishKind {
    /// Whether a table commit was issued.
    pub fn mutated(&self) -> bool {
        !matches!(self, PublishKind::Skipped)
    }
}

/// Decides which table operation publishes `change_set`.
pub fn plan_publish(mode: CommitMode, change_set: ChangeSet, partitioned: bool) -> PublishAction {
    match (mode, change_set.is_empty()) {
        (CommitMode::Append, false) => PublishAction::Append(change_set.files),
        (CommitMode::Append, true) => PublishAction::Skip,
        (CommitMode::Overwrite, false) => PublishAction::ReplacePartitions(change_set.files),
        (CommitMode::Overwrite, true) if !partitioned => PublishAction::DeleteAllRows,
        (CommitMode::Overwrite, true) => PublishAction::Skip,
    }
}

/// Result of publishing one table.
#[derive(Debug, Clone)]
pub struct TableCommitSummary {
    pub table: String,
    pub kind: PublishKind,
    pub files_added: usize,
    pub bytes_added: u64,
    pub records_added: u64,
    pub elapsed: Duration,
}

/// Publishes change sets in one commit mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct TablePublisher {
    mode: CommitMode,
}

impl TablePublisher {
    pub fn new(mode: CommitMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> CommitMode {
        self.mode
    }

    /// Publishes `change_set` to `table` with at most one table commit.
    pub async fn publish(&self, table: &dyn Table, change_set: ChangeSet) -> Result<TableCommitSummary> {
        let start = Instant::now();
        let files_added = change_set.len();
        let bytes_added = change_set.total_bytes();
        let records_added = change_set.record_count();

        let action = plan_publish(self.mode, change_set, table.is_partitioned());
        let kind = action.kind();

        match action {
            PublishAction::Append(files) => {
                let mut update = table.new_append()?;
                for file in files {
                    update.add_file(file);
                }
                update
                    .commit()
                    .await
                    .with_context(|| format!("append to table {}", table.name()))?;
                info!(
                    "Append commit took {:?} for table {} with {} file(s)",
                    start.elapsed(),
                    table.name(),
                    files_added
                );
            }
            PublishAction::ReplacePartitions(files) => {
                let mut update = table.new_replace_partitions()?;
                for file in files {
                    update.add_file(file);
                }
                update
                    .commit()
                    .await
                    .with_context(|| format!("replace partitions of table {}", table.name()))?;
                info!(
                    "Overwrite commit took {:?} for table {} with {} file(s)",
                    start.elapsed(),
                    table.name(),
                    files_added
                );
            }
            PublishAction::DeleteAllRows => {
                table
                    .delete_rows(RowFilter::AlwaysTrue)
                    .await
                    .with_context(|| format!("delete rows of table {}", table.name()))?;
                info!(
                    "Cleared table contents as part of empty overwrite for unpartitioned table {} in {:?}",
                    table.name(),
                    start.elapsed()
                );
            }
            PublishAction::Skip => {
                info!(
                    "Not creating a new {} commit for table {}: no new files",
                    self.mode,
                    table.name()
                );
            }
        }

        Ok(TableCommitSummary {
            table: table.name().to_string(),
            kind,
            files_added,
            bytes_added,
            records_added,
            elapsed: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagecommit_common::{
        CommitError, FileFormat, FileIo, InMemoryTable, OperatorFileIo, SnapshotOperation,
        StorageConfig,
    };
    use std::sync::Arc;

    fn io() -> Arc<dyn FileIo> {
        Arc::new(OperatorFileIo::from_config(&StorageConfig::memory()).unwrap())
    }

    fn change_set(paths: &[&str]) -> ChangeSet {
        ChangeSet::new(
            "db.t",
            paths
                .iter()
                .map(|p| DataFileRecord::new(*p, FileFormat::Parquet, 10, 2))
                .collect(),
        )
    }

    #[test]
    fn test_commit_mode_default() {
        assert_eq!(CommitMode::default(), CommitMode::Append);
        assert_eq!(CommitMode::from_overwrite(true), CommitMode::Overwrite);
        assert_eq!(TablePublisher::default().mode(), CommitMode::Append);
    }

    #[test]
    fn test_plan_publish_table() {
        let some = || change_set(&["a"]);
        let none = || change_set(&[]);

        assert_eq!(plan_publish(CommitMode::Append, some(), false).kind(), PublishKind::Append);
        assert_eq!(plan_publish(CommitMode::Append, none(), false), PublishAction::Skip);
        assert_eq!(plan_publish(CommitMode::Append, none(), true), PublishAction::Skip);
        assert_eq!(
            plan_publish(CommitMode::Overwrite, some(), true).kind(),
            PublishKind::ReplacePartitions
        );
        assert_eq!(
            plan_publish(CommitMode::Overwrite, some(), false).kind(),
            PublishKind::ReplacePartitions
        );
        assert_eq!(
            plan_publish(CommitMode::Overwrite, none(), false),
            PublishAction::DeleteAllRows
        );
        assert_eq!(plan_publish(CommitMode::Overwrite, none(), true), PublishAction::Skip);
    }

    #[tokio::test]
    async fn test_append_publishes_one_snapshot() {
        let table = InMemoryTable::new("db.t", "wh/db/t", io());
        let summary = TablePublisher::new(CommitMode::Append)
            .publish(&table, change_set(&["a", "b", "c"]))
            .await
            .unwrap();

        assert_eq!(summary.kind, PublishKind::Append);
        assert_eq!(summary.files_added, 3);
        assert_eq!(summary.records_added, 6);
        let snapshots = table.snapshots().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].operation, SnapshotOperation::Append);
        assert_eq!(snapshots[0].added_files, 3);
    }

    #[tokio::test]
    async fn test_empty_overwrite_clears_unpartitioned_table() {
        let table = InMemoryTable::new("db.t", "wh/db/t", io());
        let publisher = TablePublisher::new(CommitMode::Append);
        publisher.publish(&table, change_set(&["a"])).await.unwrap();

        let summary = TablePublisher::new(CommitMode::Overwrite)
            .publish(&table, change_set(&[]))
            .await
            .unwrap();

        assert_eq!(summary.kind, PublishKind::DeleteAllRows);
        assert_eq!(table.row_count().unwrap(), 0);
        assert_eq!(table.snapshots().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_skip_issues_no_commit() {
        let table = InMemoryTable::partitioned("db.p", "wh/db/p", ["day"], io());
        let summary = TablePublisher::new(CommitMode::Overwrite)
            .publish(&table, change_set(&[]))
            .await
            .unwrap();

        assert!(!summary.kind.mutated());
        assert!(table.snapshots().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conflict_is_not_retried() {
        let table = InMemoryTable::new("db.t", "wh/db/t", io());
        table.inject_conflicts(1).unwrap();

        let result = TablePublisher::new(CommitMode::Append)
            .publish(&table, change_set(&["a"]))
            .await;

        assert!(matches!(result, Err(CommitError::Conflict(_))));
        assert!(table.snapshots().unwrap().is_empty());
    }
}
