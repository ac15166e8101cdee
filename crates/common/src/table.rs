/*
 * Table and catalog interface.
 *
 * The table owns its snapshot lineage. This crate only ever mutates it
 * through the table's own atomic, optimistic-concurrency-checked commit
 * calls: append, partition replace, and delete-by-filter.
 *
 * `InMemoryCatalog` / `InMemoryTable` implement the interface with a
 * snapshot log, for embedding and for tests.
 */

use crate::{CommitError, DataFileRecord, FileIo, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// Row filter accepted by `Table::delete_rows`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFilter {
    AlwaysTrue,
}

/// A table change being assembled. Nothing is visible until `commit`.
#[async_trait]
pub trait PendingUpdate: Send {
    fn add_file(&mut self, file: DataFileRecord);

    fn file_count(&self) -> usize;

    /// Atomically applies the change. Fails with `CommitError::Conflict`
    /// if a concurrent change invalidated it.
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Handle to a table owned by an external catalog.
#[async_trait]
pub trait Table: Send + Sync {
    fn name(&self) -> &str;

    /// Root location; staging directories live under `<location>/temp`.
    fn location(&self) -> &str;

    fn is_partitioned(&self) -> bool;

    /// Storage handle for staging files and data files of this table.
    fn io(&self) -> Arc<dyn FileIo>;

    /// Starts an append based on the current snapshot.
    fn new_append(&self) -> Result<Box<dyn PendingUpdate>>;

    /// Starts a partition replacement based on the current snapshot.
    fn new_replace_partitions(&self) -> Result<Box<dyn PendingUpdate>>;

    /// Atomically deletes every row matching `filter`.
    async fn delete_rows(&self, filter: RowFilter) -> Result<()>;
}

/// Resolves configured output names to tables.
#[async_trait]
pub trait TableCatalog: Send + Sync {
    /// Returns `None` if no table is registered under `name`.
    async fn load_table(&self, name: &str) -> Result<Option<Arc<dyn Table>>>;
}

/// Kind of change recorded by a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOperation {
    Append,
    ReplacePartitions,
    Delete,
}

/// One committed table change.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub snapshot_id: u64,
    pub parent_id: Option<u64>,
    pub operation: SnapshotOperation,
    pub added_files: usize,
    pub removed_files: usize,
    pub timestamp_ms: i64,
}

#[derive(Debug, Default)]
struct TableState {
    files: Vec<DataFileRecord>,
    snapshots: Vec<Snapshot>,
    injected_conflicts: usize,
}

impl TableState {
    fn current_snapshot_id(&self) -> Option<u64> {
        self.snapshots.last().map(|s| s.snapshot_id)
    }

    fn push_snapshot(&mut self, operation: SnapshotOperation, added: usize, removed: usize) {
        let parent_id = self.current_snapshot_id();
        self.snapshots.push(Snapshot {
            snapshot_id: parent_id.map(|id| id + 1).unwrap_or(1),
            parent_id,
            operation,
            added_files: added,
            removed_files: removed,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        });
    }
}

struct TableInner {
    name: String,
    location: String,
    partition_fields: Vec<String>,
    io: Arc<dyn FileIo>,
    state: RwLock<TableState>,
}

impl TableInner {
    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, TableState>> {
        self.state
            .read()
            .map_err(|e| CommitError::Unexpected(format!("Lock poisoned: {}", e)))
    }

    fn write_state(&self) -> Result<std::sync::RwLockWriteGuard<'_, TableState>> {
        self.state
            .write()
            .map_err(|e| CommitError::Unexpected(format!("Lock poisoned: {}", e)))
    }

    fn take_injected_conflict(&self, state: &mut TableState) -> Result<()> {
        if state.injected_conflicts > 0 {
            state.injected_conflicts -= 1;
            return Err(CommitError::Conflict(format!(
                "table {} was modified concurrently",
                self.name
            )));
        }
        Ok(())
    }

    fn apply(
        &self,
        operation: SnapshotOperation,
        base_snapshot: Option<u64>,
        files: Vec<DataFileRecord>,
    ) -> Result<()> {
        let mut state = self.write_state()?;
        self.take_injected_conflict(&mut state)?;

        let added = files.len();
        let removed = match operation {
            SnapshotOperation::Append => 0,
            SnapshotOperation::ReplacePartitions => {
                // Partition replacement must be based on the current snapshot
                if state.current_snapshot_id() != base_snapshot {
                    return Err(CommitError::Conflict(format!(
                        "table {}: snapshot changed from {:?} to {:?}",
                        self.name,
                        base_snapshot,
                        state.current_snapshot_id()
                    )));
                }
                let replaced: HashSet<&BTreeMap<String, String>> =
                    files.iter().map(|f| &f.partition).collect();
                let before = state.files.len();
                let kept: Vec<DataFileRecord> = state
                    .files
                    .iter()
                    .filter(|f| !replaced.contains(&f.partition))
                    .cloned()
                    .collect();
                state.files = kept;
                before - state.files.len()
            }
            SnapshotOperation::Delete => {
                let removed = state.files.len();
                state.files.clear();
                removed
            }
        };

        state.files.extend(files);
        state.push_snapshot(operation, added, removed);
        tracing::debug!(
            "Table {} committed {:?}: +{} -{} files",
            self.name,
            operation,
            added,
            removed
        );
        Ok(())
    }
}

/// In-memory table with a snapshot log.
#[derive(Clone)]
pub struct InMemoryTable {
    inner: Arc<TableInner>,
}

impl InMemoryTable {
    /// Creates an unpartitioned table.
    pub fn new(name: impl Into<String>, location: impl Into<String>, io: Arc<dyn FileIo>) -> Self {
        Self::partitioned(name, location, Vec::<String>::new(), io)
    }

    /// Creates a table partitioned by the given fields.
    pub fn partitioned(
        name: impl Into<String>,
        location: impl Into<String>,
        partition_fields: impl IntoIterator<Item = impl Into<String>>,
        io: Arc<dyn FileIo>,
    ) -> Self {
        Self {
            inner: Arc::new(TableInner {
                name: name.into(),
                location: location.into(),
                partition_fields: partition_fields.into_iter().map(Into::into).collect(),
                io,
                state: RwLock::new(TableState::default()),
            }),
        }
    }

    pub fn partition_fields(&self) -> &[String] {
        &self.inner.partition_fields
    }

    pub fn snapshots(&self) -> Result<Vec<Snapshot>> {
        Ok(self.inner.read_state()?.snapshots.clone())
    }

    pub fn current_snapshot_id(&self) -> Result<Option<u64>> {
        Ok(self.inner.read_state()?.current_snapshot_id())
    }

    /// Data files visible in the current snapshot.
    pub fn files(&self) -> Result<Vec<DataFileRecord>> {
        Ok(self.inner.read_state()?.files.clone())
    }

    pub fn row_count(&self) -> Result<u64> {
        Ok(self
            .inner
            .read_state()?
            .files
            .iter()
            .map(|f| f.record_count)
            .sum())
    }

    /// Makes the next `count` commits fail with a conflict.
    pub fn inject_conflicts(&self, count: usize) -> Result<()> {
        self.inner.write_state()?.injected_conflicts += count;
        Ok(())
    }

    fn pending(&self, operation: SnapshotOperation) -> Result<Box<dyn PendingUpdate>> {
        let base_snapshot = self.inner.read_state()?.current_snapshot_id();
        Ok(Box::new(InMemoryUpdate {
            table: self.inner.clone(),
            operation,
            base_snapshot,
            files: Vec::new(),
        }))
    }
}

struct InMemoryUpdate {
    table: Arc<TableInner>,
    operation: SnapshotOperation,
    base_snapshot: Option<u64>,
    files: Vec<DataFileRecord>,
}

#[async_trait]
impl PendingUpdate for InMemoryUpdate {
    fn add_file(&mut self, file: DataFileRecord) {
        self.files.push(file);
    }

    fn file_count(&self) -> usize {
        self.files.len()
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let update = *self;
        update
            .table
            .apply(update.operation, update.base_snapshot, update.files)
    }
}

#[async_trait]
impl Table for InMemoryTable {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn location(&self) -> &str {
        &self.inner.location
    }

    fn is_partitioned(&self) -> bool {
        !self.inner.partition_fields.is_empty()
    }

    fn io(&self) -> Arc<dyn FileIo> {
        self.inner.io.clone()
    }

    fn new_append(&self) -> Result<Box<dyn PendingUpdate>> {
        self.pending(SnapshotOperation::Append)
    }

    fn new_replace_partitions(&self) -> Result<Box<dyn PendingUpdate>> {
        self.pending(SnapshotOperation::ReplacePartitions)
    }

    async fn delete_rows(&self, filter: RowFilter) -> Result<()> {
        match filter {
            RowFilter::AlwaysTrue => {
                self.inner
                    .apply(SnapshotOperation::Delete, None, Vec::new())
            }
        }
    }
}

/// In-memory catalog keyed by table name.
#[derive(Default)]
pub struct InMemoryCatalog {
    tables: RwLock<HashMap<String, Arc<dyn Table>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a table under its own name, replacing any previous one.
    pub fn register(&self, table: impl Table + 'static) -> Result<()> {
        let mut tables = self
            .tables
            .write()
            .map_err(|e| CommitError::Unexpected(format!("Lock poisoned: {}", e)))?;
        tables.insert(table.name().to_string(), Arc::new(table));
        Ok(())
    }
}

#[async_trait]
impl TableCatalog for InMemoryCatalog {
    async fn load_table(&self, name: &str) -> Result<Option<Arc<dyn Table>>> {
        let tables = self
            .tables
            .read()
            .map_err(|e| CommitError::Unexpected(format!("Lock poisoned: {}", e)))?;
        Ok(tables.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FileFormat, OperatorFileIo, StorageConfig};

    fn io() -> Arc<dyn FileIo> {
        Arc::new(OperatorFileIo::from_config(&StorageConfig::memory()).unwrap())
    }

    fn file(path: &str, day: Option<&str>, rows: u64) -> DataFileRecord {
        let record = DataFileRecord::new(path, FileFormat::Parquet, 100, rows);
        match day {
            Some(day) => record.with_partition_value("day", day),
            None => record,
        }
    }

    #[tokio::test]
    async fn test_append_creates_snapshot() {
        let table = InMemoryTable::new("db.t", "wh/db/t", io());

        let mut append = table.new_append().unwrap();
        append.add_file(file("a", None, 5));
        append.add_file(file("b", None, 7));
        append.commit().await.unwrap();

        let snapshots = table.snapshots().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].operation, SnapshotOperation::Append);
        assert_eq!(table.row_count().unwrap(), 12);
    }

    #[tokio::test]
    async fn test_replace_partitions_only_touches_written_partitions() {
        let table = InMemoryTable::partitioned("db.p", "wh/db/p", ["day"], io());

        let mut append = table.new_append().unwrap();
        append.add_file(file("d1-old", Some("d1"), 1));
        append.add_file(file("d2-old", Some("d2"), 1));
        append.commit().await.unwrap();

        let mut replace = table.new_replace_partitions().unwrap();
        replace.add_file(file("d1-new", Some("d1"), 3));
        replace.commit().await.unwrap();

        let mut paths: Vec<String> = table
            .files()
            .unwrap()
            .into_iter()
            .map(|f| f.file_path)
            .collect();
        paths.sort();
        assert_eq!(paths, vec!["d1-new", "d2-old"]);
    }

    #[tokio::test]
    async fn test_replace_partitions_detects_concurrent_commit() {
        let table = InMemoryTable::partitioned("db.p", "wh/db/p", ["day"], io());

        let mut replace = table.new_replace_partitions().unwrap();
        replace.add_file(file("d1", Some("d1"), 1));

        let mut append = table.new_append().unwrap();
        append.add_file(file("other", Some("d1"), 1));
        append.commit().await.unwrap();

        let result = replace.commit().await;
        assert!(matches!(result, Err(CommitError::Conflict(_))));
        assert_eq!(table.snapshots().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_all_rows_on_empty_table() {
        let table = InMemoryTable::new("db.t", "wh/db/t", io());
        table.delete_rows(RowFilter::AlwaysTrue).await.unwrap();
        assert_eq!(table.row_count().unwrap(), 0);
    }

    #[test]
    fn test_poisoned_table_state_is_reported() {
        let table = InMemoryTable::new("db.t", "wh/db/t", io());
        let poisoner = table.clone();
        let panicked = std::thread::spawn(move || {
            let _guard = poisoner.inner.state.write().unwrap();
            panic!("writer died holding the table lock");
        })
        .join();
        assert!(panicked.is_err());

        assert!(matches!(
            table.new_replace_partitions(),
            Err(CommitError::Unexpected(_))
        ));
        assert!(matches!(table.new_append(), Err(CommitError::Unexpected(_))));
    }

    #[tokio::test]
    async fn test_catalog_lookup() {
        let catalog = InMemoryCatalog::new();
        catalog
            .register(InMemoryTable::new("db.t", "wh/db/t", io()))
            .unwrap();

        assert!(catalog.load_table("db.t").await.unwrap().is_some());
        assert!(catalog.load_table("db.missing").await.unwrap().is_none());
    }
}
