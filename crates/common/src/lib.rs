/*
 * Staged Commit Protocol - Common Types
 *
 * Shared errors, retry, configuration, storage I/O, data file records,
 * bounded task pools and the table/catalog interface used by both the
 * task-side and job-side committers.
 */

pub mod config;
pub mod data_file;
pub mod error;
pub mod metrics;
pub mod retry;
pub mod storage;
pub mod table;
pub mod tasks;

pub use config::{CommitConfig, CommitConfigBuilder};
pub use data_file::{ColumnStats, DataFileRecord, FileFormat};
pub use error::{CommitError, Result, ResultExt};
pub use metrics::{CommitMetrics, MetricsSnapshot, Timer};
pub use retry::{RetryBuilder, RetryConfig};
pub use storage::{build_operator, FileIo, OperatorFileIo, StorageBackend, StorageConfig};
pub use table::{
    InMemoryCatalog, InMemoryTable, PendingUpdate, RowFilter, Snapshot, SnapshotOperation, Table,
    TableCatalog,
};
pub use tasks::{BoundedTasks, FailurePolicy, TaskFailure, TaskOutcome, WorkerPool};
