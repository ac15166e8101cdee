/*
 * Active writer registry.
 *
 * Maps each task attempt to the writers it opened, one per target table.
 * The registry is owned by the caller and handed by reference to both the
 * task commit and task abort paths.
 */

use stagecommit_common::{CommitError, Result};
use stagecommit_proto::TaskAttemptId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::writer::TaskWriter;

/// Writers of one task attempt keyed by table name.
pub type TableWriters = HashMap<String, Arc<dyn TaskWriter>>;

#[derive(Default)]
pub struct WriterRegistry {
    writers: Mutex<HashMap<TaskAttemptId, TableWriters>>,
}

impl WriterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<TaskAttemptId, TableWriters>>> {
        self.writers
            .lock()
            .map_err(|e| CommitError::Unexpected(format!("Lock poisoned: {}", e)))
    }

    /// Registers the writer an attempt uses for `table`, replacing any earlier one.
    pub fn register(
        &self,
        attempt: &TaskAttemptId,
        table: impl Into<String>,
        writer: Arc<dyn TaskWriter>,
    ) -> Result<()> {
        self.lock()?
            .entry(attempt.clone())
            .or_default()
            .insert(table.into(), writer);
        Ok(())
    }

    pub fn lookup(&self, attempt: &TaskAttemptId) -> Result<Option<TableWriters>> {
        Ok(self.lock()?.get(attempt).cloned())
    }

    /// Removes and returns every writer of an attempt.
    pub fn remove(&self, attempt: &TaskAttemptId) -> Result<Option<TableWriters>> {
        Ok(self.lock()?.remove(attempt))
    }

    /// Number of attempts with registered writers.
    pub fn len(&self) -> usize {
        self.lock().map(|w| w.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::FileTrackingWriter;
    use stagecommit_common::{FileIo, OperatorFileIo, StorageConfig};
    use stagecommit_proto::{JobId, TaskType};

    fn attempt(index: u32, attempt: u32) -> TaskAttemptId {
        TaskAttemptId {
            job_id: JobId::new("job_1"),
            task_type: TaskType::Map,
            task_index: index,
            attempt,
        }
    }

    #[test]
    fn test_register_lookup_remove() {
        let io: Arc<dyn FileIo> =
            Arc::new(OperatorFileIo::from_config(&StorageConfig::memory()).unwrap());
        let registry = WriterRegistry::new();

        registry
            .register(&attempt(0, 0), "db.a", Arc::new(FileTrackingWriter::new("db.a", io.clone())))
            .unwrap();
        registry
            .register(&attempt(0, 0), "db.b", Arc::new(FileTrackingWriter::new("db.b", io.clone())))
            .unwrap();
        registry
            .register(&attempt(0, 1), "db.a", Arc::new(FileTrackingWriter::new("db.a", io)))
            .unwrap();

        assert_eq!(registry.lookup(&attempt(0, 0)).unwrap().unwrap().len(), 2);
        assert_eq!(registry.len(), 2);

        let removed = registry.remove(&attempt(0, 0)).unwrap().unwrap();
        assert!(removed.contains_key("db.b"));
        assert!(registry.lookup(&attempt(0, 0)).unwrap().is_none());
        assert!(registry.remove(&attempt(0, 0)).unwrap().is_none());
        assert!(registry.lookup(&attempt(0, 1)).unwrap().is_some());
    }
}
