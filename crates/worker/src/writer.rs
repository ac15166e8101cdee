/*
 * Task writers.
 *
 * A task holds one writer per target table. At task commit the writer
 * reports the files it completed; at task abort it deletes every file it
 * touched, including files that were only partially written.
 */

use async_trait::async_trait;
use stagecommit_common::{CommitError, DataFileRecord, FileIo, Result, RetryBuilder, RetryConfig};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// The writer side of one task for one table.
#[async_trait]
pub trait TaskWriter: Send + Sync {
    /// Flushes outstanding output and returns every completed data file.
    /// Must be safe to call more than once.
    async fn complete(&self) -> Result<Vec<DataFileRecord>>;

    /// Deletes every file this writer created and releases its resources.
    /// Must be safe to call more than once.
    async fn discard(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct WriterState {
    open: Vec<String>,
    completed: Vec<DataFileRecord>,
    discarded: bool,
}

/// Writer that tracks the files a task creates in table storage.
///
/// The physical encoding is done elsewhere; this type only records which
/// paths were opened and which were finished with their statistics.
pub struct FileTrackingWriter {
    table: String,
    io: Arc<dyn FileIo>,
    retry: RetryConfig,
    state: Mutex<WriterState>,
}

impl FileTrackingWriter {
    pub fn new(table: impl Into<String>, io: Arc<dyn FileIo>) -> Self {
        Self {
            table: table.into(),
            io,
            retry: RetryConfig::default(),
            state: Mutex::new(WriterState::default()),
        }
    }

    /// Retry policy for deletes issued by `discard`.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn state(&self) -> Result<MutexGuard<'_, WriterState>> {
        self.state
            .lock()
            .map_err(|e| CommitError::Unexpected(format!("Lock poisoned: {}", e)))
    }

    /// Records that a file is being written at `path`.
    pub fn begin_file(&self, path: impl Into<String>) -> Result<()> {
        let mut state = self.state()?;
        if state.discarded {
            return Err(CommitError::Writer(format!(
                "writer for {} was already discarded",
                self.table
            )));
        }
        state.open.push(path.into());
        Ok(())
    }

    /// Marks a previously opened file as complete.
    pub fn finish_file(&self, record: DataFileRecord) -> Result<()> {
        let mut state = self.state()?;
        let position = state
            .open
            .iter()
            .position(|path| *path == record.file_path)
            .ok_or_else(|| {
                CommitError::Writer(format!("file {} was never opened", record.file_path))
            })?;
        state.open.swap_remove(position);
        debug!("Writer for {} closed {}", self.table, record);
        state.completed.push(record);
        Ok(())
    }

    /// Writes `contents` as one complete data file described by `record`.
    pub async fn write_file(&self, record: DataFileRecord, contents: bytes::Bytes) -> Result<()> {
        self.begin_file(record.file_path.clone())?;
        self.io.write(&record.file_path, contents).await?;
        self.finish_file(record)
    }
}

#[async_trait]
impl TaskWriter for FileTrackingWriter {
    async fn complete(&self) -> Result<Vec<DataFileRecord>> {
        let state = self.state()?;
        if state.discarded {
            return Err(CommitError::Writer(format!(
                "writer for {} was discarded",
                self.table
            )));
        }
        if !state.open.is_empty() {
            return Err(CommitError::Writer(format!(
                "writer for {} still has {} open file(s): {:?}",
                self.table,
                state.open.len(),
                state.open
            )));
        }
        Ok(state.completed.clone())
    }

    async fn discard(&self) -> Result<()> {
        let paths: Vec<String> = {
            let mut state = self.state()?;
            state.discarded = true;
            let completed = std::mem::take(&mut state.completed);
            std::mem::take(&mut state.open)
                .into_iter()
                .chain(completed.into_iter().map(|f| f.file_path))
                .collect()
        };

        let mut failed = Vec::new();
        for path in &paths {
            let deleted = RetryBuilder::new(&self.retry)
                .operation(format!("discard {}", path))
                .run(|| self.io.delete(path))
                .await;
            if let Err(e) = deleted {
                warn!("Failed to remove {} while discarding writer for {}: {}", path, self.table, e);
                failed.push(path.clone());
            }
        }

        if !failed.is_empty() {
            let count = failed.len();
            // kept so the next discard tries them again
            self.state()?.open.extend(failed);
            return Err(CommitError::Cleanup(format!(
                "{} of {} file(s) of {} could not be removed",
                count,
                paths.len(),
                self.table
            )));
        }
        debug!("Discarded {} file(s) for {}", paths.len(), self.table);
        Ok(())
    }
}
