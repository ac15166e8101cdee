/*
 * Configuration for the staged commit protocol.
 */

use crate::RetryConfig;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pool sizes and retry bounds shared by the task and job commit phases.
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
#[builder(setter(into), default)]
pub struct CommitConfig {
    /// Upper bound on tables processed concurrently (default: 10)
    pub table_pool_size: usize,

    /// Size of the per-job pool used for staging reads and file deletes (default: 10)
    pub file_pool_size: usize,

    /// Retry bound for staging I/O, abort deletes and directory cleanup (default: 3)
    pub max_retries: usize,

    /// Initial backoff between retries in milliseconds
    pub retry_initial_delay_ms: u64,

    /// Maximum backoff between retries in milliseconds
    pub retry_max_delay_ms: u64,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            table_pool_size: 10,
            file_pool_size: 10,
            max_retries: 3,
            retry_initial_delay_ms: 100,
            retry_max_delay_ms: 5_000,
        }
    }
}

impl CommitConfig {
    /// Parallelism for a traversal over `num_tables` tables.
    ///
    /// A result of 1 means the tables are processed strictly sequentially.
    pub fn table_parallelism(&self, num_tables: usize) -> usize {
        num_tables.min(self.table_pool_size).max(1)
    }

    /// Size of the shared file pool, never below one worker.
    pub fn file_parallelism(&self) -> usize {
        self.file_pool_size.max(1)
    }

    /// Retry policy for individual staging and cleanup operations.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(
                self.retry_max_delay_ms.max(self.retry_initial_delay_ms),
            ),
            ..Default::default()
        }
    }
}
