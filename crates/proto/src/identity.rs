/*
 * Job and task identity.
 *
 * The execution framework hands every lifecycle call a context carrying
 * the job id, the task attempt (for task-level calls), the output tables
 * and the commit configuration.
 */

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use stagecommit_common::CommitConfig;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Identifier of a write job. Used verbatim in staging paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh, time-ordered job id.
    pub fn generate() -> Self {
        Self(format!("job_{}", Uuid::now_v7().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    Map,
    Reduce,
}

/// One attempt of one task. Retried attempts share `task_index`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskAttemptId {
    pub job_id: JobId,
    pub task_type: TaskType,
    /// Stable, zero-based index of the task within the job
    pub task_index: u32,
    pub attempt: u32,
}

impl fmt::Display for TaskAttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.task_type {
            TaskType::Map => 'm',
            TaskType::Reduce => 'r',
        };
        write!(
            f,
            "attempt_{}_{}_{:06}_{}",
            self.job_id, kind, self.task_index, self.attempt
        )
    }
}

/// Final state reported to `abort_job`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Failed,
    Killed,
}

/// Job-level context shared by every lifecycle call of a job.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct JobContext {
    pub job_id: JobId,

    /// Names of the tables the job writes to
    #[builder(default)]
    pub outputs: Vec<String>,

    /// Whether the job replaces table contents instead of appending
    #[builder(default)]
    pub overwrite: bool,

    /// Configured map-side parallelism
    #[builder(default)]
    pub num_map_tasks: u32,

    /// Configured reduce-side parallelism; 0 for map-only jobs
    #[builder(default)]
    pub num_reduce_tasks: u32,

    /// Authoritative per-table count of tasks that ran, when known
    #[builder(default)]
    pub task_counts: HashMap<String, u32>,

    #[builder(default)]
    pub config: CommitConfig,
}

impl JobContextBuilder {
    fn validate(&self) -> Result<(), String> {
        match &self.job_id {
            Some(id) if id.as_str().is_empty() => Err("job id must not be empty".to_string()),
            Some(id) if id.as_str().contains('/') => {
                Err(format!("job id {} must not contain '/'", id))
            }
            _ => Ok(()),
        }
    }
}

impl JobContext {
    /// Output tables in configured order, without duplicates.
    pub fn output_tables(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.outputs
            .iter()
            .filter(|name| seen.insert(name.as_str()))
            .cloned()
            .collect()
    }

    pub fn authoritative_task_count(&self, table: &str) -> Option<u32> {
        self.task_counts.get(table).copied()
    }

    /// Upper bound on task indices that may have staged files for `table`.
    pub fn expected_task_count(&self, table: &str) -> u32 {
        let authoritative = self.authoritative_task_count(table);
        if authoritative.is_none() {
            tracing::info!(
                "Number of tasks not known for job {}, table {}; falling back to configured parallelism",
                self.job_id,
                table
            );
        }
        resolve_task_count(authoritative, self.num_reduce_tasks, self.num_map_tasks)
    }
}

/// Resolves how many task indices to scan for staged files.
///
/// The authoritative count wins when present, even if it is zero. Otherwise
/// every reducer stages a file if the job has reducers, else every mapper.
pub fn resolve_task_count(authoritative: Option<u32>, num_reduce_tasks: u32, num_map_tasks: u32) -> u32 {
    match authoritative {
        Some(count) => count,
        None if num_reduce_tasks > 0 => num_reduce_tasks,
        None => num_map_tasks,
    }
}

/// Context of one task attempt.
#[derive(Debug, Clone)]
pub struct TaskAttemptContext {
    pub attempt: TaskAttemptId,
    pub job: JobContext,
}

impl TaskAttemptContext {
    pub fn new(job: JobContext, task_type: TaskType, task_index: u32, attempt: u32) -> Self {
        Self {
            attempt: TaskAttemptId {
                job_id: job.job_id.clone(),
                task_type,
                task_index,
                attempt,
            },
            job,
        }
    }

    pub fn task_index(&self) -> u32 {
        self.attempt.task_index
    }

    /// Only the last phase of a job stages output: reduce tasks, or the map
    /// tasks of a map-only job.
    pub fn needs_task_commit(&self) -> bool {
        self.attempt.task_type == TaskType::Reduce || self.job.num_reduce_tasks == 0
    }
}
