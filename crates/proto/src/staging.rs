/*
 * Staging Store
 *
 * Each task records the data files it wrote for a table in one staging
 * file at a deterministic location:
 *
 *   <table-location>/temp/<job-id>/task-<task-index>.forCommit
 *
 * File layout (big-endian):
 *
 *   magic "SCMT" | u16 format version | u32 record count |
 *   (u32 length | JSON-encoded DataFileRecord) * count
 *
 * Records are decoded independently and unknown JSON fields are ignored,
 * so newer writers can add record fields without a version bump.
 */

use bytes::{Buf, BufMut, Bytes, BytesMut};
use stagecommit_common::{CommitError, DataFileRecord, FileIo, Result, ResultExt};
use std::sync::Arc;
use tracing::debug;

use crate::identity::JobId;

pub const FOR_COMMIT_EXTENSION: &str = ".forCommit";
pub const STAGING_MAGIC: &[u8; 4] = b"SCMT";
pub const STAGING_FORMAT_VERSION: u16 = 1;

const HEADER_LEN: usize = 4 + 2 + 4;

/// Directory holding every staging file of a job for one table.
pub fn job_location(table_location: &str, job_id: &JobId) -> String {
    format!("{}/temp/{}", table_location.trim_end_matches('/'), job_id)
}

/// Staging file of one task for one table.
pub fn task_location(table_location: &str, job_id: &JobId, task_index: u32) -> String {
    format!(
        "{}/{}",
        job_location(table_location, job_id),
        task_file_name(task_index)
    )
}

pub fn task_file_name(task_index: u32) -> String {
    format!("task-{}{}", task_index, FOR_COMMIT_EXTENSION)
}

/// Extracts the task index from a staging file name.
pub fn parse_task_index(file_name: &str) -> Option<u32> {
    file_name
        .strip_prefix("task-")?
        .strip_suffix(FOR_COMMIT_EXTENSION)?
        .parse()
        .ok()
}

/// Serializes records into the staging file layout.
pub fn encode_records(files: &[DataFileRecord]) -> Result<Bytes> {
    let count = u32::try_from(files.len()).map_err(|_| {
        CommitError::Serialization(format!("too many records to stage: {}", files.len()))
    })?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + files.len() * 256);
    buf.put_slice(STAGING_MAGIC);
    buf.put_u16(STAGING_FORMAT_VERSION);
    buf.put_u32(count);

    for file in files {
        let payload = serde_json::to_vec(file)?;
        let len = u32::try_from(payload.len()).map_err(|_| {
            CommitError::Serialization(format!("record too large: {}", file.file_path))
        })?;
        buf.put_u32(len);
        buf.put_slice(&payload);
    }

    Ok(buf.freeze())
}

/// Parses the staging file layout.
pub fn decode_records(bytes: &[u8]) -> Result<Vec<DataFileRecord>> {
    let mut buf = bytes;
    if buf.remaining() < HEADER_LEN {
        return Err(CommitError::Serialization(format!(
            "staging file truncated: {} header bytes",
            buf.remaining()
        )));
    }

    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if &magic != STAGING_MAGIC {
        return Err(CommitError::Serialization(
            "not a staging file: bad magic".to_string(),
        ));
    }

    let version = buf.get_u16();
    if version == 0 || version > STAGING_FORMAT_VERSION {
        return Err(CommitError::Serialization(format!(
            "unsupported staging format version {} (max {})",
            version, STAGING_FORMAT_VERSION
        )));
    }

    let count = buf.get_u32() as usize;
    let mut files = Vec::with_capacity(count.min(4096));
    for index in 0..count {
        if buf.remaining() < 4 {
            return Err(CommitError::Serialization(format!(
                "staging file truncated before record {} of {}",
                index, count
            )));
        }
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(CommitError::Serialization(format!(
                "staging record {} truncated: {} of {} bytes",
                index,
                buf.remaining(),
                len
            )));
        }
        let (record, rest) = buf.split_at(len);
        let file: DataFileRecord = serde_json::from_slice(record)
            .map_err(CommitError::from)
            .with_context(|| format!("staging record {}", index))?;
        files.push(file);
        buf = rest;
    }

    Ok(files)
}

/// The data files one task wrote for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedCommit {
    pub job_id: JobId,
    pub task_index: u32,
    pub table: String,
    pub files: Vec<DataFileRecord>,
}

impl StagedCommit {
    pub fn new(job_id: JobId, task_index: u32, table: impl Into<String>, files: Vec<DataFileRecord>) -> Self {
        Self {
            job_id,
            task_index,
            table: table.into(),
            files,
        }
    }

    pub fn location(&self, table_location: &str) -> String {
        task_location(table_location, &self.job_id, self.task_index)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Reads and writes staging files through a table's storage handle.
#[derive(Clone)]
pub struct StagingStore {
    io: Arc<dyn FileIo>,
}

impl StagingStore {
    pub fn new(io: Arc<dyn FileIo>) -> Self {
        Self { io }
    }

    /// Durably writes a staged commit, overwriting an earlier attempt's file.
    /// Returns the staging location.
    pub async fn stage(&self, table_location: &str, commit: &StagedCommit) -> Result<String> {
        let location = commit.location(table_location);
        self.write(&location, &commit.files).await?;
        Ok(location)
    }

    pub async fn write(&self, location: &str, files: &[DataFileRecord]) -> Result<()> {
        let contents = encode_records(files)?;
        self.io.write(location, contents).await?;
        debug!("Staged {} data file(s) at {}", files.len(), location);
        Ok(())
    }

    /// Reads a staging file. A missing file is an empty contribution.
    pub async fn read(&self, location: &str) -> Result<Vec<DataFileRecord>> {
        match self.io.read(location).await? {
            Some(contents) => decode_records(&contents).with_context(|| location.to_string()),
            None => {
                debug!("No staging file at {}, treating as empty", location);
                Ok(Vec::new())
            }
        }
    }

    /// Task indices that actually staged a file under `job_location`.
    pub async fn list_task_indices(&self, job_location: &str) -> Result<Vec<u32>> {
        let names = self.io.list(job_location).await?;
        debug!(
            "Listing job location {} yielded {} entries",
            job_location,
            names.len()
        );
        let mut indices: Vec<u32> = names.iter().filter_map(|name| parse_task_index(name)).collect();
        indices.sort_unstable();
        indices.dedup();
        Ok(indices)
    }

    /// Recursively removes a job's staging directory.
    pub async fn remove_job_location(&self, job_location: &str) -> Result<()> {
        self.io.remove_dir(job_location).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagecommit_common::{FileFormat, OperatorFileIo, StorageConfig};

    fn record(path: &str) -> DataFileRecord {
        DataFileRecord::new(path, FileFormat::Parquet, 1024, 10).with_partition_value("day", "d1")
    }

    fn memory_store() -> (StagingStore, Arc<dyn FileIo>) {
        let io: Arc<dyn FileIo> =
            Arc::new(OperatorFileIo::from_config(&StorageConfig::memory()).unwrap());
        (StagingStore::new(io.clone()), io)
    }

    #[test]
    fn test_locations() {
        let job = JobId::new("job_42");
        assert_eq!(job_location("wh/db/t/", &job), "wh/db/t/temp/job_42");
        assert_eq!(
            task_location("wh/db/t", &job, 3),
            "wh/db/t/temp/job_42/task-3.forCommit"
        );
    }

    #[test]
    fn test_parse_task_index() {
        assert_eq!(parse_task_index("task-17.forCommit"), Some(17));
        assert_eq!(parse_task_index("task-x.forCommit"), None);
        assert_eq!(parse_task_index("task-3.tmp"), None);
        assert_eq!(parse_task_index("_SUCCESS"), None);
    }

    #[test]
    fn test_encode_decode() {
        let files = vec![record("a.parquet"), record("b.parquet")];
        let encoded = encode_records(&files).unwrap();

        assert_eq!(&encoded[..4], STAGING_MAGIC);
        assert_eq!(decode_records(&encoded).unwrap(), files);
    }

    #[test]
    fn test_empty_staged_commit() {
        let encoded = encode_records(&[]).unwrap();
        assert_eq!(encoded.len(), HEADER_LEN);
        assert!(decode_records(&encoded).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_record_fields_are_ignored() {
        let payload =
            br#"{"file_path":"a.parquet","file_format":"parquet","file_size_bytes":1,"record_count":1,"added_in_v2":true}"#;
        let mut buf = BytesMut::new();
        buf.put_slice(STAGING_MAGIC);
        buf.put_u16(STAGING_FORMAT_VERSION);
        buf.put_u32(1);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);

        let files = decode_records(&buf).unwrap();
        assert_eq!(files[0].file_path, "a.parquet");
    }

    #[test]
    fn test_rejects_newer_version_and_truncation() {
        let mut newer = encode_records(&[record("a")]).unwrap().to_vec();
        newer[4..6].copy_from_slice(&(STAGING_FORMAT_VERSION + 1).to_be_bytes());
        assert!(matches!(
            decode_records(&newer),
            Err(CommitError::Serialization(_))
        ));

        let full = encode_records(&[record("a")]).unwrap();
        let truncated = &full[..full.len() - 3];
        assert!(matches!(
            decode_records(truncated),
            Err(CommitError::Serialization(_))
        ));

        assert!(decode_records(b"PAR1").is_err());
    }

    #[tokio::test]
    async fn test_store_stage_and_read() {
        let (store, _) = memory_store();
        let commit = StagedCommit::new(JobId::new("job_1"), 2, "db.t", vec![record("a")]);

        let location = store.stage("wh/db/t", &commit).await.unwrap();
        assert_eq!(location, "wh/db/t/temp/job_1/task-2.forCommit");
        assert_eq!(store.read(&location).await.unwrap(), commit.files);
    }

    #[tokio::test]
    async fn test_missing_staging_file_reads_empty() {
        let (store, _) = memory_store();
        let files = store
            .read("wh/db/t/temp/job_1/task-9.forCommit")
            .await
            .unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn test_list_task_indices_skips_foreign_files() {
        let (store, io) = memory_store();
        let job = JobId::new("job_1");
        let dir = job_location("wh/db/t", &job);

        store.write(&task_location("wh/db/t", &job, 5), &[]).await.unwrap();
        store.write(&task_location("wh/db/t", &job, 1), &[record("a")]).await.unwrap();
        io.write(&format!("{}/_SUCCESS", dir), Bytes::new()).await.unwrap();

        assert_eq!(store.list_task_indices(&dir).await.unwrap(), vec![1, 5]);

        store.remove_job_location(&dir).await.unwrap();
        assert!(store.list_task_indices(&dir).await.unwrap().is_empty());
    }
}
