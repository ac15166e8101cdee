/*
 * Storage abstraction using opendal.
 *
 * Staging files, data files and staging directories are all accessed
 * through the `FileIo` handle a table exposes. `OperatorFileIo` is the
 * opendal-backed implementation for local, in-memory and S3 storage.
 */

use crate::{CommitError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use opendal::{ErrorKind, Operator};
use std::collections::HashMap;

/// Storage I/O handle used to create, read, list and delete files by path.
#[async_trait]
pub trait FileIo: Send + Sync {
    /// Reads a whole file. Returns `None` if the file does not exist.
    async fn read(&self, path: &str) -> Result<Option<Bytes>>;

    /// Creates or overwrites a file.
    async fn write(&self, path: &str, contents: Bytes) -> Result<()>;

    /// Deletes a file. Deleting an absent file succeeds.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Lists the names of the files directly under `dir`.
    /// An absent directory lists as empty; sub-directories are skipped.
    async fn list(&self, dir: &str) -> Result<Vec<String>>;

    /// Recursively removes a directory and everything under it.
    async fn remove_dir(&self, dir: &str) -> Result<()>;
}

/// Storage backend type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Local,
    Memory,
    S3,
}

/// Configuration for building a storage operator.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// The storage backend type
    pub backend: StorageBackend,
    /// Root path (bucket name or local path)
    pub root: String,
    /// Endpoint override (for S3-compatible services)
    pub endpoint: Option<String>,
    /// Region (for S3)
    pub region: Option<String>,
    /// Credentials and other backend options
    pub options: HashMap<String, String>,
}

impl StorageConfig {
    fn new(backend: StorageBackend, root: String) -> Self {
        Self {
            backend,
            root,
            endpoint: None,
            region: None,
            options: HashMap::new(),
        }
    }

    /// Creates a local filesystem storage config.
    pub fn local(root: impl Into<String>) -> Self {
        Self::new(StorageBackend::Local, root.into())
    }

    /// Creates an in-process memory storage config.
    pub fn memory() -> Self {
        Self::new(StorageBackend::Memory, "/".to_string())
    }

    /// Creates an S3 storage config.
    pub fn s3(bucket: impl Into<String>) -> Self {
        Self::new(StorageBackend::S3, bucket.into())
    }

    /// Sets the endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Adds a configuration option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Sets AWS credentials.
    pub fn with_aws_credentials(
        self,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        self.with_option("access_key_id", access_key_id)
            .with_option("secret_access_key", secret_access_key)
    }
}

/// Builds an opendal Operator from storage configuration.
pub fn build_operator(config: &StorageConfig) -> Result<Operator> {
    match config.backend {
        StorageBackend::Local => {
            let builder = opendal::services::Fs::default().root(&config.root);
            Operator::new(builder)
                .map(|op| op.finish())
                .map_err(|e| CommitError::Config(format!("Failed to build local operator: {}", e)))
        }
        StorageBackend::Memory => Operator::new(opendal::services::Memory::default())
            .map(|op| op.finish())
            .map_err(|e| CommitError::Config(format!("Failed to build memory operator: {}", e))),
        StorageBackend::S3 => build_s3_operator(config),
    }
}

fn build_s3_operator(config: &StorageConfig) -> Result<Operator> {
    let mut builder = opendal::services::S3::default().bucket(&config.root);

    if let Some(endpoint) = &config.endpoint {
        builder = builder.endpoint(endpoint);
    }
    if let Some(region) = &config.region {
        builder = builder.region(region);
    }
    if let Some(access_key) = config.options.get("access_key_id") {
        builder = builder.access_key_id(access_key);
    }
    if let Some(secret_key) = config.options.get("secret_access_key") {
        builder = builder.secret_access_key(secret_key);
    }

    Operator::new(builder)
        .map(|op| op.finish())
        .map_err(|e| CommitError::Config(format!("Failed to build S3 operator: {}", e)))
}

/// `FileIo` over an opendal operator. Paths are relative to the operator root.
#[derive(Debug, Clone)]
pub struct OperatorFileIo {
    operator: Operator,
}

impl OperatorFileIo {
    pub fn new(operator: Operator) -> Self {
        Self { operator }
    }

    /// Builds the operator from configuration and wraps it.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        build_operator(config).map(Self::new)
    }
}

fn dir_path(dir: &str) -> String {
    if dir.ends_with('/') {
        dir.to_string()
    } else {
        format!("{}/", dir)
    }
}

#[async_trait]
impl FileIo for OperatorFileIo {
    async fn read(&self, path: &str) -> Result<Option<Bytes>> {
        match self.operator.read(path).await {
            Ok(buffer) => Ok(Some(buffer.to_bytes())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CommitError::Storage(format!("read {}: {}", path, e))),
        }
    }

    async fn write(&self, path: &str, contents: Bytes) -> Result<()> {
        self.operator
            .write(path, contents)
            .await
            .map_err(|e| CommitError::Storage(format!("write {}: {}", path, e)))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match self.operator.delete(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CommitError::Storage(format!("delete {}: {}", path, e))),
        }
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let dir = dir_path(dir);
        let entries = match self.operator.list(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CommitError::Storage(format!("list {}: {}", dir, e))),
        };

        Ok(entries
            .iter()
            .map(|entry| entry.name())
            .filter(|name| !name.is_empty() && !name.ends_with('/'))
            .map(str::to_string)
            .collect())
    }

    async fn remove_dir(&self, dir: &str) -> Result<()> {
        let dir = dir_path(dir);
        self.operator
            .remove_all(&dir)
            .await
            .map_err(|e| CommitError::Storage(format!("remove {}: {}", dir, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s3_config_with_credentials() {
        let config = StorageConfig::s3("warehouse")
            .with_endpoint("http://localhost:9000")
            .with_region("us-west-2")
            .with_aws_credentials("AKID", "SECRET");

        assert_eq!(config.backend, StorageBackend::S3);
        assert_eq!(config.root, "warehouse");
        assert_eq!(config.endpoint.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.region, Some("us-west-2".to_string()));
        assert_eq!(config.options.get("access_key_id"), Some(&"AKID".to_string()));
    }

    #[tokio::test]
    async fn test_local_io_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let io = OperatorFileIo::from_config(&StorageConfig::local(
            dir.path().to_string_lossy().to_string(),
        ))
        .unwrap();

        io.write("db/t/temp/job_1/task-0.forCommit", Bytes::from_static(b"abc"))
            .await
            .unwrap();
        io.write("db/t/temp/job_1/task-1.forCommit", Bytes::from_static(b"def"))
            .await
            .unwrap();

        let contents = io.read("db/t/temp/job_1/task-1.forCommit").await.unwrap();
        assert_eq!(contents, Some(Bytes::from_static(b"def")));

        let mut names = io.list("db/t/temp/job_1").await.unwrap();
        names.sort();
        assert_eq!(names, vec!["task-0.forCommit", "task-1.forCommit"]);

        io.remove_dir("db/t/temp/job_1").await.unwrap();
        assert!(io.list("db/t/temp/job_1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_absent_paths_are_not_errors() {
        let io = OperatorFileIo::from_config(&StorageConfig::memory()).unwrap();

        assert_eq!(io.read("missing/file").await.unwrap(), None);
        io.delete("missing/file").await.unwrap();
        assert!(io.list("missing").await.unwrap().is_empty());
    }
}
