/*
 * Error types for the staged commit protocol.
 *
 * Errors are categorized by:
 * - Source: staging I/O, table commit, writers, cleanup
 * - Retryability: only staging I/O is retried at this layer
 * - Severity: fatal on the commit path, logged and suppressed on abort paths
 */

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CommitError {
    /// Transient failure reading, writing or listing a staging location.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The table rejected an atomic commit because of a concurrent change.
    #[error("Commit conflict: {0}")]
    Conflict(String),

    #[error("Cleanup error: {0}")]
    Cleanup(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Writer error: {0}")]
    Writer(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl CommitError {
    /// Returns true if this error is likely transient and the operation can be retried.
    /// Table conflicts are never retryable here.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CommitError::Storage(_))
    }

    /// Wraps this error with additional context, keeping its category.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        match self {
            CommitError::Storage(msg) => CommitError::Storage(format!("{}: {}", ctx, msg)),
            CommitError::Conflict(msg) => CommitError::Conflict(format!("{}: {}", ctx, msg)),
            CommitError::Cleanup(msg) => CommitError::Cleanup(format!("{}: {}", ctx, msg)),
            CommitError::Serialization(msg) => {
                CommitError::Serialization(format!("{}: {}", ctx, msg))
            }
            CommitError::Writer(msg) => CommitError::Writer(format!("{}: {}", ctx, msg)),
            CommitError::Config(msg) => CommitError::Config(format!("{}: {}", ctx, msg)),
            CommitError::Unexpected(msg) => CommitError::Unexpected(format!("{}: {}", ctx, msg)),
        }
    }
}

impl From<opendal::Error> for CommitError {
    fn from(e: opendal::Error) -> Self {
        CommitError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for CommitError {
    fn from(e: serde_json::Error) -> Self {
        CommitError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CommitError>;

/// Attaches the failing path, table or job to an error while keeping its
/// category, so retry decisions made on the result stay the same.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Like `context`, but the message is only built when the result is an error.
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_storage_is_retryable() {
        assert!(CommitError::Storage("io".into()).is_retryable());
        assert!(!CommitError::Conflict("snapshot moved".into()).is_retryable());
        assert!(!CommitError::Serialization("bad".into()).is_retryable());
        assert!(!CommitError::Cleanup("rm".into()).is_retryable());
    }

    #[test]
    fn test_context_keeps_category() {
        let err: Result<()> = Err(CommitError::Storage("timeout".into()));
        let err = err.context("reading task-3.forCommit").unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Storage error: reading task-3.forCommit: timeout"
        );
    }

    #[test]
    fn test_with_context_builds_message_only_on_error() {
        let ok: Result<u8> = Ok(1);
        let value = ok
            .with_context(|| -> String { panic!("context built for a success") })
            .unwrap();
        assert_eq!(value, 1);

        let err: Result<u8> = Err(CommitError::Conflict("snapshot moved".into()));
        let err = err.with_context(|| format!("append to table {}", "db.t")).unwrap_err();
        assert!(matches!(err, CommitError::Conflict(_)));
        assert!(!err.is_retryable());
    }
}
