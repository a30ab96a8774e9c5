//! Error taxonomy shared across the sync engine
//!
//! Per-entry failures (`RefResolution`, `RepositoryUnavailable`,
//! `PathNotFound`, `TypeMismatch`) are isolated by the engine and reported
//! as `error` outcomes for that entry only. `ProvenanceCorruption` aborts
//! the run before any entry is processed.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while synchronizing cross-reference entries.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A ref (branch, tag, or commit) does not exist in the source repository.
    #[error("cannot resolve ref '{reference}' in {url}: {reason}")]
    RefResolution {
        url: String,
        reference: String,
        reason: String,
    },

    /// The source repository could not be cloned or fetched.
    #[error("repository unavailable: {url}: {reason}")]
    RepositoryUnavailable { url: String, reason: String },

    /// The source path does not exist at the resolved commit.
    #[error("path '{path}' not found at commit {commit}")]
    PathNotFound { commit: String, path: String },

    /// The entry's sync mode disagrees with the object type at the source path.
    #[error("'{path}' at commit {commit} is a {actual}, but the entry is declared as {expected}")]
    TypeMismatch {
        commit: String,
        path: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// The provenance state file is unreadable or unparseable.
    #[error("provenance state file {path} is corrupt: {reason}")]
    ProvenanceCorruption { path: PathBuf, reason: String },

    /// The manifest is missing, unparseable, or fails validation.
    #[error("manifest error: {0}")]
    Manifest(String),

    /// An underlying filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_subject() {
        let err = SyncError::RefResolution {
            url: "https://example.com/repo.git".to_string(),
            reference: "v9.9".to_string(),
            reason: "unknown revision".to_string(),
        };
        assert!(err.to_string().contains("v9.9"));
        assert!(err.to_string().contains("https://example.com/repo.git"));

        let err = SyncError::TypeMismatch {
            commit: "abc123".to_string(),
            path: "lib".to_string(),
            expected: "file",
            actual: "directory",
        };
        assert!(err.to_string().contains("declared as file"));
    }

    #[test]
    fn test_io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: SyncError = io.into();
        assert!(matches!(err, SyncError::Io(_)));
    }
}
