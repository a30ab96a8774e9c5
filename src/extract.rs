//! Content extraction at exact revisions
//!
//! Reads the file or directory tree a cross-reference points at, as of the
//! resolved commit, straight out of the mirror's object database. The source
//! repository's working tree (there is none; mirrors are bare) is never
//! consulted or modified.

use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use crate::config::SyncMode;
use crate::error::{Result, SyncError};
use crate::git;

/// Content extracted from a source repository for one entry.
#[derive(Debug, Clone)]
pub enum ExtractedContent {
    /// A single file's bytes.
    File(Vec<u8>),
    /// Relative path → bytes for every file under the source directory.
    Directory(BTreeMap<String, Vec<u8>>),
}

impl ExtractedContent {
    /// Number of files this content materializes.
    pub fn file_count(&self) -> usize {
        match self {
            ExtractedContent::File(_) => 1,
            ExtractedContent::Directory(entries) => entries.len(),
        }
    }
}

/// Extract the content at `source` as of `commit` from a mirror clone.
///
/// Fails with `PathNotFound` when nothing exists at the path, and with
/// `TypeMismatch` when the entry's declared mode disagrees with the object
/// type actually found there.
pub async fn extract(
    repo_dir: &Path,
    commit: &str,
    source: &str,
    mode: SyncMode,
) -> Result<ExtractedContent> {
    let object_type = git::object_type(repo_dir, commit, source)
        .await?
        .ok_or_else(|| SyncError::PathNotFound {
            commit: commit.to_string(),
            path: source.to_string(),
        })?;

    match (mode, object_type.as_str()) {
        (SyncMode::File, "blob") => {
            let bytes = git::cat_blob(repo_dir, commit, source).await?;
            Ok(ExtractedContent::File(bytes))
        }
        (SyncMode::Directory, "tree") => {
            let entries = extract_tree(repo_dir, commit, source).await?;
            Ok(ExtractedContent::Directory(entries))
        }
        (SyncMode::File, "tree") => Err(SyncError::TypeMismatch {
            commit: commit.to_string(),
            path: source.to_string(),
            expected: "file",
            actual: "directory",
        }),
        (SyncMode::Directory, "blob") => Err(SyncError::TypeMismatch {
            commit: commit.to_string(),
            path: source.to_string(),
            expected: "directory",
            actual: "file",
        }),
        (_, other) => Err(SyncError::TypeMismatch {
            commit: commit.to_string(),
            path: source.to_string(),
            expected: mode.as_str(),
            actual: if other == "commit" { "submodule" } else { "object" },
        }),
    }
}

/// Read every blob under `source` at `commit` into a path-sorted map.
async fn extract_tree(
    repo_dir: &Path,
    commit: &str,
    source: &str,
) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut entries = BTreeMap::new();

    for entry in git::ls_tree_recursive(repo_dir, commit, source).await? {
        if entry.object_type != "blob" {
            // Submodule (gitlink) entries have no content to materialize.
            debug!(
                "skipping non-blob entry '{}' ({}) under '{}'",
                entry.path, entry.object_type, source
            );
            continue;
        }

        let blob_path = if source.is_empty() {
            entry.path.clone()
        } else {
            format!("{source}/{}", entry.path)
        };
        let bytes = git::cat_blob(repo_dir, commit, &blob_path).await?;
        entries.insert(entry.path, bytes);
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testutil::{commit_all, init_repo};
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, String) {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        std::fs::create_dir_all(dir.path().join("lib/deep")).unwrap();
        std::fs::write(dir.path().join("lib/config.yaml"), "key: value\n").unwrap();
        std::fs::write(dir.path().join("lib/deep/notes.txt"), "notes\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "# readme\n").unwrap();
        let commit = commit_all(dir.path(), "initial");
        (dir, commit)
    }

    #[tokio::test]
    async fn test_extract_single_file() {
        let (dir, commit) = fixture();
        let content = extract(dir.path(), &commit, "lib/config.yaml", SyncMode::File)
            .await
            .unwrap();
        assert_matches!(content, ExtractedContent::File(bytes) => {
            assert_eq!(bytes, b"key: value\n");
        });
    }

    #[tokio::test]
    async fn test_extract_directory_tree() {
        let (dir, commit) = fixture();
        let content = extract(dir.path(), &commit, "lib", SyncMode::Directory)
            .await
            .unwrap();
        assert_matches!(content, ExtractedContent::Directory(entries) => {
            assert_eq!(entries.len(), 2);
            assert_eq!(entries["config.yaml"], b"key: value\n");
            assert_eq!(entries["deep/notes.txt"], b"notes\n");
        });
    }

    #[tokio::test]
    async fn test_missing_path_is_path_not_found() {
        let (dir, commit) = fixture();
        let err = extract(dir.path(), &commit, "nope.txt", SyncMode::File)
            .await
            .unwrap_err();
        assert_matches!(err, SyncError::PathNotFound { .. });
    }

    #[tokio::test]
    async fn test_mode_file_on_directory_is_type_mismatch() {
        let (dir, commit) = fixture();
        let err = extract(dir.path(), &commit, "lib", SyncMode::File)
            .await
            .unwrap_err();
        assert_matches!(err, SyncError::TypeMismatch { expected: "file", actual: "directory", .. });
    }

    #[tokio::test]
    async fn test_mode_directory_on_file_is_type_mismatch() {
        let (dir, commit) = fixture();
        let err = extract(dir.path(), &commit, "README.md", SyncMode::Directory)
            .await
            .unwrap_err();
        assert_matches!(
            err,
            SyncError::TypeMismatch { expected: "directory", actual: "file", .. }
        );
    }

    #[tokio::test]
    async fn test_extraction_reads_historic_revision() {
        let (dir, first) = fixture();
        std::fs::write(dir.path().join("lib/config.yaml"), "key: changed\n").unwrap();
        commit_all(dir.path(), "change config");

        // The old commit still serves the old bytes.
        let content = extract(dir.path(), &first, "lib/config.yaml", SyncMode::File)
            .await
            .unwrap();
        assert_matches!(content, ExtractedContent::File(bytes) => {
            assert_eq!(bytes, b"key: value\n");
        });
    }
}
