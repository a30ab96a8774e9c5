//! Revision resolution - from symbolic refs to immutable commit ids
//!
//! Branches and tags are resolved fresh on every run, because they may have
//! moved since the last sync; that is exactly the upstream drift the engine
//! detects. A ref that already is a full commit id resolves to itself
//! without touching the repository.

use crate::cache::RepoHandle;
use crate::error::{Result, SyncError};
use crate::git;

/// A source ref pinned to the commit it pointed at during this run.
#[derive(Debug, Clone)]
pub struct ResolvedRevision {
    /// The ref as written in the manifest.
    pub reference: String,
    /// Full commit id the ref resolved to.
    pub commit: String,
}

/// Whether a ref string is already a full commit id.
pub fn is_commit_id(reference: &str) -> bool {
    reference.len() == 40 && reference.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Resolve `reference` against an acquired mirror.
///
/// Annotated tags are peeled to the commit they tag. Fails with
/// `RefResolution` when the ref names nothing in the repository.
pub async fn resolve(handle: &RepoHandle, reference: &str) -> Result<ResolvedRevision> {
    if is_commit_id(reference) {
        return Ok(ResolvedRevision {
            reference: reference.to_string(),
            commit: reference.to_lowercase(),
        });
    }

    match git::rev_parse_commit(&handle.dir, reference).await? {
        Some(commit) => Ok(ResolvedRevision {
            reference: reference.to_string(),
            commit,
        }),
        None => Err(SyncError::RefResolution {
            url: handle.url.clone(),
            reference: reference.to_string(),
            reason: "ref does not exist in the source repository".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testutil::{commit_all, init_repo, tag};
    use assert_matches::assert_matches;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn handle_for(dir: &std::path::Path) -> RepoHandle {
        RepoHandle {
            url: dir.to_string_lossy().to_string(),
            dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_is_commit_id() {
        assert!(is_commit_id("0123456789abcdef0123456789abcdef01234567"));
        assert!(!is_commit_id("main"));
        assert!(!is_commit_id("abc123")); // abbreviated ids still need the repo
        assert!(!is_commit_id("0123456789abcdef0123456789abcdef0123456g"));
    }

    #[tokio::test]
    async fn test_full_commit_id_resolves_without_repository_access() {
        // The handle points at a directory that does not exist; resolution
        // must succeed anyway.
        let handle = RepoHandle {
            url: "https://example.com/repo.git".to_string(),
            dir: PathBuf::from("/nonexistent"),
        };
        let resolved = resolve(&handle, "0123456789abcdef0123456789abcdef01234567")
            .await
            .unwrap();
        assert_eq!(resolved.commit, "0123456789abcdef0123456789abcdef01234567");
    }

    #[tokio::test]
    async fn test_branch_resolves_to_current_tip() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        let first = commit_all(dir.path(), "first");

        let resolved = resolve(&handle_for(dir.path()), "main").await.unwrap();
        assert_eq!(resolved.commit, first);

        // The branch moves; a fresh resolution follows it.
        std::fs::write(dir.path().join("a.txt"), "a2").unwrap();
        let second = commit_all(dir.path(), "second");
        let resolved = resolve(&handle_for(dir.path()), "main").await.unwrap();
        assert_eq!(resolved.commit, second);
    }

    #[tokio::test]
    async fn test_moved_tag_resolves_to_new_target() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        let first = commit_all(dir.path(), "first");
        tag(dir.path(), "v1.0");

        let resolved = resolve(&handle_for(dir.path()), "v1.0").await.unwrap();
        assert_eq!(resolved.commit, first);

        std::fs::write(dir.path().join("a.txt"), "a2").unwrap();
        let second = commit_all(dir.path(), "second");
        tag(dir.path(), "v1.0"); // force-moved

        let resolved = resolve(&handle_for(dir.path()), "v1.0").await.unwrap();
        assert_eq!(resolved.commit, second);
    }

    #[tokio::test]
    async fn test_unknown_ref_is_ref_resolution_error() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        commit_all(dir.path(), "first");

        let err = resolve(&handle_for(dir.path()), "does-not-exist")
            .await
            .unwrap_err();
        assert_matches!(err, SyncError::RefResolution { reference, .. } => {
            assert_eq!(reference, "does-not-exist");
        });
    }
}
