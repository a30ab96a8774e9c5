//! Subprocess git plumbing shared by the cache, resolver, and extractor
//!
//! All repository access runs the system `git` binary through
//! `tokio::process::Command` against bare mirror clones. Nothing here ever
//! touches a working tree: clones are `--mirror`, and content is read
//! straight out of the object database with `cat-file` and `ls-tree`.

use std::path::Path;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

use crate::error::{Result, SyncError};

/// Captured result of a git invocation.
pub(crate) struct GitOutput {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl GitOutput {
    /// Stdout as trimmed UTF-8, for single-line plumbing output.
    pub fn stdout_line(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Run git with the given arguments, optionally inside a repository.
///
/// A non-zero exit is not an error here; callers inspect `success` and
/// `stderr` to produce their own typed failures.
pub(crate) async fn run_git(repo_dir: Option<&Path>, args: &[&str]) -> Result<GitOutput> {
    let mut cmd = AsyncCommand::new("git");
    cmd.args(args);
    if let Some(dir) = repo_dir {
        cmd.current_dir(dir);
    }

    debug!("running git {}", args.join(" "));

    let output = cmd.output().await?;

    Ok(GitOutput {
        success: output.status.success(),
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Mirror-clone a repository into `dest`.
///
/// A mirror clone carries every ref under `refs/*`, so later resolution and
/// extraction never need the network again within a run.
pub(crate) async fn clone_mirror(url: &str, dest: &Path) -> Result<()> {
    let dest_str = dest.to_string_lossy();
    let output = run_git(None, &["clone", "--mirror", "--quiet", url, &dest_str]).await?;

    if !output.success {
        return Err(SyncError::RepositoryUnavailable {
            url: url.to_string(),
            reason: output.stderr,
        });
    }

    Ok(())
}

/// Fetch a mirror, force-updating and pruning refs.
///
/// The mirror refspec (`+refs/*:refs/*`) makes this pick up force-moved
/// branches and re-pointed tags, which the resolver relies on.
pub(crate) async fn fetch_mirror(url: &str, repo_dir: &Path) -> Result<()> {
    let output = run_git(Some(repo_dir), &["fetch", "--prune", "--quiet", "origin"]).await?;

    if !output.success {
        return Err(SyncError::RepositoryUnavailable {
            url: url.to_string(),
            reason: output.stderr,
        });
    }

    Ok(())
}

/// Resolve a ref to a full commit id, peeling annotated tags.
///
/// Returns `None` when the ref does not name a commit in the repository.
pub(crate) async fn rev_parse_commit(repo_dir: &Path, reference: &str) -> Result<Option<String>> {
    let spec = format!("{reference}^{{commit}}");
    let output = run_git(Some(repo_dir), &["rev-parse", "--verify", "--quiet", &spec]).await?;

    if output.success {
        Ok(Some(output.stdout_line()))
    } else {
        Ok(None)
    }
}

/// Object type (`blob` or `tree`) at `<commit>:<path>`, or `None` if the
/// path does not exist at that commit.
pub(crate) async fn object_type(
    repo_dir: &Path,
    commit: &str,
    path: &str,
) -> Result<Option<String>> {
    let spec = object_spec(commit, path);
    let output = run_git(Some(repo_dir), &["cat-file", "-t", &spec]).await?;

    if output.success {
        Ok(Some(output.stdout_line()))
    } else {
        Ok(None)
    }
}

/// Raw bytes of the blob at `<commit>:<path>`.
pub(crate) async fn cat_blob(repo_dir: &Path, commit: &str, path: &str) -> Result<Vec<u8>> {
    let spec = object_spec(commit, path);
    let output = run_git(Some(repo_dir), &["cat-file", "blob", &spec]).await?;

    if !output.success {
        return Err(SyncError::PathNotFound {
            commit: commit.to_string(),
            path: path.to_string(),
        });
    }

    Ok(output.stdout)
}

/// One entry of a recursive tree listing.
#[derive(Debug)]
pub(crate) struct TreeEntry {
    pub mode: String,
    pub object_type: String,
    /// Path relative to the listed tree.
    pub path: String,
}

/// Recursively list the tree at `<commit>:<path>`.
pub(crate) async fn ls_tree_recursive(
    repo_dir: &Path,
    commit: &str,
    path: &str,
) -> Result<Vec<TreeEntry>> {
    let spec = object_spec(commit, path);
    let output = run_git(Some(repo_dir), &["ls-tree", "-r", "-z", &spec]).await?;

    if !output.success {
        return Err(SyncError::PathNotFound {
            commit: commit.to_string(),
            path: path.to_string(),
        });
    }

    let listing = String::from_utf8_lossy(&output.stdout);
    let mut entries = Vec::new();

    // Each record: "<mode> <type> <oid>\t<path>\0"
    for record in listing.split('\0').filter(|r| !r.is_empty()) {
        let (meta, entry_path) =
            record
                .split_once('\t')
                .ok_or_else(|| SyncError::RepositoryUnavailable {
                    url: repo_dir.to_string_lossy().to_string(),
                    reason: format!("unparseable ls-tree record: {record}"),
                })?;

        let mut fields = meta.split(' ');
        let mode = fields.next().unwrap_or_default().to_string();
        let object_type = fields.next().unwrap_or_default().to_string();

        entries.push(TreeEntry {
            mode,
            object_type,
            path: entry_path.to_string(),
        });
    }

    Ok(entries)
}

/// Build a `<commit>:<path>` object spec; an empty path names the root tree.
fn object_spec(commit: &str, path: &str) -> String {
    if path.is_empty() {
        commit.to_string()
    } else {
        format!("{commit}:{path}")
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::{commit_all, init_repo};
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_rev_parse_and_cat_blob() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("hello.txt"), "hello world\n").unwrap();
        let commit = commit_all(dir.path(), "initial");

        let resolved = rev_parse_commit(dir.path(), "main").await.unwrap();
        assert_eq!(resolved.as_deref(), Some(commit.as_str()));

        let bytes = cat_blob(dir.path(), &commit, "hello.txt").await.unwrap();
        assert_eq!(bytes, b"hello world\n");
    }

    #[tokio::test]
    async fn test_object_type_distinguishes_blob_and_tree() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a.txt"), "a").unwrap();
        let commit = commit_all(dir.path(), "initial");

        assert_eq!(
            object_type(dir.path(), &commit, "sub")
                .await
                .unwrap()
                .as_deref(),
            Some("tree")
        );
        assert_eq!(
            object_type(dir.path(), &commit, "sub/a.txt")
                .await
                .unwrap()
                .as_deref(),
            Some("blob")
        );
        assert_eq!(
            object_type(dir.path(), &commit, "missing").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_ls_tree_recursive_lists_nested_files() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        std::fs::create_dir_all(dir.path().join("sub/deep")).unwrap();
        std::fs::write(dir.path().join("sub/a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("sub/deep/b.txt"), "b").unwrap();
        let commit = commit_all(dir.path(), "initial");

        let entries = ls_tree_recursive(dir.path(), &commit, "sub").await.unwrap();
        let mut paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        paths.sort();
        assert_eq!(paths, vec!["a.txt", "deep/b.txt"]);
        assert!(entries.iter().all(|e| e.object_type == "blob"));
    }

    #[tokio::test]
    async fn test_missing_ref_resolves_to_none() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        commit_all(dir.path(), "initial");

        let resolved = rev_parse_commit(dir.path(), "no-such-branch").await.unwrap();
        assert_eq!(resolved, None);
    }
}
