//! Manifest loading and validation
//!
//! The `.gitcrossref` manifest at the repository root declares named remotes
//! and, per remote, the files and directories to materialize locally:
//!
//! ```yaml
//! remotes:
//!   upstream:
//!     url: https://github.com/example/repo.git
//!     base_path: src
//!     version: main
//! files:
//!   upstream:
//!     - source: lib/config.yaml
//!       destination: vendor/config.yaml
//!     - source: templates/
//!       destination: project-templates/
//!       version: v1.0
//! ```
//!
//! A trailing `/` on a source selects directory mode. Validation guarantees
//! the engine's input invariants: every file group names a declared remote,
//! no two entries claim the same destination, and destinations stay inside
//! the repository root.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};

/// Manifest file name, looked up from the working directory upward.
pub const MANIFEST_FILE: &str = ".gitcrossref";

/// Top-level manifest structure.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Manifest {
    /// Named source repositories.
    pub remotes: BTreeMap<String, RemoteConfig>,

    /// File and directory mappings, grouped by remote name.
    #[serde(default)]
    pub files: BTreeMap<String, Vec<FileMapping>>,

    /// Synchronization behavior settings.
    #[serde(default)]
    pub sync: SyncConfig,
}

/// A source repository declaration.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RemoteConfig {
    /// Clone URL; environment variables are expanded on load.
    pub url: String,

    /// Prefix prepended to every source path of this remote.
    #[serde(default)]
    pub base_path: Option<String>,

    /// Default ref for entries of this remote (branch, tag, or commit).
    #[serde(default = "default_version")]
    pub version: String,
}

/// One file or directory mapping within a remote.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FileMapping {
    /// Path inside the source repository; trailing `/` selects directory mode.
    pub source: String,

    /// Path inside the local repository.
    pub destination: String,

    /// Per-entry ref override.
    #[serde(default)]
    pub version: Option<String>,

    /// Allow overwriting local edits to this destination.
    #[serde(default)]
    pub ignore_changes: bool,
}

/// Synchronization configuration.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    /// Maximum parallel entries in flight.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Whole-run timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Fetch attempts per repository before giving up.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Initial retry backoff in milliseconds; doubles per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Override for the repository cache directory.
    #[serde(default)]
    pub cache_dir: Option<String>,
}

// Default value functions
fn default_version() -> String {
    "HEAD".to_string()
}
fn default_max_parallel() -> usize {
    4
}
fn default_timeout() -> u64 {
    300
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    500
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            timeout: default_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            cache_dir: None,
        }
    }
}

/// How a cross-reference entry is extracted and fingerprinted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// A single file's bytes.
    File,
    /// A full recursive directory tree.
    Directory,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::File => "file",
            SyncMode::Directory => "directory",
        }
    }
}

/// A validated cross-reference: one source path at one revision, mapped to
/// one local destination. Immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct CrossRefEntry {
    /// Remote name in the manifest, for reporting and filtering.
    pub remote: String,
    /// Source repository URL.
    pub url: String,
    /// Ref to sync from: branch, tag, or commit id.
    pub reference: String,
    /// Path inside the source repository (base_path applied, no trailing `/`).
    pub source: String,
    /// Destination path relative to the repository root.
    pub destination: String,
    /// File or directory synchronization.
    pub mode: SyncMode,
    /// Allow overwriting local edits to this destination.
    pub ignore_changes: bool,
}

impl Manifest {
    /// Load and validate a manifest from a specific file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Manifest(format!("failed to read {}: {e}", path.display()))
        })?;

        let mut manifest: Manifest = serde_yaml::from_str(&content).map_err(|e| {
            SyncError::Manifest(format!("failed to parse {}: {e}", path.display()))
        })?;

        manifest.expand_urls()?;
        manifest.validate()?;

        Ok(manifest)
    }

    /// Locate the manifest by walking up from `start`, returning its path.
    pub fn find_from(start: &Path) -> Option<PathBuf> {
        let mut dir = Some(start);
        while let Some(current) = dir {
            let candidate = current.join(MANIFEST_FILE);
            if candidate.is_file() {
                return Some(candidate);
            }
            dir = current.parent();
        }
        None
    }

    /// Serialize the manifest back to YAML.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self)
            .map_err(|e| SyncError::Manifest(format!("failed to serialize manifest: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Expand environment variables in remote URLs.
    fn expand_urls(&mut self) -> Result<()> {
        for remote in self.remotes.values_mut() {
            remote.url = shellexpand::full(&remote.url)
                .map_err(|e| SyncError::Manifest(format!("failed to expand remote url: {e}")))?
                .into_owned();
        }
        Ok(())
    }

    /// Enforce the manifest invariants the engine relies on.
    fn validate(&self) -> Result<()> {
        let mut seen_destinations = BTreeMap::new();

        for (remote_name, mappings) in &self.files {
            if !self.remotes.contains_key(remote_name) {
                return Err(SyncError::Manifest(format!(
                    "files section references undeclared remote '{remote_name}'"
                )));
            }

            for mapping in mappings {
                if mapping.source.trim_end_matches('/').is_empty() {
                    return Err(SyncError::Manifest(format!(
                        "remote '{remote_name}' has a mapping with an empty source"
                    )));
                }

                let destination = normalize_destination(&mapping.destination)?;
                if let Some(previous) = seen_destinations.insert(destination.clone(), remote_name)
                {
                    return Err(SyncError::Manifest(format!(
                        "destination '{destination}' is claimed by both '{previous}' and '{remote_name}'"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Expand the manifest into validated cross-reference entries.
    ///
    /// `remote_filter` restricts the expansion to a single remote.
    pub fn entries(&self, remote_filter: Option<&str>) -> Result<Vec<CrossRefEntry>> {
        let mut entries = Vec::new();

        for (remote_name, mappings) in &self.files {
            if let Some(filter) = remote_filter {
                if remote_name != filter {
                    continue;
                }
            }

            // validate() guarantees the remote exists
            let remote = &self.remotes[remote_name];

            for mapping in mappings {
                let mode = if mapping.source.ends_with('/') {
                    SyncMode::Directory
                } else {
                    SyncMode::File
                };

                let source = mapping.source.trim_end_matches('/');
                let source = match remote.base_path.as_deref() {
                    Some(base) if !base.is_empty() => {
                        format!("{}/{}", base.trim_end_matches('/'), source)
                    }
                    _ => source.to_string(),
                };

                entries.push(CrossRefEntry {
                    remote: remote_name.clone(),
                    url: remote.url.clone(),
                    reference: mapping
                        .version
                        .clone()
                        .unwrap_or_else(|| remote.version.clone()),
                    source,
                    destination: normalize_destination(&mapping.destination)?,
                    mode,
                    ignore_changes: mapping.ignore_changes,
                });
            }
        }

        Ok(entries)
    }

    /// A starter manifest for `git-crossref init`.
    pub fn starter_template() -> &'static str {
        r#"# git-crossref manifest
# Declare remote repositories and the files to materialize from them.

remotes:
  upstream:
    url: https://github.com/example/repo.git
    version: main

files:
  upstream:
    - source: lib/config.yaml
      destination: vendor/config.yaml
    # A trailing slash syncs a whole directory tree:
    # - source: templates/
    #   destination: project-templates/

# sync:
#   max_parallel: 4
#   timeout: 300
"#
    }
}

/// Clean a destination path and reject anything escaping the repository root.
fn normalize_destination(destination: &str) -> Result<String> {
    let trimmed = destination.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(SyncError::Manifest("empty destination path".to_string()));
    }

    let cleaned = path_clean::clean(trimmed);
    if cleaned.is_absolute() || cleaned.starts_with("..") {
        return Err(SyncError::Manifest(format!(
            "destination '{destination}' escapes the repository root"
        )));
    }

    Ok(cleaned.to_string_lossy().replace('\\', "/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest_from(yaml: &str) -> Manifest {
        let mut manifest: Manifest = serde_yaml::from_str(yaml).expect("failed to parse YAML");
        manifest.expand_urls().unwrap();
        manifest.validate().expect("manifest should validate");
        manifest
    }

    const BASIC: &str = r#"
remotes:
  upstream:
    url: https://github.com/example/repo.git
    version: main
files:
  upstream:
    - source: lib/config.yaml
      destination: vendor/config.yaml
"#;

    #[test]
    fn test_basic_manifest_parses() {
        let manifest = manifest_from(BASIC);
        assert_eq!(manifest.remotes.len(), 1);
        assert_eq!(manifest.sync.max_parallel, 4);
        assert_eq!(manifest.sync.timeout, 300);

        let entries = manifest.entries(None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reference, "main");
        assert_eq!(entries[0].source, "lib/config.yaml");
        assert_eq!(entries[0].destination, "vendor/config.yaml");
        assert_eq!(entries[0].mode, SyncMode::File);
        assert!(!entries[0].ignore_changes);
    }

    #[test]
    fn test_trailing_slash_selects_directory_mode() {
        let manifest = manifest_from(
            r#"
remotes:
  upstream:
    url: https://github.com/example/repo.git
files:
  upstream:
    - source: templates/
      destination: project-templates/
"#,
        );
        let entries = manifest.entries(None).unwrap();
        assert_eq!(entries[0].mode, SyncMode::Directory);
        assert_eq!(entries[0].source, "templates");
        assert_eq!(entries[0].destination, "project-templates");
    }

    #[test]
    fn test_base_path_prefixes_sources() {
        let manifest = manifest_from(
            r#"
remotes:
  upstream:
    url: https://github.com/example/repo.git
    base_path: src
files:
  upstream:
    - source: file.py
      destination: dest/file.py
"#,
        );
        let entries = manifest.entries(None).unwrap();
        assert_eq!(entries[0].source, "src/file.py");
    }

    #[test]
    fn test_per_entry_version_overrides_remote_version() {
        let manifest = manifest_from(
            r#"
remotes:
  upstream:
    url: https://github.com/example/repo.git
    version: develop
files:
  upstream:
    - source: a.txt
      destination: a.txt
    - source: b.txt
      destination: b.txt
      version: v1.0
"#,
        );
        let entries = manifest.entries(None).unwrap();
        assert_eq!(entries[0].reference, "develop");
        assert_eq!(entries[1].reference, "v1.0");
    }

    #[test]
    fn test_undeclared_remote_rejected() {
        let yaml = r#"
remotes:
  origin:
    url: https://github.com/example/repo.git
files:
  nonexistent:
    - source: file.py
      destination: dest/file.py
"#;
        let mut manifest: Manifest = serde_yaml::from_str(yaml).unwrap();
        let err = manifest_validate_err(&mut manifest);
        assert!(err.contains("undeclared remote"));
    }

    #[test]
    fn test_duplicate_destination_rejected() {
        let yaml = r#"
remotes:
  origin:
    url: https://github.com/example/repo.git
files:
  origin:
    - source: file1.py
      destination: dest/file.py
    - source: file2.py
      destination: dest/file.py
"#;
        let mut manifest: Manifest = serde_yaml::from_str(yaml).unwrap();
        let err = manifest_validate_err(&mut manifest);
        assert!(err.contains("claimed by both"));
    }

    #[test]
    fn test_escaping_destination_rejected() {
        let yaml = r#"
remotes:
  origin:
    url: https://github.com/example/repo.git
files:
  origin:
    - source: file.py
      destination: ../outside.py
"#;
        let mut manifest: Manifest = serde_yaml::from_str(yaml).unwrap();
        let err = manifest_validate_err(&mut manifest);
        assert!(err.contains("escapes the repository root"));
    }

    fn manifest_validate_err(manifest: &mut Manifest) -> String {
        manifest.expand_urls().unwrap();
        manifest
            .validate()
            .expect_err("manifest should be rejected")
            .to_string()
    }

    #[test]
    fn test_remote_filter_restricts_entries() {
        let manifest = manifest_from(
            r#"
remotes:
  upstream:
    url: https://github.com/example/up.git
  tools:
    url: https://github.com/example/tools.git
files:
  upstream:
    - source: a.txt
      destination: a.txt
  tools:
    - source: b.txt
      destination: b.txt
"#,
        );
        let entries = manifest.entries(Some("tools")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].remote, "tools");
    }

    #[test]
    fn test_env_vars_expanded_in_urls() {
        std::env::set_var("TEST_CROSSREF_HOST", "github.example.com");
        let manifest = manifest_from(
            r#"
remotes:
  upstream:
    url: https://${TEST_CROSSREF_HOST}/repo.git
files: {}
"#,
        );
        assert_eq!(
            manifest.remotes["upstream"].url,
            "https://github.example.com/repo.git"
        );
        std::env::remove_var("TEST_CROSSREF_HOST");
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(MANIFEST_FILE);

        let manifest = manifest_from(BASIC);
        manifest.save(&path).expect("failed to save manifest");

        let loaded = Manifest::load(&path).expect("failed to load manifest");
        assert_eq!(loaded.remotes["upstream"].url, manifest.remotes["upstream"].url);
        assert_eq!(loaded.entries(None).unwrap().len(), 1);
    }

    #[test]
    fn test_find_from_walks_upward() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), BASIC).unwrap();
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();

        let found = Manifest::find_from(&nested).expect("manifest should be found");
        assert_eq!(found, dir.path().join(MANIFEST_FILE));
    }

    #[test]
    fn test_starter_template_is_valid() {
        let manifest: Manifest =
            serde_yaml::from_str(Manifest::starter_template()).expect("template should parse");
        manifest.validate().expect("template should validate");
    }
}
