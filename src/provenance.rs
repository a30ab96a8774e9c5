//! Provenance persistence - what was last synced, from where, at what revision
//!
//! This module provides persistent storage for per-destination sync records:
//! the source URL, the resolved commit, and the content fingerprint of the
//! last successful sync. The engine classifies drift by comparing current
//! fingerprints against these records.
//!
//! The store is a versioned JSON document next to the manifest, keyed by
//! destination path. Every mutation is persisted immediately via a
//! temp-file-then-rename in the same directory, so an interrupted run never
//! leaves a half-written state file and already-recorded work survives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, SyncError};

/// State file name, stored next to the manifest.
pub const STATE_FILE: &str = ".git-crossref-state.json";

/// Format version this build reads and writes.
const STATE_VERSION: u32 = 1;

/// Last-synced state of one destination path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvenanceRecord {
    /// Source repository URL.
    pub url: String,
    /// Commit identifier the destination was last synced from.
    pub commit: String,
    /// Content fingerprint recorded at that sync.
    pub fingerprint: String,
    /// When the record was last written.
    pub synced_at: DateTime<Utc>,
}

/// On-disk document shape.
#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    records: BTreeMap<String, ProvenanceRecord>,
}

/// Persistent store of provenance records, keyed by destination path.
///
/// The engine owns all writes; it serializes them behind a mutex. An
/// in-memory store (no backing file) supports tests and dry runs.
#[derive(Debug)]
pub struct ProvenanceStore {
    path: Option<PathBuf>,
    records: BTreeMap<String, ProvenanceRecord>,
}

impl ProvenanceStore {
    /// Load the store from `path`, or start empty if the file does not exist.
    ///
    /// An unreadable, unparseable, or future-versioned file is
    /// `ProvenanceCorruption`: proceeding with partial records would
    /// mis-classify drift for every destination, so the run must not start.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("no provenance state at {}, starting empty", path.display());
            return Ok(Self {
                path: Some(path.to_path_buf()),
                records: BTreeMap::new(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| SyncError::ProvenanceCorruption {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let document: StateDocument =
            serde_json::from_str(&content).map_err(|e| SyncError::ProvenanceCorruption {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        if document.version != STATE_VERSION {
            return Err(SyncError::ProvenanceCorruption {
                path: path.to_path_buf(),
                reason: format!(
                    "unsupported state version {} (this build understands {})",
                    document.version, STATE_VERSION
                ),
            });
        }

        debug!(
            "loaded {} provenance record(s) from {}",
            document.records.len(),
            path.display()
        );

        Ok(Self {
            path: Some(path.to_path_buf()),
            records: document.records,
        })
    }

    /// A store with no backing file; mutations stay in memory.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: BTreeMap::new(),
        }
    }

    /// The record for a destination, if it has ever been synced.
    pub fn get(&self, destination: &str) -> Option<&ProvenanceRecord> {
        self.records.get(destination)
    }

    /// Insert or replace the record for a destination and persist the store.
    pub fn record(&mut self, destination: &str, record: ProvenanceRecord) -> Result<()> {
        self.records.insert(destination.to_string(), record);
        self.save()
    }

    /// Number of recorded destinations.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write the full document atomically: temp file in the same directory,
    /// flushed, then renamed over the previous state.
    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let document = StateDocument {
            version: STATE_VERSION,
            records: self.records.clone(),
        };
        let content = serde_json::to_string_pretty(&document)
            .expect("state document serialization cannot fail");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let temp_name = format!(
            ".{}.{}.tmp",
            path.file_name()
                .map(|n| n.to_string_lossy())
                .unwrap_or_default(),
            std::process::id()
        );
        let temp_path = path.with_file_name(&temp_name);

        let mut temp_file = std::fs::File::create(&temp_path)?;
        temp_file.write_all(content.as_bytes())?;
        temp_file.sync_all()?;
        drop(temp_file);

        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}
