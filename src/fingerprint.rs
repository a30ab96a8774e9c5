//! Content fingerprints and drift classification
//!
//! Fingerprints use the canonical `sha256:<hex>` format. A directory
//! fingerprint digests its entries in sorted relative-path order, so it is
//! stable regardless of how the tree was enumerated. A missing destination
//! has no fingerprint and compares unequal to everything.
//!
//! `classify` is the drift-detection policy for the whole tool: it decides,
//! from the extracted fingerprint, the on-disk fingerprint, and the
//! last-synced fingerprint, whether a destination is safe to overwrite.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::Result;
use crate::extract::ExtractedContent;

/// Prefix for all fingerprints produced by this module.
const PREFIX: &str = "sha256:";

/// Fingerprint a single file's bytes.
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{}{:x}", PREFIX, hasher.finalize())
}

/// Fingerprint a directory tree from its (relative path, bytes) entries.
///
/// Entries are digested in sorted path order: path, NUL, per-file digest,
/// newline. Two trees with the same contents always fingerprint identically.
pub fn fingerprint_tree(entries: &BTreeMap<String, Vec<u8>>) -> String {
    let mut hasher = Sha256::new();
    for (path, bytes) in entries {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(fingerprint_bytes(bytes).as_bytes());
        hasher.update(b"\n");
    }
    format!("{}{:x}", PREFIX, hasher.finalize())
}

/// Fingerprint extracted source content.
pub fn fingerprint_extracted(content: &ExtractedContent) -> String {
    match content {
        ExtractedContent::File(bytes) => fingerprint_bytes(bytes),
        ExtractedContent::Directory(entries) => fingerprint_tree(entries),
    }
}

/// Fingerprint whatever currently exists at `path`.
///
/// Returns `None` when nothing exists there. The on-disk shape is taken as
/// found: a directory where a file is expected still fingerprints as a
/// tree, so shape drift surfaces through the classification table like any
/// other local edit.
pub fn fingerprint_on_disk(path: &Path) -> Result<Option<String>> {
    if path.is_file() {
        let bytes = std::fs::read(path)?;
        return Ok(Some(fingerprint_bytes(&bytes)));
    }

    if path.is_dir() {
        let mut entries = BTreeMap::new();
        collect_tree(path, path, &mut entries)?;
        return Ok(Some(fingerprint_tree(&entries)));
    }

    Ok(None)
}

/// Recursively collect (relative path, bytes) pairs under `root`.
fn collect_tree(
    root: &Path,
    dir: &Path,
    entries: &mut BTreeMap<String, Vec<u8>>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_tree(root, &path, entries)?;
        } else if path.is_file() {
            let relative = path
                .strip_prefix(root)
                .expect("walked path is under root")
                .to_string_lossy()
                .replace('\\', "/");
            entries.insert(relative, std::fs::read(&path)?);
        }
    }
    Ok(())
}

/// Drift state of one destination, derived purely from fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// First sync: no provenance record exists for this destination.
    Created,
    /// Destination already matches the upstream content.
    Unchanged,
    /// Upstream changed; destination untouched since the last sync.
    Updated,
    /// Destination edited locally; upstream unchanged since the last sync.
    LocallyModified,
    /// Both sides changed independently and disagree.
    Conflict,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Created => "created",
            Classification::Unchanged => "unchanged",
            Classification::Updated => "updated",
            Classification::LocallyModified => "locally-modified",
            Classification::Conflict => "conflict",
        }
    }
}

/// The authoritative drift-detection table.
///
/// `extracted` is the fingerprint of the content at the resolved source
/// revision, `on_disk` the current destination fingerprint (`None` when the
/// destination does not exist), `provenance` the last-synced fingerprint
/// (`None` when this destination has never been synced).
pub fn classify(
    extracted: &str,
    on_disk: Option<&str>,
    provenance: Option<&str>,
) -> Classification {
    let Some(last_synced) = provenance else {
        return Classification::Created;
    };

    let disk_unchanged = on_disk == Some(last_synced);
    let upstream_unchanged = extracted == last_synced;

    match (disk_unchanged, upstream_unchanged) {
        (true, true) => Classification::Unchanged,
        (true, false) => Classification::Updated,
        (false, true) => Classification::LocallyModified,
        (false, false) => {
            if on_disk == Some(extracted) {
                // Destination was brought up to date out of band.
                Classification::Unchanged
            } else {
                Classification::Conflict
            }
        }
    }
}
