//! Sync engine - orchestrates parallel cross-reference synchronization
//!
//! For each entry the engine resolves the source ref, extracts the content
//! at that commit, fingerprints both sides, classifies the drift, and
//! applies the outcome under the run policy. Entries are independent units
//! of work: they run concurrently under a semaphore, and a failure on one
//! never aborts the others.

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::cache::RepositoryCache;
use crate::config::{CrossRefEntry, SyncConfig, SyncMode};
use crate::error::Result;
use crate::extract::{self, ExtractedContent};
use crate::fingerprint::{self, Classification};
use crate::provenance::{ProvenanceRecord, ProvenanceStore};
use crate::revision::{self, ResolvedRevision};

/// Run-level application policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncPolicy {
    /// Overwrite locally modified and conflicted destinations.
    pub force: bool,
    /// Classify only: no destination writes, no provenance updates.
    pub dry_run: bool,
}

/// Final state of one entry in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Created,
    Unchanged,
    Updated,
    LocallyModified,
    Conflict,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Created => "created",
            SyncStatus::Unchanged => "unchanged",
            SyncStatus::Updated => "updated",
            SyncStatus::LocallyModified => "locally-modified",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Error => "error",
        }
    }
}

impl From<Classification> for SyncStatus {
    fn from(classification: Classification) -> Self {
        match classification {
            Classification::Created => SyncStatus::Created,
            Classification::Unchanged => SyncStatus::Unchanged,
            Classification::Updated => SyncStatus::Updated,
            Classification::LocallyModified => SyncStatus::LocallyModified,
            Classification::Conflict => SyncStatus::Conflict,
        }
    }
}

/// Per-entry, per-run result.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub destination: String,
    pub status: SyncStatus,
    /// Whether the destination was written this run.
    pub applied: bool,
    pub message: String,
}

/// Results from a complete sync run.
#[derive(Debug, Clone)]
pub struct SyncSummary {
    pub total: usize,
    pub applied: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub errors: usize,
    pub duration: Duration,
    pub outcomes: Vec<SyncOutcome>,
}

impl SyncSummary {
    /// A run succeeds when no entry errored or was left in conflict.
    pub fn is_success(&self) -> bool {
        self.errors == 0 && self.conflicts == 0
    }
}

/// The main engine, generic over where its state lives: the cache and the
/// provenance store are injected, so tests run against temp dirs and
/// in-memory stores.
pub struct SyncEngine {
    /// Repository root destinations are materialized under.
    root: PathBuf,
    cache: Arc<RepositoryCache>,
    provenance: Arc<Mutex<ProvenanceStore>>,
    max_parallel: usize,
    run_timeout: Duration,
}

impl SyncEngine {
    pub fn new(
        root: PathBuf,
        cache: Arc<RepositoryCache>,
        provenance: ProvenanceStore,
        config: &SyncConfig,
    ) -> Self {
        Self {
            root,
            cache,
            provenance: Arc::new(Mutex::new(provenance)),
            max_parallel: config.max_parallel.max(1),
            run_timeout: Duration::from_secs(config.timeout),
        }
    }

    /// Synchronize all entries under `policy` and aggregate the outcomes.
    pub async fn sync(&self, entries: &[CrossRefEntry], policy: SyncPolicy) -> SyncSummary {
        let start_time = Instant::now();

        info!(
            "syncing {} entr{} (max_parallel={}, force={}, dry_run={})",
            entries.len(),
            if entries.len() == 1 { "y" } else { "ies" },
            self.max_parallel,
            policy.force,
            policy.dry_run
        );

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut futures = FuturesUnordered::new();

        for entry in entries {
            let semaphore = semaphore.clone();
            let entry = entry.clone();
            futures.push(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                self.sync_entry(entry, policy).await
            });
        }

        let mut outcomes: Vec<SyncOutcome> = Vec::with_capacity(entries.len());
        let mut completed: HashSet<String> = HashSet::new();

        let collect = async {
            while let Some(outcome) = futures.next().await {
                debug!(
                    "{}: {} (applied={})",
                    outcome.destination,
                    outcome.status.as_str(),
                    outcome.applied
                );
                completed.insert(outcome.destination.clone());
                outcomes.push(outcome);
            }
        };

        if self.run_timeout.is_zero() {
            collect.await;
        } else if tokio::time::timeout(self.run_timeout, collect).await.is_err() {
            warn!(
                "run timed out after {}s; unfinished entries reported as unavailable",
                self.run_timeout.as_secs()
            );
            // Entries cancelled mid-flight fail transiently; work already
            // applied (and its provenance) is kept.
            for entry in entries {
                if !completed.contains(&entry.destination) {
                    outcomes.push(SyncOutcome {
                        destination: entry.destination.clone(),
                        status: SyncStatus::Error,
                        applied: false,
                        message: format!(
                            "run timed out after {}s; {} treated as temporarily unavailable",
                            self.run_timeout.as_secs(),
                            entry.url
                        ),
                    });
                }
            }
        }

        outcomes.sort_by(|a, b| a.destination.cmp(&b.destination));

        let summary = compile_summary(outcomes, start_time.elapsed());
        info!(
            "sync completed in {:.2}s: {} applied, {} unchanged, {} skipped, {} conflicts, {} errors",
            summary.duration.as_secs_f64(),
            summary.applied,
            summary.unchanged,
            summary.skipped,
            summary.conflicts,
            summary.errors
        );
        summary
    }

    /// Process one entry, converting failures into `error` outcomes so they
    /// never disturb sibling entries.
    async fn sync_entry(&self, entry: CrossRefEntry, policy: SyncPolicy) -> SyncOutcome {
        match self.process_entry(&entry, policy).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("{}: {}", entry.destination, e);
                SyncOutcome {
                    destination: entry.destination,
                    status: SyncStatus::Error,
                    applied: false,
                    message: e.to_string(),
                }
            }
        }
    }

    async fn process_entry(
        &self,
        entry: &CrossRefEntry,
        policy: SyncPolicy,
    ) -> Result<SyncOutcome> {
        let handle = self.cache.acquire(&entry.url).await?;
        let revision = revision::resolve(&handle, &entry.reference).await?;
        let content =
            extract::extract(&handle.dir, &revision.commit, &entry.source, entry.mode).await?;

        let extracted_fp = fingerprint::fingerprint_extracted(&content);
        let destination = self.root.join(&entry.destination);
        let on_disk_fp = fingerprint::fingerprint_on_disk(&destination)?;

        let recorded = {
            let store = self.provenance.lock().await;
            store.get(&entry.destination).cloned()
        };

        let classification = fingerprint::classify(
            &extracted_fp,
            on_disk_fp.as_deref(),
            recorded.as_ref().map(|r| r.fingerprint.as_str()),
        );

        if policy.dry_run {
            return Ok(self.dry_run_outcome(entry, classification));
        }

        match classification {
            Classification::Created | Classification::Updated => {
                self.apply(entry, &content, &destination)?;
                self.record(entry, &revision, extracted_fp).await?;
                Ok(SyncOutcome {
                    destination: entry.destination.clone(),
                    status: classification.into(),
                    applied: true,
                    message: format!(
                        "synced {} file(s) from {} @ {}",
                        content.file_count(),
                        entry.reference,
                        short(&revision.commit)
                    ),
                })
            }

            Classification::Unchanged => {
                // No write, but the recorded commit still advances so future
                // runs diff against the latest known-good revision. Covers
                // both a moved ref with identical content and a destination
                // brought up to date out of band.
                let stale = recorded.as_ref().map_or(true, |r| {
                    r.commit != revision.commit || r.fingerprint != extracted_fp
                });
                if stale {
                    self.record(entry, &revision, extracted_fp).await?;
                }
                Ok(SyncOutcome {
                    destination: entry.destination.clone(),
                    status: SyncStatus::Unchanged,
                    applied: false,
                    message: format!("up to date with {} @ {}", entry.reference, short(&revision.commit)),
                })
            }

            Classification::LocallyModified => {
                if policy.force || entry.ignore_changes {
                    self.apply(entry, &content, &destination)?;
                    self.record(entry, &revision, extracted_fp).await?;
                    Ok(SyncOutcome {
                        destination: entry.destination.clone(),
                        status: SyncStatus::LocallyModified,
                        applied: true,
                        message: if policy.force {
                            "local modifications overwritten (--force)".to_string()
                        } else {
                            "local modifications overwritten (ignore_changes)".to_string()
                        },
                    })
                } else {
                    Ok(SyncOutcome {
                        destination: entry.destination.clone(),
                        status: SyncStatus::LocallyModified,
                        applied: false,
                        message: "destination has local modifications; re-run with --force to overwrite"
                            .to_string(),
                    })
                }
            }

            Classification::Conflict => {
                // Both sides changed independently. Only the explicit --force
                // policy resolves this; nothing else may apply it.
                if policy.force {
                    self.apply(entry, &content, &destination)?;
                    self.record(entry, &revision, extracted_fp).await?;
                    Ok(SyncOutcome {
                        destination: entry.destination.clone(),
                        status: SyncStatus::Conflict,
                        applied: true,
                        message: "conflicting changes overwritten with upstream content (--force)"
                            .to_string(),
                    })
                } else {
                    Ok(SyncOutcome {
                        destination: entry.destination.clone(),
                        status: SyncStatus::Conflict,
                        applied: false,
                        message:
                            "both local and upstream changed; reconcile manually or re-run with --force"
                                .to_string(),
                    })
                }
            }
        }
    }

    fn dry_run_outcome(&self, entry: &CrossRefEntry, classification: Classification) -> SyncOutcome {
        let message = match classification {
            Classification::Created => "would create destination",
            Classification::Updated => "would update destination from upstream",
            Classification::Unchanged => "up to date",
            Classification::LocallyModified => "destination has local modifications",
            Classification::Conflict => "both local and upstream changed",
        };
        SyncOutcome {
            destination: entry.destination.clone(),
            status: classification.into(),
            applied: false,
            message: message.to_string(),
        }
    }

    /// Materialize extracted content at the destination.
    fn apply(
        &self,
        entry: &CrossRefEntry,
        content: &ExtractedContent,
        destination: &Path,
    ) -> Result<()> {
        match (entry.mode, content) {
            (SyncMode::File, ExtractedContent::File(bytes)) => {
                if destination.is_dir() {
                    std::fs::remove_dir_all(destination)?;
                }
                write_file_atomic(destination, bytes)?;
            }
            (SyncMode::Directory, ExtractedContent::Directory(entries)) => {
                if destination.is_file() {
                    std::fs::remove_file(destination)?;
                }
                for (relative, bytes) in entries {
                    write_file_atomic(&destination.join(relative), bytes)?;
                }
                prune_stale_files(destination, entries.keys())?;
            }
            // extract() returns content matching the entry's mode.
            _ => unreachable!("extracted content shape does not match sync mode"),
        }
        Ok(())
    }

    async fn record(
        &self,
        entry: &CrossRefEntry,
        revision: &ResolvedRevision,
        fingerprint: String,
    ) -> Result<()> {
        let mut store = self.provenance.lock().await;
        store.record(
            &entry.destination,
            ProvenanceRecord {
                url: entry.url.clone(),
                commit: revision.commit.clone(),
                fingerprint,
                synced_at: chrono::Utc::now(),
            },
        )
    }
}

/// Compile per-entry outcomes into a run summary.
fn compile_summary(outcomes: Vec<SyncOutcome>, duration: Duration) -> SyncSummary {
    let mut summary = SyncSummary {
        total: outcomes.len(),
        applied: 0,
        unchanged: 0,
        skipped: 0,
        conflicts: 0,
        errors: 0,
        duration,
        outcomes: Vec::new(),
    };

    for outcome in &outcomes {
        match outcome.status {
            SyncStatus::Error => summary.errors += 1,
            SyncStatus::Conflict if !outcome.applied => summary.conflicts += 1,
            SyncStatus::Unchanged => summary.unchanged += 1,
            SyncStatus::LocallyModified if !outcome.applied => summary.skipped += 1,
            _ if outcome.applied => summary.applied += 1,
            _ => summary.skipped += 1,
        }
    }

    summary.outcomes = outcomes;
    summary
}

/// First 12 characters of a commit id, for messages.
fn short(commit: &str) -> &str {
    &commit[..commit.len().min(12)]
}

/// Write one file via a temp file in the same directory, then rename.
fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;

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
    temp_file.write_all(bytes)?;
    temp_file.sync_all()?;
    drop(temp_file);

    std::fs::rename(&temp_path, path)?;
    Ok(())
}

/// Delete files under `root` that are not in the extracted tree, then drop
/// directories the deletions emptied.
fn prune_stale_files<'a>(
    root: &Path,
    keep: impl Iterator<Item = &'a String>,
) -> Result<()> {
    let keep: HashSet<PathBuf> = keep.map(|rel| root.join(rel)).collect();

    fn walk(dir: &Path, keep: &HashSet<PathBuf>) -> Result<bool> {
        let mut emptied = true;
        for dir_entry in std::fs::read_dir(dir)? {
            let path = dir_entry?.path();
            if path.is_dir() {
                if walk(&path, keep)? {
                    std::fs::remove_dir(&path)?;
                } else {
                    emptied = false;
                }
            } else if keep.contains(&path) {
                emptied = false;
            } else {
                debug!("removing stale file {}", path.display());
                std::fs::remove_file(&path)?;
            }
        }
        Ok(emptied)
    }

    if root.is_dir() {
        walk(root, &keep)?;
    }
    Ok(())
}
