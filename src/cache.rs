//! Repository cache - mirror clones shared across entries
//!
//! Every source repository is mirror-cloned once into a private cache
//! directory and fetched at most once per run, no matter how many entries
//! reference it. Concurrent `acquire` calls for the same URL are
//! single-flight: the first caller performs the clone or fetch, everyone
//! else awaits and shares its result (including a failure result).
//!
//! This is the only component that performs network I/O.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::git;

/// Retry behavior for clone and fetch operations.
///
/// One explicit policy around the single network call site, instead of
/// scattered ad hoc retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts before the repository is reported unavailable.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each one after.
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
            initial_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// A usable local mirror of one source repository.
#[derive(Debug, Clone)]
pub struct RepoHandle {
    pub url: String,
    /// Bare mirror directory inside the cache area.
    pub dir: PathBuf,
}

type AcquireResult = std::result::Result<RepoHandle, String>;

/// Process-wide cache of acquired repositories.
pub struct RepositoryCache {
    root: PathBuf,
    retry: RetryPolicy,
    acquired: Mutex<HashMap<String, Arc<OnceCell<AcquireResult>>>>,
    fetch_count: AtomicUsize,
}

impl RepositoryCache {
    pub fn new(root: PathBuf, retry: RetryPolicy) -> Self {
        Self {
            root,
            retry,
            acquired: Mutex::new(HashMap::new()),
            fetch_count: AtomicUsize::new(0),
        }
    }

    /// Build a cache from the manifest's sync settings, defaulting to the
    /// user cache directory.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let root = match &config.cache_dir {
            Some(dir) => {
                let expanded = shellexpand::full(dir)
                    .map_err(|e| SyncError::Manifest(format!("failed to expand cache_dir: {e}")))?;
                PathBuf::from(expanded.into_owned())
            }
            None => dirs::cache_dir()
                .ok_or_else(|| SyncError::Manifest("cannot determine cache directory".to_string()))?
                .join("git-crossref")
                .join("repos"),
        };

        Ok(Self::new(root, RetryPolicy::from_config(config)))
    }

    /// Acquire a fetchable handle for `url`.
    ///
    /// Idempotent per run: the first call clones or fetches the mirror,
    /// every later or concurrent call for the same URL shares that result.
    pub async fn acquire(&self, url: &str) -> Result<RepoHandle> {
        let cell = {
            let mut acquired = self.acquired.lock().await;
            acquired
                .entry(url.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_init(|| async {
                self.fetch_count.fetch_add(1, Ordering::SeqCst);
                self.ensure_mirror_with_retry(url).await
            })
            .await;

        result
            .clone()
            .map_err(|reason| SyncError::RepositoryUnavailable {
                url: url.to_string(),
                reason,
            })
    }

    /// Number of distinct repositories cloned or fetched this run.
    pub fn fetches(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    /// Delete the whole cache area.
    pub fn clean(&self) -> Result<()> {
        if self.root.exists() {
            info!("removing repository cache at {}", self.root.display());
            std::fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }

    /// Clone the mirror if absent, fetch it otherwise, retrying per policy.
    async fn ensure_mirror_with_retry(&self, url: &str) -> AcquireResult {
        let dir = self.mirror_dir(url);
        let mut backoff = self.retry.initial_backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.retry.max_attempts {
            match self.ensure_mirror(url, &dir).await {
                Ok(()) => {
                    return Ok(RepoHandle {
                        url: url.to_string(),
                        dir,
                    });
                }
                Err(e) => {
                    last_error = match e {
                        SyncError::RepositoryUnavailable { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    if attempt < self.retry.max_attempts {
                        warn!(
                            "fetch of {} failed (attempt {}/{}): {}; retrying in {:?}",
                            url, attempt, self.retry.max_attempts, last_error, backoff
                        );
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        Err(last_error)
    }

    async fn ensure_mirror(&self, url: &str, dir: &Path) -> Result<()> {
        if dir.join("HEAD").is_file() {
            debug!("fetching cached mirror for {}", url);
            git::fetch_mirror(url, dir).await
        } else {
            if dir.exists() {
                // Leftover from an interrupted clone; start over.
                std::fs::remove_dir_all(dir)?;
            }
            if let Some(parent) = dir.parent() {
                std::fs::create_dir_all(parent)?;
            }
            debug!("mirror-cloning {} into {}", url, dir.display());
            let result = git::clone_mirror(url, dir).await;
            if result.is_err() && dir.exists() {
                let _ = std::fs::remove_dir_all(dir);
            }
            result
        }
    }

    /// Cache directory for a URL: a digest keeps it filesystem-safe and
    /// collision-free across remotes.
    fn mirror_dir(&self, url: &str) -> PathBuf {
        let digest = Sha256::digest(url.as_bytes());
        self.root.join(hex::encode(&digest[..8]))
    }
}
