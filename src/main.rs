use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use git_crossref::provenance::STATE_FILE;
use git_crossref::{
    Manifest, ProvenanceStore, RepositoryCache, SyncEngine, SyncPolicy, SyncStatus, SyncSummary,
};

#[derive(Parser)]
#[command(name = "git-crossref")]
#[command(about = "Sync files and directories from other git repositories at pinned revisions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Manifest path (defaults to .gitcrossref, searched upward)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync cross-referenced files from their source repositories
    Sync {
        /// Only sync these destination paths
        paths: Vec<String>,

        /// Overwrite locally modified and conflicted destinations
        #[arg(long)]
        force: bool,

        /// Show what would change without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Only sync entries of this remote
        #[arg(long)]
        remote: Option<String>,
    },

    /// Check destinations for drift without changing anything
    Check {
        /// Only check entries of this remote
        #[arg(long)]
        remote: Option<String>,
    },

    /// Create a starter .gitcrossref manifest
    Init {
        /// Also clone the declared remotes into the cache
        #[arg(long)]
        clone: bool,
    },

    /// Pre-fetch remote repositories into the cache
    Clone {
        /// Only clone this remote
        #[arg(long)]
        remote: Option<String>,
    },

    /// Remove the repository cache
    Clean,

    /// Validate the manifest
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match cli.command {
        Commands::Sync {
            ref paths,
            force,
            dry_run,
            ref remote,
        } => {
            cmd_sync(
                &cli,
                paths,
                SyncPolicy { force, dry_run },
                remote.as_deref(),
            )
            .await
        }
        Commands::Check { ref remote } => {
            cmd_sync(
                &cli,
                &[],
                SyncPolicy {
                    force: false,
                    dry_run: true,
                },
                remote.as_deref(),
            )
            .await
        }
        Commands::Init { clone } => cmd_init(&cli, clone).await,
        Commands::Clone { ref remote } => cmd_clone(&cli, remote.as_deref()).await,
        Commands::Clean => cmd_clean(&cli),
        Commands::Validate => cmd_validate(&cli),
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Locate the manifest from --config or by searching upward from the
/// working directory.
fn manifest_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = &cli.config {
        return Ok(path.clone());
    }

    let cwd = std::env::current_dir().context("failed to determine working directory")?;
    Manifest::find_from(&cwd).with_context(|| {
        format!(
            "no {} manifest found; run 'git-crossref init' to create one",
            git_crossref::config::MANIFEST_FILE
        )
    })
}

/// Load the manifest and build an engine rooted next to it.
fn build_engine(cli: &Cli) -> Result<(Manifest, SyncEngine)> {
    let path = manifest_path(cli)?;
    let manifest = Manifest::load(&path)?;

    let root = path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));

    let cache = Arc::new(RepositoryCache::from_config(&manifest.sync)?);
    let provenance = ProvenanceStore::load(&root.join(STATE_FILE))?;
    let engine = SyncEngine::new(root, cache, provenance, &manifest.sync);

    Ok((manifest, engine))
}

/// Sync (or, with a dry-run policy, check) cross-referenced files
async fn cmd_sync(
    cli: &Cli,
    paths: &[String],
    policy: SyncPolicy,
    remote_filter: Option<&str>,
) -> Result<()> {
    let (manifest, engine) = build_engine(cli)?;

    let mut entries = manifest.entries(remote_filter)?;
    if !paths.is_empty() {
        entries.retain(|e| paths.iter().any(|p| p.trim_end_matches('/') == e.destination));
        if entries.is_empty() {
            bail!("no manifest entries match the given paths");
        }
    }

    if entries.is_empty() {
        println!("Nothing to sync: the manifest declares no matching entries.");
        return Ok(());
    }

    if policy.dry_run {
        println!("🔍 Checking {} cross-reference(s)...", entries.len());
    } else {
        println!("🔄 Syncing {} cross-reference(s)...", entries.len());
        if policy.force {
            println!("⚡ Force mode enabled");
        }
    }

    let summary = engine.sync(&entries, policy).await;
    print_summary(&summary, policy.dry_run);

    if !summary.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

/// Create a starter manifest
async fn cmd_init(cli: &Cli, clone: bool) -> Result<()> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => std::env::current_dir()?.join(git_crossref::config::MANIFEST_FILE),
    };

    if path.exists() {
        println!("⚠️  Manifest already exists: {}", path.display());
        return Ok(());
    }

    std::fs::write(&path, Manifest::starter_template())
        .with_context(|| format!("failed to write {}", path.display()))?;

    println!("✅ Created {}", path.display());
    println!("   Edit this file to configure your remotes and files.");

    if clone {
        cmd_clone(cli, None).await?;
    }

    Ok(())
}

/// Pre-fetch remotes into the cache
async fn cmd_clone(cli: &Cli, remote_filter: Option<&str>) -> Result<()> {
    let path = manifest_path(cli)?;
    let manifest = Manifest::load(&path)?;
    let cache = RepositoryCache::from_config(&manifest.sync)?;

    let remotes: Vec<_> = manifest
        .remotes
        .iter()
        .filter(|(name, _)| remote_filter.map_or(true, |f| f == name.as_str()))
        .collect();

    if remotes.is_empty() {
        if let Some(filter) = remote_filter {
            bail!("remote '{filter}' not found in the manifest");
        }
        println!("Nothing to clone: the manifest declares no remotes.");
        return Ok(());
    }

    let mut failures = 0;
    for (name, remote) in remotes {
        info!("cloning remote '{}' from {}", name, remote.url);
        match cache.acquire(&remote.url).await {
            Ok(_) => println!("✅ {name}: {}", remote.url),
            Err(e) => {
                println!("❌ {name}: {e}");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Remove the repository cache
fn cmd_clean(cli: &Cli) -> Result<()> {
    let path = manifest_path(cli)?;
    let manifest = Manifest::load(&path)?;
    let cache = RepositoryCache::from_config(&manifest.sync)?;

    cache.clean()?;
    println!("✅ Repository cache removed");
    Ok(())
}

/// Validate the manifest
fn cmd_validate(cli: &Cli) -> Result<()> {
    let path = manifest_path(cli)?;
    let manifest = Manifest::load(&path)?;
    let entries = manifest.entries(None)?;

    println!("✅ Manifest is valid: {}", path.display());
    println!(
        "   {} remote(s), {} cross-reference(s)",
        manifest.remotes.len(),
        entries.len()
    );
    Ok(())
}

/// Print per-entry outcomes and the run summary.
///
/// Everything that is not plainly in sync is surfaced prominently;
/// conflicts and errors decide the exit code.
fn print_summary(summary: &SyncSummary, dry_run: bool) {
    for outcome in &summary.outcomes {
        let icon = match outcome.status {
            SyncStatus::Created | SyncStatus::Updated => {
                if outcome.applied {
                    "✅"
                } else {
                    "🔄"
                }
            }
            SyncStatus::Unchanged => "  ",
            SyncStatus::LocallyModified => {
                if outcome.applied {
                    "⚡"
                } else {
                    "⚠️ "
                }
            }
            SyncStatus::Conflict => {
                if outcome.applied {
                    "⚡"
                } else {
                    "❌"
                }
            }
            SyncStatus::Error => "❌",
        };
        println!(
            "{icon} {} [{}] {}",
            outcome.destination,
            outcome.status.as_str(),
            outcome.message
        );
    }

    println!();
    if dry_run {
        println!("📊 Check complete:");
    } else {
        println!("📊 Sync complete:");
    }
    println!("   Total: {}", summary.total);
    println!("   Applied: {}", summary.applied);
    println!("   Unchanged: {}", summary.unchanged);
    println!("   Skipped: {}", summary.skipped);
    println!("   Conflicts: {}", summary.conflicts);
    println!("   Errors: {}", summary.errors);
    println!("   Duration: {:.2}s", summary.duration.as_secs_f64());

    if summary.conflicts > 0 {
        println!("\n💡 Resolve conflicts manually or re-run with --force to take upstream content");
    }
}
