//! # worktrail CLI (`wt`)
//!
//! A thin command-line front end over the engine: ingest git history,
//! summarize your commits, reindex a working tree, search it, and read
//! cached worklogs.
//!
//! ## Usage
//!
//! ```bash
//! wt --config ./config/worktrail.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `wt init` | Create the active profile's store |
//! | `wt ingest [path]` | Ingest new commits for the default (and selected) branches |
//! | `wt summarize [path]` | Summarize your commits that still lack a summary |
//! | `wt reindex [path]` | Re-summarize files and folders whose content changed |
//! | `wt search "<text>"` | Search files, folders or commits |
//! | `wt worklog show <group> <key>` | Build or reuse a worklog digest |
//! | `wt stats [path]` | Aggregate counts for a codebase |
//! | `wt query "<sql>"` | Raw read-only query |
//!
//! Logging goes to stderr and is controlled with `RUST_LOG` (default `info`).

use anyhow::{bail, Context};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use worktrail::config::{self, Config};
use worktrail::indexer::{self, ReindexOptions};
use worktrail::ingest::{self, EnrichOptions, IngestOptions};
use worktrail::manager::{Manager, ProfileHandle};
use worktrail::models::Codebase;
use worktrail::scm::GitCli;
use worktrail::search::{self, SearchKind};
use worktrail::stats;
use worktrail::store::codebases;
use worktrail::summarize::create_summarizer;
use worktrail::tree::WorkingTree;
use worktrail::worklog::{self, Period, WorklogOptions, WorklogScope};

/// worktrail: commit history, structure and worklogs for your codebases.
#[derive(Parser)]
#[command(name = "wt", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/worktrail.toml")]
    config: PathBuf,

    /// Profile to use instead of `active_profile`.
    #[arg(long, global = true)]
    profile: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the profile's store. Idempotent.
    Init,

    /// Ingest new commits from a git repository.
    Ingest {
        /// Repository path. Defaults to the current directory.
        path: Option<PathBuf>,

        /// Non-default branch to ingest as well. Repeatable.
        #[arg(long = "branch")]
        branches: Vec<String>,

        /// Ingest every local branch.
        #[arg(long)]
        all_branches: bool,

        /// Summarize your new commits after ingesting.
        #[arg(long)]
        summarize: bool,
    },

    /// Summarize (and embed) your commits that still lack a summary.
    Summarize {
        path: Option<PathBuf>,

        /// Maximum number of commits to process.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Re-index folders and files, summarizing only what changed.
    Reindex { path: Option<PathBuf> },

    /// Search indexed files, folders or your commits.
    Search {
        query: String,

        /// `file`, `folder` or `commit`.
        #[arg(long, default_value = "file")]
        kind: String,

        #[arg(long)]
        path: Option<PathBuf>,

        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Worklog digests and activity.
    Worklog {
        #[command(subcommand)]
        action: WorklogAction,
    },

    /// Branch maintenance.
    Branch {
        #[command(subcommand)]
        action: BranchAction,
    },

    /// List ingest cursors, or reset one.
    Cursors {
        #[arg(long)]
        path: Option<PathBuf>,

        /// Forget this branch's cursor so its history is re-read.
        #[arg(long)]
        reset: Option<String>,
    },

    /// Aggregate statistics for a codebase.
    Stats { path: Option<PathBuf> },

    /// Run a raw read-only SQL query and print rows as JSON.
    Query { sql: String },
}

#[derive(Subcommand)]
enum WorklogAction {
    /// Build (or reuse) the digest for one scope.
    ///
    /// Group is `day`, `week`, `month` or `branch`; keys look like
    /// `2024-03-01`, `2024-W09`, `2024-03`, or a branch name.
    Show {
        group_by: String,
        key: String,
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// List cached digests of one group.
    List {
        group_by: String,
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Live per-period commit counts for an inclusive date range.
    Activity {
        /// `day`, `week` or `month`.
        group_by: String,
        /// First local date (YYYY-MM-DD).
        from: String,
        /// Last local date (YYYY-MM-DD).
        to: String,
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum BranchAction {
    /// Register a branch explicitly.
    Create {
        name: String,
        #[arg(long)]
        base: Option<String>,
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Mark a branch as the codebase's default.
    Default {
        name: String,
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Regenerate a branch's summary and story from its commit summaries.
    Refresh {
        name: String,
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let manager = Manager::new(cfg);
    let profile = open_profile(&manager, cli.profile.as_deref()).await?;
    let cfg = manager.config();

    match cli.command {
        Commands::Init => {
            println!(
                "Profile '{}' ready at {}",
                profile.name(),
                profile.db_path().display()
            );
        }
        Commands::Ingest {
            path,
            branches,
            all_branches,
            summarize,
        } => {
            let repo = repo_path(path)?;
            let writer = profile.writer().await?;
            let options = IngestOptions {
                branches,
                all_branches,
                ..IngestOptions::from_config(&cfg.ingest)
            };
            let report =
                ingest::ingest_codebase(&writer, &GitCli::new(), &repo, profile.user_email(), &options)
                    .await?;

            println!("{}", report.codebase);
            for branch in &report.branches {
                println!(
                    "  {:<32} {:>6} new  {:<7} {}",
                    branch.name,
                    branch.added,
                    branch.status.as_str(),
                    short(&branch.cursor)
                );
            }
            println!(
                "{} commits added ({} yours)",
                report.commits_added, report.user_commits_added
            );

            if summarize {
                let summarizer = create_summarizer(&cfg.summarizer)?;
                let enrich = ingest::summarize_pending(
                    &writer,
                    summarizer.as_ref(),
                    report.codebase_id,
                    &EnrichOptions::from_config(&cfg.ingest),
                )
                .await?;
                println!(
                    "{} summarized, {} embedded, {} failed",
                    enrich.summarized, enrich.embedded, enrich.failed
                );
            }
            writer.close().await;
        }
        Commands::Summarize { path, limit } => {
            let writer = profile.writer().await?;
            let codebase = require_codebase(writer.pool(), path).await?;
            let summarizer = create_summarizer(&cfg.summarizer)?;
            let options = EnrichOptions {
                limit,
                ..EnrichOptions::from_config(&cfg.ingest)
            };
            let report =
                ingest::summarize_pending(&writer, summarizer.as_ref(), codebase.id, &options).await?;
            println!(
                "{} attempted: {} summarized, {} embedded, {} failed",
                report.attempted, report.summarized, report.embedded, report.failed
            );
            writer.close().await;
        }
        Commands::Reindex { path } => {
            let root = repo_path(path)?;
            let tree = WorkingTree::new(&root, &cfg.indexer.exclude_globs)?;
            let summarizer = create_summarizer(&cfg.summarizer)?;
            let writer = profile.writer().await?;
            let report = indexer::reindex(
                &writer,
                summarizer.as_ref(),
                &root,
                &tree,
                &ReindexOptions::from_config(&cfg.indexer, &cfg.ingest),
            )
            .await?;
            println!(
                "files:   {} total, {} unchanged, {} changed, {} new, {} removed, {} failed",
                report.files_total,
                report.files_unchanged,
                report.files_changed,
                report.files_new,
                report.files_removed,
                report.files_failed
            );
            println!(
                "folders: {} total, {} unchanged, {} changed, {} new, {} removed, {} failed",
                report.folders_total,
                report.folders_unchanged,
                report.folders_changed,
                report.folders_new,
                report.folders_removed,
                report.folders_failed
            );
            if report.codebase_summary_refreshed {
                println!("codebase summary refreshed");
            }
            writer.close().await;
        }
        Commands::Search {
            query,
            kind,
            path,
            limit,
        } => {
            let Some(kind) = SearchKind::parse(&kind) else {
                bail!("unknown search kind '{kind}': expected file, folder or commit");
            };
            let reader = profile.reader().await?;
            let codebase = require_codebase(reader.pool(), path).await?;
            let summarizer = create_summarizer(&cfg.summarizer)?;
            let results =
                search::search(reader.pool(), summarizer.as_ref(), codebase.id, &query, kind, limit)
                    .await?;

            if results.hits.is_empty() {
                println!("No results.");
                return Ok(());
            }
            println!("strategy: {:?}", results.strategy);
            for (i, hit) in results.hits.iter().enumerate() {
                let score = hit
                    .score
                    .map(|s| format!("{s:.3}"))
                    .unwrap_or_else(|| "-".to_string());
                println!("{}. [{}] {}  {}", i + 1, score, hit.key, hit.title);
                if let Some(snippet) = &hit.snippet {
                    println!("   {}", snippet);
                }
            }
        }
        Commands::Worklog { action } => run_worklog(&profile, cfg, action).await?,
        Commands::Branch { action } => run_branch(&profile, cfg, action).await?,
        Commands::Cursors { path, reset } => {
            if let Some(branch) = reset {
                let writer = profile.writer().await?;
                let codebase = require_codebase(writer.pool(), path).await?;
                if ingest::reset_cursor(&writer, codebase.id, &branch).await? {
                    println!("Cursor for '{branch}' reset.");
                } else {
                    println!("No cursor for '{branch}'.");
                }
                writer.close().await;
            } else {
                let reader = profile.reader().await?;
                let codebase = require_codebase(reader.pool(), path).await?;
                for cursor in ingest::list_cursors(reader.pool(), codebase.id).await? {
                    println!("{:<32} {}", cursor.branch, short(&cursor.last_commit));
                }
            }
        }
        Commands::Stats { path } => {
            let reader = profile.reader().await?;
            let codebase = require_codebase(reader.pool(), path).await?;
            let collected = stats::collect(reader.pool(), codebase.id).await?;
            stats::print(&codebase, &collected);
        }
        Commands::Query { sql } => {
            let reader = profile.reader().await?;
            let rows = reader.raw_query(&sql).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }

    Ok(())
}

async fn run_worklog(
    profile: &ProfileHandle,
    cfg: &Config,
    action: WorklogAction,
) -> anyhow::Result<()> {
    match action {
        WorklogAction::Show {
            group_by,
            key,
            path,
        } => {
            let Some(scope) = WorklogScope::parse(&group_by, &key) else {
                bail!("invalid worklog scope '{group_by} {key}'");
            };
            let writer = profile.writer().await?;
            let codebase = require_codebase(writer.pool(), path).await?;
            let summarizer = create_summarizer(&cfg.summarizer)?;
            let outcome = worklog::get_or_build(
                &writer,
                summarizer.as_ref(),
                codebase.id,
                profile.name(),
                &scope,
                &WorklogOptions::from_config(&cfg.worklog, &cfg.ingest),
            )
            .await?;
            writer.close().await;

            match outcome.entry {
                Some(entry) => {
                    println!(
                        "# {} ({} commits, +{} -{}{})",
                        scope,
                        entry.commit_count,
                        entry.additions,
                        entry.deletions,
                        if outcome.reused { ", cached" } else { "" }
                    );
                    println!();
                    println!("{}", entry.content);
                }
                None if !outcome.pending.is_empty() => {
                    println!("{scope} is pending; could not build: {}", outcome.pending.join(", "));
                }
                None => println!("No commits for {scope}."),
            }
        }
        WorklogAction::List { group_by, path } => {
            let reader = profile.reader().await?;
            let codebase = require_codebase(reader.pool(), path).await?;
            let entries =
                worklog::list_entries(reader.pool(), codebase.id, profile.name(), &group_by).await?;
            for e in entries {
                println!(
                    "{:<24} {:>4} commits  +{:<6} -{:<6} {:>4} files",
                    e.scope_key, e.commit_count, e.additions, e.deletions, e.files_changed
                );
            }
        }
        WorklogAction::Activity {
            group_by,
            from,
            to,
            path,
        } => {
            let Some(period) = Period::parse(&group_by) else {
                bail!("unknown period '{group_by}': expected day, week or month");
            };
            let from = parse_date(&from)?;
            let to = parse_date(&to)?;
            let reader = profile.reader().await?;
            let codebase = require_codebase(reader.pool(), path).await?;
            let buckets = worklog::activity(
                reader.pool(),
                codebase.id,
                period,
                from,
                to,
                cfg.worklog.utc_offset_minutes,
            )
            .await?;
            for b in buckets {
                println!(
                    "{:<12} {:>4} commits  +{:<6} -{:<6} {:>4} files",
                    b.period, b.commits, b.additions, b.deletions, b.files_changed
                );
            }
        }
    }
    Ok(())
}

async fn run_branch(profile: &ProfileHandle, cfg: &Config, action: BranchAction) -> anyhow::Result<()> {
    let writer = profile.writer().await?;
    match action {
        BranchAction::Create { name, base, path } => {
            let codebase = require_codebase(writer.pool(), path).await?;
            let branch = ingest::create_branch(&writer, codebase.id, &name, base.as_deref()).await?;
            println!("Created branch '{}' (id {}).", branch.name, branch.id);
        }
        BranchAction::Default { name, path } => {
            let codebase = require_codebase(writer.pool(), path).await?;
            ingest::set_default_branch(&writer, codebase.id, &name).await?;
            println!("'{name}' is now the default branch.");
        }
        BranchAction::Refresh { name, path } => {
            let codebase = require_codebase(writer.pool(), path).await?;
            let summarizer = create_summarizer(&cfg.summarizer)?;
            let refreshed = ingest::refresh_branch_summary(
                &writer,
                summarizer.as_ref(),
                codebase.id,
                &name,
                Duration::from_secs(cfg.ingest.call_timeout_secs),
            )
            .await?;
            match refreshed.and_then(|b| b.summary) {
                Some(summary) => println!("{summary}"),
                None => println!("Branch '{name}' has no summarized commits."),
            }
        }
    }
    writer.close().await;
    Ok(())
}

async fn open_profile(manager: &Manager, name: Option<&str>) -> anyhow::Result<Arc<ProfileHandle>> {
    match name {
        Some(name) => manager
            .for_profile(name)
            .await?
            .with_context(|| format!("profile '{name}' is not configured")),
        None => Ok(manager.active().await?),
    }
}

fn repo_path(path: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let path = match path {
        Some(path) => path,
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    path.canonicalize()
        .with_context(|| format!("{} does not exist", path.display()))
}

async fn require_codebase(pool: &sqlx::SqlitePool, path: Option<PathBuf>) -> anyhow::Result<Codebase> {
    let root = repo_path(path)?;
    let key = root.display().to_string();
    codebases::find_by_path(pool, &key)
        .await?
        .with_context(|| format!("{} has not been ingested or indexed yet", root.display()))
}

fn parse_date(s: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{s}', expected YYYY-MM-DD"))
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(10)]
}
