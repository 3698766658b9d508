//! Commit ingestion and branch ownership.
//!
//! An ingest pass runs in two phases:
//!
//! 1. **Read.** Every source-control call happens up front: branch list,
//!    merge-bases, new commits after each branch cursor, and file changes
//!    for commits this codebase has not stored yet. A failure here aborts the
//!    pass before anything is written, so cursors never move past data that
//!    was not persisted.
//! 2. **Write.** One transaction per branch, default branch first. A commit
//!    belongs to the first branch that stores it (`INSERT … ON CONFLICT DO
//!    NOTHING`) and is never re-attributed later, even after a merge.
//!
//! Commit summaries are produced separately by [`summarize_pending`], which
//! can be re-run until every current-user commit has one.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::SqliteConnection;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::IngestConfig;
use crate::db;
use crate::error::{EngineError, Result};
use crate::manager::Writer;
use crate::models::{Branch, BranchStatus, Commit, IngestCursor};
use crate::scm::{BranchRef, CommitInfo, FileDiff, SourceControl};
use crate::store::branches::BranchProgress;
use crate::store::commits::{NewCommit, NewFileChange};
use crate::store::{self, branches, codebases, commits, cursors, developers};
use crate::summarize::{with_deadline, Summarizer, SummaryKind};

const SECS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Non-default branches to ingest in addition to the default branch.
    pub branches: Vec<String>,
    /// Ingest every local branch; `branches` is ignored.
    pub all_branches: bool,
    pub stale_after_days: i64,
    pub max_diff_bytes: usize,
}

impl IngestOptions {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            branches: Vec::new(),
            all_branches: false,
            stale_after_days: config.stale_after_days,
            max_diff_bytes: config.max_diff_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BranchReport {
    pub name: String,
    pub is_default: bool,
    pub status: BranchStatus,
    /// Commits this branch took ownership of during the pass.
    pub added: usize,
    /// Cursor after the pass.
    pub cursor: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub codebase_id: i64,
    pub codebase: String,
    pub branches: Vec<BranchReport>,
    pub commits_added: usize,
    pub user_commits_added: usize,
}

/// A commit read from source control and not yet stored.
struct PlannedCommit {
    info: CommitInfo,
    changes: Vec<FileDiff>,
}

struct BranchPlan {
    branch: BranchRef,
    base_branch: Option<String>,
    cursor: Option<String>,
    /// False when the tip no longer descends from the stored cursor.
    advance_cursor: bool,
    status: BranchStatus,
    commits: Vec<PlannedCommit>,
}

impl BranchPlan {
    /// Cursor value once this plan is written.
    fn cursor_after(&self) -> &str {
        match (&self.cursor, self.advance_cursor) {
            (Some(kept), false) => kept,
            _ => &self.branch.tip,
        }
    }
}

/// Ingest new history for one repository.
///
/// Commits authored by `user_email` (compared case-insensitively) are
/// flagged as user commits and queued for summarization.
pub async fn ingest_codebase(
    writer: &Writer,
    scm: &dyn SourceControl,
    repo: &Path,
    user_email: &str,
    options: &IngestOptions,
) -> Result<IngestReport> {
    let repo = canonical(repo);
    let key = repo.display().to_string();
    let name = repo
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| key.clone());
    let user_email = user_email.trim().to_lowercase();

    let existing = codebases::find_by_path(writer.pool(), &key).await?;
    let plans = plan(writer, scm, &repo, existing.as_ref().map(|c| c.id), options).await?;

    let mut report = IngestReport {
        codebase_id: 0,
        codebase: key.clone(),
        branches: Vec::new(),
        commits_added: 0,
        user_commits_added: 0,
    };

    for plan in &plans {
        let (codebase_id, added, user_added) =
            db::with_transaction(writer.pool(), async |conn: &mut SqliteConnection| {
                write_branch(conn, &key, &name, &user_email, plan, options).await
            })
            .await?;

        tracing::info!(
            codebase = %key,
            branch = %plan.branch.name,
            added,
            status = plan.status.as_str(),
            "branch ingested"
        );

        report.codebase_id = codebase_id;
        report.commits_added += added;
        report.user_commits_added += user_added;
        report.branches.push(BranchReport {
            name: plan.branch.name.clone(),
            is_default: plan.branch.is_default,
            status: plan.status,
            added,
            cursor: plan.cursor_after().to_string(),
        });
    }

    db::with_transaction(writer.pool(), async |conn: &mut SqliteConnection| {
        developers::mark_current_user(conn, &user_email).await
    })
    .await?;

    Ok(report)
}

/// Read phase: every source-control call, no writes.
async fn plan(
    writer: &Writer,
    scm: &dyn SourceControl,
    repo: &Path,
    codebase_id: Option<i64>,
    options: &IngestOptions,
) -> Result<Vec<BranchPlan>> {
    let key = repo.display().to_string();

    let refs = scm
        .list_branches(repo)
        .await
        .map_err(|e| EngineError::scm(&key, "*", e))?;

    let default = refs
        .iter()
        .find(|b| b.is_default)
        .cloned()
        .ok_or_else(|| EngineError::scm(&key, "*", anyhow::anyhow!("no default branch")))?;

    let mut selected = vec![default.clone()];
    if options.all_branches {
        let mut others: Vec<_> = refs.iter().filter(|b| !b.is_default).cloned().collect();
        others.sort_by(|a, b| a.name.cmp(&b.name));
        selected.extend(others);
    } else {
        for wanted in &options.branches {
            if *wanted == default.name || selected.iter().any(|b| &b.name == wanted) {
                continue;
            }
            let found = refs.iter().find(|b| &b.name == wanted).cloned().ok_or_else(|| {
                EngineError::scm(&key, wanted, anyhow::anyhow!("branch not found"))
            })?;
            selected.push(found);
        }
    }

    let stored = match codebase_id {
        Some(id) => commits::stored_hashes(writer.pool(), id).await?,
        None => HashSet::new(),
    };
    let mut claimed: HashSet<String> = HashSet::new();
    let now = store::now();

    let mut plans = Vec::with_capacity(selected.len());
    for branch in selected {
        let cursor = match codebase_id {
            Some(id) => cursors::get(writer.pool(), id, &branch.name).await?,
            None => None,
        };

        // A rewound or force-pushed tip keeps its cursor until an explicit
        // reset; history is re-read from the start and deduplicated.
        let rewound = match cursor.as_deref() {
            Some(last) if last != branch.tip => !scm
                .is_ancestor(repo, last, &branch.tip)
                .await
                .map_err(|e| EngineError::scm(&key, &branch.name, e))?,
            _ => false,
        };
        if rewound {
            tracing::warn!(
                codebase = %key,
                branch = %branch.name,
                cursor = cursor.as_deref().unwrap_or_default(),
                tip = %branch.tip,
                "branch tip does not descend from its cursor; cursor kept"
            );
        }
        let resume = if rewound { None } else { cursor.clone() };

        let (base_branch, after, merged) = if branch.is_default {
            (None, resume, false)
        } else {
            let merge_base = scm
                .merge_base(repo, &default.name, &branch.name)
                .await
                .map_err(|e| EngineError::scm(&key, &branch.name, e))?;
            let merged = merge_base.as_deref() == Some(branch.tip.as_str());
            (
                Some(default.name.clone()),
                resume.or(merge_base),
                merged,
            )
        };

        let listed = if cursor.as_deref() == Some(branch.tip.as_str()) {
            Vec::new()
        } else {
            scm.list_commits(repo, &branch.name, after.as_deref())
                .await
                .map_err(|e| EngineError::scm(&key, &branch.name, e))?
        };

        let mut planned = Vec::new();
        for info in listed {
            if stored.contains(&info.hash) || !claimed.insert(info.hash.clone()) {
                continue;
            }
            let changes = scm
                .commit_changes(repo, &info.hash)
                .await
                .map_err(|e| EngineError::scm(&key, &branch.name, e))?;
            planned.push(PlannedCommit { info, changes });
        }

        let newest = match planned.iter().map(|c| c.info.committed_at).max() {
            Some(ts) => Some(ts),
            None => match codebase_id {
                Some(id) => commits::get_by_hash(writer.pool(), id, &branch.tip)
                    .await?
                    .map(|c| c.committed_at),
                None => None,
            },
        };

        let status = if branch.is_default {
            BranchStatus::Active
        } else if merged {
            BranchStatus::Merged
        } else if newest.is_some_and(|ts| now - ts > options.stale_after_days * SECS_PER_DAY) {
            BranchStatus::Stale
        } else {
            BranchStatus::Active
        };

        tracing::debug!(
            codebase = %key,
            branch = %branch.name,
            new_commits = planned.len(),
            "branch planned"
        );

        plans.push(BranchPlan {
            branch,
            base_branch,
            cursor,
            advance_cursor: !rewound,
            status,
            commits: planned,
        });
    }

    Ok(plans)
}

/// Write phase for one branch. Runs inside a transaction.
async fn write_branch(
    conn: &mut SqliteConnection,
    key: &str,
    name: &str,
    user_email: &str,
    plan: &BranchPlan,
    options: &IngestOptions,
) -> Result<(i64, usize, usize)> {
    let codebase_id = codebases::upsert(&mut *conn, key, name).await?;

    let branch_name = plan.branch.name.as_str();
    if plan.branch.is_default {
        branches::set_default(&mut *conn, codebase_id, branch_name).await?;
    }
    let branch_id = branches::ensure(&mut *conn, codebase_id, branch_name).await?;

    let mut added = 0;
    let mut user_added = 0;
    let mut first_added: Option<&str> = None;

    for planned in &plan.commits {
        let info = &planned.info;
        let is_user = info.author_email.trim().eq_ignore_ascii_case(user_email);
        developers::upsert(&mut *conn, &info.author_name, &info.author_email, is_user).await?;

        let new_commit = NewCommit {
            branch_id: Some(branch_id),
            hash: info.hash.clone(),
            author_name: info.author_name.clone(),
            author_email: info.author_email.clone(),
            message: info.message.clone(),
            committed_at: info.committed_at,
            files_changed: planned.changes.len() as i64,
            additions: planned.changes.iter().map(|c| c.additions).sum(),
            deletions: planned.changes.iter().map(|c| c.deletions).sum(),
            is_default_branch: plan.branch.is_default,
            is_user_commit: is_user,
        };

        let Some(commit_id) = commits::insert_if_absent(&mut *conn, codebase_id, &new_commit).await?
        else {
            continue;
        };

        let changes: Vec<NewFileChange> = planned
            .changes
            .iter()
            .map(|c| NewFileChange {
                path: c.path.clone(),
                change_kind: c.change_kind,
                additions: c.additions,
                deletions: c.deletions,
                diff: c.diff.as_deref().map(|d| truncate_utf8(d, options.max_diff_bytes)),
            })
            .collect();
        commits::insert_file_changes(&mut *conn, commit_id, &changes).await?;

        added += 1;
        if is_user {
            user_added += 1;
        }
        first_added.get_or_insert(info.hash.as_str());
    }

    let progress = BranchProgress {
        base_branch: plan.base_branch.as_deref(),
        first_commit: first_added,
        last_commit: Some(plan.branch.tip.as_str()),
        added_commits: added as i64,
        status: plan.status,
    };
    branches::record_progress(&mut *conn, branch_id, &progress).await?;

    if plan.advance_cursor && plan.cursor.as_deref() != Some(plan.branch.tip.as_str()) {
        cursors::set(&mut *conn, codebase_id, branch_name, &plan.branch.tip).await?;
    }

    Ok((codebase_id, added, user_added))
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Cut `text` to at most `max` bytes on a char boundary.
fn truncate_utf8(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

// ═══════════════════════════════════════════════════════════════════════
// Enrichment
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct EnrichOptions {
    pub concurrency: usize,
    pub call_timeout: Duration,
    pub limit: Option<usize>,
}

impl EnrichOptions {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            concurrency: config.summary_concurrency.max(1),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichReport {
    pub attempted: usize,
    pub summarized: usize,
    pub embedded: usize,
    pub failed: usize,
}

struct Enriched {
    summary: String,
    embedding: Option<Vec<f32>>,
}

/// Summarize (and embed, when supported) every user commit still lacking a
/// summary. Each failed or timed-out commit is marked `missing` and retried
/// on the next call; it never stops the others.
pub async fn summarize_pending(
    writer: &Writer,
    summarizer: &dyn Summarizer,
    codebase_id: i64,
    options: &EnrichOptions,
) -> Result<EnrichReport> {
    if !summarizer.supports_summaries() {
        tracing::info!(
            codebase_id,
            summarizer = summarizer.name(),
            "summarizer disabled, commits left pending"
        );
        return Ok(EnrichReport::default());
    }

    let pending = commits::list_pending_summaries(writer.pool(), codebase_id, options.limit).await?;

    let mut work = Vec::with_capacity(pending.len());
    for commit in pending {
        let context = commit_context(writer, &commit).await?;
        work.push((commit, context));
    }

    let mut report = EnrichReport {
        attempted: work.len(),
        ..Default::default()
    };

    let mut results = stream::iter(work)
        .map(|(commit, context)| async move {
            let outcome = enrich_one(summarizer, &commit, &context, options.call_timeout).await;
            (commit, outcome)
        })
        .buffer_unordered(options.concurrency.max(1));

    while let Some((commit, outcome)) = results.next().await {
        match outcome {
            Ok(enriched) => {
                db::with_transaction(writer.pool(), async |conn: &mut SqliteConnection| {
                    commits::set_summary(
                        &mut *conn,
                        commit.id,
                        &enriched.summary,
                        enriched.embedding.as_deref(),
                    )
                    .await
                })
                .await?;
                report.summarized += 1;
                if enriched.embedding.is_some() {
                    report.embedded += 1;
                }
            }
            Err(e) => {
                tracing::warn!(commit = %commit.hash, error = %e, "commit summary failed");
                commits::mark_summary_missing(writer.pool(), commit.id).await?;
                report.failed += 1;
            }
        }
    }

    tracing::info!(
        codebase_id,
        summarized = report.summarized,
        failed = report.failed,
        "enrichment pass finished"
    );
    Ok(report)
}

async fn enrich_one(
    summarizer: &dyn Summarizer,
    commit: &Commit,
    context: &str,
    call_timeout: Duration,
) -> Result<Enriched> {
    let summary = with_deadline(
        &commit.hash,
        call_timeout,
        summarizer.summarize(SummaryKind::Commit, context),
    )
    .await?;

    let embedding = if summarizer.supports_embeddings() {
        let text = format!("{}\n{}", summary, commit.message);
        with_deadline(&commit.hash, call_timeout, summarizer.embed(&text)).await?
    } else {
        None
    };

    Ok(Enriched { summary, embedding })
}

async fn commit_context(writer: &Writer, commit: &Commit) -> Result<String> {
    let changes = commits::file_changes(writer.pool(), commit.id).await?;
    let mut context = format!(
        "Commit {}\nAuthor: {}\n\n{}\n\nFiles changed: {} (+{} -{})\n",
        commit.hash,
        commit.author_name,
        commit.message,
        commit.files_changed,
        commit.additions,
        commit.deletions
    );
    for change in &changes {
        context.push_str(&format!(
            "\n{} {} (+{} -{})\n",
            change.change_kind.as_str(),
            change.path,
            change.additions,
            change.deletions
        ));
        if let Some(diff) = &change.diff {
            context.push_str(diff);
            context.push('\n');
        }
    }
    Ok(context)
}

// ═══════════════════════════════════════════════════════════════════════
// Branch and cursor maintenance
// ═══════════════════════════════════════════════════════════════════════

/// Regenerate a branch's summary and story from its commits' summaries.
///
/// Returns `Ok(None)` when the branch is unknown or owns no summarized
/// commits; nothing is called or written in that case.
pub async fn refresh_branch_summary(
    writer: &Writer,
    summarizer: &dyn Summarizer,
    codebase_id: i64,
    branch: &str,
    call_timeout: Duration,
) -> Result<Option<Branch>> {
    let Some(row) = branches::get_by_name(writer.pool(), codebase_id, branch).await? else {
        return Ok(None);
    };

    let owned = commits::list_for_branch(writer.pool(), row.id).await?;
    let lines: Vec<String> = owned
        .iter()
        .filter_map(|c| {
            c.summary
                .as_ref()
                .map(|s| format!("- {} {}", &c.hash[..c.hash.len().min(8)], s))
        })
        .collect();
    if lines.is_empty() {
        return Ok(None);
    }

    let context = format!("Branch {}\n\n{}", row.name, lines.join("\n"));
    let key = format!("branch {}", row.name);
    let summary = with_deadline(
        &key,
        call_timeout,
        summarizer.summarize(SummaryKind::Branch, &context),
    )
    .await?;
    let story = with_deadline(
        &key,
        call_timeout,
        summarizer.summarize(SummaryKind::BranchStory, &context),
    )
    .await?;

    branches::set_summary(writer.pool(), row.id, &summary, Some(&story)).await?;
    branches::get(writer.pool(), row.id).await
}

/// Explicitly register a branch. A duplicate name is a conflict.
pub async fn create_branch(
    writer: &Writer,
    codebase_id: i64,
    name: &str,
    base_branch: Option<&str>,
) -> Result<Branch> {
    db::with_transaction(writer.pool(), async |conn: &mut SqliteConnection| {
        branches::create(conn, codebase_id, name, base_branch).await
    })
    .await
}

pub async fn set_default_branch(writer: &Writer, codebase_id: i64, name: &str) -> Result<()> {
    db::with_transaction(writer.pool(), async |conn: &mut SqliteConnection| {
        branches::set_default(conn, codebase_id, name).await
    })
    .await
}

/// Forget a branch cursor so the next pass re-reads its whole history.
pub async fn reset_cursor(writer: &Writer, codebase_id: i64, branch: &str) -> Result<bool> {
    let removed = cursors::reset(writer.pool(), codebase_id, branch).await?;
    if removed {
        tracing::info!(codebase_id, branch, "cursor reset");
    }
    Ok(removed)
}

pub async fn list_cursors(pool: &sqlx::SqlitePool, codebase_id: i64) -> Result<Vec<IngestCursor>> {
    cursors::list(pool, codebase_id).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_utf8_respects_char_boundary() {
        assert_eq!(truncate_utf8("hello", 10), "hello");
        assert_eq!(truncate_utf8("hello", 3), "hel");
        // 'é' is two bytes; cutting inside it backs off
        assert_eq!(truncate_utf8("aé", 2), "a");
    }

    #[test]
    fn test_options_from_config() {
        let config = IngestConfig::default();
        let ingest = IngestOptions::from_config(&config);
        assert_eq!(ingest.stale_after_days, 30);
        assert!(!ingest.all_branches);

        let enrich = EnrichOptions::from_config(&config);
        assert_eq!(enrich.concurrency, 4);
        assert_eq!(enrich.call_timeout, Duration::from_secs(60));
    }
}
