//! Worklog aggregation cache.
//!
//! A worklog entry is a digest of the current user's commits for one scope:
//! a day, an ISO week, a month, or a branch. Each stored entry carries the
//! fingerprint of the commit set it was built from (SHA-256 over the sorted,
//! newline-joined hashes). When the live commit set still has that
//! fingerprint the entry is returned as-is and the summarizer is not called.
//!
//! Digests compose bottom-up:
//!
//! ```text
//! day ──▶ week (days that have commits) ──▶ month (ISO weeks inside it,
//!                                            in-month days of boundary weeks)
//! branch ──▶ its own commits
//! ```
//!
//! Children are resolved first, each through the same cache. If a child
//! digest cannot be produced the parent is left alone and the failed scopes
//! are reported as pending.

use chrono::{DateTime, Datelike, Months, NaiveDate, TimeDelta, Weekday};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use crate::config::{IngestConfig, WorklogConfig};
use crate::error::{EngineError, Result};
use crate::indexer::sha256_hex;
use crate::manager::Writer;
use crate::models::{Commit, WorklogEntry};
use crate::store::worklogs::{self, NewWorklog, WorklogSummary};
use crate::store::{branches, commits};
use crate::summarize::{with_deadline, Summarizer, SummaryKind};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorklogScope {
    Day(NaiveDate),
    /// ISO week-numbering year and week.
    Week { year: i32, week: u32 },
    Month { year: i32, month: u32 },
    Branch(String),
}

impl WorklogScope {
    pub fn group_by(&self) -> &'static str {
        match self {
            WorklogScope::Day(_) => "day",
            WorklogScope::Week { .. } => "week",
            WorklogScope::Month { .. } => "month",
            WorklogScope::Branch(_) => "branch",
        }
    }

    /// Stable cache key: `2024-03-01`, `2024-W09`, `2024-03`, or the branch name.
    pub fn key(&self) -> String {
        match self {
            WorklogScope::Day(date) => date.format("%Y-%m-%d").to_string(),
            WorklogScope::Week { year, week } => format!("{year}-W{week:02}"),
            WorklogScope::Month { year, month } => format!("{year}-{month:02}"),
            WorklogScope::Branch(name) => name.clone(),
        }
    }

    /// Inverse of [`group_by`](Self::group_by) + [`key`](Self::key).
    pub fn parse(group_by: &str, key: &str) -> Option<Self> {
        match group_by {
            "day" => NaiveDate::parse_from_str(key, "%Y-%m-%d")
                .ok()
                .map(WorklogScope::Day),
            "week" => {
                let (year, week) = key.split_once("-W")?;
                let scope = WorklogScope::Week {
                    year: year.parse().ok()?,
                    week: week.parse().ok()?,
                };
                scope.first_day().map(|_| scope)
            }
            "month" => {
                let (year, month) = key.split_once('-')?;
                let scope = WorklogScope::Month {
                    year: year.parse().ok()?,
                    month: month.parse().ok()?,
                };
                scope.first_day().map(|_| scope)
            }
            "branch" if !key.is_empty() => Some(WorklogScope::Branch(key.to_string())),
            _ => None,
        }
    }

    pub fn week_of(date: NaiveDate) -> Self {
        let iso = date.iso_week();
        WorklogScope::Week {
            year: iso.year(),
            week: iso.week(),
        }
    }

    fn first_day(&self) -> Option<NaiveDate> {
        match self {
            WorklogScope::Day(date) => Some(*date),
            WorklogScope::Week { year, week } => {
                NaiveDate::from_isoywd_opt(*year, *week, Weekday::Mon)
            }
            WorklogScope::Month { year, month } => NaiveDate::from_ymd_opt(*year, *month, 1),
            WorklogScope::Branch(_) => None,
        }
    }

    /// `[first, end)` local dates covered by a calendar scope.
    fn date_range(&self) -> Option<(NaiveDate, NaiveDate)> {
        let first = self.first_day()?;
        let end = match self {
            WorklogScope::Day(_) => first.succ_opt()?,
            WorklogScope::Week { .. } => first.checked_add_signed(TimeDelta::days(7))?,
            WorklogScope::Month { .. } => first.checked_add_months(Months::new(1))?,
            WorklogScope::Branch(_) => return None,
        };
        Some((first, end))
    }
}

impl fmt::Display for WorklogScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.group_by(), self.key())
    }
}

#[derive(Debug, Clone)]
pub struct WorklogOptions {
    /// Fixed offset used to decide which local day a commit falls on.
    pub utc_offset_minutes: i32,
    pub call_timeout: Duration,
}

impl WorklogOptions {
    pub fn from_config(worklog: &WorklogConfig, ingest: &IngestConfig) -> Self {
        Self {
            utc_offset_minutes: worklog.utc_offset_minutes,
            call_timeout: Duration::from_secs(ingest.call_timeout_secs),
        }
    }

    fn offset_secs(&self) -> i64 {
        i64::from(self.utc_offset_minutes) * 60
    }

    fn local_date(&self, ts: i64) -> NaiveDate {
        DateTime::from_timestamp(ts + self.offset_secs(), 0)
            .map(|dt| dt.date_naive())
            .unwrap_or_default()
    }

    fn start_of(&self, date: NaiveDate) -> i64 {
        date.and_time(chrono::NaiveTime::MIN).and_utc().timestamp() - self.offset_secs()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorklogOutcome {
    /// `None` when the scope has no qualifying commits, or when a child
    /// digest failed (see `pending`).
    pub entry: Option<WorklogEntry>,
    /// True when the cached entry matched and nothing was regenerated.
    pub reused: bool,
    /// Child scope keys whose digests could not be produced.
    pub pending: Vec<String>,
}

impl WorklogOutcome {
    fn none() -> Self {
        Self {
            entry: None,
            reused: false,
            pending: Vec::new(),
        }
    }
}

struct BuildContext<'a> {
    writer: &'a Writer,
    summarizer: &'a dyn Summarizer,
    codebase_id: i64,
    profile: &'a str,
    options: &'a WorklogOptions,
}

/// Return the digest for `scope`, rebuilding it only if its commit set
/// changed since it was cached.
pub async fn get_or_build(
    writer: &Writer,
    summarizer: &dyn Summarizer,
    codebase_id: i64,
    profile: &str,
    scope: &WorklogScope,
    options: &WorklogOptions,
) -> Result<WorklogOutcome> {
    let ctx = BuildContext {
        writer,
        summarizer,
        codebase_id,
        profile,
        options,
    };
    resolve(&ctx, scope).await
}

async fn resolve(ctx: &BuildContext<'_>, scope: &WorklogScope) -> Result<WorklogOutcome> {
    let commits = qualifying_commits(ctx, scope).await?;
    if commits.is_empty() {
        return Ok(WorklogOutcome::none());
    }

    let key = scope.key();
    let fingerprint = commit_fingerprint(&commits);

    if let Some(existing) = worklogs::get(
        ctx.writer.pool(),
        ctx.codebase_id,
        ctx.profile,
        scope.group_by(),
        &key,
    )
    .await?
    {
        if existing.fingerprint == fingerprint {
            tracing::debug!(scope = %scope, "worklog reused");
            return Ok(WorklogOutcome {
                entry: Some(existing),
                reused: true,
                pending: Vec::new(),
            });
        }
    }

    let context = match scope {
        WorklogScope::Day(_) | WorklogScope::Branch(_) => commit_listing(scope, &commits, ctx.options),
        WorklogScope::Week { .. } => {
            let days: BTreeSet<NaiveDate> = commits
                .iter()
                .map(|c| ctx.options.local_date(c.committed_at))
                .collect();
            let children = days.into_iter().map(WorklogScope::Day).collect();
            match compose(ctx, scope, children).await? {
                Ok(context) => context,
                Err(pending) => return Ok(pending_outcome(pending)),
            }
        }
        WorklogScope::Month { .. } => {
            let children = month_children(scope, &commits, ctx.options);
            match compose(ctx, scope, children).await? {
                Ok(context) => context,
                Err(pending) => return Ok(pending_outcome(pending)),
            }
        }
    };

    let content = with_deadline(
        &scope.to_string(),
        ctx.options.call_timeout,
        ctx.summarizer.summarize(SummaryKind::Worklog, &context),
    )
    .await?;

    let entry = worklogs::replace(
        ctx.writer.pool(),
        ctx.codebase_id,
        &NewWorklog {
            profile: ctx.profile,
            group_by: scope.group_by(),
            scope_key: &key,
            fingerprint: &fingerprint,
            commit_count: commits.len() as i64,
            additions: commits.iter().map(|c| c.additions).sum(),
            deletions: commits.iter().map(|c| c.deletions).sum(),
            files_changed: commits.iter().map(|c| c.files_changed).sum(),
            content: &content,
        },
    )
    .await?;

    tracing::info!(scope = %scope, commits = commits.len(), "worklog built");
    Ok(WorklogOutcome {
        entry: Some(entry),
        reused: false,
        pending: Vec::new(),
    })
}

/// Resolve child scopes in order and join their digests.
///
/// `Ok(Err(pending))` when any child could not be produced.
async fn compose(
    ctx: &BuildContext<'_>,
    parent: &WorklogScope,
    children: Vec<WorklogScope>,
) -> Result<std::result::Result<String, Vec<String>>> {
    let mut sections = Vec::new();
    let mut pending = Vec::new();

    for child in &children {
        match Box::pin(resolve(ctx, child)).await {
            Ok(outcome) if !outcome.pending.is_empty() => pending.extend(outcome.pending),
            Ok(outcome) => {
                if let Some(entry) = outcome.entry {
                    sections.push(format!("## {}\n{}", child.key(), entry.content));
                }
            }
            Err(e) if is_collaborator_failure(&e) => {
                tracing::warn!(scope = %child, error = %e, "child worklog failed");
                pending.push(child.key());
            }
            Err(e) => return Err(e),
        }
    }

    if !pending.is_empty() {
        tracing::warn!(scope = %parent, pending = pending.len(), "worklog left pending");
        return Ok(Err(pending));
    }

    Ok(Ok(format!(
        "Worklog for {}\n\n{}",
        parent,
        sections.join("\n\n")
    )))
}

/// ISO weeks holding the month's commits, in order. A week that crosses
/// into a neighbouring month contributes its in-month days instead, so the
/// month digest covers exactly the commits in its fingerprint.
fn month_children(
    month: &WorklogScope,
    commits: &[Commit],
    options: &WorklogOptions,
) -> Vec<WorklogScope> {
    let Some((first, end)) = month.date_range() else {
        return Vec::new();
    };

    let mut weeks: BTreeMap<(i32, u32), BTreeSet<NaiveDate>> = BTreeMap::new();
    for c in commits {
        let date = options.local_date(c.committed_at);
        let iso = date.iso_week();
        weeks.entry((iso.year(), iso.week())).or_default().insert(date);
    }

    let mut children = Vec::new();
    for ((year, week), days) in weeks {
        let week = WorklogScope::Week { year, week };
        let inside = week
            .date_range()
            .is_some_and(|(start, stop)| start >= first && stop <= end);
        if inside {
            children.push(week);
        } else {
            children.extend(days.into_iter().map(WorklogScope::Day));
        }
    }
    children
}

fn pending_outcome(pending: Vec<String>) -> WorklogOutcome {
    WorklogOutcome {
        entry: None,
        reused: false,
        pending,
    }
}

fn is_collaborator_failure(err: &EngineError) -> bool {
    matches!(
        err,
        EngineError::Summarizer { .. } | EngineError::Timeout { .. }
    )
}

async fn qualifying_commits(ctx: &BuildContext<'_>, scope: &WorklogScope) -> Result<Vec<Commit>> {
    let pool = ctx.writer.pool();
    match scope {
        WorklogScope::Branch(name) => {
            match branches::get_by_name(pool, ctx.codebase_id, name).await? {
                Some(branch) => commits::list_user_commits_for_branch(pool, branch.id).await,
                None => Ok(Vec::new()),
            }
        }
        _ => {
            let Some((first, end)) = scope.date_range() else {
                return Ok(Vec::new());
            };
            commits::list_user_commits_between(
                pool,
                ctx.codebase_id,
                ctx.options.start_of(first),
                ctx.options.start_of(end),
            )
            .await
        }
    }
}

/// SHA-256 over the sorted, newline-joined commit hashes.
pub fn commit_fingerprint(commits: &[Commit]) -> String {
    let mut hashes: Vec<&str> = commits.iter().map(|c| c.hash.as_str()).collect();
    hashes.sort_unstable();
    sha256_hex(hashes.join("\n").as_bytes())
}

fn commit_listing(scope: &WorklogScope, commits: &[Commit], options: &WorklogOptions) -> String {
    let mut out = format!("Worklog for {scope}\n\n");
    for c in commits {
        let when = DateTime::from_timestamp(c.committed_at + options.offset_secs(), 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        let subject = c.message.lines().next().unwrap_or("");
        out.push_str(&format!(
            "- {} {} {} (+{} -{}, {} files)\n",
            when,
            &c.hash[..c.hash.len().min(8)],
            subject,
            c.additions,
            c.deletions,
            c.files_changed
        ));
        if let Some(summary) = &c.summary {
            out.push_str(&format!("  {summary}\n"));
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════
// Listings
// ═══════════════════════════════════════════════════════════════════════

/// Cached entries of one kind, without digest text.
pub async fn list_entries(
    pool: &SqlitePool,
    codebase_id: i64,
    profile: &str,
    group_by: &str,
) -> Result<Vec<WorklogSummary>> {
    worklogs::list(pool, codebase_id, profile, group_by).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Day,
    Week,
    Month,
}

impl Period {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "day" => Some(Period::Day),
            "week" => Some(Period::Week),
            "month" => Some(Period::Month),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityBucket {
    pub period: String,
    pub commits: i64,
    pub additions: i64,
    pub deletions: i64,
    pub files_changed: i64,
}

/// Live per-period counts of the current user's commits for local dates
/// `from..=to`. Never touches digest content.
pub async fn activity(
    pool: &SqlitePool,
    codebase_id: i64,
    period: Period,
    from: NaiveDate,
    to: NaiveDate,
    utc_offset_minutes: i32,
) -> Result<Vec<ActivityBucket>> {
    let options = WorklogOptions {
        utc_offset_minutes,
        call_timeout: Duration::ZERO,
    };
    let Some(end) = to.succ_opt() else {
        return Ok(Vec::new());
    };
    let format = match period {
        Period::Month => "%Y-%m",
        Period::Day | Period::Week => "%Y-%m-%d",
    };

    let rows = sqlx::query(
        r#"
        SELECT strftime(?, committed_at + ?, 'unixepoch') AS bucket,
               COUNT(*) AS commits,
               SUM(additions) AS additions,
               SUM(deletions) AS deletions,
               SUM(files_changed) AS files_changed
        FROM commits
        WHERE codebase_id = ? AND is_user_commit = 1
          AND committed_at >= ? AND committed_at < ?
        GROUP BY bucket
        ORDER BY bucket
        "#,
    )
    .bind(format)
    .bind(options.offset_secs())
    .bind(codebase_id)
    .bind(options.start_of(from))
    .bind(options.start_of(end))
    .fetch_all(pool)
    .await?;

    let mut buckets: BTreeMap<String, ActivityBucket> = BTreeMap::new();
    for row in &rows {
        let raw: String = row.try_get("bucket")?;
        let period_key = match period {
            Period::Week => match NaiveDate::parse_from_str(&raw, "%Y-%m-%d") {
                Ok(date) => WorklogScope::week_of(date).key(),
                Err(_) => raw,
            },
            _ => raw,
        };
        let bucket = buckets
            .entry(period_key.clone())
            .or_insert_with(|| ActivityBucket {
                period: period_key,
                commits: 0,
                additions: 0,
                deletions: 0,
                files_changed: 0,
            });
        bucket.commits += row.try_get::<i64, _>("commits")?;
        bucket.additions += row.try_get::<i64, _>("additions")?;
        bucket.deletions += row.try_get::<i64, _>("deletions")?;
        bucket.files_changed += row.try_get::<i64, _>("files_changed")?;
    }

    Ok(buckets.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_scope_keys_roundtrip() {
        let scopes = [
            WorklogScope::Day(date(2024, 3, 1)),
            WorklogScope::Week { year: 2024, week: 9 },
            WorklogScope::Month { year: 2024, month: 3 },
            WorklogScope::Branch("feature/login".into()),
        ];
        for scope in scopes {
            let parsed = WorklogScope::parse(scope.group_by(), &scope.key()).unwrap();
            assert_eq!(parsed, scope);
        }
        assert_eq!(WorklogScope::Week { year: 2024, week: 9 }.key(), "2024-W09");
    }

    #[test]
    fn test_parse_rejects_invalid_scopes() {
        assert!(WorklogScope::parse("week", "2024-W60").is_none());
        assert!(WorklogScope::parse("month", "2024-13").is_none());
        assert!(WorklogScope::parse("day", "yesterday").is_none());
        assert!(WorklogScope::parse("year", "2024").is_none());
    }

    #[test]
    fn test_iso_week_crosses_year() {
        // 2024-12-30 is Monday of ISO week 1 of 2025
        assert_eq!(
            WorklogScope::week_of(date(2024, 12, 30)),
            WorklogScope::Week { year: 2025, week: 1 }
        );
        let (first, end) = WorklogScope::Week { year: 2025, week: 1 }.date_range().unwrap();
        assert_eq!(first, date(2024, 12, 30));
        assert_eq!(end, date(2025, 1, 6));
    }

    #[test]
    fn test_month_range() {
        let (first, end) = WorklogScope::Month { year: 2024, month: 12 }.date_range().unwrap();
        assert_eq!(first, date(2024, 12, 1));
        assert_eq!(end, date(2025, 1, 1));
    }

    #[test]
    fn test_local_day_uses_offset() {
        let options = WorklogOptions {
            utc_offset_minutes: -300,
            call_timeout: Duration::from_secs(1),
        };
        // 2024-03-02T03:00:00Z is still March 1st at UTC-5
        let ts = date(2024, 3, 2).and_hms_opt(3, 0, 0).unwrap().and_utc().timestamp();
        assert_eq!(options.local_date(ts), date(2024, 3, 1));
        assert_eq!(
            options.start_of(date(2024, 3, 1)),
            date(2024, 3, 1).and_hms_opt(5, 0, 0).unwrap().and_utc().timestamp()
        );
    }

    fn commit(hash: &str) -> Commit {
        Commit {
            id: 0,
            codebase_id: 1,
            branch_id: None,
            hash: hash.into(),
            author_name: "Ada".into(),
            author_email: "ada@example.com".into(),
            message: "m".into(),
            summary: None,
            summary_status: crate::models::SummaryStatus::Pending,
            committed_at: 0,
            files_changed: 0,
            additions: 0,
            deletions: 0,
            is_default_branch: true,
            is_user_commit: true,
        }
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let a = commit_fingerprint(&[commit("b"), commit("a")]);
        let b = commit_fingerprint(&[commit("a"), commit("b")]);
        assert_eq!(a, b);
        assert_eq!(a, sha256_hex(b"a\nb"));
        assert_ne!(a, commit_fingerprint(&[commit("a")]));
    }

    #[test]
    fn test_month_children_split_boundary_weeks() {
        let options = WorklogOptions {
            utc_offset_minutes: 0,
            call_timeout: Duration::from_secs(1),
        };
        let at = |d: NaiveDate| {
            let mut c = commit(&d.to_string());
            c.committed_at = d.and_hms_opt(12, 0, 0).unwrap().and_utc().timestamp();
            c
        };
        // March 2024: W09 starts in February; W10 and W13 lie inside March.
        let commits = [
            at(date(2024, 3, 1)),
            at(date(2024, 3, 5)),
            at(date(2024, 3, 6)),
            at(date(2024, 3, 31)),
        ];
        let children = month_children(
            &WorklogScope::Month { year: 2024, month: 3 },
            &commits,
            &options,
        );
        assert_eq!(
            children,
            vec![
                WorklogScope::Day(date(2024, 3, 1)),
                WorklogScope::Week { year: 2024, week: 10 },
                WorklogScope::Week { year: 2024, week: 13 },
            ]
        );
    }
}
