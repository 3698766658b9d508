//! Core data models stored per profile.
//!
//! Timestamps are Unix seconds. Embeddings are decoded from their BLOB
//! columns lazily by the modules that need them.

use serde::Serialize;
use std::collections::BTreeMap;

/// One indexed repository.
#[derive(Debug, Clone, Serialize)]
pub struct Codebase {
    pub id: i64,
    pub path: String,
    pub name: String,
    pub summary: Option<String>,
    pub language_stats: BTreeMap<String, i64>,
    pub default_branch: Option<String>,
    pub last_indexed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchStatus {
    Active,
    Merged,
    Stale,
}

impl BranchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchStatus::Active => "active",
            BranchStatus::Merged => "merged",
            BranchStatus::Stale => "stale",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "merged" => BranchStatus::Merged,
            "stale" => BranchStatus::Stale,
            _ => BranchStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Branch {
    pub id: i64,
    pub codebase_id: i64,
    pub name: String,
    pub is_default: bool,
    pub base_branch: Option<String>,
    pub summary: Option<String>,
    pub story: Option<String>,
    pub status: BranchStatus,
    pub first_commit: Option<String>,
    pub last_commit: Option<String>,
    pub commit_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Whether a commit's summary has been produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryStatus {
    /// Not a current-user commit; never summarized.
    None,
    /// Queued for the enrichment pass.
    Pending,
    /// The last attempt failed; retried on the next pass.
    Missing,
    Done,
}

impl SummaryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryStatus::None => "none",
            SummaryStatus::Pending => "pending",
            SummaryStatus::Missing => "missing",
            SummaryStatus::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => SummaryStatus::Pending,
            "missing" => SummaryStatus::Missing,
            "done" => SummaryStatus::Done,
            _ => SummaryStatus::None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Commit {
    pub id: i64,
    pub codebase_id: i64,
    pub branch_id: Option<i64>,
    pub hash: String,
    pub author_name: String,
    pub author_email: String,
    pub message: String,
    pub summary: Option<String>,
    pub summary_status: SummaryStatus,
    pub committed_at: i64,
    pub files_changed: i64,
    pub additions: i64,
    pub deletions: i64,
    pub is_default_branch: bool,
    pub is_user_commit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
    Other,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Renamed => "renamed",
            ChangeKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "added" => ChangeKind::Added,
            "modified" => ChangeKind::Modified,
            "deleted" => ChangeKind::Deleted,
            "renamed" => ChangeKind::Renamed,
            _ => ChangeKind::Other,
        }
    }

    /// Map a `git --name-status` letter.
    pub fn from_git_status(status: &str) -> Self {
        match status.chars().next() {
            Some('A') => ChangeKind::Added,
            Some('M') => ChangeKind::Modified,
            Some('D') => ChangeKind::Deleted,
            Some('R') => ChangeKind::Renamed,
            _ => ChangeKind::Other,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileChange {
    pub id: i64,
    pub commit_id: i64,
    pub path: String,
    pub change_kind: ChangeKind,
    pub additions: i64,
    pub deletions: i64,
    pub diff: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Folder {
    pub id: i64,
    pub codebase_id: i64,
    pub path: String,
    pub parent_path: Option<String>,
    pub name: String,
    pub depth: i64,
    pub summary: Option<String>,
    pub purpose: Option<String>,
    pub content_hash: String,
    pub has_embedding: bool,
    pub indexed_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileIndex {
    pub id: i64,
    pub codebase_id: i64,
    pub path: String,
    pub folder_path: Option<String>,
    pub name: String,
    pub language: Option<String>,
    pub size_bytes: i64,
    pub line_count: i64,
    pub summary: Option<String>,
    pub purpose: Option<String>,
    pub content_hash: String,
    pub has_embedding: bool,
    pub indexed_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestCursor {
    pub codebase_id: i64,
    pub branch: String,
    pub last_commit: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorklogEntry {
    pub id: i64,
    pub codebase_id: i64,
    pub profile: String,
    pub group_by: String,
    pub scope_key: String,
    pub fingerprint: String,
    pub commit_count: i64,
    pub additions: i64,
    pub deletions: i64,
    pub files_changed: i64,
    pub content: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Developer {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub is_current_user: bool,
}
