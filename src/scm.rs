//! Source-control collaborator.
//!
//! The ingest pipeline reads history exclusively through the
//! [`SourceControl`] trait. [`GitCli`] implements it by shelling out to the
//! `git` executable; tests substitute an in-memory fake.
//!
//! # Contract
//!
//! - [`list_commits`](SourceControl::list_commits) returns commits reachable
//!   from `branch` but not from `after`, oldest first.
//! - [`merge_base`](SourceControl::merge_base) returns `None` when the two
//!   histories share nothing.
//! - [`list_branches`](SourceControl::list_branches) flags exactly one branch
//!   as the default when the repository has one.
//!
//! Implementations return `anyhow` errors; the ingest pipeline wraps them
//! with the codebase path and branch being read.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tokio::process::Command;

use crate::models::ChangeKind;

// ═══════════════════════════════════════════════════════════════════════
// Collaborator types
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub hash: String,
    pub author_name: String,
    pub author_email: String,
    pub message: String,
    /// Committer time, Unix seconds.
    pub committed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRef {
    pub name: String,
    pub is_default: bool,
    /// Hash of the commit the branch currently points at.
    pub tip: String,
}

/// One file touched by a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub path: String,
    pub change_kind: ChangeKind,
    pub additions: i64,
    pub deletions: i64,
    /// Unified diff for this file, untruncated. `None` for binary files.
    pub diff: Option<String>,
}

#[async_trait]
pub trait SourceControl: Send + Sync {
    async fn list_branches(&self, repo: &Path) -> Result<Vec<BranchRef>>;

    async fn list_commits(
        &self,
        repo: &Path,
        branch: &str,
        after: Option<&str>,
    ) -> Result<Vec<CommitInfo>>;

    async fn merge_base(&self, repo: &Path, a: &str, b: &str) -> Result<Option<String>>;

    /// Whether `descendant` contains `ancestor` in its history. A commit is
    /// its own ancestor; an unknown `ancestor` is not an ancestor of anything.
    async fn is_ancestor(&self, repo: &Path, ancestor: &str, descendant: &str) -> Result<bool>;

    async fn commit_changes(&self, repo: &Path, hash: &str) -> Result<Vec<FileDiff>>;
}

// ═══════════════════════════════════════════════════════════════════════
// git executable
// ═══════════════════════════════════════════════════════════════════════

const FIELD_SEP: char = '\x1f';
const RECORD_SEP: char = '\x1e';

/// [`SourceControl`] backed by the `git` command-line tool.
#[derive(Debug, Clone, Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self
    }

    async fn git(&self, repo: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(repo)
            .output()
            .await
            .with_context(|| format!("Failed to execute 'git {}'. Is git installed?", args[0]))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args[0], stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Exit status only; used for probes that are allowed to fail.
    async fn git_ok(&self, repo: &Path, args: &[&str]) -> Option<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(repo)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// The branch `origin/HEAD` points at, else `main`, else `master`, else
    /// whatever is checked out.
    async fn detect_default(&self, repo: &Path, local: &[String]) -> Option<String> {
        if let Some(remote_head) = self
            .git_ok(repo, &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"])
            .await
        {
            let name = remote_head.strip_prefix("origin/").unwrap_or(&remote_head);
            if local.iter().any(|b| b == name) {
                return Some(name.to_string());
            }
        }

        for candidate in ["main", "master"] {
            if local.iter().any(|b| b == candidate) {
                return Some(candidate.to_string());
            }
        }

        self.git_ok(repo, &["symbolic-ref", "--short", "HEAD"])
            .await
            .filter(|head| local.iter().any(|b| b == head))
    }
}

#[async_trait]
impl SourceControl for GitCli {
    async fn list_branches(&self, repo: &Path) -> Result<Vec<BranchRef>> {
        let out = self
            .git(
                repo,
                &[
                    "for-each-ref",
                    "--format=%(refname:short)%1f%(objectname)",
                    "refs/heads",
                ],
            )
            .await?;

        let mut pairs = Vec::new();
        for line in out.lines().filter(|l| !l.is_empty()) {
            let Some((name, tip)) = line.split_once(FIELD_SEP) else {
                continue;
            };
            pairs.push((name.to_string(), tip.to_string()));
        }

        let names: Vec<String> = pairs.iter().map(|(n, _)| n.clone()).collect();
        let default = self.detect_default(repo, &names).await;

        Ok(pairs
            .into_iter()
            .map(|(name, tip)| BranchRef {
                is_default: default.as_deref() == Some(name.as_str()),
                name,
                tip,
            })
            .collect())
    }

    async fn list_commits(
        &self,
        repo: &Path,
        branch: &str,
        after: Option<&str>,
    ) -> Result<Vec<CommitInfo>> {
        let range = match after {
            Some(base) => format!("{base}..{branch}"),
            None => branch.to_string(),
        };
        let out = self
            .git(
                repo,
                &[
                    "log",
                    "--reverse",
                    "--format=%H%x1f%an%x1f%ae%x1f%ct%x1f%B%x1e",
                    &range,
                    "--",
                ],
            )
            .await?;

        parse_log(&out)
    }

    async fn merge_base(&self, repo: &Path, a: &str, b: &str) -> Result<Option<String>> {
        let output = Command::new("git")
            .args(["merge-base", a, b])
            .current_dir(repo)
            .output()
            .await
            .with_context(|| "Failed to execute 'git merge-base'")?;

        // Exit code 1 with empty output means "no common ancestor".
        if output.status.code() == Some(1) && output.stdout.is_empty() {
            return Ok(None);
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git merge-base failed: {}", stderr.trim());
        }

        let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!hash.is_empty()).then_some(hash))
    }

    async fn is_ancestor(&self, repo: &Path, ancestor: &str, descendant: &str) -> Result<bool> {
        let output = Command::new("git")
            .args(["merge-base", "--is-ancestor", ancestor, descendant])
            .current_dir(repo)
            .output()
            .await
            .with_context(|| "Failed to execute 'git merge-base --is-ancestor'")?;

        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => {
                // A cursor commit that was garbage-collected after a rewind.
                let missing = self
                    .git_ok(repo, &["cat-file", "-e", &format!("{ancestor}^{{commit}}")])
                    .await
                    .is_none();
                if missing {
                    return Ok(false);
                }
                let stderr = String::from_utf8_lossy(&output.stderr);
                bail!("git merge-base --is-ancestor failed: {}", stderr.trim());
            }
        }
    }

    async fn commit_changes(&self, repo: &Path, hash: &str) -> Result<Vec<FileDiff>> {
        let base = ["diff-tree", "--no-commit-id", "-r", "-M", "--root"];

        let mut status_args = base.to_vec();
        status_args.extend(["-z", "--name-status", hash]);
        let statuses = self.git(repo, &status_args).await?;

        let mut numstat_args = base.to_vec();
        numstat_args.extend(["-z", "--numstat", hash]);
        let numstats = self.git(repo, &numstat_args).await?;

        let mut patch_args = base.to_vec();
        patch_args.extend(["--no-color", "-p", hash]);
        let patch = self.git(repo, &patch_args).await?;

        let kinds = parse_name_status(&statuses);
        let mut diffs = split_patch(&patch);

        Ok(parse_numstat(&numstats)
            .into_iter()
            .map(|(path, additions, deletions)| {
                let binary = additions.is_none();
                FileDiff {
                    change_kind: kinds.get(&path).copied().unwrap_or(ChangeKind::Other),
                    additions: additions.unwrap_or(0),
                    deletions: deletions.unwrap_or(0),
                    diff: if binary { None } else { diffs.remove(&path) },
                    path,
                }
            })
            .collect())
    }
}

fn parse_log(out: &str) -> Result<Vec<CommitInfo>> {
    let mut commits = Vec::new();
    for record in out.split(RECORD_SEP) {
        let record = record.trim_start_matches('\n');
        if record.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = record.splitn(5, FIELD_SEP).collect();
        if fields.len() != 5 {
            bail!("unexpected git log record: {record:?}");
        }
        let committed_at = fields[3]
            .parse::<i64>()
            .with_context(|| format!("bad commit time for {}", fields[0]))?;
        commits.push(CommitInfo {
            hash: fields[0].to_string(),
            author_name: fields[1].to_string(),
            author_email: fields[2].to_string(),
            committed_at,
            message: fields[4].trim_end().to_string(),
        });
    }
    Ok(commits)
}

/// `-z --name-status`: `STATUS\0path\0` or `R100\0old\0new\0`.
fn parse_name_status(out: &str) -> HashMap<String, ChangeKind> {
    let mut kinds = HashMap::new();
    let mut tokens = out.split('\0').filter(|t| !t.is_empty());
    while let Some(status) = tokens.next() {
        let kind = ChangeKind::from_git_status(status);
        let path = if status.starts_with('R') || status.starts_with('C') {
            tokens.next();
            tokens.next()
        } else {
            tokens.next()
        };
        if let Some(path) = path {
            kinds.insert(path.to_string(), kind);
        }
    }
    kinds
}

/// `-z --numstat`: `add\tdel\tpath\0`, or `add\tdel\t\0old\0new\0` for
/// renames. Binary files report `-` for both counts.
fn parse_numstat(out: &str) -> Vec<(String, Option<i64>, Option<i64>)> {
    let mut entries = Vec::new();
    let mut tokens = out.split('\0');
    while let Some(token) = tokens.next() {
        if token.is_empty() {
            continue;
        }
        let mut parts = token.splitn(3, '\t');
        let (Some(add), Some(del), Some(path)) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        let path = if path.is_empty() {
            tokens.next();
            match tokens.next() {
                Some(new) => new,
                None => continue,
            }
        } else {
            path
        };
        entries.push((path.to_string(), add.parse().ok(), del.parse().ok()));
    }
    entries
}

/// Split a multi-file patch into per-file chunks keyed by the new path.
fn split_patch(patch: &str) -> HashMap<String, String> {
    let mut files = HashMap::new();
    let mut current: Option<(String, String)> = None;

    for line in patch.split_inclusive('\n') {
        if let Some(header) = line.strip_prefix("diff --git ") {
            if let Some((path, text)) = current.take() {
                files.insert(path, text);
            }
            let path = header
                .trim_end()
                .rsplit_once(" b/")
                .map(|(_, p)| p.to_string())
                .unwrap_or_default();
            current = Some((path, line.to_string()));
        } else if let Some((_, text)) = current.as_mut() {
            text.push_str(line);
        }
    }
    if let Some((path, text)) = current {
        files.insert(path, text);
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_keeps_multiline_messages() {
        let out = "aaa\x1fAda\x1fada@example.com\x1f100\x1fFirst line\n\nBody\n\x1e\nbbb\x1fBob\x1fbob@example.com\x1f200\x1fSecond\n\x1e\n";
        let commits = parse_log(out).unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].hash, "aaa");
        assert_eq!(commits[0].message, "First line\n\nBody");
        assert_eq!(commits[1].committed_at, 200);
    }

    #[test]
    fn test_parse_log_rejects_garbage() {
        assert!(parse_log("not a record").is_err());
        assert!(parse_log("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_name_status_handles_renames() {
        let out = "M\0src/lib.rs\0R087\0old.rs\0new.rs\0A\0README.md\0";
        let kinds = parse_name_status(out);
        assert_eq!(kinds["src/lib.rs"], ChangeKind::Modified);
        assert_eq!(kinds["new.rs"], ChangeKind::Renamed);
        assert_eq!(kinds["README.md"], ChangeKind::Added);
        assert!(!kinds.contains_key("old.rs"));
    }

    #[test]
    fn test_parse_numstat_binary_and_rename() {
        let out = "3\t1\tsrc/lib.rs\0-\t-\tlogo.png\x002\t2\t\0old.rs\0new.rs\0";
        let entries = parse_numstat(out);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], ("src/lib.rs".to_string(), Some(3), Some(1)));
        assert_eq!(entries[1], ("logo.png".to_string(), None, None));
        assert_eq!(entries[2], ("new.rs".to_string(), Some(2), Some(2)));
    }

    #[test]
    fn test_split_patch_by_file() {
        let patch = "diff --git a/a.txt b/a.txt\n--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-x\n+y\ndiff --git a/b.txt b/b.txt\n+z\n";
        let files = split_patch(patch);
        assert_eq!(files.len(), 2);
        assert!(files["a.txt"].contains("+y"));
        assert!(files["b.txt"].starts_with("diff --git"));
    }
}
