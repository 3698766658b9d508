//! In-memory collaborators and fixtures shared by the integration tests.

#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use worktrail::config::{Config, StorageConfig};
use worktrail::manager::{Manager, ProfileHandle};
use worktrail::models::ChangeKind;
use worktrail::scm::{BranchRef, CommitInfo, FileDiff, SourceControl};
use worktrail::summarize::{Summarizer, SummaryKind};
use worktrail::tree::FileTree;

pub const USER_EMAIL: &str = "me@example.com";
pub const OTHER_EMAIL: &str = "colleague@example.com";

// ─── Profile fixture ────────────────────────────────────────────────

pub fn test_config(tmp: &TempDir) -> Config {
    let mut config: Config = toml::from_str(&format!(
        r#"
        data_dir = "{}"
        active_profile = "work"

        [[profiles]]
        name = "work"
        user_email = "{}"
        "#,
        tmp.path().join("data").display(),
        USER_EMAIL
    ))
    .unwrap();
    config.storage = StorageConfig {
        lock_timeout_ms: 200,
        read_connections: 2,
    };
    config
}

/// Fresh manager + active profile, plus a repository directory under the
/// same temp root.
pub async fn setup() -> (TempDir, Manager, Arc<ProfileHandle>, std::path::PathBuf) {
    let tmp = TempDir::new().unwrap();
    let repo = tmp.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    let manager = Manager::new(test_config(&tmp));
    let profile = manager.active().await.unwrap();
    (tmp, manager, profile, repo)
}

// ─── Fake source control ────────────────────────────────────────────

#[derive(Default)]
struct ScmState {
    /// Branch name → full history, oldest first.
    branches: BTreeMap<String, Vec<CommitInfo>>,
    default_branch: String,
    /// Every `list_commits` call as (branch, after).
    list_calls: Vec<(String, Option<String>)>,
    fail_list_commits: Option<String>,
}

/// Source control over in-memory branch histories.
#[derive(Default)]
pub struct FakeScm {
    state: Mutex<ScmState>,
}

impl FakeScm {
    pub fn new(default_branch: &str) -> Self {
        let scm = Self::default();
        {
            let mut state = scm.state.lock().unwrap();
            state.default_branch = default_branch.to_string();
            state.branches.insert(default_branch.to_string(), Vec::new());
        }
        scm
    }

    /// Append a commit to `branch`. Timestamps are seconds since the epoch.
    pub fn commit(&self, branch: &str, hash: &str, email: &str, committed_at: i64) {
        let mut state = self.state.lock().unwrap();
        state
            .branches
            .entry(branch.to_string())
            .or_default()
            .push(CommitInfo {
                hash: hash.to_string(),
                author_name: email.split('@').next().unwrap_or("dev").to_string(),
                author_email: email.to_string(),
                message: format!("Change {hash}\n\nLonger description of {hash}."),
                committed_at,
            });
    }

    /// Create `branch` from `from`'s history up to and including `at`.
    pub fn branch_from(&self, branch: &str, from: &str, at: &str) {
        let mut state = self.state.lock().unwrap();
        let source = state.branches.get(from).cloned().unwrap_or_default();
        let end = source.iter().position(|c| c.hash == at).map_or(0, |i| i + 1);
        state
            .branches
            .insert(branch.to_string(), source[..end].to_vec());
    }

    /// Rewind `branch` so that `at` is its tip again, as after a reset or
    /// force-push.
    pub fn reset_branch(&self, branch: &str, at: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(history) = state.branches.get_mut(branch) {
            if let Some(i) = history.iter().position(|c| c.hash == at) {
                history.truncate(i + 1);
            }
        }
    }

    pub fn fail_list_commits_on(&self, branch: &str) {
        self.state.lock().unwrap().fail_list_commits = Some(branch.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().fail_list_commits = None;
    }

    /// The `after` argument of every `list_commits` call for `branch`.
    pub fn after_args(&self, branch: &str) -> Vec<Option<String>> {
        self.state
            .lock()
            .unwrap()
            .list_calls
            .iter()
            .filter(|(b, _)| b == branch)
            .map(|(_, after)| after.clone())
            .collect()
    }
}

#[async_trait]
impl SourceControl for FakeScm {
    async fn list_branches(&self, _repo: &Path) -> Result<Vec<BranchRef>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .branches
            .iter()
            .filter_map(|(name, history)| {
                history.last().map(|tip| BranchRef {
                    name: name.clone(),
                    is_default: *name == state.default_branch,
                    tip: tip.hash.clone(),
                })
            })
            .collect())
    }

    async fn list_commits(
        &self,
        _repo: &Path,
        branch: &str,
        after: Option<&str>,
    ) -> Result<Vec<CommitInfo>> {
        let mut state = self.state.lock().unwrap();
        state
            .list_calls
            .push((branch.to_string(), after.map(str::to_string)));
        if state.fail_list_commits.as_deref() == Some(branch) {
            bail!("simulated failure listing {branch}");
        }

        let history = state
            .branches
            .get(branch)
            .ok_or_else(|| anyhow!("unknown branch {branch}"))?;
        let start = match after {
            Some(hash) => history.iter().position(|c| c.hash == hash).map_or(0, |i| i + 1),
            None => 0,
        };
        Ok(history[start..].to_vec())
    }

    async fn merge_base(&self, _repo: &Path, a: &str, b: &str) -> Result<Option<String>> {
        let state = self.state.lock().unwrap();
        let (Some(a), Some(b)) = (state.branches.get(a), state.branches.get(b)) else {
            return Ok(None);
        };
        Ok(a.iter()
            .zip(b.iter())
            .take_while(|(x, y)| x.hash == y.hash)
            .last()
            .map(|(x, _)| x.hash.clone()))
    }

    async fn is_ancestor(&self, _repo: &Path, ancestor: &str, descendant: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.branches.values().any(|history| {
            let find = |hash: &str| history.iter().position(|c| c.hash == hash);
            matches!((find(ancestor), find(descendant)), (Some(a), Some(d)) if a <= d)
        }))
    }

    async fn commit_changes(&self, _repo: &Path, hash: &str) -> Result<Vec<FileDiff>> {
        Ok(vec![FileDiff {
            path: format!("src/{hash}.rs"),
            change_kind: ChangeKind::Added,
            additions: 3,
            deletions: 1,
            diff: Some(format!("+fn {hash}() {{}}\n")),
        }])
    }
}

// ─── In-memory file tree ────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryTree {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryTree {
    pub fn with_files(files: &[(&str, &str)]) -> Self {
        let tree = Self::default();
        for (path, content) in files {
            tree.set(path, content.as_bytes());
        }
        tree
    }

    pub fn set(&self, path: &str, content: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
    }

    pub fn remove(&self, path: &str) {
        self.files.lock().unwrap().remove(path);
    }
}

#[async_trait]
impl FileTree for MemoryTree {
    async fn list_files(&self) -> Result<Vec<String>> {
        Ok(self.files.lock().unwrap().keys().cloned().collect())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("no such file: {path}"))
    }
}

// ─── Recording summarizer ───────────────────────────────────────────

/// Deterministic summarizer that counts calls.
///
/// Summaries echo the first line of the context so tests can tell which
/// unit they belong to. Embeddings are 26-dimensional letter histograms.
#[derive(Default)]
pub struct RecordingSummarizer {
    embeddings: bool,
    summaries: AtomicUsize,
    embeds: AtomicUsize,
    /// Fail any summarize call whose context contains this text.
    fail_when: Mutex<Option<String>>,
    kinds: Mutex<Vec<SummaryKind>>,
}

impl RecordingSummarizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_embeddings() -> Self {
        Self {
            embeddings: true,
            ..Self::default()
        }
    }

    pub fn fail_when_context_contains(&self, needle: &str) {
        *self.fail_when.lock().unwrap() = Some(needle.to_string());
    }

    pub fn stop_failing(&self) {
        *self.fail_when.lock().unwrap() = None;
    }

    pub fn summary_calls(&self) -> usize {
        self.summaries.load(Ordering::SeqCst)
    }

    pub fn embed_calls(&self) -> usize {
        self.embeds.load(Ordering::SeqCst)
    }

    pub fn calls_of(&self, kind: SummaryKind) -> usize {
        self.kinds.lock().unwrap().iter().filter(|k| **k == kind).count()
    }

    pub fn reset_counts(&self) {
        self.summaries.store(0, Ordering::SeqCst);
        self.embeds.store(0, Ordering::SeqCst);
        self.kinds.lock().unwrap().clear();
    }
}

pub fn letter_histogram(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; 26];
    for b in text.bytes() {
        if b.is_ascii_alphabetic() {
            v[(b.to_ascii_lowercase() - b'a') as usize] += 1.0;
        }
    }
    v
}

#[async_trait]
impl Summarizer for RecordingSummarizer {
    fn name(&self) -> &str {
        "recording"
    }

    fn supports_embeddings(&self) -> bool {
        self.embeddings
    }

    async fn summarize(&self, kind: SummaryKind, context: &str) -> Result<String> {
        let n = self.summaries.fetch_add(1, Ordering::SeqCst) + 1;
        self.kinds.lock().unwrap().push(kind);

        if let Some(needle) = self.fail_when.lock().unwrap().as_deref() {
            if context.contains(needle) {
                bail!("simulated summarizer failure");
            }
        }

        let first = context.lines().next().unwrap_or("").trim();
        Ok(format!("Summary {n} of {first}. Generated for {kind:?}."))
    }

    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>> {
        if !self.embeddings {
            return Ok(None);
        }
        self.embeds.fetch_add(1, Ordering::SeqCst);
        Ok(Some(letter_histogram(text)))
    }
}
