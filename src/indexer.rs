//! Structural indexer.
//!
//! Keeps the `folders` and `file_index` tables in step with a working tree.
//! Change detection is content-addressed:
//!
//! - a file's fingerprint is the SHA-256 of its bytes;
//! - a folder's fingerprint is the SHA-256 of its sorted direct children
//!   (sub-folders carry a trailing `/`).
//!
//! Rows whose fingerprint matches are left alone: no summarizer call, no
//! write. Paths that disappeared are removed in batched deletes. When the
//! summarizer fails for one path the row is still written, with an empty
//! fingerprint, so the next pass picks it up again.

use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{IndexerConfig, IngestConfig};
use crate::db;
use crate::error::{EngineError, Result};
use crate::manager::Writer;
use crate::store::tree::{FileRecord, FolderRecord};
use crate::store::{self, codebases};
use crate::summarize::{with_deadline, Summarizer, SummaryKind};
use crate::tree::FileTree;

#[derive(Debug, Clone)]
pub struct ReindexOptions {
    pub max_folder_depth: usize,
    /// Files larger than this are fingerprinted in full but only the first
    /// `max_file_bytes` are sent for summarization.
    pub max_file_bytes: usize,
    pub call_timeout: Duration,
}

impl ReindexOptions {
    pub fn from_config(indexer: &IndexerConfig, ingest: &IngestConfig) -> Self {
        Self {
            max_folder_depth: indexer.max_folder_depth.max(1),
            max_file_bytes: indexer.max_file_bytes,
            call_timeout: Duration::from_secs(ingest.call_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReindexReport {
    pub codebase_id: i64,
    pub files_total: usize,
    pub files_unchanged: usize,
    pub files_changed: usize,
    pub files_new: usize,
    pub files_removed: u64,
    pub files_failed: usize,
    pub binary_files: usize,
    pub folders_total: usize,
    pub folders_unchanged: usize,
    pub folders_changed: usize,
    pub folders_new: usize,
    pub folders_removed: u64,
    pub folders_failed: usize,
    pub codebase_summary_refreshed: bool,
}

impl ReindexReport {
    fn folders_touched(&self) -> bool {
        self.folders_changed + self.folders_new > 0 || self.folders_removed > 0
    }
}

struct Summary {
    text: String,
    embedding: Option<Vec<f32>>,
}

/// Reconcile stored folder/file records with `tree`.
pub async fn reindex(
    writer: &Writer,
    summarizer: &dyn Summarizer,
    codebase_path: &Path,
    tree: &dyn FileTree,
    options: &ReindexOptions,
) -> Result<ReindexReport> {
    let root = codebase_path
        .canonicalize()
        .unwrap_or_else(|_| PathBuf::from(codebase_path));
    let key = root.display().to_string();
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| key.clone());

    let codebase_id = codebases::upsert(writer.pool(), &key, &name).await?;
    let indexed_at = store::now();
    let mut report = ReindexReport {
        codebase_id,
        ..Default::default()
    };

    let paths = tree
        .list_files()
        .await
        .map_err(|e| EngineError::Io(std::io::Error::other(format!("{key}: {e:#}"))))?;
    report.files_total = paths.len();

    // ─── Files ───

    let summarizing = summarizer.supports_summaries();
    let stored_files = store::tree::file_hashes(writer.pool(), codebase_id).await?;
    let mut languages: BTreeMap<String, i64> = BTreeMap::new();

    for path in &paths {
        if let Some(lang) = detect_language(path) {
            *languages.entry(lang.to_string()).or_default() += 1;
        }

        let bytes = match tree.read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "file unreadable, skipped");
                report.files_failed += 1;
                continue;
            }
        };

        let hash = sha256_hex(&bytes);
        let previous = stored_files.get(path);
        if previous == Some(&hash) {
            report.files_unchanged += 1;
            continue;
        }

        let (folder_path, file_name) = split_path(path);
        let mut record = FileRecord {
            path,
            folder_path,
            name: file_name,
            language: detect_language(path),
            size_bytes: bytes.len() as i64,
            line_count: 0,
            summary: None,
            purpose: None,
            content_hash: &hash,
            embedding: None,
        };

        let text = std::str::from_utf8(&bytes).ok();
        let summary = match text {
            None => {
                report.binary_files += 1;
                None
            }
            Some(text) if !summarizing => {
                record.line_count = text.lines().count() as i64;
                None
            }
            Some(text) => {
                record.line_count = text.lines().count() as i64;
                let context = format!("File: {path}\n\n{}", head(text, options.max_file_bytes));
                match summarize_unit(summarizer, SummaryKind::File, path, &context, options).await
                {
                    Ok(summary) => Some(summary),
                    Err(e) => {
                        tracing::warn!(path = %path, error = %e, "file summary failed");
                        report.files_failed += 1;
                        record.content_hash = "";
                        None
                    }
                }
            }
        };

        let purpose = summary.as_ref().map(|s| first_sentence(&s.text));
        record.summary = summary.as_ref().map(|s| s.text.as_str());
        record.purpose = purpose.as_deref();
        record.embedding = summary.as_ref().and_then(|s| s.embedding.as_deref());

        store::tree::upsert_file(writer.pool(), codebase_id, &record, indexed_at).await?;
        if previous.is_some() {
            report.files_changed += 1;
        } else {
            report.files_new += 1;
        }
        tracing::debug!(path = %path, "file indexed");
    }

    // ─── Folders ───

    let folders = folder_children(&paths, options.max_folder_depth);
    report.folders_total = folders.len();
    let stored_folders = store::tree::folder_hashes(writer.pool(), codebase_id).await?;
    let file_summaries: HashMap<String, Option<String>> =
        store::tree::list_files(writer.pool(), codebase_id)
            .await?
            .into_iter()
            .map(|f| (f.path, f.purpose.or(f.summary)))
            .collect();

    for (folder, children) in &folders {
        let hash = folder_fingerprint(children);
        let previous = stored_folders.get(folder);
        if previous == Some(&hash) {
            report.folders_unchanged += 1;
            continue;
        }

        let mut context = format!("Folder: {folder}\n\nContents:\n");
        for child in children {
            let child_path = format!("{folder}/{}", child.trim_end_matches('/'));
            match file_summaries.get(&child_path).and_then(|s| s.as_deref()) {
                Some(s) => context.push_str(&format!("- {child}: {s}\n")),
                None => context.push_str(&format!("- {child}\n")),
            }
        }

        let (parent_path, folder_name) = split_path(folder);
        let mut content_hash = hash.as_str();
        let summary = if !summarizing {
            None
        } else {
            match summarize_unit(summarizer, SummaryKind::Folder, folder, &context, options).await {
                Ok(summary) => Some(summary),
                Err(e) => {
                    tracing::warn!(path = %folder, error = %e, "folder summary failed");
                    report.folders_failed += 1;
                    content_hash = "";
                    None
                }
            }
        };
        let purpose = summary.as_ref().map(|s| first_sentence(&s.text));

        let record = FolderRecord {
            path: folder,
            parent_path,
            name: folder_name,
            depth: folder.split('/').count() as i64,
            summary: summary.as_ref().map(|s| s.text.as_str()),
            purpose: purpose.as_deref(),
            content_hash,
            embedding: summary.as_ref().and_then(|s| s.embedding.as_deref()),
        };
        store::tree::upsert_folder(writer.pool(), codebase_id, &record, indexed_at).await?;
        if previous.is_some() {
            report.folders_changed += 1;
        } else {
            report.folders_new += 1;
        }
    }

    // ─── Removals ───

    let current_files: BTreeSet<&str> = paths.iter().map(String::as_str).collect();
    let gone_files: Vec<String> = stored_files
        .keys()
        .filter(|p| !current_files.contains(p.as_str()))
        .cloned()
        .collect();
    let gone_folders: Vec<String> = stored_folders
        .keys()
        .filter(|p| !folders.contains_key(p.as_str()))
        .cloned()
        .collect();

    if !gone_files.is_empty() || !gone_folders.is_empty() {
        let (files_removed, folders_removed) =
            db::with_transaction(writer.pool(), async |conn: &mut SqliteConnection| {
                let files = store::tree::delete_files(conn, codebase_id, &gone_files).await?;
                let folders = store::tree::delete_folders(conn, codebase_id, &gone_folders).await?;
                Ok((files, folders))
            })
            .await?;
        report.files_removed = files_removed;
        report.folders_removed = folders_removed;
    }

    codebases::set_index_state(writer.pool(), codebase_id, &languages, indexed_at).await?;

    if report.folders_touched() {
        report.codebase_summary_refreshed =
            refresh_codebase_summary(writer, summarizer, codebase_id, &key, options).await?;
    }

    tracing::info!(
        codebase = %key,
        files_new = report.files_new,
        files_changed = report.files_changed,
        files_removed = report.files_removed,
        folders_changed = report.folders_changed + report.folders_new,
        "reindex finished"
    );
    Ok(report)
}

/// Rebuild the codebase overview from its top-level folder summaries.
/// Returns false when there was nothing to build from or the call failed.
async fn refresh_codebase_summary(
    writer: &Writer,
    summarizer: &dyn Summarizer,
    codebase_id: i64,
    key: &str,
    options: &ReindexOptions,
) -> Result<bool> {
    let top_level: Vec<String> = store::tree::list_folders(writer.pool(), codebase_id)
        .await?
        .into_iter()
        .filter(|f| f.depth == 1)
        .filter_map(|f| f.summary.map(|s| format!("- {}: {}", f.path, s)))
        .collect();
    if top_level.is_empty() {
        return Ok(false);
    }

    let context = format!("Codebase: {key}\n\n{}", top_level.join("\n"));
    match with_deadline(
        key,
        options.call_timeout,
        summarizer.summarize(SummaryKind::Codebase, &context),
    )
    .await
    {
        Ok(summary) => {
            codebases::set_summary(writer.pool(), codebase_id, &summary).await?;
            Ok(true)
        }
        Err(e) => {
            tracing::warn!(codebase = %key, error = %e, "codebase summary failed");
            Ok(false)
        }
    }
}

async fn summarize_unit(
    summarizer: &dyn Summarizer,
    kind: SummaryKind,
    key: &str,
    context: &str,
    options: &ReindexOptions,
) -> Result<Summary> {
    let text = with_deadline(
        key,
        options.call_timeout,
        summarizer.summarize(kind, context),
    )
    .await?;
    let embedding = if summarizer.supports_embeddings() {
        with_deadline(key, options.call_timeout, summarizer.embed(&text)).await?
    } else {
        None
    };
    Ok(Summary { text, embedding })
}

/// Every folder up to `max_depth`, mapped to its sorted direct children.
fn folder_children(paths: &[String], max_depth: usize) -> BTreeMap<String, BTreeSet<String>> {
    let mut folders: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for path in paths {
        let parts: Vec<&str> = path.split('/').collect();
        let dirs = parts.len() - 1;
        for depth in 1..=dirs.min(max_depth) {
            let folder = parts[..depth].join("/");
            let child = if depth == dirs {
                parts[depth].to_string()
            } else {
                format!("{}/", parts[depth])
            };
            folders.entry(folder).or_default().insert(child);
        }
    }

    folders
}

fn folder_fingerprint(children: &BTreeSet<String>) -> String {
    let joined = children.iter().map(String::as_str).collect::<Vec<_>>().join("\n");
    sha256_hex(joined.as_bytes())
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// `("src/a", "b.rs")` for `"src/a/b.rs"`; `(None, "b.rs")` at the root.
fn split_path(path: &str) -> (Option<&str>, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (Some(parent), name),
        None => (None, path),
    }
}

fn head(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn first_sentence(text: &str) -> String {
    let line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    let end = line.find(". ").map(|i| i + 1).unwrap_or(line.len());
    head(&line[..end], 240).to_string()
}

/// Language name from a file extension.
pub fn detect_language(path: &str) -> Option<&'static str> {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    match file_name {
        "Dockerfile" => return Some("Dockerfile"),
        "Makefile" => return Some("Makefile"),
        _ => {}
    }
    let ext = file_name.rsplit_once('.')?.1.to_ascii_lowercase();
    let lang = match ext.as_str() {
        "rs" => "Rust",
        "py" => "Python",
        "js" | "mjs" | "cjs" => "JavaScript",
        "jsx" => "JavaScript",
        "ts" | "tsx" => "TypeScript",
        "go" => "Go",
        "java" => "Java",
        "kt" | "kts" => "Kotlin",
        "c" | "h" => "C",
        "cc" | "cpp" | "cxx" | "hpp" => "C++",
        "cs" => "C#",
        "rb" => "Ruby",
        "php" => "PHP",
        "swift" => "Swift",
        "scala" => "Scala",
        "lua" => "Lua",
        "sh" | "bash" | "zsh" => "Shell",
        "sql" => "SQL",
        "html" | "htm" => "HTML",
        "css" | "scss" => "CSS",
        "md" | "markdown" => "Markdown",
        "json" => "JSON",
        "toml" => "TOML",
        "yaml" | "yml" => "YAML",
        "xml" => "XML",
        _ => return None,
    };
    Some(lang)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_folder_children_respects_depth() {
        let folders = folder_children(
            &paths(&["README.md", "src/lib.rs", "src/store/mod.rs", "src/store/deep/x.rs"]),
            2,
        );

        let keys: Vec<_> = folders.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["src", "src/store"]);
        let src: Vec<_> = folders["src"].iter().map(String::as_str).collect();
        assert_eq!(src, vec!["lib.rs", "store/"]);
        let store: Vec<_> = folders["src/store"].iter().map(String::as_str).collect();
        assert_eq!(store, vec!["deep/", "mod.rs"]);
    }

    #[test]
    fn test_folder_fingerprint_ignores_order_and_tracks_names() {
        let a: BTreeSet<String> = ["b.rs", "a.rs"].iter().map(|s| s.to_string()).collect();
        let b: BTreeSet<String> = ["a.rs", "b.rs"].iter().map(|s| s.to_string()).collect();
        let c: BTreeSet<String> = ["a.rs", "c.rs"].iter().map(|s| s.to_string()).collect();
        assert_eq!(folder_fingerprint(&a), folder_fingerprint(&b));
        assert_ne!(folder_fingerprint(&a), folder_fingerprint(&c));
    }

    #[test]
    fn test_sha256_hex_known_value() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_detect_language() {
        assert_eq!(detect_language("src/main.rs"), Some("Rust"));
        assert_eq!(detect_language("web/App.TSX"), Some("TypeScript"));
        assert_eq!(detect_language("Dockerfile"), Some("Dockerfile"));
        assert_eq!(detect_language("LICENSE"), None);
    }

    #[test]
    fn test_first_sentence() {
        assert_eq!(first_sentence("Parses config. Also validates."), "Parses config.");
        assert_eq!(first_sentence("\n  Loads data\nmore"), "Loads data");
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("src/a/b.rs"), (Some("src/a"), "b.rs"));
        assert_eq!(split_path("README.md"), (None, "README.md"));
    }
}
