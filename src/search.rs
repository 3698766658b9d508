//! Semantic search over indexed files, folders and user commits.
//!
//! Two strategies, never blended:
//!
//! - **semantic**: cosine similarity between a query embedding and every
//!   stored embedding of the requested kind, computed in Rust;
//! - **substring**: case-insensitive match over names, summaries and
//!   purposes (messages and summaries for commits).
//!
//! [`search`] picks semantic when the summarizer can embed and the store
//! has embeddings of that kind, and reports which strategy ran.

use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::cmp::Ordering;

use crate::embedding::{blob_to_vec, cosine_similarity};
use crate::error::Result;
use crate::summarize::Summarizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchKind {
    File,
    Folder,
    Commit,
}

impl SearchKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file" | "files" => Some(SearchKind::File),
            "folder" | "folders" => Some(SearchKind::Folder),
            "commit" | "commits" => Some(SearchKind::Commit),
            _ => None,
        }
    }

    /// `key`, `title`, `snippet` projection plus the table filter, ordered
    /// by the natural key.
    fn source(&self) -> &'static str {
        match self {
            SearchKind::File => {
                "SELECT path AS key, name AS title, COALESCE(purpose, summary) AS snippet, embedding \
                 FROM file_index WHERE codebase_id = ?"
            }
            SearchKind::Folder => {
                "SELECT path AS key, name AS title, COALESCE(purpose, summary) AS snippet, embedding \
                 FROM folders WHERE codebase_id = ?"
            }
            SearchKind::Commit => {
                "SELECT hash AS key, message AS title, summary AS snippet, embedding \
                 FROM commits WHERE codebase_id = ? AND is_user_commit = 1"
            }
        }
    }

    /// Columns searched by substring.
    fn text_columns(&self) -> &'static [&'static str] {
        match self {
            SearchKind::File | SearchKind::Folder => {
                &["COALESCE(summary, '')", "COALESCE(purpose, '')", "name"]
            }
            SearchKind::Commit => &["message", "COALESCE(summary, '')"],
        }
    }

    fn order_key(&self) -> &'static str {
        match self {
            SearchKind::Commit => "hash",
            _ => "path",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Semantic,
    Substring,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub kind: SearchKind,
    /// Path for files and folders, hash for commits.
    pub key: String,
    pub title: String,
    pub snippet: Option<String>,
    /// Cosine similarity; `None` for substring matches.
    pub score: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub strategy: Strategy,
    pub hits: Vec<SearchHit>,
}

/// Rank stored rows of `kind` by similarity to `query`.
///
/// Rows are loaded in key order and stable-sorted by descending score, so
/// equal scores keep their key order.
pub async fn search_similar(
    pool: &SqlitePool,
    codebase_id: i64,
    query: &[f32],
    kind: SearchKind,
    limit: usize,
) -> Result<Vec<SearchHit>> {
    let sql = format!(
        "{} AND embedding IS NOT NULL AND length(embedding) > 0 ORDER BY {}",
        kind.source(),
        kind.order_key()
    );
    let rows = sqlx::query(&sql).bind(codebase_id).fetch_all(pool).await?;

    let mut hits: Vec<SearchHit> = rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.try_get("embedding")?;
            let vector = blob_to_vec(&blob);
            Ok(SearchHit {
                kind,
                key: row.try_get("key")?,
                title: first_line(row.try_get("title")?),
                snippet: row.try_get("snippet")?,
                score: Some(cosine_similarity(query, &vector)),
            })
        })
        .collect::<Result<_>>()?;

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
    });
    hits.truncate(limit);
    Ok(hits)
}

/// Case-insensitive substring match, ordered by key.
pub async fn search_substring(
    pool: &SqlitePool,
    codebase_id: i64,
    text: &str,
    kind: SearchKind,
    limit: usize,
) -> Result<Vec<SearchHit>> {
    let needle = text.trim().to_lowercase();
    if needle.is_empty() {
        return Ok(Vec::new());
    }

    let filter = kind
        .text_columns()
        .iter()
        .map(|col| format!("instr(lower({col}), ?) > 0"))
        .collect::<Vec<_>>()
        .join(" OR ");
    let sql = format!(
        "{} AND ({}) ORDER BY {} LIMIT ?",
        kind.source(),
        filter,
        kind.order_key()
    );

    let mut query = sqlx::query(&sql).bind(codebase_id);
    for _ in kind.text_columns() {
        query = query.bind(&needle);
    }
    let rows = query.bind(limit as i64).fetch_all(pool).await?;

    rows.iter()
        .map(|row| {
            Ok(SearchHit {
                kind,
                key: row.try_get("key")?,
                title: first_line(row.try_get("title")?),
                snippet: row.try_get("snippet")?,
                score: None,
            })
        })
        .collect()
}

/// Search with the best available strategy.
pub async fn search(
    pool: &SqlitePool,
    summarizer: &dyn Summarizer,
    codebase_id: i64,
    text: &str,
    kind: SearchKind,
    limit: usize,
) -> Result<SearchResults> {
    if summarizer.supports_embeddings() && has_embeddings(pool, codebase_id, kind).await? {
        match summarizer.embed(text).await {
            Ok(Some(query)) => {
                let hits = search_similar(pool, codebase_id, &query, kind, limit).await?;
                return Ok(SearchResults {
                    strategy: Strategy::Semantic,
                    hits,
                });
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed, using substring search");
            }
        }
    }

    let hits = search_substring(pool, codebase_id, text, kind, limit).await?;
    Ok(SearchResults {
        strategy: Strategy::Substring,
        hits,
    })
}

async fn has_embeddings(pool: &SqlitePool, codebase_id: i64, kind: SearchKind) -> Result<bool> {
    let sql = format!(
        "SELECT EXISTS ({} AND embedding IS NOT NULL AND length(embedding) > 0)",
        kind.source()
    );
    let exists: bool = sqlx::query_scalar(&sql).bind(codebase_id).fetch_one(pool).await?;
    Ok(exists)
}

fn first_line(text: String) -> String {
    match text.find('\n') {
        Some(end) => text[..end].trim_end().to_string(),
        None => text,
    }
}
