//! Aggregate statistics for a codebase.
//!
//! A quick summary of what's indexed and ingested: folder and file counts,
//! total bytes and lines, the language histogram, and commit counts by
//! summary state. Used by `wt stats` to confirm that reindexing and
//! ingestion are doing what you expect.

use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::models::Codebase;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CodebaseStats {
    pub folders: i64,
    pub files: i64,
    pub total_bytes: i64,
    pub total_lines: i64,
    /// Files per language, from the live file index.
    pub languages: BTreeMap<String, i64>,
    pub commits: i64,
    pub user_commits: i64,
    pub pending_summaries: i64,
    pub branches: i64,
}

pub async fn collect(pool: &SqlitePool, codebase_id: i64) -> Result<CodebaseStats> {
    let folders: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM folders WHERE codebase_id = ?")
        .bind(codebase_id)
        .fetch_one(pool)
        .await?;

    let files_row = sqlx::query(
        r#"
        SELECT COUNT(*) AS files,
               COALESCE(SUM(size_bytes), 0) AS total_bytes,
               COALESCE(SUM(line_count), 0) AS total_lines
        FROM file_index
        WHERE codebase_id = ?
        "#,
    )
    .bind(codebase_id)
    .fetch_one(pool)
    .await?;

    let language_rows = sqlx::query(
        r#"
        SELECT COALESCE(language, 'other') AS language, COUNT(*) AS files
        FROM file_index
        WHERE codebase_id = ?
        GROUP BY 1
        "#,
    )
    .bind(codebase_id)
    .fetch_all(pool)
    .await?;

    let mut languages = BTreeMap::new();
    for row in &language_rows {
        languages.insert(row.try_get("language")?, row.try_get("files")?);
    }

    let commit_row = sqlx::query(
        r#"
        SELECT COUNT(*) AS commits,
               COALESCE(SUM(is_user_commit), 0) AS user_commits,
               COALESCE(SUM(CASE WHEN summary_status IN ('pending', 'missing') THEN 1 ELSE 0 END), 0)
                   AS pending_summaries
        FROM commits
        WHERE codebase_id = ?
        "#,
    )
    .bind(codebase_id)
    .fetch_one(pool)
    .await?;

    let branches: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM branches WHERE codebase_id = ?")
        .bind(codebase_id)
        .fetch_one(pool)
        .await?;

    Ok(CodebaseStats {
        folders,
        files: files_row.try_get("files")?,
        total_bytes: files_row.try_get("total_bytes")?,
        total_lines: files_row.try_get("total_lines")?,
        languages,
        commits: commit_row.try_get("commits")?,
        user_commits: commit_row.try_get("user_commits")?,
        pending_summaries: commit_row.try_get("pending_summaries")?,
        branches,
    })
}

/// Print a stats report the way `wt stats` shows it.
pub fn print(codebase: &Codebase, stats: &CodebaseStats) {
    println!("{} ({})", codebase.name, codebase.path);
    println!("{}", "=".repeat(codebase.name.len() + codebase.path.len() + 3));
    println!();
    println!("  Folders:     {}", stats.folders);
    println!("  Files:       {}", stats.files);
    println!("  Size:        {}", format_bytes(stats.total_bytes.max(0) as u64));
    println!("  Lines:       {}", stats.total_lines);
    println!(
        "  Indexed:     {}",
        codebase
            .last_indexed_at
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );
    println!();
    println!("  Branches:    {}", stats.branches);
    println!("  Commits:     {}", stats.commits);
    println!(
        "  Yours:       {} ({} awaiting summary)",
        stats.user_commits, stats.pending_summaries
    );

    if !stats.languages.is_empty() {
        let mut by_count: Vec<_> = stats.languages.iter().collect();
        by_count.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

        println!();
        println!("  {:<16} {:>6}", "LANGUAGE", "FILES");
        println!("  {}", "-".repeat(23));
        for (language, count) in by_count {
            println!("  {:<16} {:>6}", language, count);
        }
    }
    println!();
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        format_ts_iso(ts)
    } else if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::migrated_pool;
    use crate::store::{codebases, tree};

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[tokio::test]
    async fn test_collect_counts_files_and_languages() {
        let (_tmp, pool) = migrated_pool().await;
        let cb = codebases::upsert(&pool, "/repo", "repo").await.unwrap();

        for (path, language, lines) in [("a.rs", "rust", 10), ("b.rs", "rust", 5), ("c.py", "python", 7)] {
            tree::upsert_file(
                &pool,
                cb,
                &tree::FileRecord {
                    path,
                    folder_path: None,
                    name: path,
                    language: Some(language),
                    size_bytes: 100,
                    line_count: lines,
                    summary: None,
                    purpose: None,
                    content_hash: "h",
                    embedding: None,
                },
                1,
            )
            .await
            .unwrap();
        }

        let stats = collect(&pool, cb).await.unwrap();
        assert_eq!(stats.files, 3);
        assert_eq!(stats.total_bytes, 300);
        assert_eq!(stats.total_lines, 22);
        assert_eq!(stats.languages.get("rust"), Some(&2));
        assert_eq!(stats.commits, 0);
    }
}
