use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteExecutor};
use std::collections::BTreeMap;

use super::now;
use crate::error::Result;
use crate::models::Codebase;

const COLUMNS: &str = "id, path, name, summary, language_stats, default_branch, last_indexed_at, created_at, updated_at";

/// Insert the codebase if its canonical path is new; return its id either way.
pub async fn upsert<'e, E: SqliteExecutor<'e>>(exec: E, path: &str, name: &str) -> Result<i64> {
    let ts = now();
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO codebases (path, name, created_at, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(path) DO UPDATE SET
            name = excluded.name,
            updated_at = excluded.updated_at
        RETURNING id
        "#,
    )
    .bind(path)
    .bind(name)
    .bind(ts)
    .bind(ts)
    .fetch_one(exec)
    .await?;

    Ok(id)
}

pub async fn get<'e, E: SqliteExecutor<'e>>(exec: E, id: i64) -> Result<Option<Codebase>> {
    let row = sqlx::query(&format!("SELECT {COLUMNS} FROM codebases WHERE id = ?"))
        .bind(id)
        .fetch_optional(exec)
        .await?;
    row.as_ref().map(row_to_codebase).transpose()
}

pub async fn find_by_path<'e, E: SqliteExecutor<'e>>(
    exec: E,
    path: &str,
) -> Result<Option<Codebase>> {
    let row = sqlx::query(&format!("SELECT {COLUMNS} FROM codebases WHERE path = ?"))
        .bind(path)
        .fetch_optional(exec)
        .await?;
    row.as_ref().map(row_to_codebase).transpose()
}

pub async fn list<'e, E: SqliteExecutor<'e>>(exec: E) -> Result<Vec<Codebase>> {
    let rows = sqlx::query(&format!("SELECT {COLUMNS} FROM codebases ORDER BY path"))
        .fetch_all(exec)
        .await?;
    rows.iter().map(row_to_codebase).collect()
}

pub async fn set_default_branch<'e, E: SqliteExecutor<'e>>(
    exec: E,
    id: i64,
    branch: &str,
) -> Result<()> {
    sqlx::query("UPDATE codebases SET default_branch = ?, updated_at = ? WHERE id = ?")
        .bind(branch)
        .bind(now())
        .bind(id)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn set_summary<'e, E: SqliteExecutor<'e>>(
    exec: E,
    id: i64,
    summary: &str,
) -> Result<()> {
    sqlx::query("UPDATE codebases SET summary = ?, updated_at = ? WHERE id = ?")
        .bind(summary)
        .bind(now())
        .bind(id)
        .execute(exec)
        .await?;
    Ok(())
}

/// Record the outcome of a structural index pass.
pub async fn set_index_state<'e, E: SqliteExecutor<'e>>(
    exec: E,
    id: i64,
    language_stats: &BTreeMap<String, i64>,
    indexed_at: i64,
) -> Result<()> {
    let stats_json = serde_json::to_string(language_stats)?;
    sqlx::query(
        "UPDATE codebases SET language_stats = ?, last_indexed_at = ?, updated_at = ? WHERE id = ?",
    )
    .bind(stats_json)
    .bind(indexed_at)
    .bind(now())
    .bind(id)
    .execute(exec)
    .await?;
    Ok(())
}

fn row_to_codebase(row: &SqliteRow) -> Result<Codebase> {
    let stats_json: String = row.try_get("language_stats")?;
    let language_stats = serde_json::from_str(&stats_json).unwrap_or_default();

    Ok(Codebase {
        id: row.try_get("id")?,
        path: row.try_get("path")?,
        name: row.try_get("name")?,
        summary: row.try_get("summary")?,
        language_stats,
        default_branch: row.try_get("default_branch")?,
        last_indexed_at: row.try_get("last_indexed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
