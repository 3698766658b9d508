use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteExecutor};

use super::now;
use crate::error::Result;
use crate::models::IngestCursor;

/// Last ingested commit for a branch. `None` means never ingested.
pub async fn get<'e, E: SqliteExecutor<'e>>(
    exec: E,
    codebase_id: i64,
    branch: &str,
) -> Result<Option<String>> {
    let hash = sqlx::query_scalar(
        "SELECT last_commit FROM ingest_cursors WHERE codebase_id = ? AND branch = ?",
    )
    .bind(codebase_id)
    .bind(branch)
    .fetch_optional(exec)
    .await?;
    Ok(hash)
}

/// Store a branch cursor. Ingestion only writes a tip that descends from
/// the stored one; [`reset`] is the only way back.
pub async fn set<'e, E: SqliteExecutor<'e>>(
    exec: E,
    codebase_id: i64,
    branch: &str,
    last_commit: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO ingest_cursors (codebase_id, branch, last_commit, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(codebase_id, branch) DO UPDATE SET
            last_commit = excluded.last_commit,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(codebase_id)
    .bind(branch)
    .bind(last_commit)
    .bind(now())
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn list<'e, E: SqliteExecutor<'e>>(
    exec: E,
    codebase_id: i64,
) -> Result<Vec<IngestCursor>> {
    let rows = sqlx::query(
        "SELECT codebase_id, branch, last_commit, updated_at FROM ingest_cursors WHERE codebase_id = ? ORDER BY branch",
    )
    .bind(codebase_id)
    .fetch_all(exec)
    .await?;
    rows.iter().map(row_to_cursor).collect()
}

/// Forget a branch's progress so the next ingest starts from scratch.
/// Returns true when a cursor existed.
pub async fn reset<'e, E: SqliteExecutor<'e>>(
    exec: E,
    codebase_id: i64,
    branch: &str,
) -> Result<bool> {
    let result = sqlx::query("DELETE FROM ingest_cursors WHERE codebase_id = ? AND branch = ?")
        .bind(codebase_id)
        .bind(branch)
        .execute(exec)
        .await?;
    Ok(result.rows_affected() > 0)
}

fn row_to_cursor(row: &SqliteRow) -> Result<IngestCursor> {
    Ok(IngestCursor {
        codebase_id: row.try_get("codebase_id")?,
        branch: row.try_get("branch")?,
        last_commit: row.try_get("last_commit")?,
        updated_at: row.try_get("updated_at")?,
    })
}
