use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqliteExecutor};

use super::now;
use crate::error::Result;
use crate::models::Developer;

/// Insert or refresh an author identity, keyed by lower-cased email.
pub async fn upsert<'e, E: SqliteExecutor<'e>>(
    exec: E,
    name: &str,
    email: &str,
    is_current_user: bool,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO developers (name, email, is_current_user, created_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(email) DO UPDATE SET
            name = excluded.name,
            is_current_user = excluded.is_current_user
        RETURNING id
        "#,
    )
    .bind(name)
    .bind(email.trim().to_lowercase())
    .bind(is_current_user)
    .bind(now())
    .fetch_one(exec)
    .await?;
    Ok(id)
}

/// Move the current-user flag to `email`, clearing it everywhere else.
pub async fn mark_current_user(conn: &mut SqliteConnection, email: &str) -> Result<()> {
    let email = email.trim().to_lowercase();
    sqlx::query("UPDATE developers SET is_current_user = 0 WHERE is_current_user = 1 AND email != ?")
        .bind(&email)
        .execute(&mut *conn)
        .await?;
    sqlx::query("UPDATE developers SET is_current_user = 1 WHERE email = ?")
        .bind(&email)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn get_by_email<'e, E: SqliteExecutor<'e>>(
    exec: E,
    email: &str,
) -> Result<Option<Developer>> {
    let row = sqlx::query("SELECT id, name, email, is_current_user FROM developers WHERE email = ?")
        .bind(email.trim().to_lowercase())
        .fetch_optional(exec)
        .await?;
    row.as_ref().map(row_to_developer).transpose()
}

pub async fn current_user<'e, E: SqliteExecutor<'e>>(exec: E) -> Result<Option<Developer>> {
    let row =
        sqlx::query("SELECT id, name, email, is_current_user FROM developers WHERE is_current_user = 1")
            .fetch_optional(exec)
            .await?;
    row.as_ref().map(row_to_developer).transpose()
}

pub async fn list<'e, E: SqliteExecutor<'e>>(exec: E) -> Result<Vec<Developer>> {
    let rows = sqlx::query("SELECT id, name, email, is_current_user FROM developers ORDER BY email")
        .fetch_all(exec)
        .await?;
    rows.iter().map(row_to_developer).collect()
}

fn row_to_developer(row: &SqliteRow) -> Result<Developer> {
    Ok(Developer {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        is_current_user: row.try_get("is_current_user")?,
    })
}
