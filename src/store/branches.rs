use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqliteExecutor};

use super::{codebases, now};
use crate::error::{EngineError, Result};
use crate::models::{Branch, BranchStatus};

const COLUMNS: &str = "id, codebase_id, name, is_default, base_branch, summary, story, status, first_commit, last_commit, commit_count, created_at, updated_at";

/// Progress applied to a branch row after an ingest pass.
#[derive(Debug, Clone)]
pub struct BranchProgress<'a> {
    pub base_branch: Option<&'a str>,
    pub first_commit: Option<&'a str>,
    pub last_commit: Option<&'a str>,
    pub added_commits: i64,
    pub status: BranchStatus,
}

/// Return the branch id, inserting a bare row when the name is new.
pub async fn ensure(conn: &mut SqliteConnection, codebase_id: i64, name: &str) -> Result<i64> {
    if let Some(id) = id_by_name(&mut *conn, codebase_id, name).await? {
        return Ok(id);
    }

    let ts = now();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO branches (codebase_id, name, created_at, updated_at) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(codebase_id)
    .bind(name)
    .bind(ts)
    .bind(ts)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

/// Explicitly create a branch record. A duplicate name is a conflict.
pub async fn create(
    conn: &mut SqliteConnection,
    codebase_id: i64,
    name: &str,
    base_branch: Option<&str>,
) -> Result<Branch> {
    if id_by_name(&mut *conn, codebase_id, name).await?.is_some() {
        return Err(EngineError::Conflict {
            entity: "branch",
            key: name.to_string(),
        });
    }

    let ts = now();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO branches (codebase_id, name, base_branch, created_at, updated_at) VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(codebase_id)
    .bind(name)
    .bind(base_branch)
    .bind(ts)
    .bind(ts)
    .fetch_one(&mut *conn)
    .await?;

    get(&mut *conn, id)
        .await?
        .ok_or_else(|| EngineError::Database(sqlx::Error::RowNotFound))
}

async fn id_by_name<'e, E: SqliteExecutor<'e>>(
    exec: E,
    codebase_id: i64,
    name: &str,
) -> Result<Option<i64>> {
    let id = sqlx::query_scalar("SELECT id FROM branches WHERE codebase_id = ? AND name = ?")
        .bind(codebase_id)
        .bind(name)
        .fetch_optional(exec)
        .await?;
    Ok(id)
}

pub async fn get<'e, E: SqliteExecutor<'e>>(exec: E, id: i64) -> Result<Option<Branch>> {
    let row = sqlx::query(&format!("SELECT {COLUMNS} FROM branches WHERE id = ?"))
        .bind(id)
        .fetch_optional(exec)
        .await?;
    row.as_ref().map(row_to_branch).transpose()
}

pub async fn get_by_name<'e, E: SqliteExecutor<'e>>(
    exec: E,
    codebase_id: i64,
    name: &str,
) -> Result<Option<Branch>> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM branches WHERE codebase_id = ? AND name = ?"
    ))
    .bind(codebase_id)
    .bind(name)
    .fetch_optional(exec)
    .await?;
    row.as_ref().map(row_to_branch).transpose()
}

pub async fn list<'e, E: SqliteExecutor<'e>>(exec: E, codebase_id: i64) -> Result<Vec<Branch>> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM branches WHERE codebase_id = ? ORDER BY is_default DESC, name"
    ))
    .bind(codebase_id)
    .fetch_all(exec)
    .await?;
    rows.iter().map(row_to_branch).collect()
}

pub async fn default_branch<'e, E: SqliteExecutor<'e>>(
    exec: E,
    codebase_id: i64,
) -> Result<Option<Branch>> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM branches WHERE codebase_id = ? AND is_default = 1"
    ))
    .bind(codebase_id)
    .fetch_optional(exec)
    .await?;
    row.as_ref().map(row_to_branch).transpose()
}

/// Make `name` the codebase's only default branch.
///
/// Clears every default flag first, then sets the new one; run inside a
/// transaction so readers never observe two defaults.
pub async fn set_default(conn: &mut SqliteConnection, codebase_id: i64, name: &str) -> Result<()> {
    let branch_id = ensure(&mut *conn, codebase_id, name).await?;
    let ts = now();

    sqlx::query("UPDATE branches SET is_default = 0, updated_at = ? WHERE codebase_id = ? AND is_default = 1 AND id != ?")
        .bind(ts)
        .bind(codebase_id)
        .bind(branch_id)
        .execute(&mut *conn)
        .await?;

    sqlx::query("UPDATE branches SET is_default = 1, base_branch = NULL, updated_at = ? WHERE id = ? AND is_default = 0")
        .bind(ts)
        .bind(branch_id)
        .execute(&mut *conn)
        .await?;

    codebases::set_default_branch(&mut *conn, codebase_id, name).await?;
    Ok(())
}

/// Apply one ingest pass's results to a branch row.
pub async fn record_progress<'e, E: SqliteExecutor<'e>>(
    exec: E,
    branch_id: i64,
    progress: &BranchProgress<'_>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE branches SET
            base_branch = COALESCE(?, base_branch),
            first_commit = COALESCE(first_commit, ?),
            last_commit = COALESCE(?, last_commit),
            commit_count = commit_count + ?,
            status = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(progress.base_branch)
    .bind(progress.first_commit)
    .bind(progress.last_commit)
    .bind(progress.added_commits)
    .bind(progress.status.as_str())
    .bind(now())
    .bind(branch_id)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn set_summary<'e, E: SqliteExecutor<'e>>(
    exec: E,
    branch_id: i64,
    summary: &str,
    story: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE branches SET summary = ?, story = COALESCE(?, story), updated_at = ? WHERE id = ?")
        .bind(summary)
        .bind(story)
        .bind(now())
        .bind(branch_id)
        .execute(exec)
        .await?;
    Ok(())
}

fn row_to_branch(row: &SqliteRow) -> Result<Branch> {
    let status: String = row.try_get("status")?;
    Ok(Branch {
        id: row.try_get("id")?,
        codebase_id: row.try_get("codebase_id")?,
        name: row.try_get("name")?,
        is_default: row.try_get("is_default")?,
        base_branch: row.try_get("base_branch")?,
        summary: row.try_get("summary")?,
        story: row.try_get("story")?,
        status: BranchStatus::parse(&status),
        first_commit: row.try_get("first_commit")?,
        last_commit: row.try_get("last_commit")?,
        commit_count: row.try_get("commit_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::migrated_pool;

    #[tokio::test]
    async fn test_set_default_clears_previous() {
        let (_tmp, pool) = migrated_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let cb = codebases::upsert(&mut *conn, "/src/app", "app").await.unwrap();

        set_default(&mut conn, cb, "master").await.unwrap();
        set_default(&mut conn, cb, "main").await.unwrap();

        let all = list(&mut *conn, cb).await.unwrap();
        let defaults: Vec<_> = all.iter().filter(|b| b.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].name, "main");

        let codebase = codebases::get(&mut *conn, cb).await.unwrap().unwrap();
        assert_eq!(codebase.default_branch.as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn test_create_duplicate_is_conflict() {
        let (_tmp, pool) = migrated_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let cb = codebases::upsert(&mut *conn, "/src/app", "app").await.unwrap();

        let branch = create(&mut conn, cb, "feature/x", Some("main")).await.unwrap();
        assert_eq!(branch.base_branch.as_deref(), Some("main"));
        assert_eq!(branch.status, BranchStatus::Active);

        let err = create(&mut conn, cb, "feature/x", None).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict { entity: "branch", .. }));
    }

    #[tokio::test]
    async fn test_record_progress_accumulates() {
        let (_tmp, pool) = migrated_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let cb = codebases::upsert(&mut *conn, "/src/app", "app").await.unwrap();
        let id = ensure(&mut conn, cb, "main").await.unwrap();

        let first = BranchProgress {
            base_branch: None,
            first_commit: Some("a1"),
            last_commit: Some("c3"),
            added_commits: 3,
            status: BranchStatus::Active,
        };
        record_progress(&mut *conn, id, &first).await.unwrap();

        let second = BranchProgress {
            base_branch: None,
            first_commit: Some("d4"),
            last_commit: Some("d4"),
            added_commits: 1,
            status: BranchStatus::Active,
        };
        record_progress(&mut *conn, id, &second).await.unwrap();

        let branch = get(&mut *conn, id).await.unwrap().unwrap();
        assert_eq!(branch.first_commit.as_deref(), Some("a1"));
        assert_eq!(branch.last_commit.as_deref(), Some("d4"));
        assert_eq!(branch.commit_count, 4);
    }
}
