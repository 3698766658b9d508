use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqliteExecutor};
use std::collections::HashSet;

use super::now;
use crate::embedding::vec_to_blob;
use crate::error::Result;
use crate::models::{ChangeKind, Commit, FileChange, SummaryStatus};

const COLUMNS: &str = "id, codebase_id, branch_id, hash, author_name, author_email, message, summary, summary_status, committed_at, files_changed, additions, deletions, is_default_branch, is_user_commit";

/// A commit about to be stored.
#[derive(Debug, Clone)]
pub struct NewCommit {
    pub branch_id: Option<i64>,
    pub hash: String,
    pub author_name: String,
    pub author_email: String,
    pub message: String,
    pub committed_at: i64,
    pub files_changed: i64,
    pub additions: i64,
    pub deletions: i64,
    pub is_default_branch: bool,
    pub is_user_commit: bool,
}

#[derive(Debug, Clone)]
pub struct NewFileChange {
    pub path: String,
    pub change_kind: ChangeKind,
    pub additions: i64,
    pub deletions: i64,
    pub diff: Option<String>,
}

/// Insert a commit unless its hash is already stored for the codebase.
///
/// Returns the new row id, or `None` when the commit already existed:
/// the first writer owns it and later discoveries never re-attribute it.
pub async fn insert_if_absent<'e, E: SqliteExecutor<'e>>(
    exec: E,
    codebase_id: i64,
    commit: &NewCommit,
) -> Result<Option<i64>> {
    let status = if commit.is_user_commit {
        SummaryStatus::Pending
    } else {
        SummaryStatus::None
    };

    let id: Option<i64> = sqlx::query_scalar(
        r#"
        INSERT INTO commits (codebase_id, branch_id, hash, author_name, author_email, message,
                             summary_status, committed_at, files_changed, additions, deletions,
                             is_default_branch, is_user_commit, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(codebase_id, hash) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(codebase_id)
    .bind(commit.branch_id)
    .bind(&commit.hash)
    .bind(&commit.author_name)
    .bind(commit.author_email.trim().to_lowercase())
    .bind(&commit.message)
    .bind(status.as_str())
    .bind(commit.committed_at)
    .bind(commit.files_changed)
    .bind(commit.additions)
    .bind(commit.deletions)
    .bind(commit.is_default_branch)
    .bind(commit.is_user_commit)
    .bind(now())
    .fetch_optional(exec)
    .await?;

    Ok(id)
}

pub async fn insert_file_changes(
    conn: &mut SqliteConnection,
    commit_id: i64,
    changes: &[NewFileChange],
) -> Result<()> {
    for change in changes {
        sqlx::query(
            "INSERT INTO file_changes (commit_id, path, change_kind, additions, deletions, diff) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(commit_id)
        .bind(&change.path)
        .bind(change.change_kind.as_str())
        .bind(change.additions)
        .bind(change.deletions)
        .bind(&change.diff)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Every hash already stored for a codebase.
pub async fn stored_hashes<'e, E: SqliteExecutor<'e>>(
    exec: E,
    codebase_id: i64,
) -> Result<HashSet<String>> {
    let hashes: Vec<String> = sqlx::query_scalar("SELECT hash FROM commits WHERE codebase_id = ?")
        .bind(codebase_id)
        .fetch_all(exec)
        .await?;
    Ok(hashes.into_iter().collect())
}

pub async fn count<'e, E: SqliteExecutor<'e>>(exec: E, codebase_id: i64) -> Result<i64> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM commits WHERE codebase_id = ?")
        .bind(codebase_id)
        .fetch_one(exec)
        .await?;
    Ok(n)
}

pub async fn get_by_hash<'e, E: SqliteExecutor<'e>>(
    exec: E,
    codebase_id: i64,
    hash: &str,
) -> Result<Option<Commit>> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM commits WHERE codebase_id = ? AND hash = ?"
    ))
    .bind(codebase_id)
    .bind(hash)
    .fetch_optional(exec)
    .await?;
    row.as_ref().map(row_to_commit).transpose()
}

/// Commits owned by a branch, oldest first.
pub async fn list_for_branch<'e, E: SqliteExecutor<'e>>(
    exec: E,
    branch_id: i64,
) -> Result<Vec<Commit>> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM commits WHERE branch_id = ? ORDER BY committed_at, hash"
    ))
    .bind(branch_id)
    .fetch_all(exec)
    .await?;
    rows.iter().map(row_to_commit).collect()
}

/// Current-user commits with `start <= committed_at < end`, oldest first.
pub async fn list_user_commits_between<'e, E: SqliteExecutor<'e>>(
    exec: E,
    codebase_id: i64,
    start: i64,
    end: i64,
) -> Result<Vec<Commit>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {COLUMNS} FROM commits
        WHERE codebase_id = ? AND is_user_commit = 1
          AND committed_at >= ? AND committed_at < ?
        ORDER BY committed_at, hash
        "#
    ))
    .bind(codebase_id)
    .bind(start)
    .bind(end)
    .fetch_all(exec)
    .await?;
    rows.iter().map(row_to_commit).collect()
}

/// Current-user commits owned by a branch, oldest first.
pub async fn list_user_commits_for_branch<'e, E: SqliteExecutor<'e>>(
    exec: E,
    branch_id: i64,
) -> Result<Vec<Commit>> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM commits WHERE branch_id = ? AND is_user_commit = 1 ORDER BY committed_at, hash"
    ))
    .bind(branch_id)
    .fetch_all(exec)
    .await?;
    rows.iter().map(row_to_commit).collect()
}

/// User commits still waiting for a summary (never attempted or failed).
pub async fn list_pending_summaries<'e, E: SqliteExecutor<'e>>(
    exec: E,
    codebase_id: i64,
    limit: Option<usize>,
) -> Result<Vec<Commit>> {
    let limit_val = limit.map(|l| l as i64).unwrap_or(-1);
    let rows = sqlx::query(&format!(
        r#"
        SELECT {COLUMNS} FROM commits
        WHERE codebase_id = ? AND is_user_commit = 1
          AND summary_status IN ('pending', 'missing')
        ORDER BY committed_at, hash
        LIMIT ?
        "#
    ))
    .bind(codebase_id)
    .bind(limit_val)
    .fetch_all(exec)
    .await?;
    rows.iter().map(row_to_commit).collect()
}

pub async fn set_summary<'e, E: SqliteExecutor<'e>>(
    exec: E,
    commit_id: i64,
    summary: &str,
    embedding: Option<&[f32]>,
) -> Result<()> {
    sqlx::query(
        "UPDATE commits SET summary = ?, summary_status = 'done', embedding = COALESCE(?, embedding) WHERE id = ?",
    )
    .bind(summary)
    .bind(embedding.map(vec_to_blob))
    .bind(commit_id)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn mark_summary_missing<'e, E: SqliteExecutor<'e>>(exec: E, commit_id: i64) -> Result<()> {
    sqlx::query("UPDATE commits SET summary_status = 'missing' WHERE id = ?")
        .bind(commit_id)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn file_changes<'e, E: SqliteExecutor<'e>>(
    exec: E,
    commit_id: i64,
) -> Result<Vec<FileChange>> {
    let rows = sqlx::query(
        "SELECT id, commit_id, path, change_kind, additions, deletions, diff FROM file_changes WHERE commit_id = ? ORDER BY path",
    )
    .bind(commit_id)
    .fetch_all(exec)
    .await?;

    rows.iter()
        .map(|row| {
            let kind: String = row.try_get("change_kind")?;
            Ok(FileChange {
                id: row.try_get("id")?,
                commit_id: row.try_get("commit_id")?,
                path: row.try_get("path")?,
                change_kind: ChangeKind::parse(&kind),
                additions: row.try_get("additions")?,
                deletions: row.try_get("deletions")?,
                diff: row.try_get("diff")?,
            })
        })
        .collect()
}

pub(crate) fn row_to_commit(row: &SqliteRow) -> Result<Commit> {
    let status: String = row.try_get("summary_status")?;
    Ok(Commit {
        id: row.try_get("id")?,
        codebase_id: row.try_get("codebase_id")?,
        branch_id: row.try_get("branch_id")?,
        hash: row.try_get("hash")?,
        author_name: row.try_get("author_name")?,
        author_email: row.try_get("author_email")?,
        message: row.try_get("message")?,
        summary: row.try_get("summary")?,
        summary_status: SummaryStatus::parse(&status),
        committed_at: row.try_get("committed_at")?,
        files_changed: row.try_get("files_changed")?,
        additions: row.try_get("additions")?,
        deletions: row.try_get("deletions")?,
        is_default_branch: row.try_get("is_default_branch")?,
        is_user_commit: row.try_get("is_user_commit")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::codebases;
    use crate::store::test_support::migrated_pool;

    fn commit(hash: &str, user: bool, at: i64) -> NewCommit {
        NewCommit {
            branch_id: None,
            hash: hash.into(),
            author_name: "Ada".into(),
            author_email: "ada@example.com".into(),
            message: format!("commit {hash}"),
            committed_at: at,
            files_changed: 1,
            additions: 10,
            deletions: 2,
            is_default_branch: true,
            is_user_commit: user,
        }
    }

    #[tokio::test]
    async fn test_first_insert_wins() {
        let (_tmp, pool) = migrated_pool().await;
        let cb = codebases::upsert(&pool, "/src/app", "app").await.unwrap();

        let first = insert_if_absent(&pool, cb, &commit("abc", true, 10)).await.unwrap();
        let mut again = commit("abc", true, 10);
        again.is_default_branch = false;
        let second = insert_if_absent(&pool, cb, &again).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        let stored = get_by_hash(&pool, cb, "abc").await.unwrap().unwrap();
        assert!(stored.is_default_branch);
        assert_eq!(count(&pool, cb).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_same_hash_in_two_codebases() {
        let (_tmp, pool) = migrated_pool().await;
        let a = codebases::upsert(&pool, "/src/a", "a").await.unwrap();
        let b = codebases::upsert(&pool, "/src/b", "b").await.unwrap();

        assert!(insert_if_absent(&pool, a, &commit("abc", false, 1)).await.unwrap().is_some());
        assert!(insert_if_absent(&pool, b, &commit("abc", false, 1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pending_summary_lifecycle() {
        let (_tmp, pool) = migrated_pool().await;
        let cb = codebases::upsert(&pool, "/src/app", "app").await.unwrap();
        let mine = insert_if_absent(&pool, cb, &commit("u1", true, 5)).await.unwrap().unwrap();
        insert_if_absent(&pool, cb, &commit("o1", false, 6)).await.unwrap();

        let pending = list_pending_summaries(&pool, cb, None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].hash, "u1");

        mark_summary_missing(&pool, mine).await.unwrap();
        let pending = list_pending_summaries(&pool, cb, None).await.unwrap();
        assert_eq!(pending[0].summary_status, SummaryStatus::Missing);

        set_summary(&pool, mine, "Added login", Some(&[1.0, 0.0])).await.unwrap();
        assert!(list_pending_summaries(&pool, cb, None).await.unwrap().is_empty());
        let stored = get_by_hash(&pool, cb, "u1").await.unwrap().unwrap();
        assert_eq!(stored.summary.as_deref(), Some("Added login"));
        assert_eq!(stored.summary_status, SummaryStatus::Done);
    }

    #[tokio::test]
    async fn test_user_commit_window_is_half_open() {
        let (_tmp, pool) = migrated_pool().await;
        let cb = codebases::upsert(&pool, "/src/app", "app").await.unwrap();
        for (hash, at) in [("a", 99), ("b", 100), ("c", 199), ("d", 200)] {
            insert_if_absent(&pool, cb, &commit(hash, true, at)).await.unwrap();
        }

        let window = list_user_commits_between(&pool, cb, 100, 200).await.unwrap();
        let hashes: Vec<_> = window.iter().map(|c| c.hash.as_str()).collect();
        assert_eq!(hashes, vec!["b", "c"]);
    }
}
