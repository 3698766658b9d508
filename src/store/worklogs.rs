use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteExecutor};

use super::now;
use crate::error::Result;
use crate::models::WorklogEntry;

const COLUMNS: &str = "id, codebase_id, profile, group_by, scope_key, fingerprint, commit_count, additions, deletions, files_changed, content, created_at";

/// A digest ready to be cached for one scope.
#[derive(Debug, Clone)]
pub struct NewWorklog<'a> {
    pub profile: &'a str,
    pub group_by: &'a str,
    pub scope_key: &'a str,
    pub fingerprint: &'a str,
    pub commit_count: i64,
    pub additions: i64,
    pub deletions: i64,
    pub files_changed: i64,
    pub content: &'a str,
}

/// Stored aggregate counts for one scope, without the digest text.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorklogSummary {
    pub group_by: String,
    pub scope_key: String,
    pub commit_count: i64,
    pub additions: i64,
    pub deletions: i64,
    pub files_changed: i64,
    pub created_at: i64,
}

pub async fn get<'e, E: SqliteExecutor<'e>>(
    exec: E,
    codebase_id: i64,
    profile: &str,
    group_by: &str,
    scope_key: &str,
) -> Result<Option<WorklogEntry>> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM worklogs WHERE codebase_id = ? AND profile = ? AND group_by = ? AND scope_key = ?"
    ))
    .bind(codebase_id)
    .bind(profile)
    .bind(group_by)
    .bind(scope_key)
    .fetch_optional(exec)
    .await?;
    row.as_ref().map(row_to_entry).transpose()
}

/// Store a digest, replacing whatever was cached for the same scope.
pub async fn replace<'e, E: SqliteExecutor<'e>>(
    exec: E,
    codebase_id: i64,
    entry: &NewWorklog<'_>,
) -> Result<WorklogEntry> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO worklogs (codebase_id, profile, group_by, scope_key, fingerprint, commit_count,
                              additions, deletions, files_changed, content, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(codebase_id, profile, group_by, scope_key) DO UPDATE SET
            fingerprint = excluded.fingerprint,
            commit_count = excluded.commit_count,
            additions = excluded.additions,
            deletions = excluded.deletions,
            files_changed = excluded.files_changed,
            content = excluded.content,
            created_at = excluded.created_at
        RETURNING {COLUMNS}
        "#
    ))
    .bind(codebase_id)
    .bind(entry.profile)
    .bind(entry.group_by)
    .bind(entry.scope_key)
    .bind(entry.fingerprint)
    .bind(entry.commit_count)
    .bind(entry.additions)
    .bind(entry.deletions)
    .bind(entry.files_changed)
    .bind(entry.content)
    .bind(now())
    .fetch_one(exec)
    .await?;
    row_to_entry(&row)
}

/// Cached scopes of one kind, newest scope first.
pub async fn list<'e, E: SqliteExecutor<'e>>(
    exec: E,
    codebase_id: i64,
    profile: &str,
    group_by: &str,
) -> Result<Vec<WorklogSummary>> {
    let rows = sqlx::query(
        r#"
        SELECT group_by, scope_key, commit_count, additions, deletions, files_changed, created_at
        FROM worklogs
        WHERE codebase_id = ? AND profile = ? AND group_by = ?
        ORDER BY scope_key DESC
        "#,
    )
    .bind(codebase_id)
    .bind(profile)
    .bind(group_by)
    .fetch_all(exec)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(WorklogSummary {
                group_by: row.try_get("group_by")?,
                scope_key: row.try_get("scope_key")?,
                commit_count: row.try_get("commit_count")?,
                additions: row.try_get("additions")?,
                deletions: row.try_get("deletions")?,
                files_changed: row.try_get("files_changed")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

fn row_to_entry(row: &SqliteRow) -> Result<WorklogEntry> {
    Ok(WorklogEntry {
        id: row.try_get("id")?,
        codebase_id: row.try_get("codebase_id")?,
        profile: row.try_get("profile")?,
        group_by: row.try_get("group_by")?,
        scope_key: row.try_get("scope_key")?,
        fingerprint: row.try_get("fingerprint")?,
        commit_count: row.try_get("commit_count")?,
        additions: row.try_get("additions")?,
        deletions: row.try_get("deletions")?,
        files_changed: row.try_get("files_changed")?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::codebases;
    use crate::store::test_support::migrated_pool;

    fn entry<'a>(scope: &'a str, fingerprint: &'a str, content: &'a str) -> NewWorklog<'a> {
        NewWorklog {
            profile: "work",
            group_by: "day",
            scope_key: scope,
            fingerprint,
            commit_count: 2,
            additions: 10,
            deletions: 1,
            files_changed: 3,
            content,
        }
    }

    #[tokio::test]
    async fn test_replace_overwrites_scope() {
        let (_tmp, pool) = migrated_pool().await;
        let cb = codebases::upsert(&pool, "/src/app", "app").await.unwrap();

        let first = replace(&pool, cb, &entry("2024-03-01", "f1", "old")).await.unwrap();
        let second = replace(&pool, cb, &entry("2024-03-01", "f2", "new")).await.unwrap();

        assert_eq!(first.id, second.id);
        let stored = get(&pool, cb, "work", "day", "2024-03-01").await.unwrap().unwrap();
        assert_eq!(stored.fingerprint, "f2");
        assert_eq!(stored.content, "new");
    }

    #[tokio::test]
    async fn test_list_is_per_profile_and_kind() {
        let (_tmp, pool) = migrated_pool().await;
        let cb = codebases::upsert(&pool, "/src/app", "app").await.unwrap();
        replace(&pool, cb, &entry("2024-03-01", "f", "a")).await.unwrap();
        replace(&pool, cb, &entry("2024-03-02", "f", "b")).await.unwrap();
        let mut other = entry("2024-03-02", "f", "c");
        other.profile = "home";
        replace(&pool, cb, &other).await.unwrap();

        let listed = list(&pool, cb, "work", "day").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|s| s.scope_key.as_str()).collect();
        assert_eq!(keys, vec!["2024-03-02", "2024-03-01"]);
        assert!(list(&pool, cb, "work", "week").await.unwrap().is_empty());
    }
}
