//! Folder and file records mirroring a working tree.

use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqliteExecutor};
use std::collections::HashMap;

use crate::embedding::vec_to_blob;
use crate::error::Result;
use crate::models::{FileIndex, Folder};

/// Bound parameters per batched DELETE.
const DELETE_BATCH: usize = 500;

const FILE_COLUMNS: &str = "id, codebase_id, path, folder_path, name, language, size_bytes, line_count, summary, purpose, content_hash, embedding IS NOT NULL AS has_embedding, indexed_at";
const FOLDER_COLUMNS: &str = "id, codebase_id, path, parent_path, name, depth, summary, purpose, content_hash, embedding IS NOT NULL AS has_embedding, indexed_at";

#[derive(Debug, Clone)]
pub struct FileRecord<'a> {
    pub path: &'a str,
    pub folder_path: Option<&'a str>,
    pub name: &'a str,
    pub language: Option<&'a str>,
    pub size_bytes: i64,
    pub line_count: i64,
    pub summary: Option<&'a str>,
    pub purpose: Option<&'a str>,
    /// Empty when enrichment failed, so the next pass sees the row as changed.
    pub content_hash: &'a str,
    pub embedding: Option<&'a [f32]>,
}

#[derive(Debug, Clone)]
pub struct FolderRecord<'a> {
    pub path: &'a str,
    pub parent_path: Option<&'a str>,
    pub name: &'a str,
    pub depth: i64,
    pub summary: Option<&'a str>,
    pub purpose: Option<&'a str>,
    pub content_hash: &'a str,
    pub embedding: Option<&'a [f32]>,
}

/// Stored `path -> content_hash` for every file of a codebase.
pub async fn file_hashes<'e, E: SqliteExecutor<'e>>(
    exec: E,
    codebase_id: i64,
) -> Result<HashMap<String, String>> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT path, content_hash FROM file_index WHERE codebase_id = ?")
            .bind(codebase_id)
            .fetch_all(exec)
            .await?;
    Ok(rows.into_iter().collect())
}

/// Stored `path -> content_hash` for every folder of a codebase.
pub async fn folder_hashes<'e, E: SqliteExecutor<'e>>(
    exec: E,
    codebase_id: i64,
) -> Result<HashMap<String, String>> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT path, content_hash FROM folders WHERE codebase_id = ?")
            .bind(codebase_id)
            .fetch_all(exec)
            .await?;
    Ok(rows.into_iter().collect())
}

pub async fn upsert_file<'e, E: SqliteExecutor<'e>>(
    exec: E,
    codebase_id: i64,
    record: &FileRecord<'_>,
    indexed_at: i64,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO file_index (codebase_id, path, folder_path, name, language, size_bytes,
                                line_count, summary, purpose, content_hash, embedding, indexed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(codebase_id, path) DO UPDATE SET
            folder_path = excluded.folder_path,
            name = excluded.name,
            language = excluded.language,
            size_bytes = excluded.size_bytes,
            line_count = excluded.line_count,
            summary = excluded.summary,
            purpose = excluded.purpose,
            content_hash = excluded.content_hash,
            embedding = excluded.embedding,
            indexed_at = excluded.indexed_at
        RETURNING id
        "#,
    )
    .bind(codebase_id)
    .bind(record.path)
    .bind(record.folder_path)
    .bind(record.name)
    .bind(record.language)
    .bind(record.size_bytes)
    .bind(record.line_count)
    .bind(record.summary)
    .bind(record.purpose)
    .bind(record.content_hash)
    .bind(record.embedding.map(vec_to_blob))
    .bind(indexed_at)
    .fetch_one(exec)
    .await?;
    Ok(id)
}

pub async fn upsert_folder<'e, E: SqliteExecutor<'e>>(
    exec: E,
    codebase_id: i64,
    record: &FolderRecord<'_>,
    indexed_at: i64,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO folders (codebase_id, path, parent_path, name, depth, summary, purpose,
                             content_hash, embedding, indexed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(codebase_id, path) DO UPDATE SET
            parent_path = excluded.parent_path,
            name = excluded.name,
            depth = excluded.depth,
            summary = excluded.summary,
            purpose = excluded.purpose,
            content_hash = excluded.content_hash,
            embedding = excluded.embedding,
            indexed_at = excluded.indexed_at
        RETURNING id
        "#,
    )
    .bind(codebase_id)
    .bind(record.path)
    .bind(record.parent_path)
    .bind(record.name)
    .bind(record.depth)
    .bind(record.summary)
    .bind(record.purpose)
    .bind(record.content_hash)
    .bind(record.embedding.map(vec_to_blob))
    .bind(indexed_at)
    .fetch_one(exec)
    .await?;
    Ok(id)
}

/// Delete file rows by path. Returns the number of rows removed.
pub async fn delete_files(
    conn: &mut SqliteConnection,
    codebase_id: i64,
    paths: &[String],
) -> Result<u64> {
    delete_paths(conn, "file_index", codebase_id, paths).await
}

/// Delete folder rows by path. Returns the number of rows removed.
pub async fn delete_folders(
    conn: &mut SqliteConnection,
    codebase_id: i64,
    paths: &[String],
) -> Result<u64> {
    delete_paths(conn, "folders", codebase_id, paths).await
}

async fn delete_paths(
    conn: &mut SqliteConnection,
    table: &'static str,
    codebase_id: i64,
    paths: &[String],
) -> Result<u64> {
    let mut removed = 0;
    for chunk in paths.chunks(DELETE_BATCH) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM ");
        qb.push(table);
        qb.push(" WHERE codebase_id = ");
        qb.push_bind(codebase_id);
        qb.push(" AND path IN (");
        let mut separated = qb.separated(", ");
        for path in chunk {
            separated.push_bind(path);
        }
        separated.push_unseparated(")");

        removed += qb.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(removed)
}

pub async fn list_files<'e, E: SqliteExecutor<'e>>(
    exec: E,
    codebase_id: i64,
) -> Result<Vec<FileIndex>> {
    let rows = sqlx::query(&format!(
        "SELECT {FILE_COLUMNS} FROM file_index WHERE codebase_id = ? ORDER BY path"
    ))
    .bind(codebase_id)
    .fetch_all(exec)
    .await?;
    rows.iter().map(row_to_file).collect()
}

pub async fn get_file<'e, E: SqliteExecutor<'e>>(
    exec: E,
    codebase_id: i64,
    path: &str,
) -> Result<Option<FileIndex>> {
    let row = sqlx::query(&format!(
        "SELECT {FILE_COLUMNS} FROM file_index WHERE codebase_id = ? AND path = ?"
    ))
    .bind(codebase_id)
    .bind(path)
    .fetch_optional(exec)
    .await?;
    row.as_ref().map(row_to_file).transpose()
}

pub async fn list_folders<'e, E: SqliteExecutor<'e>>(
    exec: E,
    codebase_id: i64,
) -> Result<Vec<Folder>> {
    let rows = sqlx::query(&format!(
        "SELECT {FOLDER_COLUMNS} FROM folders WHERE codebase_id = ? ORDER BY path"
    ))
    .bind(codebase_id)
    .fetch_all(exec)
    .await?;
    rows.iter().map(row_to_folder).collect()
}

pub async fn get_folder<'e, E: SqliteExecutor<'e>>(
    exec: E,
    codebase_id: i64,
    path: &str,
) -> Result<Option<Folder>> {
    let row = sqlx::query(&format!(
        "SELECT {FOLDER_COLUMNS} FROM folders WHERE codebase_id = ? AND path = ?"
    ))
    .bind(codebase_id)
    .bind(path)
    .fetch_optional(exec)
    .await?;
    row.as_ref().map(row_to_folder).transpose()
}

fn row_to_file(row: &SqliteRow) -> Result<FileIndex> {
    Ok(FileIndex {
        id: row.try_get("id")?,
        codebase_id: row.try_get("codebase_id")?,
        path: row.try_get("path")?,
        folder_path: row.try_get("folder_path")?,
        name: row.try_get("name")?,
        language: row.try_get("language")?,
        size_bytes: row.try_get("size_bytes")?,
        line_count: row.try_get("line_count")?,
        summary: row.try_get("summary")?,
        purpose: row.try_get("purpose")?,
        content_hash: row.try_get("content_hash")?,
        has_embedding: row.try_get("has_embedding")?,
        indexed_at: row.try_get("indexed_at")?,
    })
}

fn row_to_folder(row: &SqliteRow) -> Result<Folder> {
    Ok(Folder {
        id: row.try_get("id")?,
        codebase_id: row.try_get("codebase_id")?,
        path: row.try_get("path")?,
        parent_path: row.try_get("parent_path")?,
        name: row.try_get("name")?,
        depth: row.try_get("depth")?,
        summary: row.try_get("summary")?,
        purpose: row.try_get("purpose")?,
        content_hash: row.try_get("content_hash")?,
        has_embedding: row.try_get("has_embedding")?,
        indexed_at: row.try_get("indexed_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::codebases;
    use crate::store::test_support::migrated_pool;

    fn file<'a>(path: &'a str, hash: &'a str) -> FileRecord<'a> {
        FileRecord {
            path,
            folder_path: Some("src"),
            name: path.rsplit('/').next().unwrap_or(path),
            language: Some("Rust"),
            size_bytes: 42,
            line_count: 3,
            summary: Some("does things"),
            purpose: None,
            content_hash: hash,
            embedding: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_file_is_keyed_by_path() {
        let (_tmp, pool) = migrated_pool().await;
        let cb = codebases::upsert(&pool, "/src/app", "app").await.unwrap();

        let a = upsert_file(&pool, cb, &file("src/lib.rs", "h1"), 1).await.unwrap();
        let mut changed = file("src/lib.rs", "h2");
        changed.embedding = Some(&[0.5, 0.5]);
        let b = upsert_file(&pool, cb, &changed, 2).await.unwrap();

        assert_eq!(a, b);
        let stored = get_file(&pool, cb, "src/lib.rs").await.unwrap().unwrap();
        assert_eq!(stored.content_hash, "h2");
        assert!(stored.has_embedding);
        assert_eq!(stored.indexed_at, 2);

        let hashes = file_hashes(&pool, cb).await.unwrap();
        assert_eq!(hashes.get("src/lib.rs").map(String::as_str), Some("h2"));
    }

    #[tokio::test]
    async fn test_batched_delete_spans_chunks() {
        let (_tmp, pool) = migrated_pool().await;
        let cb = codebases::upsert(&pool, "/src/app", "app").await.unwrap();

        let paths: Vec<String> = (0..(DELETE_BATCH + 20)).map(|i| format!("f{i}.txt")).collect();
        for p in &paths {
            upsert_file(&pool, cb, &file(p, "h"), 1).await.unwrap();
        }
        upsert_file(&pool, cb, &file("keep.txt", "h"), 1).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let removed = delete_files(&mut conn, cb, &paths).await.unwrap();
        assert_eq!(removed, paths.len() as u64);

        let left = list_files(&mut *conn, cb).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].path, "keep.txt");
    }

    #[tokio::test]
    async fn test_folder_delete_is_scoped_to_codebase() {
        let (_tmp, pool) = migrated_pool().await;
        let a = codebases::upsert(&pool, "/src/a", "a").await.unwrap();
        let b = codebases::upsert(&pool, "/src/b", "b").await.unwrap();
        let record = FolderRecord {
            path: "src",
            parent_path: None,
            name: "src",
            depth: 1,
            summary: None,
            purpose: None,
            content_hash: "x",
            embedding: None,
        };
        upsert_folder(&pool, a, &record, 1).await.unwrap();
        upsert_folder(&pool, b, &record, 1).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        delete_folders(&mut conn, a, &["src".to_string()]).await.unwrap();

        assert!(get_folder(&mut *conn, a, "src").await.unwrap().is_none());
        assert!(get_folder(&mut *conn, b, "src").await.unwrap().is_some());
    }
}
