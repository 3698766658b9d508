//! Storage engine adapter.
//!
//! Thin layer over `sqlx` SQLite pools: connection setup for the single
//! writer and the read-only readers, the transaction helper every
//! multi-step write goes through, and a raw passthrough query that returns
//! rows as JSON objects.

use futures::FutureExt;
use serde_json::{Map, Value};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Column, Row, SqliteConnection, TypeInfo, ValueRef};
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Open the writable pool for a store file, creating it if missing.
///
/// The pool holds exactly one connection; every write in the process goes
/// through it.
pub async fn connect_writer(db_path: &Path, busy_timeout: Duration) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(busy_timeout)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Open a read-only pool. Never creates the file and never takes the
/// profile's write lock.
pub async fn connect_reader(db_path: &Path, max_connections: u32) -> Result<SqlitePool> {
    if !db_path.exists() {
        return Err(EngineError::NotInitialized(db_path.display().to_string()));
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .read_only(true)
        .busy_timeout(Duration::from_secs(1));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Run `f` inside a transaction.
///
/// Commits when `f` returns `Ok`. On `Err` the transaction is rolled back
/// and the error is returned unchanged. If `f` panics the transaction is
/// rolled back and the panic is resumed.
pub async fn with_transaction<T, F>(pool: &SqlitePool, f: F) -> Result<T>
where
    F: AsyncFnOnce(&mut SqliteConnection) -> Result<T>,
{
    let mut tx = pool.begin().await?;

    let outcome = AssertUnwindSafe(f(&mut *tx)).catch_unwind().await;

    match outcome {
        Ok(Ok(value)) => {
            tx.commit().await?;
            Ok(value)
        }
        Ok(Err(err)) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "rollback after failed transaction also failed");
            }
            Err(err)
        }
        Err(panic) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "rollback after panic failed");
            }
            std::panic::resume_unwind(panic)
        }
    }
}

/// Execute arbitrary SQL and return each row as a JSON object keyed by
/// column name. BLOB columns are reported by size only.
pub async fn raw_query(pool: &SqlitePool, sql: &str) -> Result<Vec<Map<String, Value>>> {
    let rows = sqlx::query(sql).fetch_all(pool).await?;
    rows.iter().map(row_to_json).collect()
}

fn row_to_json(row: &SqliteRow) -> Result<Map<String, Value>> {
    let mut map = Map::new();

    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let kind = raw.type_info().name().to_string();
            match kind.as_str() {
                "INTEGER" | "BOOLEAN" => Value::from(row.try_get::<i64, _>(i)?),
                "REAL" => serde_json::Number::from_f64(row.try_get::<f64, _>(i)?)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                "BLOB" => {
                    let bytes: Vec<u8> = row.try_get(i)?;
                    Value::String(format!("<{} bytes>", bytes.len()))
                }
                _ => Value::String(row.try_get::<String, _>(i)?),
            }
        };
        map.insert(column.name().to_string(), value);
    }

    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn scratch_pool(tmp: &TempDir) -> SqlitePool {
        let pool = connect_writer(&tmp.path().join("scratch.db"), Duration::from_secs(1))
            .await
            .unwrap();
        sqlx::query("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL, score REAL, data BLOB)")
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    async fn count(pool: &SqlitePool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM items")
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_transaction_commits_on_ok() {
        let tmp = TempDir::new().unwrap();
        let pool = scratch_pool(&tmp).await;

        let id = with_transaction(&pool, async |conn: &mut SqliteConnection| {
            sqlx::query("INSERT INTO items (name) VALUES ('a')")
                .execute(&mut *conn)
                .await?;
            sqlx::query("INSERT INTO items (name) VALUES ('b')")
                .execute(&mut *conn)
                .await?;
            Ok(2)
        })
        .await
        .unwrap();

        assert_eq!(id, 2);
        assert_eq!(count(&pool).await, 2);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let tmp = TempDir::new().unwrap();
        let pool = scratch_pool(&tmp).await;

        let result: Result<()> = with_transaction(&pool, async |conn: &mut SqliteConnection| {
            sqlx::query("INSERT INTO items (name) VALUES ('a')")
                .execute(&mut *conn)
                .await?;
            Err(EngineError::Migration("boom".into()))
        })
        .await;

        assert!(matches!(result, Err(EngineError::Migration(_))));
        assert_eq!(count(&pool).await, 0);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_and_resumes_panic() {
        let tmp = TempDir::new().unwrap();
        let pool = scratch_pool(&tmp).await;

        let inner = pool.clone();
        let handle = tokio::spawn(async move {
            let _: Result<()> = with_transaction(&inner, async |conn: &mut SqliteConnection| {
                sqlx::query("INSERT INTO items (name) VALUES ('a')")
                    .execute(&mut *conn)
                    .await?;
                panic!("mutation exploded");
            })
            .await;
        });

        let join = handle.await;
        assert!(join.unwrap_err().is_panic());
        assert_eq!(count(&pool).await, 0);
    }

    #[tokio::test]
    async fn test_raw_query_maps_column_types() {
        let tmp = TempDir::new().unwrap();
        let pool = scratch_pool(&tmp).await;
        sqlx::query("INSERT INTO items (name, score, data) VALUES ('x', 0.5, X'0102')")
            .execute(&pool)
            .await
            .unwrap();

        let rows = raw_query(&pool, "SELECT id, name, score, data, NULL AS missing FROM items")
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row["id"], Value::from(1));
        assert_eq!(row["name"], Value::from("x"));
        assert_eq!(row["score"], Value::from(0.5));
        assert_eq!(row["data"], Value::from("<2 bytes>"));
        assert_eq!(row["missing"], Value::Null);
    }

    #[tokio::test]
    async fn test_reader_requires_existing_file() {
        let tmp = TempDir::new().unwrap();
        let err = connect_reader(&tmp.path().join("missing.db"), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotInitialized(_)));
    }
}
