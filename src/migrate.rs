use sqlx::SqlitePool;

use crate::error::{EngineError, Result};

/// Base schema. Every statement is idempotent.
const SCHEMA_SQL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS codebases (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        summary TEXT,
        language_stats TEXT NOT NULL DEFAULT '{}',
        default_branch TEXT,
        last_indexed_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS branches (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        codebase_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        is_default INTEGER NOT NULL DEFAULT 0,
        base_branch TEXT,
        summary TEXT,
        status TEXT NOT NULL DEFAULT 'active',
        first_commit TEXT,
        last_commit TEXT,
        commit_count INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE(codebase_id, name),
        FOREIGN KEY (codebase_id) REFERENCES codebases(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS developers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        email TEXT NOT NULL UNIQUE,
        is_current_user INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS commits (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        codebase_id INTEGER NOT NULL,
        branch_id INTEGER,
        hash TEXT NOT NULL,
        author_name TEXT NOT NULL,
        author_email TEXT NOT NULL,
        message TEXT NOT NULL,
        summary TEXT,
        summary_status TEXT NOT NULL DEFAULT 'none',
        committed_at INTEGER NOT NULL,
        files_changed INTEGER NOT NULL DEFAULT 0,
        additions INTEGER NOT NULL DEFAULT 0,
        deletions INTEGER NOT NULL DEFAULT 0,
        is_default_branch INTEGER NOT NULL DEFAULT 0,
        is_user_commit INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        UNIQUE(codebase_id, hash),
        FOREIGN KEY (codebase_id) REFERENCES codebases(id),
        FOREIGN KEY (branch_id) REFERENCES branches(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS file_changes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        commit_id INTEGER NOT NULL,
        path TEXT NOT NULL,
        change_kind TEXT NOT NULL,
        additions INTEGER NOT NULL DEFAULT 0,
        deletions INTEGER NOT NULL DEFAULT 0,
        diff TEXT,
        FOREIGN KEY (commit_id) REFERENCES commits(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS folders (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        codebase_id INTEGER NOT NULL,
        path TEXT NOT NULL,
        parent_path TEXT,
        name TEXT NOT NULL,
        depth INTEGER NOT NULL,
        summary TEXT,
        content_hash TEXT NOT NULL DEFAULT '',
        embedding BLOB,
        indexed_at INTEGER NOT NULL,
        UNIQUE(codebase_id, path),
        FOREIGN KEY (codebase_id) REFERENCES codebases(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS file_index (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        codebase_id INTEGER NOT NULL,
        path TEXT NOT NULL,
        folder_path TEXT,
        name TEXT NOT NULL,
        language TEXT,
        size_bytes INTEGER NOT NULL DEFAULT 0,
        summary TEXT,
        content_hash TEXT NOT NULL DEFAULT '',
        embedding BLOB,
        indexed_at INTEGER NOT NULL,
        UNIQUE(codebase_id, path),
        FOREIGN KEY (codebase_id) REFERENCES codebases(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ingest_cursors (
        codebase_id INTEGER NOT NULL,
        branch TEXT NOT NULL,
        last_commit TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (codebase_id, branch)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS worklogs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        codebase_id INTEGER NOT NULL,
        profile TEXT NOT NULL,
        group_by TEXT NOT NULL,
        scope_key TEXT NOT NULL,
        fingerprint TEXT NOT NULL,
        commit_count INTEGER NOT NULL,
        additions INTEGER NOT NULL DEFAULT 0,
        deletions INTEGER NOT NULL DEFAULT 0,
        files_changed INTEGER NOT NULL DEFAULT 0,
        content TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE(codebase_id, profile, group_by, scope_key)
    )
    "#,
];

/// Columns added after the base schema shipped.
///
/// Each is attempted individually; "duplicate column name" errors are
/// ignored so that stores that already have the column migrate cleanly.
const COLUMN_MIGRATIONS: &[&str] = &[
    "ALTER TABLE branches ADD COLUMN story TEXT",
    "ALTER TABLE commits ADD COLUMN embedding BLOB",
    "ALTER TABLE folders ADD COLUMN purpose TEXT",
    "ALTER TABLE file_index ADD COLUMN purpose TEXT",
    "ALTER TABLE file_index ADD COLUMN line_count INTEGER NOT NULL DEFAULT 0",
];

const INDEX_SQL: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_branches_codebase_id ON branches(codebase_id)",
    "CREATE INDEX IF NOT EXISTS idx_commits_codebase_id ON commits(codebase_id)",
    "CREATE INDEX IF NOT EXISTS idx_commits_author_email ON commits(author_email)",
    "CREATE INDEX IF NOT EXISTS idx_commits_committed_at ON commits(committed_at)",
    "CREATE INDEX IF NOT EXISTS idx_commits_branch_id ON commits(branch_id)",
    "CREATE INDEX IF NOT EXISTS idx_file_changes_commit_id ON file_changes(commit_id)",
    "CREATE INDEX IF NOT EXISTS idx_folders_codebase_id ON folders(codebase_id)",
    "CREATE INDEX IF NOT EXISTS idx_file_index_codebase_id ON file_index(codebase_id)",
    "CREATE INDEX IF NOT EXISTS idx_file_index_language ON file_index(language)",
    "CREATE INDEX IF NOT EXISTS idx_worklogs_codebase_id ON worklogs(codebase_id)",
];

/// Apply the schema and additive migrations. Safe to run on every open.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA_SQL {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| EngineError::Migration(e.to_string()))?;
    }

    for statement in COLUMN_MIGRATIONS {
        if let Err(e) = sqlx::query(statement).execute(pool).await {
            let msg = e.to_string();
            if msg.contains("duplicate column name") {
                continue;
            }
            return Err(EngineError::Migration(format!("{statement}: {msg}")));
        }
    }

    for statement in INDEX_SQL {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| EngineError::Migration(e.to_string()))?;
    }

    tracing::debug!("schema up to date");
    Ok(())
}
