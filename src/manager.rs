//! Connection / profile manager.
//!
//! A [`Manager`] is created once by the application (or once per test) and
//! passed to whatever needs storage. For each configured profile it hands
//! out a [`ProfileHandle`], which in turn issues:
//!
//! - at most one [`Writer`] at a time, guarded by an exclusive lock file next
//!   to the store; a second request waits up to the configured timeout and
//!   then fails with [`EngineError::StorageLocked`];
//! - any number of [`Reader`]s over read-only connections, which never wait
//!   on the lock and see whatever the writer has committed.
//!
//! ```text
//! Manager ──for_profile("work")──▶ ProfileHandle
//!                                    ├─ writer()  ─▶ Writer  (lock + 1 conn)
//!                                    └─ reader()  ─▶ Reader  (read-only pool)
//! ```

use fs2::FileExt;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::db;
use crate::error::{EngineError, Result};
use crate::migrate;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

pub struct Manager {
    config: Config,
    profiles: Mutex<HashMap<String, Arc<ProfileHandle>>>,
}

impl Manager {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            profiles: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handle for a named profile, creating its store on first use.
    ///
    /// Returns `Ok(None)` when no such profile is configured.
    pub async fn for_profile(&self, name: &str) -> Result<Option<Arc<ProfileHandle>>> {
        if let Some(handle) = self.cached(name) {
            return Ok(Some(handle));
        }

        let Some(profile) = self.config.profile(name) else {
            return Ok(None);
        };

        let db_path = self.config.profile_db_path(profile);
        let handle = Arc::new(ProfileHandle {
            name: profile.name.clone(),
            user_email: profile.user_email.trim().to_lowercase(),
            lock_path: db_path.with_extension("lock"),
            db_path,
            lock_timeout: Duration::from_millis(self.config.storage.lock_timeout_ms),
            read_connections: self.config.storage.read_connections,
        });

        handle.ensure_initialized().await?;

        let mut profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
        let handle = profiles
            .entry(name.to_string())
            .or_insert(handle)
            .clone();
        Ok(Some(handle))
    }

    /// Handle for the configured active profile.
    pub async fn active(&self) -> Result<Arc<ProfileHandle>> {
        let name = self.config.active_profile.clone();
        self.for_profile(&name)
            .await?
            .ok_or_else(|| EngineError::NotInitialized(format!("profile `{name}`")))
    }

    fn cached(&self, name: &str) -> Option<Arc<ProfileHandle>> {
        let profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
        profiles.get(name).cloned()
    }
}

/// Everything needed to open connections into one profile's store.
#[derive(Debug)]
pub struct ProfileHandle {
    name: String,
    user_email: String,
    db_path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    read_connections: u32,
}

impl ProfileHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lower-cased email of the profile's current user.
    pub fn user_email(&self) -> &str {
        &self.user_email
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Acquire the profile's single writable connection.
    ///
    /// Waits up to the configured lock timeout, then fails with
    /// [`EngineError::StorageLocked`]. Schema creation and additive
    /// migrations run every time the writer opens.
    pub async fn writer(&self) -> Result<Writer> {
        let lock = self.acquire_lock().await?;
        let pool = db::connect_writer(&self.db_path, self.lock_timeout).await?;
        migrate::run_migrations(&pool).await?;

        tracing::debug!(profile = %self.name, "writer opened");
        Ok(Writer {
            profile: self.name.clone(),
            pool,
            _lock: lock,
        })
    }

    /// Open a read-only connection pool. Never blocks on the writer.
    pub async fn reader(&self) -> Result<Reader> {
        let pool = db::connect_reader(&self.db_path, self.read_connections).await?;
        Ok(Reader {
            profile: self.name.clone(),
            pool,
        })
    }

    async fn ensure_initialized(&self) -> Result<()> {
        if self.db_path.exists() {
            return Ok(());
        }
        tracing::info!(profile = %self.name, path = %self.db_path.display(), "creating profile store");
        let writer = self.writer().await?;
        writer.close().await;
        Ok(())
    }

    async fn acquire_lock(&self) -> Result<WriteLock> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)?;

        let started = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(WriteLock { file }),
                Err(e) if is_contended(&e) => {}
                Err(e) => return Err(e.into()),
            }

            let waited = started.elapsed();
            if waited >= self.lock_timeout {
                tracing::warn!(profile = %self.name, ?waited, "write lock not acquired");
                return Err(EngineError::StorageLocked {
                    profile: self.name.clone(),
                    waited,
                });
            }

            let remaining = self.lock_timeout - waited;
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(remaining)).await;
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Exclusive advisory lock on the profile's lock file, released on drop.
struct WriteLock {
    file: File,
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// The single writable path into a profile's store.
pub struct Writer {
    profile: String,
    pool: SqlitePool,
    _lock: WriteLock,
}

impl Writer {
    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the connection, then release the lock.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// A read-only path into a profile's store.
#[derive(Clone)]
pub struct Reader {
    profile: String,
    pool: SqlitePool,
}

impl Reader {
    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Raw passthrough query over the read-only connection.
    pub async fn raw_query(&self, sql: &str) -> Result<Vec<Map<String, Value>>> {
        db::raw_query(&self.pool, sql).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProfileConfig, StorageConfig};
    use tempfile::TempDir;

    fn test_config(tmp: &TempDir, lock_timeout_ms: u64) -> Config {
        let mut config: Config = toml::from_str(&format!(
            r#"
            data_dir = "{}"
            active_profile = "work"

            [[profiles]]
            name = "work"
            user_email = "Me@Example.com"
            "#,
            tmp.path().display()
        ))
        .unwrap();
        config.storage = StorageConfig {
            lock_timeout_ms,
            read_connections: 2,
        };
        config.profiles.push(ProfileConfig {
            name: "home".into(),
            user_email: "me@home.net".into(),
            storage_path: None,
        });
        config
    }

    #[tokio::test]
    async fn test_unknown_profile_is_none() {
        let tmp = TempDir::new().unwrap();
        let manager = Manager::new(test_config(&tmp, 200));
        assert!(manager.for_profile("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_profiles_are_isolated() {
        let tmp = TempDir::new().unwrap();
        let manager = Manager::new(test_config(&tmp, 200));

        let work = manager.for_profile("work").await.unwrap().unwrap();
        let home = manager.for_profile("home").await.unwrap().unwrap();

        assert_ne!(work.db_path(), home.db_path());
        assert!(work.db_path().exists());
        assert!(home.db_path().exists());
        assert_eq!(work.user_email(), "me@example.com");
    }

    #[tokio::test]
    async fn test_second_writer_fails_within_timeout() {
        let tmp = TempDir::new().unwrap();
        let manager = Manager::new(test_config(&tmp, 150));
        let handle = manager.for_profile("work").await.unwrap().unwrap();

        let _first = handle.writer().await.unwrap();

        let started = Instant::now();
        let err = handle.writer().await.err().unwrap();
        let elapsed = started.elapsed();

        assert!(matches!(err, EngineError::StorageLocked { .. }));
        assert!(err.is_retryable());
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_writer_available_after_release() {
        let tmp = TempDir::new().unwrap();
        let manager = Manager::new(test_config(&tmp, 150));
        let handle = manager.for_profile("work").await.unwrap().unwrap();

        let first = handle.writer().await.unwrap();
        first.close().await;

        let second = handle.writer().await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_readers_do_not_wait_on_writer() {
        let tmp = TempDir::new().unwrap();
        let manager = Manager::new(test_config(&tmp, 150));
        let handle = manager.for_profile("work").await.unwrap().unwrap();

        let writer = handle.writer().await.unwrap();
        sqlx::query(
            "INSERT INTO codebases (path, name, created_at, updated_at) VALUES ('/r', 'r', 0, 0)",
        )
        .execute(writer.pool())
        .await
        .unwrap();

        let a = handle.reader().await.unwrap();
        let b = handle.reader().await.unwrap();
        let rows = a.raw_query("SELECT path FROM codebases").await.unwrap();
        assert_eq!(rows.len(), 1);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM codebases")
            .fetch_one(b.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_reader_cannot_write() {
        let tmp = TempDir::new().unwrap();
        let manager = Manager::new(test_config(&tmp, 150));
        let handle = manager.for_profile("work").await.unwrap().unwrap();

        let reader = handle.reader().await.unwrap();
        let result = sqlx::query(
            "INSERT INTO codebases (path, name, created_at, updated_at) VALUES ('/r', 'r', 0, 0)",
        )
        .execute(reader.pool())
        .await;
        assert!(result.is_err());
    }
}
