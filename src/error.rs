//! Error taxonomy for the engine.
//!
//! "Not found" is never an error here: lookups return `Ok(None)` or an empty
//! `Vec` so callers can tell "no data yet" apart from a failure.

use std::time::Duration;

use thiserror::Error;

/// Engine result alias.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum EngineError {
    /// The writable connection for a profile could not be acquired in time.
    ///
    /// Another process (or another handle in this process) holds the
    /// profile's write lock. Retry once it finishes.
    #[error("storage locked: profile `{profile}` is held by another writer (waited {waited:?})")]
    StorageLocked { profile: String, waited: Duration },

    /// A uniquely named entity already exists.
    #[error("{entity} `{key}` already exists")]
    Conflict { entity: &'static str, key: String },

    /// The source-control collaborator failed; the ingest pass was aborted
    /// before anything was written.
    #[error("source control read failed for {codebase} ({branch}): {source}")]
    SourceControl {
        codebase: String,
        branch: String,
        #[source]
        source: anyhow::Error,
    },

    /// The summarization collaborator failed for one unit of work.
    #[error("summarizer failed for {key}: {source}")]
    Summarizer {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// A collaborator call exceeded its deadline.
    #[error("{key} timed out after {after:?}")]
    Timeout { key: String, after: Duration },

    /// Schema creation or an additive migration failed.
    #[error("schema migration failed: {0}")]
    Migration(String),

    /// A read-only connection was requested before the store was created.
    #[error("profile store at {0} has not been initialized")]
    NotInitialized(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// True for failures that are expected to succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::StorageLocked { .. } | EngineError::Timeout { .. }
        )
    }

    pub(crate) fn scm(codebase: &str, branch: &str, source: anyhow::Error) -> Self {
        EngineError::SourceControl {
            codebase: codebase.to_string(),
            branch: branch.to_string(),
            source,
        }
    }
}
