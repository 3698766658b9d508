use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::EngineError;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    pub active_profile: String,
    pub profiles: Vec<ProfileConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub worklog: WorklogConfig,
    #[serde(default)]
    pub summarizer: SummarizerConfig,
}

/// One named, isolated store plus the identity of its "current user".
#[derive(Debug, Deserialize, Clone)]
pub struct ProfileConfig {
    pub name: String,
    pub user_email: String,
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_read_connections")]
    pub read_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            read_connections: default_read_connections(),
        }
    }
}

fn default_lock_timeout_ms() -> u64 {
    5000
}
fn default_read_connections() -> u32 {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexerConfig {
    #[serde(default = "default_max_folder_depth")]
    pub max_folder_depth: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            max_folder_depth: default_max_folder_depth(),
            max_file_bytes: default_max_file_bytes(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_max_folder_depth() -> usize {
    3
}
fn default_max_file_bytes() -> usize {
    256 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_stale_after_days")]
    pub stale_after_days: i64,
    #[serde(default = "default_max_diff_bytes")]
    pub max_diff_bytes: usize,
    #[serde(default = "default_summary_concurrency")]
    pub summary_concurrency: usize,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            stale_after_days: default_stale_after_days(),
            max_diff_bytes: default_max_diff_bytes(),
            summary_concurrency: default_summary_concurrency(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

fn default_stale_after_days() -> i64 {
    30
}
fn default_max_diff_bytes() -> usize {
    16 * 1024
}
fn default_summary_concurrency() -> usize {
    4
}
fn default_call_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WorklogConfig {
    /// Offset applied when bucketing commit timestamps into days.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SummarizerConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            embedding_model: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    60
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("worktrail")
}

impl SummarizerConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl Config {
    pub fn profile(&self, name: &str) -> Option<&ProfileConfig> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Storage file for a profile: the explicit path if configured, else
    /// `<data_dir>/profiles/<name>/worktrail.db`.
    pub fn profile_db_path(&self, profile: &ProfileConfig) -> PathBuf {
        match &profile.storage_path {
            Some(path) => path.clone(),
            None => self
                .data_dir
                .join("profiles")
                .join(&profile.name)
                .join("worktrail.db"),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.profiles.is_empty() {
        bail!("at least one [[profiles]] entry is required");
    }

    let mut seen = HashSet::new();
    for profile in &config.profiles {
        if profile.name.trim().is_empty() {
            bail!("profile names must be non-empty");
        }
        if !seen.insert(profile.name.as_str()) {
            return Err(EngineError::Conflict {
                entity: "profile",
                key: profile.name.clone(),
            }
            .into());
        }
    }

    if config.profile(&config.active_profile).is_none() {
        bail!(
            "active_profile '{}' does not name a configured profile",
            config.active_profile
        );
    }

    if config.storage.lock_timeout_ms == 0 {
        bail!("storage.lock_timeout_ms must be > 0");
    }

    if config.indexer.max_folder_depth == 0 {
        bail!("indexer.max_folder_depth must be >= 1");
    }

    if config.ingest.summary_concurrency == 0 {
        bail!("ingest.summary_concurrency must be >= 1");
    }

    if config.worklog.utc_offset_minutes.abs() > 14 * 60 {
        bail!("worklog.utc_offset_minutes must be within +/- 840");
    }

    match config.summarizer.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown summarizer provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    if config.summarizer.is_enabled() && config.summarizer.model.is_none() {
        bail!(
            "summarizer.model must be specified when provider is '{}'",
            config.summarizer.provider
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse(
            r#"
            data_dir = "/tmp/wt"
            active_profile = "work"

            [[profiles]]
            name = "work"
            user_email = "me@example.com"
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.lock_timeout_ms, 5000);
        assert_eq!(config.indexer.max_folder_depth, 3);
        assert!(!config.summarizer.is_enabled());
        let profile = config.profile("work").unwrap();
        assert_eq!(
            config.profile_db_path(profile),
            PathBuf::from("/tmp/wt/profiles/work/worktrail.db")
        );
    }

    #[test]
    fn test_duplicate_profile_is_conflict() {
        let err = parse(
            r#"
            active_profile = "work"

            [[profiles]]
            name = "work"
            user_email = "a@example.com"

            [[profiles]]
            name = "work"
            user_email = "b@example.com"
            "#,
        )
        .unwrap_err();

        match err.downcast_ref::<EngineError>() {
            Some(EngineError::Conflict { entity, key }) => {
                assert_eq!(*entity, "profile");
                assert_eq!(key, "work");
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_active_profile_rejected() {
        let err = parse(
            r#"
            active_profile = "home"

            [[profiles]]
            name = "work"
            user_email = "a@example.com"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("active_profile"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = parse(
            r#"
            active_profile = "work"

            [[profiles]]
            name = "work"
            user_email = "a@example.com"

            [summarizer]
            provider = "magic"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown summarizer provider"));
    }

    #[test]
    fn test_explicit_storage_path_wins() {
        let config = parse(
            r#"
            active_profile = "work"

            [[profiles]]
            name = "work"
            user_email = "a@example.com"
            storage_path = "/data/custom.db"
            "#,
        )
        .unwrap();
        let profile = config.profile("work").unwrap();
        assert_eq!(config.profile_db_path(profile), PathBuf::from("/data/custom.db"));
    }
}
