//! Service configuration via `edstore.toml`
//!
//! Every field has a default, so an empty file (or no file) gives a
//! working in-memory service. Sections map one to one onto the
//! collaborators the service builds at startup.

use crate::error::{EngineError, EngineResult};
use crate::validation::DescriptorPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Config file name looked up by deployments.
pub const CONFIG_FILE_NAME: &str = "edstore.toml";

/// Where queries are answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuerySource {
    /// The configured repository (read-your-writes)
    #[default]
    Primary,
    /// The eventually consistent search index
    SearchIndex,
}

/// `[sqlite]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SqliteConfig {
    /// Database file
    #[serde(default = "default_sqlite_path")]
    pub path: PathBuf,
    /// Maximum pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// How long a writer waits on a locked database
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("edstore.sqlite3")
}

fn default_pool_size() -> u32 {
    8
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// `[redb]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RedbConfig {
    /// Database file; `None` keeps the database in memory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Use the existence cache at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Upper bound on remembered ids
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_entries() -> usize {
    100_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_max_entries(),
        }
    }
}

/// `[validation]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationConfig {
    /// Check references before writing
    #[serde(default = "default_true")]
    pub validate_references: bool,
    /// How references to descriptors are treated
    #[serde(default)]
    pub descriptor_policy: DescriptorPolicy,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            validate_references: true,
            descriptor_policy: DescriptorPolicy::default(),
        }
    }
}

/// `[projection]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectionConfig {
    /// Projection worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Pending tasks before new changes are dropped and a reindex is flagged
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Attempts per change before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before retry n is `retry_backoff_ms * n`
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_workers() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    50
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// `[query]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryConfig {
    /// Where queries are answered from
    #[serde(default)]
    pub source: QuerySource,
}

/// `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

/// Service configuration loaded from `edstore.toml`.
///
/// # Example
///
/// ```toml
/// backend = "sqlite"
///
/// [sqlite]
/// path = "/var/lib/edstore/documents.sqlite3"
///
/// [validation]
/// descriptor_policy = "bootstrap"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdstoreConfig {
    /// Registry key of the storage backend
    #[serde(default = "default_backend")]
    pub backend: String,
    /// SQLite backend settings
    #[serde(default)]
    pub sqlite: SqliteConfig,
    /// redb backend settings
    #[serde(default)]
    pub redb: RedbConfig,
    /// Existence cache settings
    #[serde(default)]
    pub cache: CacheConfig,
    /// Reference validation settings
    #[serde(default)]
    pub validation: ValidationConfig,
    /// Search index projection settings
    #[serde(default)]
    pub projection: ProjectionConfig,
    /// Query routing
    #[serde(default)]
    pub query: QueryConfig,
    /// Log filter
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_backend() -> String {
    "memory".to_string()
}

impl Default for EdstoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sqlite: SqliteConfig::default(),
            redb: RedbConfig::default(),
            cache: CacheConfig::default(),
            validation: ValidationConfig::default(),
            projection: ProjectionConfig::default(),
            query: QueryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EdstoreConfig {
    /// Default config for a backend, everything else at defaults
    pub fn for_backend(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            ..Self::default()
        }
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# edstore configuration
#
# Storage backend: "memory" (default), "sqlite" or "redb"
backend = "memory"

[sqlite]
path = "edstore.sqlite3"
pool_size = 8
busy_timeout_ms = 5000

# Omit path to keep the redb database in memory
[redb]
# path = "edstore.redb"

# Remembers ids this process inserted so reference checks can skip the store
[cache]
enabled = true
max_entries = 100000

# descriptor_policy: "strict" (default) checks references to descriptors,
# "bootstrap" defers them so descriptors can be loaded in any order
[validation]
validate_references = true
descriptor_policy = "strict"

# Failed projections retry after retry_backoff_ms * attempt
[projection]
workers = 2
queue_capacity = 10000
max_attempts = 5
retry_backoff_ms = 50

# source: "primary" (default) or "search_index"
[query]
source = "primary"

# Overridden by RUST_LOG when set
[logging]
level = "info"
"#
    }

    /// Read, parse and validate config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EdstoreConfig = toml::from_str(&content).map_err(|e| {
            EngineError::Config(format!(
                "failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> EngineResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> EngineResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings no collaborator can run with
    pub fn validate(&self) -> EngineResult<()> {
        if self.backend.trim().is_empty() {
            return Err(EngineError::Config("backend must not be empty".to_string()));
        }
        if self.sqlite.pool_size == 0 {
            return Err(EngineError::Config(
                "sqlite.pool_size must be greater than 0".to_string(),
            ));
        }
        if self.projection.workers == 0 {
            return Err(EngineError::Config(
                "projection.workers must be greater than 0".to_string(),
            ));
        }
        if self.projection.queue_capacity == 0 {
            return Err(EngineError::Config(
                "projection.queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.projection.max_attempts == 0 {
            return Err(EngineError::Config(
                "projection.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.cache.enabled && self.cache.max_entries == 0 {
            return Err(EngineError::Config(
                "cache.max_entries must be greater than 0 when the cache is enabled".to_string(),
            ));
        }
        Ok(())
    }
}
