//! Backend registry
//!
//! Maps the `backend` key of [`EdstoreConfig`] to a constructor. The
//! choice is made once, at startup; nothing downstream branches on the
//! engine in use.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let mut registry = BackendRegistry::with_builtin();
//! registry.register("custom", |config, index| { ... });
//!
//! let repository = registry.build(&config, index)?;
//! ```

use crate::config::EdstoreConfig;
use crate::error::{EngineError, EngineResult};
use edstore_search::SearchIndex;
use edstore_storage::{
    DocumentRepository, InMemoryDocumentStore, RedbRepository, SqliteOptions, SqliteRepository,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Builds a repository from configuration
///
/// The search index is passed so engines that answer queries from it
/// (redb) share the instance the projector writes to.
pub type BackendConstructor =
    fn(&EdstoreConfig, Arc<SearchIndex>) -> EngineResult<Arc<dyn DocumentRepository>>;

/// Registry of storage backends by configuration key
pub struct BackendRegistry {
    constructors: HashMap<&'static str, BackendConstructor>,
}

impl BackendRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        BackendRegistry {
            constructors: HashMap::new(),
        }
    }

    /// Registry with `memory`, `sqlite` and `redb`
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("memory", build_memory);
        registry.register("sqlite", build_sqlite);
        registry.register("redb", build_redb);
        registry
    }

    /// Register a constructor, replacing any previous one for the key
    pub fn register(&mut self, key: &'static str, constructor: BackendConstructor) {
        self.constructors.insert(key, constructor);
    }

    /// Get the constructor for a key
    pub fn get(&self, key: &str) -> Option<BackendConstructor> {
        self.constructors.get(key).copied()
    }

    /// Build the backend named by `config.backend`
    ///
    /// # Errors
    ///
    /// `UnknownBackend` if nothing is registered under the key, otherwise
    /// whatever the constructor reports.
    pub fn build(
        &self,
        config: &EdstoreConfig,
        index: Arc<SearchIndex>,
    ) -> EngineResult<Arc<dyn DocumentRepository>> {
        let constructor = self
            .get(&config.backend)
            .ok_or_else(|| EngineError::UnknownBackend(config.backend.clone()))?;
        constructor(config, index)
    }

    /// Registered keys, sorted
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.constructors.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Check if a key is registered
    pub fn is_registered(&self, key: &str) -> bool {
        self.constructors.contains_key(key)
    }

    /// Number of registered backends
    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

fn build_memory(
    _config: &EdstoreConfig,
    _index: Arc<SearchIndex>,
) -> EngineResult<Arc<dyn DocumentRepository>> {
    Ok(Arc::new(InMemoryDocumentStore::new()))
}

fn build_sqlite(
    config: &EdstoreConfig,
    _index: Arc<SearchIndex>,
) -> EngineResult<Arc<dyn DocumentRepository>> {
    let options = SqliteOptions {
        path: config.sqlite.path.clone(),
        pool_size: config.sqlite.pool_size,
        busy_timeout: Duration::from_millis(config.sqlite.busy_timeout_ms),
    };
    Ok(Arc::new(SqliteRepository::open(&options)?))
}

fn build_redb(
    config: &EdstoreConfig,
    index: Arc<SearchIndex>,
) -> EngineResult<Arc<dyn DocumentRepository>> {
    Ok(Arc::new(RedbRepository::open(
        config.redb.path.as_deref(),
        index,
    )?))
}
