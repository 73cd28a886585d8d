//! Document service for edstore
//!
//! This crate wires the lower layers into one service:
//! - DocumentService: upsert, update, get, query, delete
//! - ReferenceValidator: batch reference checks, cache first
//! - ExistenceCache: ids this process inserted
//! - SearchIndexProjector: worker pool keeping the search index in step
//! - BackendRegistry: config key -> storage engine constructor
//! - EdstoreConfig: `edstore.toml`
//!
//! The service is the only component that knows about every other one;
//! repositories, the search index and the cache never see each other.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod config;
pub mod error;
pub mod projector;
pub mod registry;
pub mod service;
pub mod telemetry;
pub mod validation;

pub use cache::{ExistenceCache, InMemoryExistenceCache, NoopExistenceCache};
pub use config::{
    CacheConfig, EdstoreConfig, LoggingConfig, ProjectionConfig, QueryConfig, QuerySource,
    RedbConfig, SqliteConfig, ValidationConfig, CONFIG_FILE_NAME,
};
pub use error::{EngineError, EngineResult};
pub use projector::{
    ChangeKind, ProjectionFailure, ProjectionStats, ReindexReport, SearchIndexProjector,
};
pub use registry::{BackendConstructor, BackendRegistry};
pub use service::{DocumentService, UNKNOWN_FAILURE_MESSAGE};
pub use validation::{DescriptorPolicy, ReferenceValidator, ValidationResult};

pub use edstore_search::{IndexError, ProjectionSink, SearchIndex};
pub use edstore_storage::{DocumentRepository, StoreError};
