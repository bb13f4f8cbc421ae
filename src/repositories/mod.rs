//! # Cache Repositories
//!
//! Two cache tiers sit in front of the upstream service:
//!
//! - [`MemoryCache`]: capacity-bounded, TTL-based, process-local cache of full
//!   search results with LRU eviction
//! - [`FileCache`]: one durable file per record plus a manifest per record type,
//!   surviving restarts
//!
//! Caches are an optimization, not a source of truth. Storage failures are
//! reported as [`RepositoryError`] internally and absorbed at the public
//! surface as misses or no-ops.
//!
//! ## Usage Example
//!
//! ```no_run
//! use pubmed_research_mcp::repositories::{CacheNamespace, FileCache, MemoryCache};
//! use std::path::Path;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let memory: MemoryCache<String> = MemoryCache::new(100, Duration::from_secs(300));
//! memory.set("key", "value".to_string());
//! assert_eq!(memory.get("key"), Some("value".to_string()));
//!
//! let papers = FileCache::open(Path::new("cache"), CacheNamespace::papers(Duration::from_secs(86_400))).await;
//! papers.set_record("12345", &serde_json::json!({ "title": "Example" })).await;
//! # }
//! ```

pub mod cache;
pub mod file_cache;

pub use cache::{cache_key, MemoryCache, MemoryCacheStats};
pub use file_cache::{CacheIndex, CacheNamespace, FileCache, FileCacheStats, IndexEntry, IndexStats};

/// Storage-level error types
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Constraint violation: {message}")]
    ConstraintViolation { message: String },
}

impl From<std::io::Error> for RepositoryError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<RepositoryError> for crate::Error {
    fn from(err: RepositoryError) -> Self {
        Self::Cache {
            operation: "repository".to_string(),
            reason: err.to_string(),
        }
    }
}

/// Repository result type
pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;
