pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod repositories;

pub use client::{
    ApiKeyPool, Article, CacheStatsReport, Credential, EutilsSource, KeyStrategy,
    LiteratureSource, PoolStatus, PubMedClient, RateGovernor, SearchResult, SortOrder,
};
pub use crate::config::{AbstractMode, Config};
pub use error::{Error, ErrorCategory, Result};
pub use repositories::{CacheNamespace, FileCache, MemoryCache};
