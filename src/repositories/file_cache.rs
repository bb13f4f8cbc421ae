//! # File Cache
//!
//! Durable per-record cache. Each record type lives in its own directory with
//! one file per identifier and a `_index.json` manifest listing the known
//! identifiers and aggregate stats.
//!
//! Record files are written atomically (temp file + rename) before the
//! manifest is touched, both under the manifest lock, so the manifest can lag
//! the record set by at most the write in flight when a process dies. Opening
//! and cleanup reconcile the two.

use super::{RepositoryError, RepositoryResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Manifest schema version
pub const CACHE_VERSION: &str = "1.0";

/// Manifest file name inside each namespace directory
pub const INDEX_FILE: &str = "_index.json";

const DAY_SECS: u64 = 24 * 60 * 60;

/// A record type stored by the file cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNamespace {
    /// Directory name under the cache root
    pub name: String,
    /// Extension of record files
    pub extension: String,
    /// Age after which a record is considered stale
    pub expiry: Duration,
    /// Records larger than this are not stored
    pub max_record_bytes: Option<u64>,
}

impl CacheNamespace {
    /// Article metadata records
    #[must_use]
    pub fn papers(expiry: Duration) -> Self {
        Self {
            name: "papers".to_string(),
            extension: "json".to_string(),
            expiry,
            max_record_bytes: None,
        }
    }

    /// Downloaded full-text PDFs
    #[must_use]
    pub fn fulltext(expiry: Duration, max_record_bytes: u64) -> Self {
        Self {
            name: "fulltext".to_string(),
            extension: "pdf".to_string(),
            expiry,
            max_record_bytes: Some(max_record_bytes),
        }
    }
}

/// Manifest entry for one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub file_name: String,
    pub size_bytes: u64,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub total_entries: u64,
    pub total_size_bytes: u64,
    pub last_cleanup: DateTime<Utc>,
}

/// Manifest document of a namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheIndex {
    pub version: String,
    pub created: DateTime<Utc>,
    pub entries: BTreeMap<String, IndexEntry>,
    pub stats: IndexStats,
}

impl CacheIndex {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            version: CACHE_VERSION.to_string(),
            created: now,
            entries: BTreeMap::new(),
            stats: IndexStats {
                total_entries: 0,
                total_size_bytes: 0,
                last_cleanup: now,
            },
        }
    }

    fn refresh_stats(&mut self) {
        self.stats.total_entries = self.entries.len() as u64;
        self.stats.total_size_bytes = self.entries.values().map(|entry| entry.size_bytes).sum();
    }
}

/// Snapshot of file cache usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub entries: u64,
    pub total_size_bytes: u64,
    pub expiry_days: u64,
    pub last_cleanup: DateTime<Utc>,
    pub directory: PathBuf,
}

impl FileCacheStats {
    /// Calculate hit rate as a percentage
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Disk-backed cache for one record type
#[derive(Debug)]
pub struct FileCache {
    directory: PathBuf,
    namespace: CacheNamespace,
    index: Mutex<CacheIndex>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

impl FileCache {
    /// Open (or create) the namespace directory under `root`.
    ///
    /// Never fails: an unreadable manifest is replaced by a fresh one and a
    /// directory that cannot be created just makes every access a miss.
    pub async fn open(root: &Path, namespace: CacheNamespace) -> Self {
        let directory = root.join(&namespace.name);
        if let Err(e) = fs::create_dir_all(&directory).await {
            warn!("Could not create cache directory {}: {}", directory.display(), e);
        }

        let mut index = match load_index(&directory).await {
            Ok(Some(index)) if index.version == CACHE_VERSION => index,
            Ok(Some(index)) => {
                warn!(
                    "Cache manifest version {} in {} is not {}, starting fresh",
                    index.version,
                    directory.display(),
                    CACHE_VERSION
                );
                CacheIndex::new()
            }
            Ok(None) => CacheIndex::new(),
            Err(e) => {
                warn!("Unreadable cache manifest in {}: {}", directory.display(), e);
                CacheIndex::new()
            }
        };

        reconcile(&directory, &namespace.extension, &mut index).await;
        if let Err(e) = write_index(&directory, &index).await {
            warn!("Could not write cache manifest in {}: {}", directory.display(), e);
        }

        info!(
            "Opened {} cache at {} ({} records)",
            namespace.name,
            directory.display(),
            index.entries.len()
        );

        Self {
            directory,
            namespace,
            index: Mutex::new(index),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    #[must_use]
    pub const fn namespace(&self) -> &CacheNamespace {
        &self.namespace
    }

    /// Read and deserialize a record; any failure is a miss
    pub async fn get_record<T: DeserializeOwned>(&self, id: &str) -> Option<T> {
        let bytes = self.get_bytes(id).await?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Corrupt cache record {} in {}: {}", id, self.namespace.name, e);
                None
            }
        }
    }

    /// Serialize and store a record; failures are logged and ignored
    pub async fn set_record<T: Serialize + ?Sized>(&self, id: &str, value: &T) {
        match serde_json::to_vec_pretty(value) {
            Ok(bytes) => self.set_bytes(id, &bytes).await,
            Err(e) => warn!("Could not serialize cache record {}: {}", id, e),
        }
    }

    /// Raw record contents, `None` on miss, expiry or I/O failure
    pub async fn get_bytes(&self, id: &str) -> Option<Vec<u8>> {
        match self.try_get(id).await {
            Ok(Some(bytes)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("File cache hit for {}/{}", self.namespace.name, id);
                Some(bytes)
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                warn!("File cache read failed for {}/{}: {}", self.namespace.name, id, e);
                None
            }
        }
    }

    /// Store raw record contents; failures are logged and ignored
    pub async fn set_bytes(&self, id: &str, bytes: &[u8]) {
        match self.try_set(id, bytes).await {
            Ok(()) => {
                self.sets.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!("File cache write failed for {}/{}: {}", self.namespace.name, id, e),
        }
    }

    async fn try_get(&self, id: &str) -> RepositoryResult<Option<Vec<u8>>> {
        let path = self.record_path(id)?;

        let modified = match fs::metadata(&path).await {
            Ok(metadata) => metadata.modified()?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.forget(id).await;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if is_stale(modified, self.namespace.expiry) {
            debug!("File cache record {}/{} expired", self.namespace.name, id);
            return Ok(None);
        }

        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.forget(id).await;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn try_set(&self, id: &str, bytes: &[u8]) -> RepositoryResult<()> {
        let path = self.record_path(id)?;
        let size_bytes = bytes.len() as u64;

        if let Some(limit) = self.namespace.max_record_bytes {
            if size_bytes > limit {
                return Err(RepositoryError::ConstraintViolation {
                    message: format!("record of {size_bytes} bytes exceeds limit of {limit}"),
                });
            }
        }

        let mut index = self.index.lock().await;
        write_atomic(&path, bytes).await?;
        index.entries.insert(
            id.to_string(),
            IndexEntry {
                file_name: self.file_name(id),
                size_bytes,
                cached_at: Utc::now(),
            },
        );
        index.refresh_stats();
        write_index(&self.directory, &index).await
    }

    /// Drop a dangling identifier from the manifest
    async fn forget(&self, id: &str) {
        let mut index = self.index.lock().await;
        if index.entries.remove(id).is_some() {
            debug!("Dropping dangling manifest entry {}/{}", self.namespace.name, id);
            index.refresh_stats();
            if let Err(e) = write_index(&self.directory, &index).await {
                warn!("Could not write cache manifest: {}", e);
            }
        }
    }

    /// Delete expired records and reconcile the manifest
    pub async fn clean_expired(&self) -> u64 {
        let mut index = self.index.lock().await;
        let removed = match self.remove_records(|modified| is_stale(modified, self.namespace.expiry)).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!("File cache cleanup failed in {}: {}", self.directory.display(), e);
                0
            }
        };

        reconcile(&self.directory, &self.namespace.extension, &mut index).await;
        index.stats.last_cleanup = Utc::now();
        if let Err(e) = write_index(&self.directory, &index).await {
            warn!("Could not write cache manifest: {}", e);
        }

        info!("Cleaned {} expired records from {} cache", removed, self.namespace.name);
        removed
    }

    /// Delete every record and reset the manifest
    pub async fn clear(&self) -> u64 {
        let mut index = self.index.lock().await;
        let removed = match self.remove_records(|_| true).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!("File cache clear failed in {}: {}", self.directory.display(), e);
                0
            }
        };

        *index = CacheIndex::new();
        reconcile(&self.directory, &self.namespace.extension, &mut index).await;
        if let Err(e) = write_index(&self.directory, &index).await {
            warn!("Could not write cache manifest: {}", e);
        }

        info!("Cleared {} records from {} cache", removed, self.namespace.name);
        removed
    }

    pub async fn stats(&self) -> FileCacheStats {
        let index = self.index.lock().await;
        FileCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            entries: index.stats.total_entries,
            total_size_bytes: index.stats.total_size_bytes,
            expiry_days: self.namespace.expiry.as_secs() / DAY_SECS,
            last_cleanup: index.stats.last_cleanup,
            directory: self.directory.clone(),
        }
    }

    /// Copy of the current manifest
    pub async fn index(&self) -> CacheIndex {
        self.index.lock().await.clone()
    }

    /// Caller must hold the manifest lock
    async fn remove_records<F>(&self, should_remove: F) -> RepositoryResult<u64>
    where
        F: Fn(SystemTime) -> bool,
    {
        let mut removed = 0;
        let mut dir = fs::read_dir(&self.directory).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(self.namespace.extension.as_str())
                || path.file_name().and_then(|name| name.to_str()) == Some(INDEX_FILE)
            {
                continue;
            }

            let modified = entry.metadata().await?.modified()?;
            if should_remove(modified) {
                match fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => warn!("Could not remove {}: {}", path.display(), e),
                }
            }
        }
        Ok(removed)
    }

    fn file_name(&self, id: &str) -> String {
        format!("{id}.{}", self.namespace.extension)
    }

    fn record_path(&self, id: &str) -> RepositoryResult<PathBuf> {
        validate_id(id)?;
        Ok(self.directory.join(self.file_name(id)))
    }
}

/// Identifiers become file names, so only a conservative character set is allowed
fn validate_id(id: &str) -> RepositoryResult<()> {
    let valid = id.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if valid {
        Ok(())
    } else {
        Err(RepositoryError::Validation {
            field: "id".to_string(),
            message: format!("'{id}' is not a valid record identifier"),
        })
    }
}

fn is_stale(modified: SystemTime, expiry: Duration) -> bool {
    SystemTime::now()
        .duration_since(modified)
        .map_or(false, |age| age > expiry)
}

async fn load_index(directory: &Path) -> RepositoryResult<Option<CacheIndex>> {
    match fs::read(directory.join(INDEX_FILE)).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_index(directory: &Path, index: &CacheIndex) -> RepositoryResult<()> {
    let bytes = serde_json::to_vec_pretty(index)?;
    write_atomic(&directory.join(INDEX_FILE), &bytes).await
}

/// Make the manifest match the record files on disk.
///
/// Entries without a file are dropped, record files without an entry are
/// adopted, and temp files left by an interrupted write are deleted. Every
/// write goes through the manifest lock, so no temp file is live while the
/// caller holds it.
async fn reconcile(directory: &Path, extension: &str, index: &mut CacheIndex) {
    let mut dangling = Vec::new();
    for (id, entry) in &index.entries {
        if !fs::try_exists(directory.join(&entry.file_name)).await.unwrap_or(false) {
            dangling.push(id.clone());
        }
    }

    if !dangling.is_empty() {
        debug!("Reconciling manifest: dropping {} dangling entries", dangling.len());
    }
    for id in dangling {
        index.entries.remove(&id);
    }

    if let Err(e) = scan_directory(directory, extension, index).await {
        warn!("Could not scan cache directory {}: {}", directory.display(), e);
    }
    index.refresh_stats();
}

async fn scan_directory(
    directory: &Path,
    extension: &str,
    index: &mut CacheIndex,
) -> RepositoryResult<()> {
    let mut dir = fs::read_dir(directory).await?;
    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };

        if file_name.starts_with('.') && file_name.ends_with(".tmp") {
            match fs::remove_file(&path).await {
                Ok(()) => debug!("Removed leftover temp file {}", file_name),
                Err(e) => warn!("Could not remove {}: {}", path.display(), e),
            }
            continue;
        }

        let Some(id) = file_name.strip_suffix(&format!(".{extension}")) else {
            continue;
        };
        if file_name == INDEX_FILE || index.entries.contains_key(id) || validate_id(id).is_err() {
            continue;
        }

        let metadata = entry.metadata().await?;
        let cached_at = metadata.modified().map_or_else(|_| Utc::now(), DateTime::<Utc>::from);
        debug!("Adopting unindexed record {}", file_name);
        index.entries.insert(
            id.to_string(),
            IndexEntry {
                file_name: file_name.to_string(),
                size_bytes: metadata.len(),
                cached_at,
            },
        );
    }
    Ok(())
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> RepositoryResult<()> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| RepositoryError::Storage {
            message: format!("invalid cache path {}", path.display()),
        })?;
    let temp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    fs::write(&temp, bytes).await?;
    if let Err(e) = fs::rename(&temp, path).await {
        let _ = fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}
