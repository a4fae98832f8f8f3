//! Memoization of block results.
//!
//! A cache entry is keyed by the pair (block identity, input fingerprint) and
//! is written once: a changed configuration or a changed input always yields
//! a new key, never an overwrite.
//!
//! The [`Cache`] handle is what the engine talks to. It never fails: a
//! backend error is logged and treated as a miss (or a skipped store), so a
//! broken cache costs recomputation, not correctness.

pub mod disk;
pub mod memory;

use crate::core::data::DataValue;
use crate::core::fingerprint::{Fingerprint, canonical_bytes};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub use disk::DiskCache;
pub use memory::MemoryCache;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O {operation} failed for {}: {source}", .path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

impl CacheError {
    pub(crate) fn io(operation: &'static str, path: impl AsRef<Path>, source: std::io::Error) -> Self {
        CacheError::Io {
            operation,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub block: Fingerprint,
    pub input: Fingerprint,
}

impl CacheKey {
    pub fn new(block: &Fingerprint, input: &Fingerprint) -> Self {
        CacheKey {
            block: block.clone(),
            input: input.clone(),
        }
    }

    /// Deterministic storage location relative to a cache root:
    /// `<block identity>/<input fingerprint>.json`.
    pub fn relative_path(&self) -> PathBuf {
        Path::new(self.block.as_str()).join(format!("{}.json", self.input))
    }
}

/// A stored artifact plus its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub artifact: DataValue,
    pub created_at: DateTime<Utc>,
    /// Size of the artifact's canonical encoding, in bytes.
    pub size: u64,
}

impl CacheEntry {
    pub fn new(artifact: DataValue) -> Self {
        let size = canonical_bytes(&artifact).len() as u64;
        CacheEntry {
            artifact,
            created_at: Utc::now(),
            size,
        }
    }
}

/// Storage behind a [`Cache`]. Implementations must tolerate concurrent
/// callers: two branches may store the same key at the same time.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    async fn store(&self, key: &CacheKey, entry: CacheEntry) -> Result<(), CacheError>;

    /// Removes every entry of one block identity, returning how many went.
    async fn invalidate(&self, block: &Fingerprint) -> Result<usize, CacheError>;

    async fn len(&self) -> Result<usize, CacheError>;
}

/// Counters describing how a cache has been used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub violations: u64,
    pub backend_errors: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    violations: AtomicU64,
    backend_errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            violations: self.violations.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
        }
    }
}

/// Handle to the cache of one pipeline invocation, passed explicitly through
/// the execution context. Cloning is cheap and clones share storage and stats.
#[derive(Clone)]
pub struct Cache {
    backend: Option<Arc<dyn CacheBackend>>,
    counters: Arc<Counters>,
}

impl Cache {
    /// A cache that always misses and never stores.
    pub fn disabled() -> Self {
        Cache {
            backend: None,
            counters: Arc::default(),
        }
    }

    pub fn memory() -> Self {
        Self::with_backend(Arc::new(MemoryCache::new()))
    }

    pub fn disk(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        Ok(Self::with_backend(Arc::new(DiskCache::open(root)?)))
    }

    pub fn with_backend(backend: Arc<dyn CacheBackend>) -> Self {
        Cache {
            backend: Some(backend),
            counters: Arc::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.as_deref().map_or("disabled", |b| b.name())
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    /// Returns the artifact stored for the pair, or `None` on a miss.
    /// Backend failures are reported as misses.
    pub async fn lookup(&self, block: &Fingerprint, input: &Fingerprint) -> Option<DataValue> {
        let backend = self.backend.as_ref()?;
        let key = CacheKey::new(block, input);
        match backend.lookup(&key).await {
            Ok(Some(entry)) => {
                Counters::bump(&self.counters.hits);
                log::debug!("Cache hit for {}/{}", block.short(), input.short());
                Some(entry.artifact)
            }
            Ok(None) => {
                Counters::bump(&self.counters.misses);
                log::debug!("Cache miss for {}/{}", block.short(), input.short());
                None
            }
            Err(e) => {
                Counters::bump(&self.counters.backend_errors);
                Counters::bump(&self.counters.misses);
                log::warn!(
                    "Cache backend '{}' failed on lookup, recomputing: {}",
                    backend.name(),
                    e
                );
                None
            }
        }
    }

    /// Stores an artifact under the pair.
    ///
    /// Storing the same artifact again is a no-op. Storing a different
    /// artifact under an existing key means two computations with the same
    /// identity disagreed; that is logged as a consistency violation and the
    /// existing entry is kept.
    pub async fn store(&self, block: &Fingerprint, input: &Fingerprint, artifact: DataValue) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        let key = CacheKey::new(block, input);

        match backend.lookup(&key).await {
            Ok(Some(existing)) if existing.artifact == artifact => {
                log::debug!("Cache entry {}/{} already stored", block.short(), input.short());
                return;
            }
            Ok(Some(_)) => {
                Counters::bump(&self.counters.violations);
                log::error!(
                    "Cache consistency violation: block {} produced a different artifact for input {}; keeping the stored one",
                    block,
                    input
                );
                return;
            }
            Ok(None) => {}
            Err(e) => {
                Counters::bump(&self.counters.backend_errors);
                log::warn!("Cache backend '{}' failed on lookup before store: {}", backend.name(), e);
            }
        }

        match backend.store(&key, CacheEntry::new(artifact)).await {
            Ok(()) => Counters::bump(&self.counters.stores),
            Err(e) => {
                Counters::bump(&self.counters.backend_errors);
                log::warn!("Cache backend '{}' failed to store {}: {}", backend.name(), key.relative_path().display(), e);
            }
        }
    }

    /// Drops every entry of a block identity. This is the escape hatch for
    /// a block whose behavior changed without its declared configuration
    /// changing.
    pub async fn invalidate(&self, block: &Fingerprint) -> usize {
        let Some(backend) = self.backend.as_ref() else {
            return 0;
        };
        match backend.invalidate(block).await {
            Ok(removed) => {
                log::info!("Invalidated {} cache entries of block {}", removed, block.short());
                removed
            }
            Err(e) => {
                Counters::bump(&self.counters.backend_errors);
                log::warn!("Cache backend '{}' failed to invalidate {}: {}", backend.name(), block.short(), e);
                0
            }
        }
    }

    pub async fn len(&self) -> usize {
        let Some(backend) = self.backend.as_ref() else {
            return 0;
        };
        backend.len().await.unwrap_or_else(|e| {
            log::warn!("Cache backend '{}' failed to count entries: {}", backend.name(), e);
            0
        })
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for Cache {
    fn default() -> Self {
        Cache::memory()
    }
}
