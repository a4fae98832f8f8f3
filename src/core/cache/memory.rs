use crate::core::cache::{CacheBackend, CacheEntry, CacheError, CacheKey};
use crate::core::fingerprint::Fingerprint;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// In-process cache, lives as long as the pipeline holding it.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    fn name(&self) -> &str {
        "memory"
    }

    async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    async fn store(&self, key: &CacheKey, entry: CacheEntry) -> Result<(), CacheError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.clone(), entry);
        Ok(())
    }

    async fn invalidate(&self, block: &Fingerprint) -> Result<usize, CacheError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|key, _| &key.block != block);
        Ok(before - entries.len())
    }

    async fn len(&self) -> Result<usize, CacheError> {
        Ok(self.entries.read().unwrap_or_else(PoisonError::into_inner).len())
    }
}
