//! On-disk cache: one JSON file per (block identity, input fingerprint).
//!
//! ```text
//! <root>/
//!   <block identity>/
//!     <input fingerprint>.json
//! ```
//!
//! Re-running a pipeline against the same root is a pure cache-hit path.
//! Writes go to a uniquely named temporary file first and are renamed into
//! place, so concurrent writers of one key never leave a torn file behind.

use crate::core::cache::{CacheBackend, CacheEntry, CacheError, CacheKey};
use crate::core::fingerprint::Fingerprint;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    /// Opens (creating if needed) a cache rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| CacheError::io("create_dir_all", &root, e))?;
        if !root.is_dir() {
            return Err(CacheError::Unavailable(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(DiskCache { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.relative_path())
    }
}

#[async_trait]
impl CacheBackend for DiskCache {
    fn name(&self) -> &str {
        "disk"
    }

    async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.entry_path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::io("read", &path, e)),
        }
    }

    async fn store(&self, key: &CacheKey, entry: CacheEntry) -> Result<(), CacheError> {
        let path = self.entry_path(key);
        let dir = self.root.join(key.block.as_str());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CacheError::io("create_dir_all", &dir, e))?;

        let bytes = serde_json::to_vec_pretty(&entry)?;
        let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| CacheError::io("write", &tmp, e))?;

        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(CacheError::io("rename", &path, e));
        }
        Ok(())
    }

    async fn invalidate(&self, block: &Fingerprint) -> Result<usize, CacheError> {
        let dir = self.root.join(block.as_str());
        let removed = match count_entries(&dir).await {
            Ok(n) => n,
            Err(CacheError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                return Ok(0);
            }
            Err(e) => return Err(e),
        };
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| CacheError::io("remove_dir_all", &dir, e))?;
        Ok(removed)
    }

    async fn len(&self) -> Result<usize, CacheError> {
        let mut total = 0;
        let mut blocks = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| CacheError::io("read_dir", &self.root, e))?;
        while let Some(block) = blocks
            .next_entry()
            .await
            .map_err(|e| CacheError::io("read_dir", &self.root, e))?
        {
            if block.path().is_dir() {
                total += count_entries(&block.path()).await?;
            }
        }
        Ok(total)
    }
}

async fn count_entries(dir: &Path) -> Result<usize, CacheError> {
    let mut count = 0;
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| CacheError::io("read_dir", dir, e))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CacheError::io("read_dir", dir, e))?
    {
        if entry.path().extension().is_some_and(|ext| ext == "json") {
            count += 1;
        }
    }
    Ok(count)
}
