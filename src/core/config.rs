//! Pipeline and block configuration.
//!
//! Configuration is resolved and validated when a pipeline is built, so a
//! bad option fails before any block runs.

use crate::core::cache::Cache;
use crate::core::error::{PipelineError, Result, StepPath};
use crate::core::system::merge::MergeStrategy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default bound on concurrently running branches of a parallel system.
pub const DEFAULT_PARALLEL_WORKERS: usize = 50;

/// Environment variable overriding `cache_dir`.
pub const CACHE_DIR_ENV: &str = "AGOGOS_CACHE_DIR";
/// Environment variable overriding `cache` (`enabled` / `disabled`).
pub const CACHE_MODE_ENV: &str = "AGOGOS_CACHE";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    #[default]
    Enabled,
    Disabled,
}

impl CacheMode {
    pub fn is_enabled(self) -> bool {
        self == CacheMode::Enabled
    }
}

impl FromStr for CacheMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enabled" | "enable" | "on" | "true" | "1" => Ok(CacheMode::Enabled),
            "disabled" | "disable" | "off" | "false" | "0" => Ok(CacheMode::Disabled),
            other => Err(format!("unknown cache mode '{other}'")),
        }
    }
}

/// Options every leaf block accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BlockOptions {
    pub cache: CacheMode,
}

impl BlockOptions {
    pub fn uncached() -> Self {
        BlockOptions {
            cache: CacheMode::Disabled,
        }
    }
}

/// Top-level configuration of a [`Pipeline`](crate::Pipeline).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Whether block results are memoized at all.
    pub cache: CacheMode,
    /// Root directory of the on-disk cache. `None` keeps the cache in memory.
    pub cache_dir: Option<PathBuf>,
    /// Default bound on concurrently running branches of a parallel system.
    pub parallel_workers: usize,
    /// Merge strategy used by parallel systems that do not name one.
    pub merge_strategy: String,
    /// Upper bound on a whole `fit` / `predict` / `transform` call.
    pub timeout_ms: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            cache: CacheMode::Enabled,
            cache_dir: None,
            parallel_workers: DEFAULT_PARALLEL_WORKERS,
            merge_strategy: MergeStrategy::default().identifier().to_string(),
            timeout_ms: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: PipelineConfig = serde_json::from_str(text)
            .map_err(|e| PipelineError::configuration(config_path(), e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::configuration(
                config_path(),
                format!("cannot read {}: {e}", path.display()),
            )
        })?;
        Self::from_json_str(&text)
    }

    /// Applies `AGOGOS_CACHE_DIR` and `AGOGOS_CACHE` from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup (the environment, a map in tests...).
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(dir) = lookup(CACHE_DIR_ENV).filter(|s| !s.trim().is_empty()) {
            self.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(mode) = lookup(CACHE_MODE_ENV).filter(|s| !s.trim().is_empty()) {
            self.cache = mode
                .parse()
                .map_err(|message: String| PipelineError::configuration(config_path(), message))?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallel_workers == 0 {
            return Err(PipelineError::configuration(
                config_path(),
                "parallel_workers must be greater than 0",
            ));
        }
        if self.timeout_ms == Some(0) {
            return Err(PipelineError::configuration(
                config_path(),
                "timeout_ms must be greater than 0",
            ));
        }
        self.merge_strategy()?;
        Ok(())
    }

    pub fn merge_strategy(&self) -> Result<MergeStrategy> {
        self.merge_strategy
            .parse()
            .map_err(|message: String| PipelineError::configuration(config_path(), message))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Opens the cache this configuration describes.
    ///
    /// A cache directory that cannot be created is not an error: caching
    /// only saves time, so the pipeline runs with the cache disabled instead.
    pub fn build_cache(&self) -> Cache {
        if !self.cache.is_enabled() {
            return Cache::disabled();
        }
        match &self.cache_dir {
            None => Cache::memory(),
            Some(dir) => match Cache::disk(dir) {
                Ok(cache) => cache,
                Err(e) => {
                    log::warn!(
                        "Cache directory {} is unavailable ({}), running without cache",
                        dir.display(),
                        e
                    );
                    Cache::disabled()
                }
            },
        }
    }
}

fn config_path() -> StepPath {
    StepPath::root("config")
}
