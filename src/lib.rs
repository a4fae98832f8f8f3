//! # Agogos
//!
//! Composable machine-learning pipelines whose every step is identified by a
//! content hash and memoized by it.
//!
//! ## Features
//!
//! - **Blocks**: stateless [`Transformer`]s and fittable [`Trainer`]s wrap plain, synchronous logic
//! - **Systems**: compose blocks with [`SequentialSystem`] and [`ParallelSystem`], nest them freely
//! - **Memoization**: results are cached by (block identity, input fingerprint), in memory or on disk
//! - **Safe fitting**: `predict` borrows the pipeline immutably, so it can never alter fitted state
//! - **Concurrency**: parallel branches run on the blocking pool, merged in declared order
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agogos::prelude::*;
//! use serde_json::json;
//!
//! struct AddOne;
//!
//! impl TransformerLogic for AddOne {
//!     fn transform(&self, data: DataValue, _params: &Params) -> Result<DataValue, BlockError> {
//!         let x = data.as_i64().ok_or(BlockError::InvalidInput(data.to_string()))?;
//!         Ok(json!(x + 1))
//!     }
//! }
//!
//! # fn main() -> agogos::Result<()> {
//! let pipeline = Pipeline::builder()
//!     .x_system(SequentialSystem::new([Transformer::new(AddOne)?, Transformer::new(AddOne)?]))
//!     .build()?;
//!
//! let out = pipeline.transform_blocking(json!(1), &RunOptions::new())?;
//! assert_eq!(out, json!(3));
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`prelude`]: Commonly used types and traits (import with `use agogos::prelude::*`)
//! - [`cache`]: Cache handle and backends
//! - [`trace`]: Execution tracing

// ============================================================================
// Core Module
// ============================================================================

mod core;

// ============================================================================
// Public Re-exports - Granular Imports
// ============================================================================

// Core types
pub use crate::core::Step;
pub use crate::core::config::{BlockOptions, CacheMode, PipelineConfig, DEFAULT_PARALLEL_WORKERS};
pub use crate::core::context::ExecutionContext;
pub use crate::core::data::{DataValue, Dataset, Params, TrainingData};
pub use crate::core::error::{BlockError, PipelineError, Result, StepPath};
pub use crate::core::fingerprint::{Fingerprint, Hasher};

// Blocks
pub use crate::core::block::{AsAny, Trainer, TrainerLogic, Transformer, TransformerLogic};

// Systems
pub use crate::core::system::{MergeLogic, MergeStrategy, ParallelSystem, SequentialSystem};

// Pipeline and composition
pub use crate::core::pipeline::{FitReport, Pipeline, PipelineBuilder, RunOptions};
pub use crate::core::registry::{ParallelDefinition, StepRegistry};
pub use crate::core::validation::{ValidationIssue, ValidationResult};

/// Cache handle and storage backends.
pub mod cache {
    pub use crate::core::cache::{
        Cache, CacheBackend, CacheEntry, CacheError, CacheKey, CacheStats, DiskCache, MemoryCache,
    };
}

/// Recording of block executions.
pub mod trace {
    pub use crate::core::trace::{CacheOutcome, ExecutionTrace, MemoryTrace, Phase, TraceEntry};
}

// ============================================================================
// Prelude Module - Convenient Bulk Imports
// ============================================================================

/// The main prelude: imports everything you need to build and run pipelines.
///
/// # Example
/// ```rust
/// use agogos::prelude::*;
/// ```
pub mod prelude {
    pub use super::cache::Cache;
    pub use super::trace::MemoryTrace;
    pub use super::{
        BlockError,
        BlockOptions,
        CacheMode,
        DataValue,
        Dataset,
        MergeStrategy,
        ParallelSystem,
        Params,
        Pipeline,
        PipelineConfig,
        PipelineError,
        RunOptions,
        SequentialSystem,
        Step,
        Trainer,
        TrainerLogic,
        Transformer,
        TransformerLogic,
    };
}

// ============================================================================
// Re-export commonly used external types for convenience
// ============================================================================

pub use serde_json::Value as JsonValue;

// ============================================================================
// Library Metadata
// ============================================================================

/// The version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The name of this crate.
pub const NAME: &str = env!("CARGO_PKG_NAME");
