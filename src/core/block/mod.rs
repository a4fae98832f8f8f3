//! Leaf steps: stateless [`Transformer`]s and fittable [`Trainer`]s.
//!
//! User code implements [`TransformerLogic`] or [`TrainerLogic`]; the
//! wrappers seal that logic with an identity, consult the cache and run it on
//! the blocking thread pool.

pub mod trainer;
pub mod transformer;

use crate::core::context::ExecutionContext;
use crate::core::data::{DataValue, Params};
use crate::core::error::{BlockError, PipelineError, Result};
use crate::core::fingerprint::{Fingerprint, Hasher};
use crate::core::trace::{CacheOutcome, Phase, TraceEntry};
use std::any::Any;
use std::time::Instant;

pub use trainer::{Trainer, TrainerLogic};
pub use transformer::{Transformer, TransformerLogic};

/// A helper trait that just provides the `as_any` method.
/// Lets callers get the concrete logic back out of a block for inspection.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: 'static> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockKind {
    Transformer,
    Trainer,
}

impl BlockKind {
    fn as_str(self) -> &'static str {
        match self {
            BlockKind::Transformer => "transformer",
            BlockKind::Trainer => "trainer",
        }
    }
}

/// Identity of a leaf: its kind, its name and its declared configuration.
pub(crate) fn block_identity(kind: BlockKind, name: &str, config: &DataValue) -> Fingerprint {
    Hasher::new("block")
        .field(kind.as_str())
        .field(name)
        .value(config)
        .finish()
}

/// `my_crate::blocks::Scaler<f64>` -> `Scaler`.
pub(crate) fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Runs synchronous block logic on the blocking pool.
pub(crate) async fn run_blocking<T, F>(block: &str, work: F) -> Result<T, BlockError>
where
    F: FnOnce() -> Result<T, BlockError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result,
        Err(join_error) => {
            log::error!("Block '{}' panicked: {:?}", block, join_error);
            Err(BlockError::Panicked(join_error.to_string()))
        }
    }
}

/// One cached, traced invocation of a leaf's apply path.
pub(crate) struct LeafCall<'a> {
    pub name: &'a str,
    /// Block half of the cache key, also reported in errors.
    pub identity: &'a Fingerprint,
    /// Identity of the fitted state a trainer predicts with. It is folded into
    /// the input fingerprint, so every entry of a block stays under its identity.
    pub fitted: Option<&'a Fingerprint>,
    pub phase: Phase,
    pub cache_enabled: bool,
    pub ctx: &'a ExecutionContext,
}

impl LeafCall<'_> {
    pub(crate) async fn run<F>(self, data: DataValue, compute: F) -> Result<DataValue>
    where
        F: FnOnce(DataValue, &Params) -> Result<DataValue, BlockError> + Send + 'static,
    {
        let started = Instant::now();
        let path = self.ctx.path().join(self.name);
        let params = self.ctx.args().clone();
        let cache = self.ctx.cache();
        let use_cache = self.cache_enabled && cache.is_enabled();
        let input = match self.fitted {
            Some(fitted) => Fingerprint::of_fitted_input(fitted, &data, &params),
            None => Fingerprint::of_input(&data, &params),
        };

        if use_cache {
            if let Some(artifact) = cache.lookup(self.identity, &input).await {
                self.ctx.record(|| {
                    TraceEntry::new(&path, self.name, self.phase, self.identity, &input, CacheOutcome::Hit, started)
                });
                return Ok(artifact);
            }
        }

        log::debug!("Running {} at {}", self.name, path);
        let output = run_blocking(self.name, move || compute(data, &params))
            .await
            .map_err(|e| PipelineError::block(path.clone(), self.identity.clone(), e))?;

        let outcome = if use_cache {
            cache.store(self.identity, &input, output.clone()).await;
            CacheOutcome::Miss
        } else {
            CacheOutcome::Uncached
        };
        self.ctx.record(|| {
            TraceEntry::new(&path, self.name, self.phase, self.identity, &input, outcome, started)
        });
        Ok(output)
    }
}
