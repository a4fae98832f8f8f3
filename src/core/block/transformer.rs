use crate::core::block::{AsAny, BlockKind, LeafCall, block_identity, short_type_name};
use crate::core::config::BlockOptions;
use crate::core::context::ExecutionContext;
use crate::core::data::{DataValue, Params};
use crate::core::error::{BlockError, PipelineError, Result, StepPath};
use crate::core::fingerprint::Fingerprint;
use crate::core::trace::Phase;
use std::sync::Arc;

/// The logic of a stateless step.
///
/// `transform` must be a pure function of the configuration, the input and
/// the arguments: its results are cached under exactly those.
pub trait TransformerLogic: AsAny + Send + Sync + 'static {
    /// Name used in paths, traces and routed arguments. Defaults to the type name.
    fn name(&self) -> Option<String> {
        None
    }

    /// Every field that affects the output. Part of the block's identity.
    fn config(&self) -> DataValue {
        DataValue::Null
    }

    /// Checked once, when the block is built.
    fn validate(&self) -> std::result::Result<(), String> {
        Ok(())
    }

    fn transform(&self, data: DataValue, params: &Params) -> Result<DataValue, BlockError>;
}

/// A sealed [`TransformerLogic`]: its identity is computed once, at
/// construction, from its name and configuration.
#[derive(Clone)]
pub struct Transformer {
    name: String,
    identity: Fingerprint,
    options: BlockOptions,
    logic: Arc<dyn TransformerLogic>,
}

impl Transformer {
    pub fn new<L: TransformerLogic>(logic: L) -> Result<Self> {
        Self::with_options(logic, BlockOptions::default())
    }

    pub fn with_options<L: TransformerLogic>(logic: L, options: BlockOptions) -> Result<Self> {
        let name = logic.name().unwrap_or_else(short_type_name::<L>);
        logic
            .validate()
            .map_err(|message| PipelineError::configuration(StepPath::root(name.clone()), message))?;
        let identity = block_identity(BlockKind::Transformer, &name, &logic.config());
        Ok(Transformer {
            name,
            identity,
            options,
            logic: Arc::new(logic),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> &Fingerprint {
        &self.identity
    }

    pub fn options(&self) -> BlockOptions {
        self.options
    }

    pub fn config(&self) -> DataValue {
        self.logic.config()
    }

    /// Borrows the concrete logic, if it is a `T`.
    pub fn inspect<T: TransformerLogic>(&self) -> Option<&T> {
        let logic: &dyn TransformerLogic = &*self.logic;
        logic.as_any().downcast_ref::<T>()
    }

    /// Applies the logic to `data`, serving the result from the cache when
    /// this (identity, input) pair was seen before.
    pub async fn transform(&self, data: DataValue, ctx: &ExecutionContext) -> Result<DataValue> {
        let logic = Arc::clone(&self.logic);
        LeafCall {
            name: &self.name,
            identity: &self.identity,
            fitted: None,
            phase: Phase::Transform,
            cache_enabled: self.options.cache.is_enabled(),
            ctx,
        }
        .run(data, move |data, params| logic.transform(data, params))
        .await
    }
}
