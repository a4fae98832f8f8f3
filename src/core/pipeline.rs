//! The surface callers use: one object holding every system of a model and
//! exposing `fit`, `predict` and `transform`.

use crate::core::cache::Cache;
use crate::core::config::PipelineConfig;
use crate::core::context::ExecutionContext;
use crate::core::data::{DataValue, Dataset, Params, TrainingData};
use crate::core::error::{PipelineError, Result, StepPath};
use crate::core::escape_html;
use crate::core::fingerprint::{Fingerprint, Hasher};
use crate::core::trace::ExecutionTrace;
use crate::core::Step;
use std::fmt::Write as _;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const ROOT: &str = "Pipeline";

/// Per-call options.
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Arguments keyed by slot name (`x_system`, `training_system`, ...),
    /// then by child name inside each system.
    pub args: Params,
    /// Overrides the configured timeout for this call.
    pub timeout: Option<Duration>,
    pub trace: Option<Arc<dyn ExecutionTrace>>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_args(mut self, args: Params) -> Self {
        self.args = args;
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<DataValue>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_trace(mut self, trace: Arc<dyn ExecutionTrace>) -> Self {
        self.trace = Some(trace);
        self
    }
}

/// What `fit` hands back: the training and validation sets as they left the
/// last system, i.e. fitted predictions and processed labels.
#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    pub identity: Fingerprint,
    pub train: Dataset,
    pub validation: Option<Dataset>,
}

#[derive(Clone, Copy)]
enum Slot {
    X,
    Y,
    Training,
    Prediction,
    Label,
}

impl Slot {
    const ALL: [Slot; 5] = [Slot::X, Slot::Y, Slot::Training, Slot::Prediction, Slot::Label];

    fn name(self) -> &'static str {
        match self {
            Slot::X => "x_system",
            Slot::Y => "y_system",
            Slot::Training => "training_system",
            Slot::Prediction => "prediction_system",
            Slot::Label => "label_system",
        }
    }
}

#[derive(Clone, Default)]
pub struct PipelineBuilder {
    x_system: Option<Step>,
    y_system: Option<Step>,
    training_system: Option<Step>,
    prediction_system: Option<Step>,
    label_system: Option<Step>,
    config: PipelineConfig,
    cache: Option<Cache>,
}

impl PipelineBuilder {
    /// Transforms features before training and prediction.
    pub fn x_system(mut self, step: impl Into<Step>) -> Self {
        self.x_system = Some(step.into());
        self
    }

    /// Transforms labels before training.
    pub fn y_system(mut self, step: impl Into<Step>) -> Self {
        self.y_system = Some(step.into());
        self
    }

    /// The only system allowed to contain trainers.
    pub fn training_system(mut self, step: impl Into<Step>) -> Self {
        self.training_system = Some(step.into());
        self
    }

    /// Post-processes predictions.
    pub fn prediction_system(mut self, step: impl Into<Step>) -> Self {
        self.prediction_system = Some(step.into());
        self
    }

    /// Post-processes labels after training.
    pub fn label_system(mut self, step: impl Into<Step>) -> Self {
        self.label_system = Some(step.into());
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses `cache` instead of the one the configuration describes, e.g. to
    /// share one cache between pipelines.
    pub fn cache(mut self, cache: Cache) -> Self {
        self.cache = Some(cache);
        self
    }

    fn slot(&self, slot: Slot) -> Option<&Step> {
        match slot {
            Slot::X => self.x_system.as_ref(),
            Slot::Y => self.y_system.as_ref(),
            Slot::Training => self.training_system.as_ref(),
            Slot::Prediction => self.prediction_system.as_ref(),
            Slot::Label => self.label_system.as_ref(),
        }
    }

    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;

        for slot in Slot::ALL {
            if matches!(slot, Slot::Training) {
                continue;
            }
            if let Some(step) = self.slot(slot) {
                if step.contains_trainer() {
                    return Err(PipelineError::composition(
                        StepPath::root(ROOT).join(slot.name()),
                        "only the training system may contain trainers",
                    ));
                }
            }
        }

        let identity = Slot::ALL
            .iter()
            .fold(Hasher::new("pipeline"), |h, slot| {
                let h = h.field(slot.name());
                match self.slot(*slot) {
                    Some(step) => h.fingerprint(step.identity()),
                    None => h.field("none"),
                }
            })
            .finish();
        let cache = self.cache.unwrap_or_else(|| self.config.build_cache());
        log::debug!(
            "Built pipeline {} with {} cache",
            identity.short(),
            cache.backend_name()
        );

        Ok(Pipeline {
            x_system: self.x_system,
            y_system: self.y_system,
            training_system: self.training_system,
            prediction_system: self.prediction_system,
            label_system: self.label_system,
            config: self.config,
            cache,
            identity,
        })
    }
}

pub struct Pipeline {
    x_system: Option<Step>,
    y_system: Option<Step>,
    training_system: Option<Step>,
    prediction_system: Option<Step>,
    label_system: Option<Step>,
    config: PipelineConfig,
    cache: Cache,
    identity: Fingerprint,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn identity(&self) -> &Fingerprint {
        &self.identity
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    fn slot(&self, slot: Slot) -> Option<&Step> {
        match slot {
            Slot::X => self.x_system.as_ref(),
            Slot::Y => self.y_system.as_ref(),
            Slot::Training => self.training_system.as_ref(),
            Slot::Prediction => self.prediction_system.as_ref(),
            Slot::Label => self.label_system.as_ref(),
        }
    }

    fn context(&self, options: &RunOptions) -> ExecutionContext {
        let ctx = ExecutionContext::new(self.cache.clone())
            .with_path(StepPath::root(ROOT))
            .with_args(options.args.clone())
            .with_workers(self.config.parallel_workers);
        match &options.trace {
            Some(trace) => ctx.with_trace(Arc::clone(trace)),
            None => ctx,
        }
    }

    /// Fits every trainer of the training system.
    ///
    /// Features go through the x system and labels through the y system
    /// first; the training system's output then goes through the prediction
    /// and label systems.
    pub async fn fit(
        &mut self,
        train: Dataset,
        validation: Option<Dataset>,
        options: &RunOptions,
    ) -> Result<FitReport> {
        let ctx = self.context(options);
        let timeout = options.timeout.or(self.config.timeout());
        let data = TrainingData::new(train, validation);
        let result = with_timeout(timeout, self.fit_inner(data, &ctx)).await;
        flush(options);
        result
    }

    async fn fit_inner(&mut self, data: TrainingData, ctx: &ExecutionContext) -> Result<FitReport> {
        log::info!("Fitting pipeline {}", self.identity.short());
        let mut data = data;

        if let Some(step) = &self.x_system {
            data = step.transform_x(data, &slot_context(ctx, Slot::X, step)).await?;
        }
        if let Some(step) = &self.y_system {
            data = step.transform_y(data, &slot_context(ctx, Slot::Y, step)).await?;
        }
        if let Some(step) = &mut self.training_system {
            let slot_ctx = slot_context(ctx, Slot::Training, step);
            data = step.fit(data, &slot_ctx).await?;
        }
        if let Some(step) = &self.prediction_system {
            data = step.transform_x(data, &slot_context(ctx, Slot::Prediction, step)).await?;
        }
        if let Some(step) = &self.label_system {
            data = step.transform_y(data, &slot_context(ctx, Slot::Label, step)).await?;
        }

        log::info!("Pipeline {} fitted", self.identity.short());
        Ok(FitReport {
            identity: self.identity.clone(),
            train: data.train,
            validation: data.validation,
        })
    }

    /// Predictions of the fitted pipeline. Takes `&self`: predicting can
    /// never change fitted state.
    pub async fn predict(&self, data: DataValue, options: &RunOptions) -> Result<DataValue> {
        let ctx = self.context(options);
        let timeout = options.timeout.or(self.config.timeout());
        let result = with_timeout(timeout, self.apply(data, &ctx, true)).await;
        flush(options);
        result
    }

    /// Like [`predict`](Self::predict), without the prediction system.
    pub async fn transform(&self, data: DataValue, options: &RunOptions) -> Result<DataValue> {
        let ctx = self.context(options);
        let timeout = options.timeout.or(self.config.timeout());
        let result = with_timeout(timeout, self.apply(data, &ctx, false)).await;
        flush(options);
        result
    }

    async fn apply(&self, data: DataValue, ctx: &ExecutionContext, post_process: bool) -> Result<DataValue> {
        let mut data = data;
        let mut slots = vec![Slot::X, Slot::Training];
        if post_process {
            slots.push(Slot::Prediction);
        }
        for slot in slots {
            if let Some(step) = self.slot(slot) {
                data = step.transform(data, &slot_context(ctx, slot, step)).await?;
            }
        }
        Ok(data)
    }

    /// [`fit`](Self::fit) on a fresh current-thread runtime. Must not be
    /// called from inside an async runtime.
    pub fn fit_blocking(
        &mut self,
        train: Dataset,
        validation: Option<Dataset>,
        options: &RunOptions,
    ) -> Result<FitReport> {
        runtime()?.block_on(self.fit(train, validation, options))
    }

    pub fn predict_blocking(&self, data: DataValue, options: &RunOptions) -> Result<DataValue> {
        runtime()?.block_on(self.predict(data, options))
    }

    pub fn transform_blocking(&self, data: DataValue, options: &RunOptions) -> Result<DataValue> {
        runtime()?.block_on(self.transform(data, options))
    }

    /// Indented text tree of every slot.
    pub fn describe(&self) -> String {
        let mut out = format!("{} {}\n", ROOT, self.identity.short());
        for slot in Slot::ALL {
            if let Some(step) = self.slot(slot) {
                let _ = writeln!(out, "  {}:", slot.name());
                step.describe_into(&mut out, 2);
            }
        }
        out
    }

    pub fn to_html(&self) -> String {
        let mut out = String::from(
            "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>Pipeline</title>\
             <style>body{font-family:sans-serif}code{color:#666}\
             .trainer{font-weight:bold}.sequential,.parallel{font-style:italic}</style></head>\n<body>\n",
        );
        let _ = writeln!(
            out,
            "<h1>{} <code>{}</code></h1>",
            ROOT,
            escape_html(self.identity.short())
        );
        for slot in Slot::ALL {
            if let Some(step) = self.slot(slot) {
                let _ = write!(out, "<h2>{}</h2><ul>", slot.name());
                step.html_into(&mut out);
                out.push_str("</ul>\n");
            }
        }
        out.push_str("</body>\n</html>\n");
        out
    }

    pub fn save_to_html(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        std::fs::write(path, self.to_html())
    }
}

/// Arguments for a slot live under its name. A leaf placed directly in the
/// slot reads them under its own name too, as it would inside a system.
fn slot_context(ctx: &ExecutionContext, slot: Slot, step: &Step) -> ExecutionContext {
    let slot_ctx = ctx.child(slot.name(), slot.name());
    match step {
        Step::Transformer(_) | Step::Trainer(_) => slot_ctx.scoped(step.label()),
        Step::Sequential(_) | Step::Parallel(_) => slot_ctx,
    }
}

async fn with_timeout<T>(timeout: Option<Duration>, work: impl Future<Output = Result<T>>) -> Result<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .map_err(|_| PipelineError::Timeout(limit))?,
        None => work.await,
    }
}

fn flush(options: &RunOptions) {
    if let Some(trace) = &options.trace {
        trace.flush();
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|e| PipelineError::Runtime(format!("cannot start a runtime: {e}")))
}
