use crate::core::block::{AsAny, BlockKind, LeafCall, block_identity, run_blocking, short_type_name};
use crate::core::config::BlockOptions;
use crate::core::context::ExecutionContext;
use crate::core::data::{DataValue, Dataset, Params, TrainingData};
use crate::core::error::{BlockError, PipelineError, Result, StepPath};
use crate::core::fingerprint::{Fingerprint, Hasher};
use crate::core::trace::{CacheOutcome, Phase, TraceEntry};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The logic of a step with fitted state.
pub trait TrainerLogic: AsAny + Send + Sync + 'static {
    /// Name used in paths, traces and routed arguments. Defaults to the type name.
    fn name(&self) -> Option<String> {
        None
    }

    /// Every hyperparameter that affects fitting or prediction.
    fn config(&self) -> DataValue {
        DataValue::Null
    }

    fn validate(&self) -> std::result::Result<(), String> {
        Ok(())
    }

    fn fit(
        &mut self,
        train: &Dataset,
        validation: Option<&Dataset>,
        params: &Params,
    ) -> Result<(), BlockError>;

    fn predict(&self, data: &DataValue, params: &Params) -> Result<DataValue, BlockError>;

    /// Snapshot of the fitted state. Returning `Some` lets a later fit on the
    /// same data restore the state from the cache instead of refitting.
    fn state(&self) -> Option<DataValue> {
        None
    }

    fn load_state(&mut self, _state: DataValue) -> Result<(), BlockError> {
        Err(BlockError::failed("this trainer cannot restore saved state"))
    }

    fn clone_box(&self) -> Box<dyn TrainerLogic>;
}

/// A sealed [`TrainerLogic`].
///
/// The fitted state belongs to this trainer alone: only [`Trainer::fit`]
/// (which needs `&mut self`) takes the write lock, predictions take the read
/// lock, and cloning a trainer deep-copies its logic.
pub struct Trainer {
    name: String,
    identity: Fingerprint,
    options: BlockOptions,
    logic: Arc<RwLock<Box<dyn TrainerLogic>>>,
    /// Identity of the fitted state, `None` until fitted.
    fitted: Option<Fingerprint>,
}

impl Trainer {
    pub fn new<L: TrainerLogic>(logic: L) -> Result<Self> {
        Self::with_options(logic, BlockOptions::default())
    }

    pub fn with_options<L: TrainerLogic>(logic: L, options: BlockOptions) -> Result<Self> {
        let name = logic.name().unwrap_or_else(short_type_name::<L>);
        logic
            .validate()
            .map_err(|message| PipelineError::configuration(StepPath::root(name.clone()), message))?;
        let identity = block_identity(BlockKind::Trainer, &name, &logic.config());
        Ok(Trainer {
            name,
            identity,
            options,
            logic: Arc::new(RwLock::new(Box::new(logic))),
            fitted: None,
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

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    /// Identity of the fitted state: the block identity combined with the
    /// fingerprint of the data it was fitted on.
    pub fn fitted_identity(&self) -> Option<&Fingerprint> {
        self.fitted.as_ref()
    }

    /// Snapshot of the fitted state, if the logic exposes one.
    pub fn state(&self) -> Option<DataValue> {
        read(&self.logic).ok()?.state()
    }

    /// Restores previously saved state without fitting.
    pub fn load_state(&mut self, state: DataValue) -> Result<()> {
        let path = StepPath::root(self.name.clone());
        let fingerprint = Fingerprint::of_value(&state);
        write(&self.logic)
            .and_then(|mut logic| logic.load_state(state))
            .map_err(|e| PipelineError::block(path, self.identity.clone(), e))?;
        self.fitted = Some(fitted_identity(&self.identity, &fingerprint));
        Ok(())
    }

    /// Runs `inspect` against the concrete logic, if it is a `T`.
    pub fn inspect<T: TrainerLogic, R>(&self, inspect: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = read(&self.logic).ok()?;
        let logic: &dyn TrainerLogic = &**guard;
        logic.as_any().downcast_ref::<T>().map(inspect)
    }

    /// Fits on `data`, then returns the data with each `x` replaced by this
    /// trainer's predictions on it (labels pass through untouched).
    ///
    /// When the fitted state for the same data and arguments is cached, it is
    /// restored instead of refitting.
    pub async fn fit(&mut self, data: TrainingData, ctx: &ExecutionContext) -> Result<TrainingData> {
        let started = Instant::now();
        let path = ctx.path().join(&self.name);
        let params = ctx.args().clone();
        let cache = ctx.cache();
        let use_cache = self.options.cache.is_enabled() && cache.is_enabled();
        let fingerprint = fit_fingerprint(&data, &params);

        self.fitted = None;
        let mut outcome = if use_cache {
            CacheOutcome::Miss
        } else {
            CacheOutcome::Uncached
        };

        if use_cache {
            if let Some(state) = cache.lookup(&self.identity, &fingerprint).await {
                let logic = Arc::clone(&self.logic);
                let restore = move || {
                    let mut guard = write(&logic)?;
                    guard.load_state(state)
                };
                match run_blocking(&self.name, restore).await {
                    Ok(()) => outcome = CacheOutcome::Hit,
                    Err(e) => log::warn!(
                        "Trainer '{}' could not restore its cached state, refitting: {}",
                        self.name,
                        e
                    ),
                }
            }
        }

        let data = if outcome == CacheOutcome::Hit {
            data
        } else {
            log::debug!("Fitting {} at {}", self.name, path);
            let logic = Arc::clone(&self.logic);
            let fit_params = params.clone();
            let (state, data) = run_blocking(&self.name, move || {
                let mut logic = write(&logic)?;
                logic.fit(&data.train, data.validation.as_ref(), &fit_params)?;
                Ok((logic.state(), data))
            })
            .await
            .map_err(|e| PipelineError::block(path.clone(), self.identity.clone(), e))?;

            if let (true, Some(state)) = (use_cache, state) {
                cache.store(&self.identity, &fingerprint, state).await;
            }
            data
        };

        self.fitted = Some(fitted_identity(&self.identity, &fingerprint));
        ctx.record(|| {
            TraceEntry::new(&path, &self.name, Phase::Fit, &self.identity, &fingerprint, outcome, started)
        });

        let TrainingData { train, validation } = data;
        let train = Dataset {
            x: self.predict(train.x, ctx).await?,
            y: train.y,
        };
        let validation = match validation {
            Some(set) => Some(Dataset {
                x: self.predict(set.x, ctx).await?,
                y: set.y,
            }),
            None => None,
        };
        Ok(TrainingData { train, validation })
    }

    /// Predicts with the fitted state. Never mutates it.
    pub async fn predict(&self, data: DataValue, ctx: &ExecutionContext) -> Result<DataValue> {
        let Some(fitted) = &self.fitted else {
            return Err(PipelineError::block(
                ctx.path().join(&self.name),
                self.identity.clone(),
                BlockError::NotFitted,
            ));
        };
        let logic = Arc::clone(&self.logic);
        LeafCall {
            name: &self.name,
            identity: &self.identity,
            fitted: Some(fitted),
            phase: Phase::Predict,
            cache_enabled: self.options.cache.is_enabled(),
            ctx,
        }
        .run(data, move |data, params| {
            let guard = read(&logic)?;
            guard.predict(&data, params)
        })
        .await
    }
}

impl Clone for Trainer {
    fn clone(&self) -> Self {
        let logic = self
            .logic
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone_box();
        Trainer {
            name: self.name.clone(),
            identity: self.identity.clone(),
            options: self.options,
            logic: Arc::new(RwLock::new(logic)),
            fitted: self.fitted.clone(),
        }
    }
}

fn fit_fingerprint(data: &TrainingData, params: &Params) -> Fingerprint {
    let hasher = Hasher::new("fit").value(&data.train.x).value(&data.train.y);
    let hasher = match &data.validation {
        Some(set) => hasher.field("validation").value(&set.x).value(&set.y),
        None => hasher.field("no-validation"),
    };
    hasher.params(params).finish()
}

fn fitted_identity(identity: &Fingerprint, fitted_on: &Fingerprint) -> Fingerprint {
    Hasher::new("fitted")
        .fingerprint(identity)
        .fingerprint(fitted_on)
        .finish()
}

type Logic = RwLock<Box<dyn TrainerLogic>>;

fn read(logic: &Logic) -> Result<RwLockReadGuard<'_, Box<dyn TrainerLogic>>, BlockError> {
    logic
        .read()
        .map_err(|_| BlockError::failed("trainer state lock poisoned by an earlier panic"))
}

fn write(logic: &Logic) -> Result<RwLockWriteGuard<'_, Box<dyn TrainerLogic>>, BlockError> {
    logic
        .write()
        .map_err(|_| BlockError::failed("trainer state lock poisoned by an earlier panic"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::Cache;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Predicts `x * weight`, fitting the weight as mean(y) / mean(x).
    #[derive(Clone, Default)]
    struct Ratio {
        weight: Option<f64>,
        fits: Arc<AtomicUsize>,
    }

    fn numbers(value: &DataValue) -> Result<Vec<f64>, BlockError> {
        value
            .as_array()
            .ok_or_else(|| BlockError::InvalidInput("expected an array".into()))?
            .iter()
            .map(|v| v.as_f64().ok_or_else(|| BlockError::InvalidInput("expected numbers".into())))
            .collect()
    }

    impl TrainerLogic for Ratio {
        fn fit(&mut self, train: &Dataset, _validation: Option<&Dataset>, _params: &Params) -> Result<(), BlockError> {
            self.fits.fetch_add(1, Ordering::SeqCst);
            let x: f64 = numbers(&train.x)?.iter().sum();
            let y: f64 = numbers(&train.y)?.iter().sum();
            self.weight = Some(y / x);
            Ok(())
        }

        fn predict(&self, data: &DataValue, _params: &Params) -> Result<DataValue, BlockError> {
            let weight = self.weight.ok_or(BlockError::NotFitted)?;
            Ok(json!(numbers(data)?.iter().map(|x| x * weight).collect::<Vec<_>>()))
        }

        fn state(&self) -> Option<DataValue> {
            self.weight.map(|w| json!({ "weight": w }))
        }

        fn load_state(&mut self, state: DataValue) -> Result<(), BlockError> {
            self.weight = Some(
                state["weight"]
                    .as_f64()
                    .ok_or_else(|| BlockError::MissingField("weight".into()))?,
            );
            Ok(())
        }

        fn clone_box(&self) -> Box<dyn TrainerLogic> {
            Box::new(self.clone())
        }
    }

    fn training() -> TrainingData {
        TrainingData::new(
            Dataset::new(json!([1.0, 2.0]), json!([2.0, 4.0])),
            Some(Dataset::new(json!([3.0]), json!([6.0]))),
        )
    }

    #[tokio::test]
    async fn test_fit_then_predict() {
        let mut trainer = Trainer::new(Ratio::default()).unwrap();
        let ctx = ExecutionContext::new(Cache::memory());

        let out = trainer.fit(training(), &ctx).await.unwrap();
        assert_eq!(out.train.x, json!([2.0, 4.0]));
        assert_eq!(out.train.y, json!([2.0, 4.0]));
        assert_eq!(out.validation.unwrap().x, json!([6.0]));
        assert!(trainer.is_fitted());
        assert_eq!(trainer.state(), Some(json!({"weight": 2.0})));
        assert_eq!(trainer.inspect(|r: &Ratio| r.weight), Some(Some(2.0)));
    }

    #[tokio::test]
    async fn test_predict_before_fit_fails() {
        let trainer = Trainer::new(Ratio::default()).unwrap();
        let ctx = ExecutionContext::new(Cache::memory());
        let err = trainer.predict(json!([1.0]), &ctx).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::BlockExecution {
                source: BlockError::NotFitted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_refit_on_same_data_restores_cached_state() {
        let fits = Arc::new(AtomicUsize::new(0));
        let logic = Ratio {
            weight: None,
            fits: Arc::clone(&fits),
        };
        let ctx = ExecutionContext::new(Cache::memory());

        let mut first = Trainer::new(logic.clone()).unwrap();
        first.fit(training(), &ctx).await.unwrap();
        let mut second = Trainer::new(logic).unwrap();
        second.fit(training(), &ctx).await.unwrap();

        assert_eq!(fits.load(Ordering::SeqCst), 1);
        assert_eq!(second.state(), Some(json!({"weight": 2.0})));
        assert_eq!(first.fitted_identity(), second.fitted_identity());
    }

    #[tokio::test]
    async fn test_predictions_of_different_fits_are_not_shared() {
        let ctx = ExecutionContext::new(Cache::memory());
        let mut a = Trainer::new(Ratio::default()).unwrap();
        let mut b = Trainer::new(Ratio::default()).unwrap();
        a.fit(training(), &ctx).await.unwrap();
        b.fit(
            TrainingData::new(Dataset::new(json!([1.0]), json!([3.0])), None),
            &ctx,
        )
        .await
        .unwrap();

        assert_eq!(a.predict(json!([10.0]), &ctx).await.unwrap(), json!([20.0]));
        assert_eq!(b.predict(json!([10.0]), &ctx).await.unwrap(), json!([30.0]));
    }

    /// Predicts `x * factor`. The factor is left out of `config`, so two
    /// instances share an identity and only invalidation tells them apart.
    #[derive(Clone)]
    struct Unlisted {
        factor: f64,
    }

    impl TrainerLogic for Unlisted {
        fn name(&self) -> Option<String> {
            Some("Model".into())
        }

        fn fit(&mut self, _train: &Dataset, _validation: Option<&Dataset>, _params: &Params) -> Result<(), BlockError> {
            Ok(())
        }

        fn predict(&self, data: &DataValue, _params: &Params) -> Result<DataValue, BlockError> {
            Ok(json!(numbers(data)?.iter().map(|x| x * self.factor).collect::<Vec<_>>()))
        }

        fn clone_box(&self) -> Box<dyn TrainerLogic> {
            Box::new(self.clone())
        }
    }

    #[tokio::test]
    async fn test_invalidate_drops_predictions_of_the_trainer() {
        let ctx = ExecutionContext::new(Cache::memory());
        let train = || TrainingData::new(Dataset::new(json!([1.0]), json!([1.0])), None);

        let mut first = Trainer::new(Unlisted { factor: 2.0 }).unwrap();
        first.fit(train(), &ctx).await.unwrap();
        assert_eq!(first.predict(json!([10.0]), &ctx).await.unwrap(), json!([20.0]));

        // Predictions on the training x and on [10.0].
        assert_eq!(ctx.cache().invalidate(first.identity()).await, 2);
        assert!(ctx.cache().is_empty().await);

        let mut second = Trainer::new(Unlisted { factor: 3.0 }).unwrap();
        assert_eq!(first.identity(), second.identity());
        second.fit(train(), &ctx).await.unwrap();
        assert_eq!(second.predict(json!([10.0]), &ctx).await.unwrap(), json!([30.0]));
    }

    #[tokio::test]
    async fn test_clone_is_independent() {
        let ctx = ExecutionContext::new(Cache::disabled());
        let original = Trainer::new(Ratio::default()).unwrap();
        let mut copy = original.clone();
        copy.fit(training(), &ctx).await.unwrap();

        assert!(copy.is_fitted());
        assert!(!original.is_fitted());
        assert_eq!(original.state(), None);
    }

    #[tokio::test]
    async fn test_load_state_marks_fitted() {
        let mut trainer = Trainer::new(Ratio::default()).unwrap();
        trainer.load_state(json!({"weight": 0.5})).unwrap();
        let ctx = ExecutionContext::new(Cache::disabled());
        assert_eq!(trainer.predict(json!([4.0]), &ctx).await.unwrap(), json!([2.0]));

        assert!(trainer.load_state(json!({})).is_err());
    }
}
