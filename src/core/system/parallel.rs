use crate::core::Step;
use crate::core::context::ExecutionContext;
use crate::core::data::{DataValue, Dataset, TrainingData};
use crate::core::error::{PipelineError, Result, StepPath};
use crate::core::fingerprint::{Fingerprint, Hasher};
use crate::core::system::child_segment;
use crate::core::system::merge::MergeStrategy;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};

const DEFAULT_LABEL: &str = "parallel";

/// Feeds the same input to every child, runs them concurrently and merges
/// their outputs.
///
/// Outputs are merged in declared order, whichever branch finishes first.
/// Every branch runs to completion before failures are reported, and all of
/// them are reported together.
#[derive(Clone)]
pub struct ParallelSystem {
    label: String,
    identity: Fingerprint,
    steps: Vec<Step>,
    merge: MergeStrategy,
    /// One per child, summing to 1.
    weights: Vec<f64>,
    workers: Option<usize>,
}

impl ParallelSystem {
    pub fn new(steps: impl IntoIterator<Item = impl Into<Step>>) -> Result<Self> {
        let steps: Vec<Step> = steps.into_iter().map(Into::into).collect();
        if steps.is_empty() {
            return Err(PipelineError::composition(
                StepPath::root(DEFAULT_LABEL),
                "a parallel system needs at least one child",
            ));
        }
        let weights = vec![1.0 / steps.len() as f64; steps.len()];
        let merge = MergeStrategy::default();
        Ok(ParallelSystem {
            label: DEFAULT_LABEL.to_string(),
            identity: compute_identity(&steps, &merge, &weights),
            steps,
            merge,
            weights,
            workers: None,
        })
    }

    pub fn with_merge(mut self, merge: MergeStrategy) -> Self {
        self.merge = merge;
        self.identity = compute_identity(&self.steps, &self.merge, &self.weights);
        self
    }

    /// Per-child weights, used by weighted merges. They are normalized to
    /// sum to 1.
    pub fn with_weights(mut self, weights: impl Into<Vec<f64>>) -> Result<Self> {
        let weights: Vec<f64> = weights.into();
        if weights.len() != self.steps.len() {
            return Err(self.configuration_error(format!(
                "{} weights given for {} children",
                weights.len(),
                self.steps.len()
            )));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(self.configuration_error("weights must be finite and non-negative"));
        }
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return Err(self.configuration_error("weights must not all be zero"));
        }
        self.weights = weights.iter().map(|w| w / total).collect();
        self.identity = compute_identity(&self.steps, &self.merge, &self.weights);
        Ok(self)
    }

    /// Bounds how many children run at once. Defaults to the context's
    /// `parallel_workers`.
    pub fn with_workers(mut self, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(self.configuration_error("workers must be greater than 0"));
        }
        self.workers = Some(workers);
        Ok(self)
    }

    /// Sets the label used in paths and routed arguments. Does not affect identity.
    pub fn named(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn identity(&self) -> &Fingerprint {
        &self.identity
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn merge_strategy(&self) -> &MergeStrategy {
        &self.merge
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    fn configuration_error(&self, message: impl Into<String>) -> PipelineError {
        PipelineError::configuration(StepPath::root(self.label.clone()), message)
    }

    pub async fn transform(&self, data: DataValue, ctx: &ExecutionContext) -> Result<DataValue> {
        let workers = self.workers.unwrap_or(ctx.workers());
        let mut branches: Vec<BoxFuture<'_, Result<DataValue>>> = Vec::with_capacity(self.steps.len());
        for (i, step) in self.steps.iter().enumerate() {
            let child = ctx.child(child_segment(&self.label, i), step.label());
            let data = data.clone();
            branches.push(Box::pin(async move { step.transform(data, &child).await }));
        }
        let results: Vec<Result<DataValue>> = stream::iter(branches).buffered(workers).collect().await;

        let outputs = self.collect_branches(ctx, results)?;
        self.merge_outputs(ctx, &outputs)
    }

    /// Fits every child on the same data, then merges the `x` each child
    /// produced. Labels are left as they came in.
    pub async fn fit(&mut self, data: TrainingData, ctx: &ExecutionContext) -> Result<TrainingData> {
        let workers = self.workers.unwrap_or(ctx.workers());
        let label = self.label.clone();
        let mut branches: Vec<BoxFuture<'_, Result<TrainingData>>> = Vec::with_capacity(self.steps.len());
        for (i, step) in self.steps.iter_mut().enumerate() {
            let child = ctx.child(child_segment(&label, i), step.label());
            let data = data.clone();
            branches.push(Box::pin(async move { step.fit(data, &child).await }));
        }
        let results: Vec<Result<TrainingData>> =
            stream::iter(branches).buffered(workers).collect().await;

        let fitted = self.collect_branches(ctx, results)?;
        let train_x: Vec<DataValue> = fitted.iter().map(|d| d.train.x.clone()).collect();
        let train = Dataset {
            x: self.merge_outputs(ctx, &train_x)?,
            y: data.train.y,
        };
        let validation = match data.validation {
            Some(set) => {
                let validation_x: Vec<DataValue> = fitted
                    .iter()
                    .filter_map(|d| d.validation.as_ref().map(|v| v.x.clone()))
                    .collect();
                Some(Dataset {
                    x: self.merge_outputs(ctx, &validation_x)?,
                    y: set.y,
                })
            }
            None => None,
        };
        Ok(TrainingData { train, validation })
    }

    fn collect_branches<T>(&self, ctx: &ExecutionContext, results: Vec<Result<T>>) -> Result<Vec<T>> {
        let mut outputs = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(output) => outputs.push(output),
                Err(e) => failures.push(e),
            }
        }
        if failures.is_empty() {
            return Ok(outputs);
        }
        log::debug!(
            "{} of {} branches of {} failed",
            failures.len(),
            self.steps.len(),
            self.label
        );
        Err(PipelineError::Parallel {
            path: ctx.path().join(&self.label),
            identity: self.identity.clone(),
            completed_steps: None,
            failures,
        })
    }

    fn merge_outputs(&self, ctx: &ExecutionContext, outputs: &[DataValue]) -> Result<DataValue> {
        self.merge
            .merge(outputs, &self.weights)
            .map_err(|e| PipelineError::block(ctx.path().join(&self.label), self.identity.clone(), e))
    }
}

/// Children in declared order for order-sensitive merges, sorted otherwise,
/// so that reordering the children of a mean changes nothing.
fn compute_identity(steps: &[Step], merge: &MergeStrategy, weights: &[f64]) -> Fingerprint {
    let mut children: Vec<(&Fingerprint, u64)> = steps
        .iter()
        .zip(weights)
        .map(|(step, weight)| (step.identity(), weight.to_bits()))
        .collect();
    if !merge.is_order_sensitive() {
        children.sort();
    }
    children
        .into_iter()
        .fold(
            Hasher::new("parallel").field(merge.identifier()),
            |h, (identity, weight)| h.fingerprint(identity).field(weight.to_le_bytes()),
        )
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::{Trainer, TrainerLogic, Transformer, TransformerLogic};
    use crate::core::cache::Cache;
    use crate::core::data::Params;
    use crate::core::error::BlockError;
    use serde_json::json;
    use std::time::Duration;

    /// Multiplies by `factor` after sleeping `delay_ms`.
    struct SlowTimes {
        factor: i64,
        delay_ms: u64,
    }

    impl TransformerLogic for SlowTimes {
        fn name(&self) -> Option<String> {
            Some(format!("Times{}", self.factor))
        }

        fn config(&self) -> DataValue {
            json!({ "factor": self.factor, "delay_ms": self.delay_ms })
        }

        fn transform(&self, data: DataValue, _params: &Params) -> Result<DataValue, BlockError> {
            std::thread::sleep(Duration::from_millis(self.delay_ms));
            let x = data
                .as_i64()
                .ok_or_else(|| BlockError::InvalidInput(format!("not an integer: {data}")))?;
            Ok(json!(x * self.factor))
        }
    }

    fn times(factor: i64, delay_ms: u64) -> Transformer {
        Transformer::new(SlowTimes { factor, delay_ms }).unwrap()
    }

    #[tokio::test]
    async fn test_merges_in_declared_order() {
        // The first branch finishes last.
        let system = ParallelSystem::new([times(1, 60), times(2, 0), times(3, 20)]).unwrap();
        let ctx = ExecutionContext::new(Cache::disabled());
        assert_eq!(system.transform(json!(5), &ctx).await.unwrap(), json!([5, 10, 15]));
    }

    #[tokio::test]
    async fn test_all_failures_are_collected() {
        let system = ParallelSystem::new([times(2, 0), times(3, 0)]).unwrap();
        let ctx = ExecutionContext::new(Cache::disabled());
        let err = system.transform(json!("x"), &ctx).await.unwrap_err();
        match err {
            PipelineError::Parallel { failures, path, .. } => {
                assert_eq!(failures.len(), 2);
                assert_eq!(path.to_string(), "parallel");
                assert_eq!(
                    failures[1].path().unwrap().to_string(),
                    "parallel[1] → Times3"
                );
            }
            other => panic!("expected a parallel error, got {other}"),
        }
    }

    fn number(value: &DataValue) -> Result<f64, BlockError> {
        value
            .as_f64()
            .ok_or_else(|| BlockError::InvalidInput(format!("not a number: {value}")))
    }

    /// Predicts `x + offset`, learning the offset as `y - x`.
    #[derive(Clone, Default)]
    struct Offset(Option<f64>);

    impl TrainerLogic for Offset {
        fn fit(&mut self, train: &Dataset, _validation: Option<&Dataset>, _params: &Params) -> Result<(), BlockError> {
            self.0 = Some(number(&train.y)? - number(&train.x)?);
            Ok(())
        }

        fn predict(&self, data: &DataValue, _params: &Params) -> Result<DataValue, BlockError> {
            Ok(json!(number(data)? + self.0.ok_or(BlockError::NotFitted)?))
        }

        fn clone_box(&self) -> Box<dyn TrainerLogic> {
            Box::new(self.clone())
        }
    }

    /// Predicts `x * ratio`, learning the ratio as `y / x`.
    #[derive(Clone, Default)]
    struct Ratio(Option<f64>);

    impl TrainerLogic for Ratio {
        fn fit(&mut self, train: &Dataset, _validation: Option<&Dataset>, _params: &Params) -> Result<(), BlockError> {
            self.0 = Some(number(&train.y)? / number(&train.x)?);
            Ok(())
        }

        fn predict(&self, data: &DataValue, _params: &Params) -> Result<DataValue, BlockError> {
            Ok(json!(number(data)? * self.0.ok_or(BlockError::NotFitted)?))
        }

        fn clone_box(&self) -> Box<dyn TrainerLogic> {
            Box::new(self.clone())
        }
    }

    #[tokio::test]
    async fn test_fit_merges_train_and_validation_outputs() {
        let mut step: Step = ParallelSystem::new([
            Step::from(Trainer::new(Offset::default()).unwrap()),
            Step::from(Trainer::new(Ratio::default()).unwrap()),
        ])
        .unwrap()
        .with_merge(MergeStrategy::Mean)
        .into();
        let ctx = ExecutionContext::new(Cache::memory());

        let data = TrainingData::new(
            Dataset::new(json!(2.0), json!(6.0)),
            Some(Dataset::new(json!(4.0), json!(9.0))),
        );
        let out = step.fit(data, &ctx).await.unwrap();

        // Offset learns 4, Ratio learns 3.
        assert_eq!(out.train.x, json!(6.0));
        assert_eq!(out.train.y, json!(6.0));
        let validation = out.validation.unwrap();
        assert_eq!(validation.x, json!(10.0));
        assert_eq!(validation.y, json!(9.0));

        assert_eq!(step.transform(json!(1.0), &ctx).await.unwrap(), json!(4.0));
    }

    #[tokio::test]
    async fn test_single_worker_still_completes() {
        let system = ParallelSystem::new([times(2, 5), times(3, 5)])
            .unwrap()
            .with_workers(1)
            .unwrap()
            .with_merge(MergeStrategy::Sum);
        let ctx = ExecutionContext::new(Cache::disabled());
        assert_eq!(system.transform(json!(1), &ctx).await.unwrap(), json!(5));
    }

    #[test]
    fn test_empty_system_is_composition_error() {
        let err = ParallelSystem::new(Vec::<Step>::new()).err().unwrap();
        assert!(matches!(err, PipelineError::Composition { .. }));
    }

    #[test]
    fn test_weights_are_validated_and_normalized() {
        let system = ParallelSystem::new([times(1, 0), times(2, 0)]).unwrap();
        assert!(matches!(
            system.clone().with_weights(vec![1.0]).err().unwrap(),
            PipelineError::Configuration { .. }
        ));
        assert!(system.clone().with_weights(vec![0.0, 0.0]).is_err());
        assert!(system.clone().with_workers(0).is_err());

        let weighted = system.with_weights(vec![1.0, 3.0]).unwrap();
        assert_eq!(weighted.weights(), &[0.25, 0.75]);
    }

    #[test]
    fn test_identity_order_follows_merge_sensitivity() {
        let ab = ParallelSystem::new([times(1, 0), times(2, 0)]).unwrap();
        let ba = ParallelSystem::new([times(2, 0), times(1, 0)]).unwrap();
        assert_ne!(ab.identity(), ba.identity());

        let ab_mean = ab.clone().with_merge(MergeStrategy::Mean);
        let ba_mean = ba.clone().with_merge(MergeStrategy::Mean);
        assert_eq!(ab_mean.identity(), ba_mean.identity());
        assert_ne!(ab_mean.identity(), ab.identity());
    }
}
