use crate::core::Step;
use crate::core::context::ExecutionContext;
use crate::core::data::{DataValue, TrainingData};
use crate::core::error::Result;
use crate::core::fingerprint::{Fingerprint, Hasher};
use crate::core::system::child_segment;

const DEFAULT_LABEL: &str = "sequential";

/// Runs its children strictly in order. An empty system returns its input.
#[derive(Clone)]
pub struct SequentialSystem {
    label: String,
    identity: Fingerprint,
    steps: Vec<Step>,
}

impl SequentialSystem {
    pub fn new(steps: impl IntoIterator<Item = impl Into<Step>>) -> Self {
        let steps: Vec<Step> = steps.into_iter().map(Into::into).collect();
        let identity = steps
            .iter()
            .fold(Hasher::new("sequential").field(steps.len().to_le_bytes()), |h, step| {
                h.fingerprint(step.identity())
            })
            .finish();
        SequentialSystem {
            label: DEFAULT_LABEL.to_string(),
            identity,
            steps,
        }
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

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub async fn transform(&self, data: DataValue, ctx: &ExecutionContext) -> Result<DataValue> {
        let mut current = data;
        for (i, step) in self.steps.iter().enumerate() {
            let child = ctx.child(child_segment(&self.label, i), step.label());
            current = step
                .transform(current, &child)
                .await
                .map_err(|e| e.with_completed_steps(i))?;
        }
        Ok(current)
    }

    pub async fn fit(&mut self, data: TrainingData, ctx: &ExecutionContext) -> Result<TrainingData> {
        let mut current = data;
        for (i, step) in self.steps.iter_mut().enumerate() {
            let child = ctx.child(child_segment(&self.label, i), step.label());
            current = step
                .fit(current, &child)
                .await
                .map_err(|e| e.with_completed_steps(i))?;
        }
        Ok(current)
    }
}
