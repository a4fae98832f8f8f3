pub mod block;
pub mod cache;
pub mod config;
pub mod context;
pub mod data;
pub mod error;
pub mod fingerprint;
pub mod pipeline;
pub mod registry;
pub mod system;
pub mod trace;
pub mod validation;

use block::{Trainer, Transformer};
use context::ExecutionContext;
use data::{DataValue, Dataset, TrainingData};
use error::Result;
use fingerprint::Fingerprint;
use futures::future::BoxFuture;
use std::fmt::Write as _;
use system::{ParallelSystem, SequentialSystem};

/// Any node of a composition tree.
#[derive(Clone)]
pub enum Step {
    Transformer(Transformer),
    Trainer(Trainer),
    Sequential(SequentialSystem),
    Parallel(ParallelSystem),
}

impl Step {
    pub fn identity(&self) -> &Fingerprint {
        match self {
            Step::Transformer(t) => t.identity(),
            Step::Trainer(t) => t.identity(),
            Step::Sequential(s) => s.identity(),
            Step::Parallel(p) => p.identity(),
        }
    }

    /// Name of a leaf or label of a system. Parents route arguments by it.
    pub fn label(&self) -> &str {
        match self {
            Step::Transformer(t) => t.name(),
            Step::Trainer(t) => t.name(),
            Step::Sequential(s) => s.label(),
            Step::Parallel(p) => p.label(),
        }
    }

    pub fn children(&self) -> &[Step] {
        match self {
            Step::Transformer(_) | Step::Trainer(_) => &[],
            Step::Sequential(s) => s.steps(),
            Step::Parallel(p) => p.steps(),
        }
    }

    pub fn contains_trainer(&self) -> bool {
        match self {
            Step::Trainer(_) => true,
            Step::Transformer(_) => false,
            Step::Sequential(_) | Step::Parallel(_) => {
                self.children().iter().any(Step::contains_trainer)
            }
        }
    }

    /// Apply-only path: trainers predict with their fitted state, nothing is
    /// fitted.
    pub fn transform<'a>(
        &'a self,
        data: DataValue,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<DataValue>> {
        Box::pin(async move {
            match self {
                Step::Transformer(t) => t.transform(data, ctx).await,
                Step::Trainer(t) => t.predict(data, ctx).await,
                Step::Sequential(s) => s.transform(data, ctx).await,
                Step::Parallel(p) => p.transform(data, ctx).await,
            }
        })
    }

    /// Fit-then-apply path. Steps without trainers only transform the `x`
    /// of the training and validation sets.
    pub fn fit<'a>(
        &'a mut self,
        data: TrainingData,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<TrainingData>> {
        Box::pin(async move {
            if !self.contains_trainer() {
                return self.transform_x(data, ctx).await;
            }
            match self {
                Step::Trainer(t) => t.fit(data, ctx).await,
                Step::Sequential(s) => s.fit(data, ctx).await,
                Step::Parallel(p) => p.fit(data, ctx).await,
                Step::Transformer(_) => self.transform_x(data, ctx).await,
            }
        })
    }

    pub(crate) async fn transform_x(
        &self,
        data: TrainingData,
        ctx: &ExecutionContext,
    ) -> Result<TrainingData> {
        let TrainingData { train, validation } = data;
        let train = Dataset {
            x: self.transform(train.x, ctx).await?,
            y: train.y,
        };
        let validation = match validation {
            Some(set) => Some(Dataset {
                x: self.transform(set.x, ctx).await?,
                y: set.y,
            }),
            None => None,
        };
        Ok(TrainingData { train, validation })
    }

    pub(crate) async fn transform_y(
        &self,
        data: TrainingData,
        ctx: &ExecutionContext,
    ) -> Result<TrainingData> {
        let TrainingData { train, validation } = data;
        let train = Dataset {
            x: train.x,
            y: self.transform(train.y, ctx).await?,
        };
        let validation = match validation {
            Some(set) => Some(Dataset {
                x: set.x,
                y: self.transform(set.y, ctx).await?,
            }),
            None => None,
        };
        Ok(TrainingData { train, validation })
    }

    fn kind(&self) -> &'static str {
        match self {
            Step::Transformer(_) => "transformer",
            Step::Trainer(_) => "trainer",
            Step::Sequential(_) => "sequential",
            Step::Parallel(_) => "parallel",
        }
    }

    /// Indented text tree of the step and its children with their identities.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        self.describe_into(&mut out, 0);
        out
    }

    pub(crate) fn describe_into(&self, out: &mut String, depth: usize) {
        let _ = write!(
            out,
            "{:indent$}{} ({}) {}",
            "",
            self.label(),
            self.kind(),
            self.identity().short(),
            indent = depth * 2
        );
        match self {
            Step::Parallel(p) => {
                let _ = write!(out, " merge={}", p.merge_strategy().identifier());
            }
            Step::Trainer(t) if !t.is_fitted() => out.push_str(" unfitted"),
            _ => {}
        }
        out.push('\n');
        for child in self.children() {
            child.describe_into(out, depth + 1);
        }
    }

    pub(crate) fn html_into(&self, out: &mut String) {
        let _ = write!(
            out,
            "<li><span class=\"{}\">{}</span> <code>{}</code>",
            self.kind(),
            escape_html(self.label()),
            self.identity().short()
        );
        if !self.children().is_empty() {
            out.push_str("<ul>");
            for child in self.children() {
                child.html_into(out);
            }
            out.push_str("</ul>");
        }
        out.push_str("</li>");
    }
}

pub(crate) fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

impl From<Transformer> for Step {
    fn from(t: Transformer) -> Self {
        Step::Transformer(t)
    }
}

impl From<Trainer> for Step {
    fn from(t: Trainer) -> Self {
        Step::Trainer(t)
    }
}

impl From<SequentialSystem> for Step {
    fn from(s: SequentialSystem) -> Self {
        Step::Sequential(s)
    }
}

impl From<ParallelSystem> for Step {
    fn from(p: ParallelSystem) -> Self {
        Step::Parallel(p)
    }
}
