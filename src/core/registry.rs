//! Composition by name.
//!
//! A [`Step`] tree built from owned values cannot contain itself. A graph
//! described by names (from configuration, or assembled piece by piece) can,
//! so it is validated before anything is built: cycles and unknown references
//! are errors, unused definitions are warnings.

use crate::core::Step;
use crate::core::config::PipelineConfig;
use crate::core::error::{PipelineError, Result, StepPath};
use crate::core::system::{MergeStrategy, ParallelSystem, SequentialSystem};
use crate::core::validation::ValidationResult;
use std::collections::{HashMap, HashSet};

/// A parallel system whose children are referenced by name.
#[derive(Debug, Clone, Default)]
pub struct ParallelDefinition {
    pub children: Vec<String>,
    /// Falls back to the registry's default merge strategy.
    pub merge: Option<MergeStrategy>,
    pub weights: Option<Vec<f64>>,
    pub workers: Option<usize>,
}

impl ParallelDefinition {
    pub fn new(children: impl IntoIterator<Item = impl Into<String>>) -> Self {
        ParallelDefinition {
            children: children.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_merge(mut self, merge: MergeStrategy) -> Self {
        self.merge = Some(merge);
        self
    }

    pub fn with_weights(mut self, weights: impl Into<Vec<f64>>) -> Self {
        self.weights = Some(weights.into());
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }
}

#[derive(Clone)]
enum Definition {
    Step(Step),
    Sequential(Vec<String>),
    Parallel(ParallelDefinition),
}

impl Definition {
    fn children(&self) -> &[String] {
        match self {
            Definition::Step(_) => &[],
            Definition::Sequential(children) => children,
            Definition::Parallel(def) => &def.children,
        }
    }
}

#[derive(Clone, Default)]
pub struct StepRegistry {
    definitions: HashMap<String, Definition>,
    default_merge: MergeStrategy,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses the configured merge strategy for parallel definitions that do
    /// not name one.
    pub fn with_config(config: &PipelineConfig) -> Result<Self> {
        Ok(StepRegistry {
            definitions: HashMap::new(),
            default_merge: config.merge_strategy()?,
        })
    }

    pub fn with_default_merge(mut self, merge: MergeStrategy) -> Self {
        self.default_merge = merge;
        self
    }

    /// Registers a ready-made step (a block, or a system built elsewhere).
    pub fn register(&mut self, name: impl Into<String>, step: impl Into<Step>) -> &mut Self {
        self.insert(name.into(), Definition::Step(step.into()))
    }

    pub fn define_sequential(
        &mut self,
        name: impl Into<String>,
        children: impl IntoIterator<Item = impl Into<String>>,
    ) -> &mut Self {
        let children = children.into_iter().map(Into::into).collect();
        self.insert(name.into(), Definition::Sequential(children))
    }

    pub fn define_parallel(&mut self, name: impl Into<String>, definition: ParallelDefinition) -> &mut Self {
        self.insert(name.into(), Definition::Parallel(definition))
    }

    fn insert(&mut self, name: String, definition: Definition) -> &mut Self {
        if self.definitions.insert(name.clone(), definition).is_some() {
            log::warn!("Step '{}' was already defined, replacing it", name);
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    /// Checks the graph reachable from `root` without building anything.
    pub fn validate(&self, root: &str) -> ValidationResult {
        let mut result = ValidationResult::new();
        let mut visited = HashSet::new();
        let mut stack = Vec::new();
        self.validate_recursive(root, None, &mut stack, &mut visited, &mut result);

        let mut unused: Vec<&String> = self
            .definitions
            .keys()
            .filter(|name| !visited.contains(name.as_str()))
            .collect();
        unused.sort();
        for name in unused {
            result.add_warning(format!("'{name}' is defined but not reachable from '{root}'"));
        }
        result
    }

    fn validate_recursive<'a>(
        &'a self,
        name: &'a str,
        parent: Option<&str>,
        stack: &mut Vec<&'a str>,
        visited: &mut HashSet<&'a str>,
        result: &mut ValidationResult,
    ) {
        if let Some(start) = stack.iter().position(|n| *n == name) {
            let mut cycle: Vec<&str> = stack[start..].to_vec();
            cycle.push(name);
            result.add_error(format!("cycle detected: {}", cycle.join(" → ")));
            return;
        }
        if visited.contains(name) {
            return;
        }

        let Some(definition) = self.definitions.get(name) else {
            match parent {
                Some(parent) => result.add_error(format!("'{parent}' references unknown step '{name}'")),
                None => result.add_error(format!("unknown root step '{name}'")),
            }
            return;
        };
        visited.insert(name);

        if let Definition::Parallel(def) = definition {
            if def.children.is_empty() {
                result.add_error(format!("parallel '{name}' has no children"));
            } else if def.children.len() == 1 {
                result.add_warning(format!("parallel '{name}' has a single child"));
            }
            if let Some(weights) = &def.weights {
                if weights.len() != def.children.len() {
                    result.add_error(format!(
                        "parallel '{name}' has {} weights for {} children",
                        weights.len(),
                        def.children.len()
                    ));
                }
            }
        }

        stack.push(name);
        for child in definition.children() {
            self.validate_recursive(child, Some(name), stack, visited, result);
        }
        stack.pop();
    }

    /// Validates and builds the step named `root`.
    pub fn build(&self, root: &str) -> Result<Step> {
        let result = self.validate(root);
        result.log_summary();
        if !result.is_safe() {
            return Err(PipelineError::composition(
                StepPath::root(root),
                result.errors().collect::<Vec<_>>().join("; "),
            ));
        }
        self.build_recursive(root, &StepPath::root(root))
    }

    fn build_recursive(&self, name: &str, path: &StepPath) -> Result<Step> {
        let definition = self
            .definitions
            .get(name)
            .ok_or_else(|| PipelineError::composition(path.clone(), format!("unknown step '{name}'")))?;
        let children = definition
            .children()
            .iter()
            .map(|child| self.build_recursive(child, &path.join(child.as_str())))
            .collect::<Result<Vec<Step>>>()?;

        let step = match definition {
            Definition::Step(step) => step.clone(),
            Definition::Sequential(_) => SequentialSystem::new(children).named(name).into(),
            Definition::Parallel(def) => {
                let merge = def.merge.clone().unwrap_or_else(|| self.default_merge.clone());
                let mut system = ParallelSystem::new(children)?.with_merge(merge).named(name);
                if let Some(weights) = &def.weights {
                    system = system.with_weights(weights.clone())?;
                }
                if let Some(workers) = def.workers {
                    system = system.with_workers(workers)?;
                }
                system.into()
            }
        };
        Ok(step)
    }
}
