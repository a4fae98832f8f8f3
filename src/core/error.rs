use crate::core::fingerprint::Fingerprint;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The failure a block's own logic reports.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BlockError {
    #[error("shape mismatch: expected {expected}, found {found}")]
    ShapeMismatch { expected: String, found: String },

    #[error("missing required input field '{0}'")]
    MissingField(String),

    #[error("trainer has not been fitted")]
    NotFitted,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Failed(String),

    #[error("block panicked: {0}")]
    Panicked(String),
}

impl BlockError {
    pub fn failed(message: impl Into<String>) -> Self {
        BlockError::Failed(message.into())
    }
}

/// Where in the composition tree something happened,
/// e.g. `Pipeline → training_system → parallel[1] → Ridge`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct StepPath(Vec<String>);

impl StepPath {
    pub fn root(segment: impl Into<String>) -> Self {
        StepPath(vec![segment.into()])
    }

    pub fn join(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        StepPath(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for StepPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<root>");
        }
        f.write_str(&self.0.join(" → "))
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid or missing configuration, detected at construction time.
    #[error("configuration error at {path}: {message}")]
    Configuration { path: StepPath, message: String },

    /// Malformed composition graph, detected before anything executes.
    #[error("composition error at {path}: {message}")]
    Composition { path: StepPath, message: String },

    /// A block's logic failed while fitting, transforming or predicting.
    #[error(
        "block {} failed at {path}{}: {source}",
        .identity.short(),
        completed_suffix(.completed_steps)
    )]
    BlockExecution {
        path: StepPath,
        identity: Fingerprint,
        completed_steps: Option<usize>,
        #[source]
        source: BlockError,
    },

    /// One or more branches of a parallel system failed. Every branch ran to
    /// completion first; all of their errors are kept.
    #[error(
        "{} parallel branch(es) failed at {path}{}: [{}]",
        .failures.len(),
        completed_suffix(.completed_steps),
        join_failures(.failures)
    )]
    Parallel {
        path: StepPath,
        identity: Fingerprint,
        completed_steps: Option<usize>,
        failures: Vec<PipelineError>,
    },

    #[error("pipeline invocation timed out after {0:?}")]
    Timeout(Duration),

    #[error("runtime error: {0}")]
    Runtime(String),
}

fn completed_suffix(completed: &Option<usize>) -> String {
    completed.map_or(String::new(), |n| format!(" after {n} completed step(s)"))
}

fn join_failures(failures: &[PipelineError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl PipelineError {
    pub fn configuration(path: StepPath, message: impl Into<String>) -> Self {
        PipelineError::Configuration {
            path,
            message: message.into(),
        }
    }

    pub fn composition(path: StepPath, message: impl Into<String>) -> Self {
        PipelineError::Composition {
            path,
            message: message.into(),
        }
    }

    pub fn block(path: StepPath, identity: Fingerprint, source: BlockError) -> Self {
        PipelineError::BlockExecution {
            path,
            identity,
            completed_steps: None,
            source,
        }
    }

    /// Records how many steps of the innermost enclosing sequential system
    /// finished before this error. An already recorded count is kept.
    pub fn with_completed_steps(mut self, completed: usize) -> Self {
        match &mut self {
            PipelineError::BlockExecution {
                completed_steps, ..
            }
            | PipelineError::Parallel {
                completed_steps, ..
            } if completed_steps.is_none() => *completed_steps = Some(completed),
            _ => {}
        }
        self
    }

    pub fn path(&self) -> Option<&StepPath> {
        match self {
            PipelineError::Configuration { path, .. }
            | PipelineError::Composition { path, .. }
            | PipelineError::BlockExecution { path, .. }
            | PipelineError::Parallel { path, .. } => Some(path),
            PipelineError::Timeout(_) | PipelineError::Runtime(_) => None,
        }
    }

    pub fn identity(&self) -> Option<&Fingerprint> {
        match self {
            PipelineError::BlockExecution { identity, .. }
            | PipelineError::Parallel { identity, .. } => Some(identity),
            _ => None,
        }
    }

    pub fn completed_steps(&self) -> Option<usize> {
        match self {
            PipelineError::BlockExecution {
                completed_steps, ..
            }
            | PipelineError::Parallel {
                completed_steps, ..
            } => *completed_steps,
            _ => None,
        }
    }

    /// Errors raised while building a pipeline rather than running one.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            PipelineError::Configuration { .. } | PipelineError::Composition { .. }
        )
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Fingerprint {
        Fingerprint::of_bytes(b"block")
    }

    #[test]
    fn test_step_path_display() {
        let path = StepPath::root("Pipeline")
            .join("training_system")
            .join("parallel[1]")
            .join("blockX");
        assert_eq!(
            path.to_string(),
            "Pipeline → training_system → parallel[1] → blockX"
        );
        assert_eq!(StepPath::default().to_string(), "<root>");
    }

    #[test]
    fn test_completed_steps_keeps_innermost_count() {
        let err = PipelineError::block(StepPath::root("a"), identity(), BlockError::NotFitted)
            .with_completed_steps(2)
            .with_completed_steps(5);
        assert_eq!(err.completed_steps(), Some(2));
        assert!(err.to_string().contains("after 2 completed step(s)"));
    }

    #[test]
    fn test_parallel_error_lists_every_failure() {
        let failures = vec![
            PipelineError::block(StepPath::root("a"), identity(), BlockError::failed("left")),
            PipelineError::block(StepPath::root("b"), identity(), BlockError::failed("right")),
        ];
        let err = PipelineError::Parallel {
            path: StepPath::root("parallel"),
            identity: identity(),
            completed_steps: None,
            failures,
        };
        let message = err.to_string();
        assert!(message.starts_with("2 parallel branch(es) failed"));
        assert!(message.contains("left"));
        assert!(message.contains("right"));
    }

    #[test]
    fn test_construction_errors() {
        assert!(PipelineError::composition(StepPath::root("x"), "cycle").is_construction_error());
        assert!(!PipelineError::Timeout(Duration::from_secs(1)).is_construction_error());
        assert!(PipelineError::Timeout(Duration::from_secs(1)).path().is_none());
    }
}
