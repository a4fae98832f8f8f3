use crate::core::cache::Cache;
use crate::core::config::DEFAULT_PARALLEL_WORKERS;
use crate::core::data::{Params, nested_params};
use crate::core::error::StepPath;
use crate::core::trace::{ExecutionTrace, TraceEntry};
use std::sync::Arc;

/// Everything a step needs besides its input: the cache handle, where in the
/// tree it sits, the arguments routed to it and the tracing sink.
///
/// A context is cheap to clone and every child step gets its own.
#[derive(Clone)]
pub struct ExecutionContext {
    cache: Cache,
    path: StepPath,
    args: Params,
    workers: usize,
    trace: Option<Arc<dyn ExecutionTrace>>,
}

impl ExecutionContext {
    pub fn new(cache: Cache) -> Self {
        ExecutionContext {
            cache,
            path: StepPath::default(),
            args: Params::new(),
            workers: DEFAULT_PARALLEL_WORKERS,
            trace: None,
        }
    }

    pub fn with_path(mut self, path: StepPath) -> Self {
        self.path = path;
        self
    }

    pub fn with_args(mut self, args: Params) -> Self {
        self.args = args;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_trace(mut self, trace: Arc<dyn ExecutionTrace>) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn path(&self) -> &StepPath {
        &self.path
    }

    pub fn args(&self) -> &Params {
        &self.args
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Context of a child step: the path grows by `segment` and the
    /// arguments narrow to the object stored under `arg_key`.
    ///
    /// Systems narrow by their children's names, so a leaf always reads
    /// `args[name]` of whatever contains it. A pipeline slot narrows once for
    /// the slot and once more for a leaf placed directly in it.
    pub fn child(&self, segment: impl Into<String>, arg_key: &str) -> Self {
        ExecutionContext {
            path: self.path.join(segment),
            ..self.scoped(arg_key)
        }
    }

    /// Same path, arguments narrowed to the object stored under `arg_key`.
    pub(crate) fn scoped(&self, arg_key: &str) -> Self {
        ExecutionContext {
            cache: self.cache.clone(),
            path: self.path.clone(),
            args: nested_params(&self.args, arg_key),
            workers: self.workers,
            trace: self.trace.clone(),
        }
    }

    pub(crate) fn record(&self, entry: impl FnOnce() -> TraceEntry) {
        if let Some(trace) = &self.trace {
            trace.record(entry());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_child_narrows_args_and_extends_path() {
        let mut args = Params::new();
        args.insert("training_system".into(), json!({"Ridge": {"alpha": 0.5}}));

        let root = ExecutionContext::new(Cache::disabled())
            .with_path(StepPath::root("Pipeline"))
            .with_args(args);
        let slot = root.child("training_system", "training_system");
        let leaf = slot.child("Ridge", "Ridge");

        assert_eq!(slot.path().to_string(), "Pipeline → training_system");
        assert_eq!(leaf.args().get("alpha"), Some(&json!(0.5)));
        assert!(root.child("x_system", "x_system").args().is_empty());
    }

    #[test]
    fn test_scoped_keeps_the_path() {
        let mut args = Params::new();
        args.insert("Shift".into(), json!({"extra": 1}));
        let ctx = ExecutionContext::new(Cache::disabled())
            .with_path(StepPath::root("Pipeline"))
            .with_args(args);

        let scoped = ctx.scoped("Shift");
        assert_eq!(scoped.path(), ctx.path());
        assert_eq!(scoped.args().get("extra"), Some(&json!(1)));
    }

    #[test]
    fn test_workers_never_zero() {
        let ctx = ExecutionContext::new(Cache::disabled()).with_workers(0);
        assert_eq!(ctx.workers(), 1);
    }
}
