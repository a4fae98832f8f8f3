use crate::core::error::StepPath;
use crate::core::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// How a block call was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    Hit,
    Miss,
    /// Caching was off for this block or this run.
    Uncached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Transform,
    Fit,
    Predict,
}

/// A single entry in the execution trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub timestamp: DateTime<Utc>,
    pub path: String,
    pub block: String,
    pub phase: Phase,
    pub identity: Fingerprint,
    pub input: Fingerprint,
    pub outcome: CacheOutcome,
    pub duration_ms: u64,
}

impl TraceEntry {
    pub(crate) fn new(
        path: &StepPath,
        block: &str,
        phase: Phase,
        identity: &Fingerprint,
        input: &Fingerprint,
        outcome: CacheOutcome,
        started: Instant,
    ) -> Self {
        TraceEntry {
            timestamp: Utc::now(),
            path: path.to_string(),
            block: block.to_string(),
            phase,
            identity: identity.clone(),
            input: input.clone(),
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Trait for recording execution traces.
pub trait ExecutionTrace: Send + Sync {
    fn record(&self, entry: TraceEntry);
    fn flush(&self) {}
}

/// Simple in-memory collector for traces.
#[derive(Default)]
pub struct MemoryTrace {
    entries: Mutex<Vec<TraceEntry>>,
}

impl MemoryTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of calls to the named block that actually ran its logic.
    pub fn executions_of(&self, block: &str) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.block == block && e.outcome != CacheOutcome::Hit)
            .count()
    }

    pub fn count(&self, outcome: CacheOutcome) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.outcome == outcome)
            .count()
    }
}

impl ExecutionTrace for MemoryTrace {
    fn record(&self, entry: TraceEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(block: &str, outcome: CacheOutcome) -> TraceEntry {
        let fp = Fingerprint::of_bytes(block.as_bytes());
        TraceEntry::new(
            &StepPath::root("Pipeline").join(block),
            block,
            Phase::Transform,
            &fp,
            &fp,
            outcome,
            Instant::now(),
        )
    }

    #[test]
    fn test_memory_trace_counts() {
        let trace = MemoryTrace::new();
        trace.record(entry("AddOne", CacheOutcome::Miss));
        trace.record(entry("AddOne", CacheOutcome::Hit));
        trace.record(entry("TimesTwo", CacheOutcome::Uncached));

        assert_eq!(trace.entries().len(), 3);
        assert_eq!(trace.executions_of("AddOne"), 1);
        assert_eq!(trace.executions_of("TimesTwo"), 1);
        assert_eq!(trace.count(CacheOutcome::Hit), 1);
        assert_eq!(trace.entries()[0].path, "Pipeline → AddOne");
    }

    #[test]
    fn test_entry_serializes_outcome_in_snake_case() {
        let value = serde_json::to_value(entry("AddOne", CacheOutcome::Uncached)).unwrap();
        assert_eq!(value["outcome"], "uncached");
        assert_eq!(value["phase"], "transform");
    }
}
