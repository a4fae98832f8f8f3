//! Disk cache behavior across pipeline instances.
//!
//! Each test builds two pipelines over the same cache directory: the second
//! run must be served entirely from the files written by the first.

use agogos::cache::{Cache, CacheKey};
use agogos::prelude::*;
use agogos::trace::CacheOutcome;
use agogos::Fingerprint;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Increment {
    calls: Arc<AtomicUsize>,
}

impl TransformerLogic for Increment {
    fn transform(&self, data: DataValue, _params: &Params) -> Result<DataValue, BlockError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let x = data.as_f64().ok_or(BlockError::InvalidInput(data.to_string()))?;
        Ok(json!(x + 1.0))
    }
}

struct Square;

impl TransformerLogic for Square {
    fn transform(&self, data: DataValue, _params: &Params) -> Result<DataValue, BlockError> {
        let x = data.as_f64().ok_or(BlockError::InvalidInput(data.to_string()))?;
        Ok(json!(x * x))
    }
}

fn features(calls: &Arc<AtomicUsize>) -> ParallelSystem {
    ParallelSystem::new([
        Transformer::new(Increment {
            calls: Arc::clone(calls),
        })
        .unwrap(),
        Transformer::new(Square).unwrap(),
    ])
    .unwrap()
    .with_merge(MergeStrategy::Sum)
}

fn disk_config(dir: &std::path::Path) -> PipelineConfig {
    PipelineConfig {
        cache_dir: Some(dir.to_path_buf()),
        ..PipelineConfig::default()
    }
}

#[tokio::test]
async fn test_second_run_is_all_hits() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let first = Pipeline::builder()
        .config(disk_config(dir.path()))
        .x_system(features(&calls))
        .build()
        .unwrap();
    assert_eq!(first.cache().backend_name(), "disk");
    // (3 + 1) + 3 * 3
    let out = first.transform(json!(3.0), &RunOptions::new()).await.unwrap();
    assert_eq!(out, json!(13.0));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let second = Pipeline::builder()
        .config(disk_config(dir.path()))
        .x_system(features(&calls))
        .build()
        .unwrap();
    let trace = Arc::new(MemoryTrace::new());
    let again = second
        .transform(json!(3.0), &RunOptions::new().with_trace(trace.clone()))
        .await
        .unwrap();

    assert_eq!(again, out);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(trace.count(CacheOutcome::Hit), 2);
    assert_eq!(trace.count(CacheOutcome::Miss), 0);
    assert_eq!(second.cache().stats().hits, 2);
}

#[tokio::test]
async fn test_entries_are_laid_out_by_block_and_input() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::disk(dir.path()).unwrap();
    let block = Transformer::new(Square).unwrap();
    let ctx = agogos::ExecutionContext::new(cache.clone());

    block.transform(json!(4.0), &ctx).await.unwrap();

    let input = Fingerprint::of_input(&json!(4.0), &Params::new());
    let key = CacheKey::new(block.identity(), &input);
    let file = dir.path().join(key.relative_path());
    assert!(file.is_file(), "missing {}", file.display());
    assert!(dir.path().join(block.identity().as_str()).is_dir());

    let stored: serde_json::Value = serde_json::from_slice(&std::fs::read(&file).unwrap()).unwrap();
    assert_eq!(stored["artifact"], json!(16.0));
    assert_eq!(cache.len().await, 1);
}

#[tokio::test]
async fn test_invalidate_forces_recompute() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let block = Transformer::new(Increment {
        calls: Arc::clone(&calls),
    })
    .unwrap();
    let ctx = agogos::ExecutionContext::new(Cache::disk(dir.path()).unwrap());

    block.transform(json!(1.0), &ctx).await.unwrap();
    block.transform(json!(2.0), &ctx).await.unwrap();
    assert_eq!(ctx.cache().invalidate(block.identity()).await, 2);
    assert!(ctx.cache().is_empty().await);

    block.transform(json!(1.0), &ctx).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_unusable_directory_runs_uncached() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"occupied").unwrap();

    let pipeline = Pipeline::builder()
        .config(disk_config(&blocker))
        .x_system(Transformer::new(Square).unwrap())
        .build()
        .unwrap();
    assert!(!pipeline.cache().is_enabled());
    assert_eq!(
        pipeline.transform(json!(5.0), &RunOptions::new()).await.unwrap(),
        json!(25.0)
    );
}
