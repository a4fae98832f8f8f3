//! A complete example showing how to build and run a pipeline with Agogos.
//!
//! This example demonstrates:
//! - Writing transformer and trainer logic
//! - Composing blocks into sequential and parallel systems
//! - Fitting a pipeline and predicting with it
//! - Seeing the cache at work through an execution trace

use agogos::prelude::*;
use agogos::trace::CacheOutcome;
use serde_json::json;
use std::sync::Arc;

// ============================================================================
// Step 1: Feature Transformers
// ============================================================================

/// Shifts every value by a configured offset.
struct Shift {
    offset: f64,
}

impl TransformerLogic for Shift {
    fn config(&self) -> DataValue {
        json!({ "offset": self.offset })
    }

    fn transform(&self, data: DataValue, _params: &Params) -> Result<DataValue, BlockError> {
        let values = numbers(&data)?;
        Ok(json!(values.iter().map(|x| x + self.offset).collect::<Vec<_>>()))
    }
}

/// Squares every value.
struct Square;

impl TransformerLogic for Square {
    fn transform(&self, data: DataValue, _params: &Params) -> Result<DataValue, BlockError> {
        let values = numbers(&data)?;
        Ok(json!(values.iter().map(|x| x * x).collect::<Vec<_>>()))
    }
}

fn numbers(data: &DataValue) -> Result<Vec<f64>, BlockError> {
    data.as_array()
        .ok_or(BlockError::ShapeMismatch {
            expected: "array of numbers".into(),
            found: data.to_string(),
        })?
        .iter()
        .map(|v| v.as_f64().ok_or(BlockError::InvalidInput(v.to_string())))
        .collect()
}

// ============================================================================
// Step 2: A Trainer
// ============================================================================

/// Predicts `x * ratio`, where the ratio is learned as mean(y) / mean(x).
#[derive(Clone, Default)]
struct MeanRatio {
    ratio: Option<f64>,
}

impl TrainerLogic for MeanRatio {
    fn fit(&mut self, train: &Dataset, _validation: Option<&Dataset>, _params: &Params) -> Result<(), BlockError> {
        let x = numbers(&train.x)?;
        let y = numbers(&train.y)?;
        let mean_x = x.iter().sum::<f64>() / x.len().max(1) as f64;
        let mean_y = y.iter().sum::<f64>() / y.len().max(1) as f64;
        if mean_x == 0.0 {
            return Err(BlockError::InvalidInput("mean of features is zero".into()));
        }
        self.ratio = Some(mean_y / mean_x);
        println!("[MeanRatio] Fitted ratio {:.3}", mean_y / mean_x);
        Ok(())
    }

    fn predict(&self, data: &DataValue, _params: &Params) -> Result<DataValue, BlockError> {
        let ratio = self.ratio.ok_or(BlockError::NotFitted)?;
        Ok(json!(numbers(data)?.iter().map(|x| x * ratio).collect::<Vec<_>>()))
    }

    fn state(&self) -> Option<DataValue> {
        self.ratio.map(|ratio| json!({ "ratio": ratio }))
    }

    fn load_state(&mut self, state: DataValue) -> Result<(), BlockError> {
        let ratio = state["ratio"].as_f64().ok_or(BlockError::MissingField("ratio".into()))?;
        self.ratio = Some(ratio);
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn TrainerLogic> {
        Box::new(self.clone())
    }
}

// ============================================================================
// Step 3: Assemble and Run
// ============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> agogos::Result<()> {
    println!("=== Agogos Basic Pipeline ===\n");

    // Two feature branches, averaged, then a shift.
    let features = SequentialSystem::new([
        Step::from(
            ParallelSystem::new([Transformer::new(Shift { offset: 1.0 })?, Transformer::new(Square)?])?
                .with_merge(MergeStrategy::Mean),
        ),
        Step::from(Transformer::new(Shift { offset: -0.5 })?),
    ]);

    let mut pipeline = Pipeline::builder()
        .x_system(features)
        .training_system(Trainer::new(MeanRatio::default())?)
        .build()?;

    println!("{}", pipeline.describe());

    let trace = Arc::new(MemoryTrace::new());
    let options = RunOptions::new().with_trace(trace.clone());

    let train = Dataset::new(json!([1.0, 2.0, 3.0]), json!([2.0, 5.0, 10.0]));
    pipeline.fit(train.clone(), None, &options).await?;

    let prediction = pipeline.predict(json!([4.0]), &options).await?;
    println!("\nPrediction for [4.0]: {}", prediction);

    // Fitting again on the same data is served from the cache.
    pipeline.fit(train, None, &options).await?;

    println!("\n=== Execution Trace ===");
    for entry in trace.entries() {
        println!("  {:<45} {:?} {:?}", entry.path, entry.phase, entry.outcome);
    }
    println!(
        "\nHits: {}, misses: {}",
        trace.count(CacheOutcome::Hit),
        trace.count(CacheOutcome::Miss)
    );

    Ok(())
}
