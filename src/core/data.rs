//! The values that flow between blocks.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The Alias for serde_json::Value, the one data type every block consumes and produces.
pub type DataValue = serde_json::Value;

/// Per-call arguments routed to a block or system.
pub type Params = HashMap<String, DataValue>;

/// A labelled set of samples: features `x` and targets `y`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub x: DataValue,
    pub y: DataValue,
}

impl Dataset {
    pub fn new(x: impl Into<DataValue>, y: impl Into<DataValue>) -> Self {
        Dataset {
            x: x.into(),
            y: y.into(),
        }
    }
}

/// What travels down the fit path: the training set and an optional
/// validation set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingData {
    pub train: Dataset,
    pub validation: Option<Dataset>,
}

impl TrainingData {
    pub fn new(train: Dataset, validation: Option<Dataset>) -> Self {
        TrainingData { train, validation }
    }
}

/// Turns the value stored under one key of an arguments object into the
/// arguments of the step named by that key.
pub(crate) fn nested_params(params: &Params, key: &str) -> Params {
    match params.get(key) {
        Some(DataValue::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Some(DataValue::Null) | None => Params::new(),
        Some(other) => {
            log::warn!(
                "Arguments for step '{}' must be an object, ignoring {}",
                key,
                other
            );
            Params::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_params_routes_by_name() {
        let mut params = Params::new();
        params.insert("scaler".into(), json!({"factor": 3}));
        params.insert("other".into(), json!(7));

        let scaler = nested_params(&params, "scaler");
        assert_eq!(scaler.get("factor"), Some(&json!(3)));
        assert!(nested_params(&params, "missing").is_empty());
        assert!(nested_params(&params, "other").is_empty());
    }

    #[test]
    fn test_dataset_serde() {
        let data = TrainingData::new(Dataset::new(json!([1, 2]), json!([0, 1])), None);
        let text = serde_json::to_string(&data).unwrap();
        let parsed: TrainingData = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, data);
    }
}
