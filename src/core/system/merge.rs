//! How a parallel system combines the outputs of its branches.

use crate::core::data::DataValue;
use crate::core::error::BlockError;
use serde_json::{Map, Number};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// User-defined combination rule for [`MergeStrategy::Custom`].
///
/// `outputs` arrive in declared branch order; `weights` has one entry per
/// branch and sums to 1.
pub trait MergeLogic: Send + Sync + 'static {
    fn merge(&self, outputs: &[DataValue], weights: &[f64]) -> Result<DataValue, BlockError>;
}

#[derive(Clone, Default)]
pub enum MergeStrategy {
    /// Scalars are appended and arrays flattened one level, in branch order.
    #[default]
    Concatenate,
    /// Weighted elementwise mean of numbers or equally shaped numeric arrays.
    Mean,
    /// Elementwise sum. Integers stay integers unless the sum overflows.
    Sum,
    /// Union of the columns of object outputs. A column produced by two
    /// branches is an error.
    Union,
    Custom {
        name: String,
        order_sensitive: bool,
        logic: Arc<dyn MergeLogic>,
    },
}

impl MergeStrategy {
    pub fn custom(name: impl Into<String>, order_sensitive: bool, logic: impl MergeLogic) -> Self {
        MergeStrategy::Custom {
            name: name.into(),
            order_sensitive,
            logic: Arc::new(logic),
        }
    }

    /// Stable name, part of every parallel system's identity.
    pub fn identifier(&self) -> &str {
        match self {
            MergeStrategy::Concatenate => "concatenate",
            MergeStrategy::Mean => "mean",
            MergeStrategy::Sum => "sum",
            MergeStrategy::Union => "union",
            MergeStrategy::Custom { name, .. } => name,
        }
    }

    /// Whether swapping two branches can change the merged result.
    pub fn is_order_sensitive(&self) -> bool {
        match self {
            MergeStrategy::Concatenate => true,
            MergeStrategy::Mean | MergeStrategy::Sum | MergeStrategy::Union => false,
            MergeStrategy::Custom {
                order_sensitive, ..
            } => *order_sensitive,
        }
    }

    pub fn merge(&self, outputs: &[DataValue], weights: &[f64]) -> Result<DataValue, BlockError> {
        if outputs.len() != weights.len() {
            return Err(BlockError::ShapeMismatch {
                expected: format!("{} weights", outputs.len()),
                found: format!("{} weights", weights.len()),
            });
        }
        match self {
            MergeStrategy::Concatenate => Ok(concatenate(outputs)),
            MergeStrategy::Mean => {
                let refs: Vec<&DataValue> = outputs.iter().collect();
                elementwise(&refs, &|numbers: &[&Number]| weighted_mean(numbers, weights))
            }
            MergeStrategy::Sum => {
                let refs: Vec<&DataValue> = outputs.iter().collect();
                elementwise(&refs, &sum)
            }
            MergeStrategy::Union => union(outputs),
            MergeStrategy::Custom { logic, .. } => logic.merge(outputs, weights),
        }
    }
}

impl fmt::Debug for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStrategy::Custom {
                name,
                order_sensitive,
                ..
            } => f
                .debug_struct("Custom")
                .field("name", name)
                .field("order_sensitive", order_sensitive)
                .finish_non_exhaustive(),
            other => f.write_str(other.identifier()),
        }
    }
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "concatenate" | "concat" => Ok(MergeStrategy::Concatenate),
            "mean" | "average" => Ok(MergeStrategy::Mean),
            "sum" => Ok(MergeStrategy::Sum),
            "union" => Ok(MergeStrategy::Union),
            other => Err(format!(
                "unknown merge strategy '{other}' (expected concatenate, mean, sum or union)"
            )),
        }
    }
}

fn concatenate(outputs: &[DataValue]) -> DataValue {
    let mut merged = Vec::new();
    for output in outputs {
        match output {
            DataValue::Array(items) => merged.extend(items.iter().cloned()),
            other => merged.push(other.clone()),
        }
    }
    DataValue::Array(merged)
}

fn union(outputs: &[DataValue]) -> Result<DataValue, BlockError> {
    let mut columns = Map::new();
    for output in outputs {
        let DataValue::Object(object) = output else {
            return Err(BlockError::ShapeMismatch {
                expected: "object".into(),
                found: kind_of(output).into(),
            });
        };
        for (column, value) in object {
            if columns.insert(column.clone(), value.clone()).is_some() {
                return Err(BlockError::InvalidInput(format!(
                    "column '{column}' is produced by more than one branch"
                )));
            }
        }
    }
    Ok(DataValue::Object(columns))
}

/// Walks equally shaped values in lockstep and reduces the numbers found at
/// each position.
fn elementwise(
    values: &[&DataValue],
    reduce: &dyn Fn(&[&Number]) -> Result<DataValue, BlockError>,
) -> Result<DataValue, BlockError> {
    let Some(first) = values.first() else {
        return Ok(DataValue::Null);
    };
    match first {
        DataValue::Number(_) => {
            let numbers = values
                .iter()
                .map(|value| match value {
                    DataValue::Number(n) => Ok(n),
                    other => Err(BlockError::ShapeMismatch {
                        expected: "number".into(),
                        found: kind_of(other).into(),
                    }),
                })
                .collect::<Result<Vec<_>, _>>()?;
            reduce(&numbers)
        }
        DataValue::Array(head) => {
            let mut rows = Vec::with_capacity(values.len());
            for value in values {
                match value {
                    DataValue::Array(items) if items.len() == head.len() => rows.push(items),
                    DataValue::Array(items) => {
                        return Err(BlockError::ShapeMismatch {
                            expected: format!("array of length {}", head.len()),
                            found: format!("array of length {}", items.len()),
                        });
                    }
                    other => {
                        return Err(BlockError::ShapeMismatch {
                            expected: "array".into(),
                            found: kind_of(other).into(),
                        });
                    }
                }
            }
            (0..head.len())
                .map(|i| {
                    let column: Vec<&DataValue> = rows.iter().map(|row| &row[i]).collect();
                    elementwise(&column, reduce)
                })
                .collect::<Result<Vec<_>, _>>()
                .map(DataValue::Array)
        }
        other => Err(BlockError::ShapeMismatch {
            expected: "number or numeric array".into(),
            found: kind_of(other).into(),
        }),
    }
}

fn weighted_mean(numbers: &[&Number], weights: &[f64]) -> Result<DataValue, BlockError> {
    let mean = numbers
        .iter()
        .zip(weights)
        .map(|(n, w)| as_f64(n) * w)
        .sum::<f64>();
    float(mean)
}

fn sum(numbers: &[&Number]) -> Result<DataValue, BlockError> {
    let integers: Option<Vec<i64>> = numbers.iter().map(|n| n.as_i64()).collect();
    if let Some(total) = integers.and_then(|ints| ints.into_iter().try_fold(0i64, i64::checked_add)) {
        return Ok(DataValue::from(total));
    }
    float(numbers.iter().map(|n| as_f64(n)).sum())
}

fn as_f64(n: &Number) -> f64 {
    n.as_f64().unwrap_or(f64::NAN)
}

fn float(value: f64) -> Result<DataValue, BlockError> {
    Number::from_f64(value)
        .map(DataValue::Number)
        .ok_or_else(|| BlockError::InvalidInput(format!("merge produced non-finite value {value}")))
}

pub(crate) fn kind_of(value: &DataValue) -> &'static str {
    match value {
        DataValue::Null => "null",
        DataValue::Bool(_) => "bool",
        DataValue::Number(_) => "number",
        DataValue::String(_) => "string",
        DataValue::Array(_) => "array",
        DataValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn uniform(n: usize) -> Vec<f64> {
        vec![1.0 / n as f64; n]
    }

    #[test]
    fn test_concatenate_scalars_and_arrays() {
        let merged = MergeStrategy::Concatenate
            .merge(&[json!(4), json!([6, 7]), json!("x")], &uniform(3))
            .unwrap();
        assert_eq!(merged, json!([4, 6, 7, "x"]));
    }

    #[test]
    fn test_mean_is_weighted_elementwise() {
        let merged = MergeStrategy::Mean
            .merge(&[json!([1.0, 2.0]), json!([3.0, 6.0])], &[0.25, 0.75])
            .unwrap();
        assert_eq!(merged, json!([2.5, 5.0]));

        let scalar = MergeStrategy::Mean.merge(&[json!(4), json!(6)], &uniform(2)).unwrap();
        assert_eq!(scalar, json!(5.0));
    }

    #[test]
    fn test_mean_rejects_ragged_arrays() {
        let err = MergeStrategy::Mean
            .merge(&[json!([1, 2]), json!([1, 2, 3])], &uniform(2))
            .unwrap_err();
        assert!(matches!(err, BlockError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_sum_keeps_integers() {
        let merged = MergeStrategy::Sum
            .merge(&[json!([[1, 2], [3, 4]]), json!([[10, 20], [30, 40]])], &uniform(2))
            .unwrap();
        assert_eq!(merged, json!([[11, 22], [33, 44]]));

        let mixed = MergeStrategy::Sum.merge(&[json!(1), json!(0.5)], &uniform(2)).unwrap();
        assert_eq!(mixed, json!(1.5));
    }

    #[test]
    fn test_union_of_columns() {
        let merged = MergeStrategy::Union
            .merge(&[json!({"a": [1]}), json!({"b": [2]})], &uniform(2))
            .unwrap();
        assert_eq!(merged, json!({"a": [1], "b": [2]}));

        let duplicate = MergeStrategy::Union
            .merge(&[json!({"a": 1}), json!({"a": 2})], &uniform(2))
            .unwrap_err();
        assert!(matches!(duplicate, BlockError::InvalidInput(_)));

        let not_object = MergeStrategy::Union
            .merge(&[json!({"a": 1}), json!(2)], &uniform(2))
            .unwrap_err();
        assert!(matches!(not_object, BlockError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_parse_identifiers() {
        assert_eq!("concat".parse::<MergeStrategy>().unwrap().identifier(), "concatenate");
        assert_eq!("Average".parse::<MergeStrategy>().unwrap().identifier(), "mean");
        assert_eq!("sum".parse::<MergeStrategy>().unwrap().identifier(), "sum");
        assert!("median".parse::<MergeStrategy>().is_err());
    }

    #[test]
    fn test_order_sensitivity() {
        assert!(MergeStrategy::Concatenate.is_order_sensitive());
        assert!(!MergeStrategy::Mean.is_order_sensitive());
        assert!(!MergeStrategy::Union.is_order_sensitive());
    }

    struct First;

    impl MergeLogic for First {
        fn merge(&self, outputs: &[DataValue], _weights: &[f64]) -> Result<DataValue, BlockError> {
            outputs
                .first()
                .cloned()
                .ok_or_else(|| BlockError::failed("no outputs"))
        }
    }

    #[test]
    fn test_custom_merge() {
        let strategy = MergeStrategy::custom("first", true, First);
        assert_eq!(strategy.identifier(), "first");
        assert!(strategy.is_order_sensitive());
        assert_eq!(
            strategy.merge(&[json!(1), json!(2)], &uniform(2)).unwrap(),
            json!(1)
        );
        assert!(format!("{strategy:?}").contains("first"));
    }
}
