//! Sample values and the sample capability.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::feature::Feature;

/// A single observed value. Absence is expressed as `Option::None` at the
/// `Sample` boundary rather than with a dedicated variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Text(String),
    Real(f64),
}

impl Value {
    pub fn text(v: impl Into<String>) -> Self {
        Value::Text(v.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            Value::Real(_) => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(v) => Some(*v),
            Value::Text(_) => None,
        }
    }

    /// The string key under which this value is counted and reported.
    /// Reals use fixed six-decimal formatting so keys are stable.
    pub fn count_key(&self) -> String {
        match self {
            Value::Text(v) => v.clone(),
            Value::Real(v) => format!("{v:.6}"),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

/// Something a criterion can be evaluated against: anything that can report
/// the value it holds for a feature, or that it holds none.
pub trait Sample: Send + Sync {
    fn value_for(&self, feature: &Feature) -> Result<Option<Value>>;
}

/// The standard sample: a feature-name to value map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapSample {
    values: BTreeMap<String, Value>,
}

impl MapSample {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion, useful in tests and sample assembly.
    pub fn with(mut self, feature: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(feature.into(), value.into());
        self
    }

    pub fn set(&mut self, feature: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(feature.into(), value.into());
    }
}

impl FromIterator<(String, Value)> for MapSample {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl Sample for MapSample {
    fn value_for(&self, feature: &Feature) -> Result<Option<Value>> {
        Ok(self.values.get(feature.name()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_key_formats() {
        assert_eq!(Value::text("married").count_key(), "married");
        assert_eq!(Value::Real(35.0).count_key(), "35.000000");
        assert_eq!(Value::Real(0.5).count_key(), "0.500000");
    }

    #[test]
    fn test_map_sample_lookup() {
        let sample = MapSample::new().with("age", 35.0).with("color", "red");
        let age = Feature::continuous("age");
        let size = Feature::continuous("size");
        assert_eq!(sample.value_for(&age).unwrap(), Some(Value::Real(35.0)));
        assert_eq!(sample.value_for(&size).unwrap(), None);
    }
}
