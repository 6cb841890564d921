//! Feature descriptors.
//!
//! A feature is a named, observable property of a sample. Discrete features
//! take one value out of a finite catalog of strings; continuous features
//! take any real value. Descriptors are immutable and shared as
//! `Arc<Feature>` between datasets, criteria, nodes and workers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sample::Value;

/// Validation errors for feature values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeatureError {
    #[error("discrete feature {feature} expects a text value")]
    ExpectedText { feature: String },

    #[error("discrete feature {feature} got unknown value {value}")]
    UnknownValue { feature: String, value: String },

    #[error("continuous feature {feature} expects a numeric value")]
    ExpectedNumeric { feature: String },
}

/// A property that can be observed on a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Feature {
    /// Takes one value out of a finite, ordered catalog of strings.
    Discrete { name: String, values: Vec<String> },
    /// Takes any real value.
    Continuous { name: String },
}

impl Feature {
    pub fn discrete(name: impl Into<String>, values: impl IntoIterator<Item = impl Into<String>>) -> Arc<Self> {
        Arc::new(Feature::Discrete {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        })
    }

    pub fn continuous(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Feature::Continuous { name: name.into() })
    }

    pub fn name(&self) -> &str {
        match self {
            Feature::Discrete { name, .. } | Feature::Continuous { name } => name,
        }
    }

    /// The value catalog of a discrete feature, empty for continuous ones.
    pub fn available_values(&self) -> &[String] {
        match self {
            Feature::Discrete { values, .. } => values,
            Feature::Continuous { .. } => &[],
        }
    }

    pub fn is_discrete(&self) -> bool {
        matches!(self, Feature::Discrete { .. })
    }

    pub fn is_continuous(&self) -> bool {
        matches!(self, Feature::Continuous { .. })
    }

    /// Checks that a value is admissible for this feature. Absent values are
    /// always admissible.
    pub fn validate(&self, value: Option<&Value>) -> Result<(), FeatureError> {
        let Some(value) = value else {
            return Ok(());
        };
        match (self, value) {
            (Feature::Discrete { name, values }, Value::Text(v)) => {
                if values.iter().any(|av| av == v) {
                    Ok(())
                } else {
                    Err(FeatureError::UnknownValue {
                        feature: name.clone(),
                        value: v.clone(),
                    })
                }
            }
            (Feature::Discrete { name, .. }, Value::Real(_)) => Err(FeatureError::ExpectedText {
                feature: name.clone(),
            }),
            (Feature::Continuous { .. }, Value::Real(_)) => Ok(()),
            (Feature::Continuous { name }, Value::Text(_)) => Err(FeatureError::ExpectedNumeric {
                feature: name.clone(),
            }),
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Looks a feature up by name in a catalog.
pub fn find<'a>(features: &'a [Arc<Feature>], name: &str) -> Option<&'a Arc<Feature>> {
    features.iter().find(|f| f.name() == name)
}
