//! Criteria: constraints on a single feature's value.
//!
//! A criterion routes samples into one branch of a split. Evaluation never
//! errors on a missing or type-mismatched value; the sample simply does not
//! satisfy the criterion.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::feature::Feature;
use crate::sample::{Sample, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Criterion {
    /// Satisfied by samples whose value for the feature equals `value`.
    Discrete { feature: Arc<Feature>, value: String },
    /// Satisfied by samples whose numeric value lies in the half-open
    /// interval `[min, max)`. Either bound may be infinite.
    Continuous {
        feature: Arc<Feature>,
        min: f64,
        max: f64,
    },
    /// Always satisfied; marks the fallback branch under a split.
    Undefined { feature: Arc<Feature> },
}

impl Criterion {
    pub fn discrete(feature: Arc<Feature>, value: impl Into<String>) -> Self {
        Criterion::Discrete {
            feature,
            value: value.into(),
        }
    }

    pub fn continuous(feature: Arc<Feature>, min: f64, max: f64) -> Self {
        Criterion::Continuous { feature, min, max }
    }

    pub fn undefined(feature: Arc<Feature>) -> Self {
        Criterion::Undefined { feature }
    }

    pub fn feature(&self) -> &Arc<Feature> {
        match self {
            Criterion::Discrete { feature, .. }
            | Criterion::Continuous { feature, .. }
            | Criterion::Undefined { feature } => feature,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Criterion::Undefined { .. })
    }

    /// The `[min, max)` interval of a continuous criterion.
    pub fn interval(&self) -> Option<(f64, f64)> {
        match self {
            Criterion::Continuous { min, max, .. } => Some((*min, *max)),
            _ => None,
        }
    }

    /// Whether the sample satisfies this criterion. A missing value or a
    /// value of the wrong type yields `false`, never an error.
    pub fn satisfied_by(&self, sample: &dyn Sample) -> Result<bool> {
        match self {
            Criterion::Undefined { .. } => Ok(true),
            Criterion::Discrete { feature, value } => {
                let observed = sample.value_for(feature)?;
                Ok(matches!(observed, Some(Value::Text(v)) if &v == value))
            }
            Criterion::Continuous { feature, min, max } => {
                let observed = sample.value_for(feature)?;
                let Some(Value::Real(x)) = observed else {
                    return Ok(false);
                };
                Ok((min.is_infinite() || *min <= x) && (max.is_infinite() || x < *max))
            }
        }
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Criterion::Discrete { feature, value } => {
                write!(f, "{} is {}", feature.name(), value)
            }
            Criterion::Continuous { feature, min, max } => {
                if min.is_infinite() {
                    write!(f, "{} < {max:.6}", feature.name())
                } else if max.is_infinite() {
                    write!(f, "{min:.6} <= {}", feature.name())
                } else {
                    write!(f, "{min:.6} <= {} < {max:.6}", feature.name())
                }
            }
            Criterion::Undefined { feature } => write!(f, "{} not defined", feature.name()),
        }
    }
}
