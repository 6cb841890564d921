//! Label-distribution predictions.

use std::collections::BTreeMap;

use anyhow::Result;
use thiserror::Error;

use canopy_dataset::Dataset;
use canopy_types::{Cancel, Feature};

/// Prediction failures. `CannotPredictFromSample` is recovered during
/// evaluation (the sample counts as unpredictable); everything else
/// propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PredictionError {
    #[error("no prediction available for this kind of sample")]
    CannotPredictFromSample,

    #[error("cannot make prediction for empty dataset")]
    CannotPredictFromEmptySet,
}

/// A probability distribution over the label's values, together with the
/// number of training samples it was derived from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prediction {
    probabilities: BTreeMap<String, f64>,
    weight: u64,
}

impl Prediction {
    pub fn new(probabilities: BTreeMap<String, f64>, weight: u64) -> Self {
        Self {
            probabilities,
            weight,
        }
    }

    /// Derives a prediction from the label-value counts of a dataset.
    /// Fails with [`PredictionError::CannotPredictFromEmptySet`] when the
    /// dataset holds no samples.
    pub async fn from_dataset(
        ctx: &Cancel,
        dataset: &dyn Dataset,
        label: &Feature,
    ) -> Result<Self> {
        let weight = dataset.count(ctx).await?;
        if weight == 0 {
            return Err(PredictionError::CannotPredictFromEmptySet.into());
        }
        let counts = dataset.count_feature_values(ctx, label).await?;
        let probabilities = counts
            .into_iter()
            .map(|(value, count)| (value, count as f64 / weight as f64))
            .collect();
        Ok(Self {
            probabilities,
            weight,
        })
    }

    pub fn probabilities(&self) -> &BTreeMap<String, f64> {
        &self.probabilities
    }

    /// Number of training samples the distribution was derived from.
    pub fn weight(&self) -> u64 {
        self.weight
    }

    pub fn probability_of(&self, value: &str) -> f64 {
        self.probabilities.get(value).copied().unwrap_or(0.0)
    }

    /// The most probable value and its probability. Ties resolve to the
    /// first value in key order.
    pub fn predicted_value(&self) -> Option<(&str, f64)> {
        let mut best: Option<(&str, f64)> = None;
        for (value, &prob) in &self.probabilities {
            if best.map(|(_, bp)| prob > bp).unwrap_or(true) {
                best = Some((value, prob));
            }
        }
        best
    }
}

impl std::fmt::Display for Prediction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, (value, prob)) in self.probabilities.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{value}:{prob}")?;
        }
        write!(f, "]")
    }
}
