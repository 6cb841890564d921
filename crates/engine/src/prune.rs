//! Pruning strategies: the quality bar a candidate split must clear.

use std::sync::Arc;

use anyhow::Result;

use canopy_dataset::Dataset;
use canopy_types::{Cancel, Feature};

use crate::partition::Partition;

/// Decides whether a candidate partition is worth adding to the tree.
/// Decisions are pure: the same dataset and partition always prune the same
/// way.
#[derive(Debug, Clone, Default)]
pub enum Pruner {
    /// Never prunes.
    None,
    /// Prunes partitions whose information gain is at or below the
    /// threshold.
    FixedMinimumGain(f64),
    /// Rissanen-style minimum-description-length bar: the gain must pay for
    /// the cost of describing the split.
    #[default]
    MinimumDescriptionLength,
}

impl Pruner {
    /// `true` to discard the partition, `false` to keep developing it.
    pub async fn prune(
        &self,
        ctx: &Cancel,
        dataset: &Arc<dyn Dataset>,
        partition: &Partition,
        label: &Arc<Feature>,
    ) -> Result<bool> {
        match self {
            Pruner::None => Ok(false),
            Pruner::FixedMinimumGain(threshold) => Ok(partition.information_gain <= *threshold),
            Pruner::MinimumDescriptionLength => {
                let n = dataset.count(ctx).await? as f64;
                let k = dataset.feature_values(ctx, label).await?.len() as f64;
                let entropy = dataset.entropy(ctx, label).await?;
                let mut minimum = (n - 1.0).ln() + (3f64.powf(k) - 2.0).ln() - k * entropy;
                for task in &partition.tasks {
                    let subset_entropy = task.dataset.entropy(ctx, label).await?;
                    let subset_k = task.dataset.feature_values(ctx, label).await?.len() as f64;
                    minimum += subset_k * subset_entropy;
                }
                minimum /= n;
                Ok(minimum > partition.information_gain)
            }
        }
    }
}

/// A pruner plus the entropy floor below which a node is not expanded at
/// all.
#[derive(Debug, Clone, Default)]
pub struct PruningStrategy {
    pub pruner: Pruner,
    /// Nodes whose label entropy is at or below this become leaves
    /// immediately.
    pub minimum_entropy: f64,
}

impl PruningStrategy {
    pub fn new(pruner: Pruner, minimum_entropy: f64) -> Self {
        Self {
            pruner,
            minimum_entropy,
        }
    }
}
