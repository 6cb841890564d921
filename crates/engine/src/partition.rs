//! Candidate splits of a dataset on a single feature.

use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;

use canopy_dataset::Dataset;
use canopy_queue::Task;
use canopy_tree::Node;
use canopy_types::{Cancel, Criterion, Feature};

use crate::prune::Pruner;

/// A partition of a dataset according to one feature: the child tasks that
/// cover the parent dataset and the information gain the split achieves on
/// the label.
pub struct Partition {
    pub feature: Arc<Feature>,
    pub tasks: Vec<Task>,
    pub information_gain: f64,
}

/// Builds the partition of `dataset` on `feature`, or `None` when no split
/// survives the pruner. Discrete features split one branch per cataloged
/// value; continuous features search for the best thresholds recursively.
pub async fn partition(
    ctx: &Cancel,
    dataset: &Arc<dyn Dataset>,
    feature: &Arc<Feature>,
    label: &Arc<Feature>,
    pruner: &Pruner,
) -> Result<Option<Partition>> {
    match feature.as_ref() {
        Feature::Discrete { .. } => discrete_partition(ctx, dataset, feature, label, pruner).await,
        Feature::Continuous { .. } => {
            continuous_partition(ctx, dataset, feature, label, pruner).await
        }
    }
}

/// One branch per cataloged value, plus a fallback branch over the whole
/// parent dataset when the split survives pruning.
async fn discrete_partition(
    ctx: &Cancel,
    dataset: &Arc<dyn Dataset>,
    feature: &Arc<Feature>,
    label: &Arc<Feature>,
    pruner: &Pruner,
) -> Result<Option<Partition>> {
    let mut information_gain = dataset.entropy(ctx, label).await?;
    let total = dataset.count(ctx).await? as f64;
    let values = feature.available_values().to_vec();
    let mut tasks = Vec::with_capacity(values.len() + 1);
    for value in values {
        let criterion = Criterion::discrete(feature.clone(), value);
        let subset = dataset.subset_with(ctx, criterion.clone()).await?;
        let subset_entropy = subset.entropy(ctx, label).await?;
        let subset_count = subset.count(ctx).await? as f64;
        information_gain -= subset_entropy * subset_count / total;
        tasks.push(Task::new(Node::with_criterion(criterion), subset, Vec::new()));
    }
    let mut result = Partition {
        feature: feature.clone(),
        tasks,
        information_gain,
    };
    if pruner.prune(ctx, dataset, &result, label).await? {
        return Ok(None);
    }
    result.tasks.push(undefined_task(dataset, feature));
    Ok(Some(result))
}

async fn continuous_partition(
    ctx: &Cancel,
    dataset: &Arc<dyn Dataset>,
    feature: &Arc<Feature>,
    label: &Arc<Feature>,
    pruner: &Pruner,
) -> Result<Option<Partition>> {
    let entropy = dataset.entropy(ctx, label).await?;
    let refined = refine_range(
        ctx,
        dataset,
        feature,
        label,
        entropy,
        f64::NEG_INFINITY,
        f64::INFINITY,
        pruner,
    )
    .await?;
    let Some(mut result) = refined else {
        return Ok(None);
    };
    if pruner.prune(ctx, dataset, &result, label).await? {
        return Ok(None);
    }
    result.tasks.push(undefined_task(dataset, feature));
    Ok(Some(result))
}

/// Splits `[min, max)` in two at the best threshold, then recurses into each
/// half until a half can no longer be split or its split is pruned.
/// Unpruned leaves concatenate left to right; the information gain is
/// recomputed against this range's dataset.
#[allow(clippy::too_many_arguments)]
fn refine_range<'a>(
    ctx: &'a Cancel,
    dataset: &'a Arc<dyn Dataset>,
    feature: &'a Arc<Feature>,
    label: &'a Arc<Feature>,
    entropy: f64,
    min: f64,
    max: f64,
    pruner: &'a Pruner,
) -> BoxFuture<'a, Result<Option<Partition>>> {
    Box::pin(async move {
        let initial =
            match best_range_split(ctx, dataset, feature, label, entropy, min, max).await? {
                Some(initial) => initial,
                None => return Ok(None),
            };
        if pruner.prune(ctx, dataset, &initial, label).await? {
            return Ok(None);
        }
        let total = dataset.count(ctx).await? as f64;
        let mut information_gain = entropy;
        let mut tasks = Vec::new();
        for task in initial.tasks {
            let (sub_min, sub_max) = task
                .node
                .criterion
                .as_ref()
                .and_then(Criterion::interval)
                .unwrap_or((min, max));
            let subset_entropy = task.dataset.entropy(ctx, label).await?;
            let refined = refine_range(
                ctx,
                &task.dataset,
                feature,
                label,
                subset_entropy,
                sub_min,
                sub_max,
                pruner,
            )
            .await?;
            match refined {
                None => {
                    let subset_count = task.dataset.count(ctx).await? as f64;
                    information_gain -= subset_entropy * subset_count / total;
                    tasks.push(task);
                }
                Some(sub) => {
                    for sub_task in sub.tasks {
                        let sub_entropy = sub_task.dataset.entropy(ctx, label).await?;
                        let sub_count = sub_task.dataset.count(ctx).await? as f64;
                        information_gain -= sub_entropy * sub_count / total;
                        tasks.push(sub_task);
                    }
                }
            }
        }
        Ok(Some(Partition {
            feature: feature.clone(),
            tasks,
            information_gain,
        }))
    })
}

/// The two-way split of `[min, max)` with the highest information gain.
/// Thresholds are midpoints of adjacent observed values; fewer than two
/// distinct values yield no split.
async fn best_range_split(
    ctx: &Cancel,
    dataset: &Arc<dyn Dataset>,
    feature: &Arc<Feature>,
    label: &Arc<Feature>,
    entropy: f64,
    min: f64,
    max: f64,
) -> Result<Option<Partition>> {
    let values = dataset.feature_values(ctx, feature).await?;
    let mut points: Vec<f64> = values.iter().filter_map(|v| v.as_real()).collect();
    if points.len() < 2 {
        return Ok(None);
    }
    points.sort_by(f64::total_cmp);

    let total = dataset.count(ctx).await? as f64;
    let mut best: Option<Partition> = None;
    for pair in points.windows(2) {
        let threshold = (pair[0] + pair[1]) / 2.0;
        let mut information_gain = entropy;
        let mut tasks = Vec::with_capacity(2);
        for (lo, hi) in [(min, threshold), (threshold, max)] {
            let criterion = Criterion::continuous(feature.clone(), lo, hi);
            let subset = dataset.subset_with(ctx, criterion.clone()).await?;
            let subset_entropy = subset.entropy(ctx, label).await?;
            let subset_count = subset.count(ctx).await? as f64;
            information_gain -= subset_entropy * subset_count / total;
            tasks.push(Task::new(Node::with_criterion(criterion), subset, Vec::new()));
        }
        let better = best
            .as_ref()
            .map(|b| b.information_gain < information_gain)
            .unwrap_or(true);
        if better {
            best = Some(Partition {
                feature: feature.clone(),
                tasks,
                information_gain,
            });
        }
    }
    Ok(best)
}

fn undefined_task(dataset: &Arc<dyn Dataset>, feature: &Arc<Feature>) -> Task {
    Task::new(
        Node::with_criterion(Criterion::undefined(feature.clone())),
        dataset.clone(),
        Vec::new(),
    )
}
