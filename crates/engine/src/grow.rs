//! The growth driver: seeding, node development and the worker loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use canopy_dataset::Dataset;
use canopy_queue::{PulledTask, Queue, Task};
use canopy_tree::{Node, NodeStore, Prediction, PredictionError, Tree};
use canopy_types::{cancel, Cancel, Cancelled, Feature};

use crate::partition::{partition, Partition};
use crate::prune::PruningStrategy;

/// Creates the root node in the store and pushes the task to develop it,
/// returning the tree that will grow from it. On push failure the root node
/// is deleted again before the error propagates.
pub async fn seed(
    ctx: &Cancel,
    label: Arc<Feature>,
    features: Vec<Arc<Feature>>,
    dataset: Arc<dyn Dataset>,
    queue: &dyn Queue,
    store: Arc<dyn NodeStore>,
) -> Result<Tree> {
    let mut root = Node::new();
    store.create(ctx, &mut root).await?;
    let tree = Tree::new(root.id.clone(), store.clone(), label);
    let task = Task::new(root.clone(), dataset, features);
    if let Err(err) = queue.push(ctx, task).await {
        let _ = store.delete(ctx, &root).await;
        return Err(err);
    }
    Ok(tree)
}

/// Develops the task's node: attaches a prediction, selects the best
/// surviving split among the available features, creates the child nodes
/// and returns their tasks. A node that cannot or should not be split
/// returns no children and becomes a leaf.
///
/// The node is stored in every case, including error paths, so the
/// prediction and any subtree bookkeeping are never lost.
pub async fn branch_out(
    ctx: &Cancel,
    task: &mut Task,
    tree: &Tree,
    strategy: &PruningStrategy,
    shuffle_seed: Option<u64>,
) -> Result<Vec<Task>> {
    let result = develop_node(ctx, task, tree, strategy, shuffle_seed).await;
    let stored = tree.store.store(ctx, &task.node).await;
    match result {
        Err(err) => Err(err),
        Ok(children) => {
            stored?;
            Ok(children)
        }
    }
}

async fn develop_node(
    ctx: &Cancel,
    task: &mut Task,
    tree: &Tree,
    strategy: &PruningStrategy,
    shuffle_seed: Option<u64>,
) -> Result<Vec<Task>> {
    match Prediction::from_dataset(ctx, task.dataset.as_ref(), &tree.label).await {
        Ok(prediction) => task.node.prediction = Some(prediction),
        // An empty dataset is tolerated here; the leaf surfaces later as an
        // unpredictable sample.
        Err(err)
            if err.downcast_ref::<PredictionError>()
                == Some(&PredictionError::CannotPredictFromEmptySet) => {}
        Err(err) => return Err(err),
    }

    let entropy = task.dataset.entropy(ctx, &tree.label).await?;
    if task.available_features.is_empty() || entropy <= strategy.minimum_entropy {
        return Ok(Vec::new());
    }

    shuffle_features(&mut task.available_features, shuffle_seed);
    let mut selected: Option<Partition> = None;
    let mut selected_index = 0;
    for (index, feature) in task.available_features.iter().enumerate() {
        let candidate =
            partition(ctx, &task.dataset, feature, &tree.label, &strategy.pruner).await?;
        let replace = match (&selected, &candidate) {
            (None, _) => true,
            (Some(current), Some(candidate)) => {
                candidate.information_gain > current.information_gain
            }
            (Some(_), None) => false,
        };
        if replace {
            selected = candidate;
            selected_index = index;
        }
    }
    let Some(selected) = selected else {
        return Ok(Vec::new());
    };

    debug!(
        node = %task.node.id,
        feature = %selected.feature.name(),
        information_gain = selected.information_gain,
        branches = selected.tasks.len(),
        "branching out"
    );
    task.node.subtree_feature = Some(selected.feature.clone());
    let subtree_available: Vec<Arc<Feature>> = task
        .available_features
        .iter()
        .enumerate()
        .filter(|(index, _)| *index != selected_index)
        .map(|(_, feature)| feature.clone())
        .collect();

    let mut children = selected.tasks;
    let mut subtree_ids = Vec::with_capacity(children.len());
    for child in &mut children {
        child.node.parent_id = task.node.id.clone();
        tree.store.create(ctx, &mut child.node).await?;
        subtree_ids.push(child.node.id.clone());
        child.available_features = subtree_available.clone();
    }
    task.node.subtree_ids = subtree_ids;
    Ok(children)
}

fn shuffle_features(features: &mut [Arc<Feature>], seed: Option<u64>) {
    match seed {
        Some(seed) => features.shuffle(&mut StdRng::seed_from_u64(seed)),
        None => features.shuffle(&mut rand::thread_rng()),
    }
}

/// One worker's loop: pull a task, develop its node, push the child tasks,
/// complete the parent. Returns cleanly once the queue is drained; sleeps
/// `empty_queue_sleep` between polls while other workers still hold tasks.
pub async fn worker(
    ctx: &Cancel,
    tree: &Tree,
    queue: &dyn Queue,
    strategy: &PruningStrategy,
    empty_queue_sleep: Duration,
    shuffle_seed: Option<u64>,
) -> Result<()> {
    loop {
        let Some(mut pulled) = queue.pull(ctx).await? else {
            let (pending, running) = queue.count(ctx).await?;
            if pending + running == 0 {
                return Ok(());
            }
            tokio::select! {
                _ = ctx.cancelled() => return Err(Cancelled.into()),
                _ = tokio::time::sleep(empty_queue_sleep) => {}
            }
            continue;
        };
        // Either the task deadline or the worker context aborts the task.
        let merged = cancel::merge(pulled.context(), ctx);
        let result = work_task(&merged, &mut pulled, tree, queue, strategy, shuffle_seed).await;
        merged.cancel();
        let task_id = pulled.task.id().to_string();
        drop(pulled);
        if let Err(err) = result {
            // A task that overran its own deadline has been returned to the
            // queue for another worker; this worker keeps pulling.
            let task_timed_out =
                ctx.check().is_ok() && err.downcast_ref::<Cancelled>().is_some();
            if !task_timed_out {
                return Err(err);
            }
            debug!(task = %task_id, "task deadline expired; returned to queue");
        }
        ctx.check()?;
    }
}

async fn work_task(
    ctx: &Cancel,
    pulled: &mut PulledTask,
    tree: &Tree,
    queue: &dyn Queue,
    strategy: &PruningStrategy,
    shuffle_seed: Option<u64>,
) -> Result<()> {
    let id = pulled.task.id().to_string();
    let result = async {
        let children = branch_out(ctx, &mut pulled.task, tree, strategy, shuffle_seed).await?;
        for child in children {
            queue.push(ctx, child).await?;
        }
        queue.complete(ctx, &id).await
    }
    .await;
    if result.is_err() {
        if let Err(err) = queue.drop_task(ctx, &id).await {
            debug!("dropping task {id}: {err:#}");
        }
    }
    result
}
