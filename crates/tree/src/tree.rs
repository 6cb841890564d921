//! The tree itself: prediction, evaluation, traversal.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;

use canopy_dataset::Dataset;
use canopy_types::{Cancel, Feature, Sample};

use crate::node::Node;
use crate::prediction::{Prediction, PredictionError};
use crate::store::NodeStore;

/// A decision tree: the id of its root node, the store its nodes live in,
/// and the label feature it predicts.
#[derive(Clone)]
pub struct Tree {
    pub root_id: String,
    pub store: Arc<dyn NodeStore>,
    pub label: Arc<Feature>,
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("root_id", &self.root_id)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl Tree {
    pub fn new(root_id: impl Into<String>, store: Arc<dyn NodeStore>, label: Arc<Feature>) -> Self {
        Self {
            root_id: root_id.into(),
            store,
            label,
        }
    }

    async fn must_get(&self, ctx: &Cancel, id: &str) -> Result<Node> {
        self.store
            .get(ctx, id)
            .await
            .with_context(|| format!("retrieving node {id}"))?
            .ok_or_else(|| anyhow!("node {id} not found"))
    }

    /// Classifies a sample by walking from the root. At each internal node
    /// the first child whose specific criterion is satisfied wins; a child
    /// with an undefined criterion is kept as fallback and only taken once
    /// every specific branch has been rejected.
    pub async fn predict(&self, ctx: &Cancel, sample: &dyn Sample) -> Result<Prediction> {
        let mut node = self.must_get(ctx, &self.root_id).await?;
        while let Some(subtree_feature) = &node.subtree_feature {
            let mut selected: Option<Node> = None;
            for child_id in &node.subtree_ids {
                let child = self.must_get(ctx, child_id).await?;
                let Some(criterion) = &child.criterion else {
                    continue;
                };
                if criterion.satisfied_by(sample)? {
                    let undefined = criterion.is_undefined();
                    selected = Some(child);
                    if !undefined {
                        break;
                    }
                }
            }
            node = selected.ok_or_else(|| {
                anyhow!(
                    "sample does not satisfy any subtree criteria on feature {}",
                    subtree_feature.name()
                )
            })?;
        }
        node.prediction
            .ok_or_else(|| PredictionError::CannotPredictFromSample.into())
    }

    /// Evaluates the tree against a labeled dataset: the fraction of samples
    /// whose most probable predicted value matches their label, plus the
    /// number of samples the tree could not predict at all.
    pub async fn test(&self, ctx: &Cancel, dataset: &dyn Dataset) -> Result<(f64, u64)> {
        let samples = dataset.samples(ctx).await?;
        let count = dataset.count(ctx).await?;
        let mut correct = 0u64;
        let mut unpredictable = 0u64;
        for sample in &samples {
            match self.predict(ctx, sample.as_ref()).await {
                Ok(prediction) => {
                    let Some((predicted, _)) = prediction.predicted_value() else {
                        continue;
                    };
                    if let Some(actual) = sample.value_for(&self.label)? {
                        if actual.count_key() == predicted {
                            correct += 1;
                        }
                    }
                }
                Err(err)
                    if err.downcast_ref::<PredictionError>()
                        == Some(&PredictionError::CannotPredictFromSample) =>
                {
                    unpredictable += 1;
                }
                Err(err) => return Err(err),
            }
        }
        if count == 0 {
            return Ok((0.0, unpredictable));
        }
        Ok((correct as f64 / count as f64, unpredictable))
    }

    /// Depth-first traversal. Parents are visited before their children
    /// unless `bottom_up` is set, in which case they are visited after.
    pub async fn traverse(
        &self,
        ctx: &Cancel,
        bottom_up: bool,
        visit: &mut (dyn FnMut(&Node) -> Result<()> + Send),
    ) -> Result<()> {
        let root = self.must_get(ctx, &self.root_id).await?;
        self.traverse_node(ctx, root, bottom_up, visit).await
    }

    fn traverse_node<'a>(
        &'a self,
        ctx: &'a Cancel,
        node: Node,
        bottom_up: bool,
        visit: &'a mut (dyn FnMut(&Node) -> Result<()> + Send),
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            ctx.check()?;
            if !bottom_up {
                visit(&node)?;
            }
            for child_id in &node.subtree_ids {
                let child = self.must_get(ctx, child_id).await?;
                self.traverse_node(ctx, child, bottom_up, visit).await?;
            }
            if bottom_up {
                visit(&node)?;
            }
            Ok(())
        })
    }

    /// ASCII rendering of the tree for operator logs.
    pub async fn render(&self, ctx: &Cancel) -> Result<String> {
        self.render_subtree(ctx, &self.root_id).await
    }

    fn render_subtree<'a>(&'a self, ctx: &'a Cancel, id: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            ctx.check()?;
            let node = self.must_get(ctx, id).await?;
            let mut out = format!("[{id}]\n");
            if let Some(criterion) = &node.criterion {
                out.push_str(&format!("{{ {criterion} }}\n"));
            }
            if let Some(prediction) = &node.prediction {
                out.push_str(&format!("{{ {prediction} }}\n"));
            }
            out.push_str(if node.subtree_ids.is_empty() { " \n" } else { "|\n" });
            for (i, child_id) in node.subtree_ids.iter().enumerate() {
                let last = i == node.subtree_ids.len() - 1;
                let rendered = self.render_subtree(ctx, child_id).await?;
                for (j, line) in rendered.lines().enumerate() {
                    if line.is_empty() {
                        continue;
                    }
                    if j == 0 {
                        out.push_str(&format!("|__{line}\n"));
                    } else if last {
                        out.push_str(&format!("   {line}\n"));
                    } else {
                        out.push_str(&format!("|  {line}\n"));
                    }
                }
            }
            Ok(out)
        })
    }
}
