//! Node-expansion tasks.

use std::sync::Arc;

use canopy_dataset::Dataset;
use canopy_tree::Node;
use canopy_types::Feature;

/// A unit of growth work: expand `node` using the training samples that
/// reach it and the features no ancestor has consumed yet.
#[derive(Clone)]
pub struct Task {
    /// The node to develop.
    pub node: Node,
    /// Training samples satisfying the criteria of the node and all its
    /// ancestors.
    pub dataset: Arc<dyn Dataset>,
    /// Features still available for splitting below this node.
    pub available_features: Vec<Arc<Feature>>,
}

impl Task {
    pub fn new(node: Node, dataset: Arc<dyn Dataset>, available_features: Vec<Arc<Feature>>) -> Self {
        Self {
            node,
            dataset,
            available_features,
        }
    }

    /// A task is identified by its node's id.
    pub fn id(&self) -> &str {
        &self.node.id
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("id", &self.id()).finish()
    }
}
