//! Tree representation for the canopy decision-tree engine.
//!
//! The tree is a graph-by-id: nodes hold the ids of their children and
//! parent, and live in a [`NodeStore`] rather than behind pointers. That
//! keeps the structure cycle-free, lets it be streamed node by node, and
//! allows the store to live out of process during distributed growth.

pub mod codec;
mod node;
mod prediction;
mod store;
mod tree;

pub use codec::{read_tree, write_tree, FormatError};
pub use node::Node;
pub use prediction::{Prediction, PredictionError};
pub use store::{KvNodeStore, MemoryNodeStore, NodeStore};
pub use tree::Tree;
