//! Concurrent growth engine for canopy decision trees.
//!
//! Growth is driven by a task queue: seeding pushes a task for the root
//! node, then a pool of workers repeatedly pulls a task, partitions its
//! dataset on the highest-information-gain feature that survives pruning,
//! stores the resulting child nodes and pushes their tasks. The tree is
//! frozen once the queue drains.

mod engine;
mod grow;
mod partition;
mod prune;

pub use engine::{
    Engine, EngineConfig, MemoryPolicy, NodeStoreBackend, Pruning, QueueBackend, ValidationError,
};
pub use grow::{branch_out, seed, worker};
pub use partition::{partition, Partition};
pub use prune::{Pruner, PruningStrategy};
