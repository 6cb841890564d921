//! Task queues for concurrent tree growth.
//!
//! A queue hands node-expansion tasks to workers: a worker pulls a task
//! (moving it from pending to running), develops the node, pushes the
//! resulting child tasks and completes the parent, or drops it back to
//! pending when it fails partway. Growth is over exactly when both the
//! pending and running sets are empty.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use canopy_types::Cancel;

pub mod codec;
mod kv;
mod memory;
mod task;

pub use codec::{DatasetCodec, TaskCodec};
pub use kv::{KvQueue, KvQueueConfig};
pub use memory::MemoryQueue;
pub use task::Task;

/// Queue failures surfaced to workers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("task {0} already exists in the queue")]
    DuplicateTask(String),

    #[error("could not acquire lock for task {0}: already taken")]
    LockContended(String),
}

/// A task pulled from a queue, together with the context bounding its
/// execution. Dropping the handle releases any per-task deadline; it does
/// not return the task to the queue (workers do that explicitly).
pub struct PulledTask {
    pub task: Task,
    ctx: Cancel,
    cancel_on_drop: bool,
}

impl PulledTask {
    fn new(task: Task, ctx: Cancel, cancel_on_drop: bool) -> Self {
        Self {
            task,
            ctx,
            cancel_on_drop,
        }
    }

    /// The context bounding this task's execution; may carry a deadline.
    pub fn context(&self) -> &Cancel {
        &self.ctx
    }
}

impl Drop for PulledTask {
    fn drop(&mut self) {
        if self.cancel_on_drop {
            self.ctx.cancel();
        }
    }
}

#[async_trait]
pub trait Queue: Send + Sync {
    /// Stores a task as pending. Fails if a task with the same id is
    /// already pending or running.
    async fn push(&self, ctx: &Cancel, task: Task) -> Result<()>;

    /// Atomically moves a pending task to running and returns it together
    /// with its task context. `None` when nothing is pending.
    async fn pull(&self, ctx: &Cancel) -> Result<Option<PulledTask>>;

    /// Returns a running task to pending. Used by workers that fail before
    /// completing it. Dropping an id that is not running is a no-op.
    async fn drop_task(&self, ctx: &Cancel, id: &str) -> Result<()>;

    /// Removes a running task for good.
    async fn complete(&self, ctx: &Cancel, id: &str) -> Result<()>;

    /// The number of pending and running tasks, observed atomically so a
    /// task moving between the sets is never reported in neither.
    async fn count(&self, ctx: &Cancel) -> Result<(u64, u64)>;

    /// Cancels in-flight task contexts and releases resources.
    async fn stop(&self, ctx: &Cancel) -> Result<()>;
}

/// Polls the queue until it is drained (no pending and no running tasks) or
/// the context is cancelled.
pub async fn wait_for(ctx: &Cancel, queue: &dyn Queue) -> Result<()> {
    loop {
        let (pending, running) = queue.count(ctx).await?;
        if pending + running == 0 {
            return Ok(());
        }
        tokio::select! {
            _ = ctx.cancelled() => return Err(canopy_types::Cancelled.into()),
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }
}
