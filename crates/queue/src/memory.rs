//! In-process queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use canopy_types::Cancel;

use crate::{PulledTask, Queue, QueueError, Task};

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Task>,
    pending_ids: HashSet<String>,
    running: HashMap<String, Task>,
}

/// Queue backed by process memory: a pending ring plus a running map behind
/// a reader-writer lock. `pull` is non-blocking.
pub struct MemoryQueue {
    state: RwLock<QueueState>,
    all_tasks: Cancel,
}

impl MemoryQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(QueueState::default()),
            all_tasks: Cancel::new(),
        })
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn push(&self, ctx: &Cancel, task: Task) -> Result<()> {
        ctx.check()?;
        let mut state = self.state.write();
        let id = task.id().to_string();
        if state.pending_ids.contains(&id) || state.running.contains_key(&id) {
            return Err(QueueError::DuplicateTask(id).into());
        }
        state.pending_ids.insert(id);
        state.pending.push_back(task);
        Ok(())
    }

    async fn pull(&self, ctx: &Cancel) -> Result<Option<PulledTask>> {
        ctx.check()?;
        let mut state = self.state.write();
        let Some(task) = state.pending.pop_front() else {
            return Ok(None);
        };
        state.pending_ids.remove(task.id());
        state.running.insert(task.id().to_string(), task.clone());
        // The shared queue context doubles as the task context; it is
        // cancelled by stop, never by the worker finishing one task.
        Ok(Some(PulledTask::new(task, self.all_tasks.clone(), false)))
    }

    async fn drop_task(&self, ctx: &Cancel, id: &str) -> Result<()> {
        ctx.check()?;
        let mut state = self.state.write();
        if let Some(task) = state.running.remove(id) {
            state.pending_ids.insert(id.to_string());
            state.pending.push_back(task);
        }
        Ok(())
    }

    async fn complete(&self, ctx: &Cancel, id: &str) -> Result<()> {
        ctx.check()?;
        self.state.write().running.remove(id);
        Ok(())
    }

    async fn count(&self, ctx: &Cancel) -> Result<(u64, u64)> {
        ctx.check()?;
        let state = self.state.read();
        Ok((state.pending.len() as u64, state.running.len() as u64))
    }

    async fn stop(&self, _ctx: &Cancel) -> Result<()> {
        self.all_tasks.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use canopy_dataset::MemoryCopy;
    use canopy_tree::Node;

    fn task(id: &str) -> Task {
        let mut node = Node::new();
        node.id = id.to_string();
        Task::new(node, MemoryCopy::new(Vec::new()), Vec::new())
    }

    #[tokio::test]
    async fn test_fifo_pull_order() {
        let ctx = Cancel::new();
        let queue = MemoryQueue::new();
        queue.push(&ctx, task("a")).await.unwrap();
        queue.push(&ctx, task("b")).await.unwrap();

        let first = queue.pull(&ctx).await.unwrap().unwrap();
        assert_eq!(first.task.id(), "a");
        let second = queue.pull(&ctx).await.unwrap().unwrap();
        assert_eq!(second.task.id(), "b");
        assert!(queue.pull(&ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_push_rejects_duplicate_ids() {
        let ctx = Cancel::new();
        let queue = MemoryQueue::new();
        queue.push(&ctx, task("a")).await.unwrap();
        let err = queue.push(&ctx, task("a")).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<QueueError>(),
            Some(&QueueError::DuplicateTask("a".to_string()))
        );

        // Still rejected while running.
        let pulled = queue.pull(&ctx).await.unwrap().unwrap();
        assert!(queue.push(&ctx, task("a")).await.is_err());
        drop(pulled);
    }

    #[tokio::test]
    async fn test_counts_track_transitions() {
        let ctx = Cancel::new();
        let queue = MemoryQueue::new();
        queue.push(&ctx, task("a")).await.unwrap();
        assert_eq!(queue.count(&ctx).await.unwrap(), (1, 0));

        let pulled = queue.pull(&ctx).await.unwrap().unwrap();
        assert_eq!(queue.count(&ctx).await.unwrap(), (0, 1));

        queue.drop_task(&ctx, pulled.task.id()).await.unwrap();
        assert_eq!(queue.count(&ctx).await.unwrap(), (1, 0));

        let pulled = queue.pull(&ctx).await.unwrap().unwrap();
        queue.complete(&ctx, pulled.task.id()).await.unwrap();
        assert_eq!(queue.count(&ctx).await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_drop_after_complete_is_noop() {
        let ctx = Cancel::new();
        let queue = MemoryQueue::new();
        queue.push(&ctx, task("a")).await.unwrap();
        let pulled = queue.pull(&ctx).await.unwrap().unwrap();
        queue.complete(&ctx, pulled.task.id()).await.unwrap();
        queue.drop_task(&ctx, pulled.task.id()).await.unwrap();
        assert_eq!(queue.count(&ctx).await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_stop_cancels_task_contexts() {
        let ctx = Cancel::new();
        let queue = MemoryQueue::new();
        queue.push(&ctx, task("a")).await.unwrap();
        let pulled = queue.pull(&ctx).await.unwrap().unwrap();
        assert!(pulled.context().check().is_ok());
        queue.stop(&ctx).await.unwrap();
        assert!(pulled.context().check().is_err());
    }
}
