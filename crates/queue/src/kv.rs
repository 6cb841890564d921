//! Queue backed by a redis-style key-value store, shared by workers across
//! processes.
//!
//! Layout under the configured prefix:
//! - `<prefix>:pending` / `<prefix>:running`: sets of task key prefixes.
//! - `<prefix>:task:<id>:data`: the encoded task payload.
//! - `<prefix>:task:<id>:lock`: per-task mutation lock, expiring after
//!   `lock_ttl`, released only by the holder's token.
//! - `<prefix>:task:<id>:running`: liveness mark expiring after
//!   `task_max_run`. A background reaper returns tasks whose mark has
//!   expired to pending so another worker can retry them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, warn};

use canopy_kv::KeyValue;
use canopy_types::Cancel;

use crate::codec::TaskCodec;
use crate::{PulledTask, Queue, QueueError, Task};

const LOCK_ATTEMPTS: u32 = 5;
const FAIL_TO_LOCK_SLEEP: Duration = Duration::from_millis(10);
const LOCK_TOKEN_LEN: usize = 20;

#[derive(Debug, Clone)]
pub struct KvQueueConfig {
    /// Key prefix isolating this queue's data in the store.
    pub prefix: String,
    /// Upper bound on a task's wall time; doubles as the liveness TTL.
    /// Zero disables both the deadline and the reaper.
    pub task_max_run: Duration,
    /// How long a single mutation may hold a per-task lock.
    pub lock_ttl: Duration,
}

pub struct KvQueue {
    kv: Arc<dyn KeyValue>,
    config: KvQueueConfig,
    codec: TaskCodec,
    all_tasks: Cancel,
}

struct Lock {
    key: String,
    token: Vec<u8>,
}

impl KvQueue {
    pub fn new(kv: Arc<dyn KeyValue>, codec: TaskCodec, config: KvQueueConfig) -> Arc<Self> {
        let queue = Arc::new(Self {
            kv,
            config,
            codec,
            all_tasks: Cancel::new(),
        });
        if !queue.config.task_max_run.is_zero() {
            Self::spawn_reaper(&queue);
        }
        queue
    }

    fn pending_set(&self) -> String {
        format!("{}:pending", self.config.prefix)
    }

    fn running_set(&self) -> String {
        format!("{}:running", self.config.prefix)
    }

    fn task_member(&self, id: &str) -> String {
        format!("{}:task:{}", self.config.prefix, id)
    }

    fn data_key(member: &str) -> String {
        format!("{member}:data")
    }

    fn lock_key(member: &str) -> String {
        format!("{member}:lock")
    }

    fn running_mark_key(member: &str) -> String {
        format!("{member}:running")
    }

    fn member_task_id(member: &str) -> &str {
        member.rsplit(':').next().unwrap_or(member)
    }

    /// Acquires the member's mutation lock, retrying up to
    /// `additional_attempts` times with a backoff of the observed lock TTL
    /// plus jitter proportional to the remaining attempts.
    async fn acquire_lock(
        &self,
        ctx: &Cancel,
        member: &str,
        additional_attempts: u32,
    ) -> Result<Lock> {
        let key = Self::lock_key(member);
        let token: Vec<u8> = {
            let mut rng = rand::thread_rng();
            (0..LOCK_TOKEN_LEN).map(|_| rng.sample(Alphanumeric)).collect()
        };
        let mut attempts_left = additional_attempts;
        loop {
            ctx.check()?;
            if self
                .kv
                .set_nx(ctx, &key, token.clone(), Some(self.config.lock_ttl))
                .await
                .context("could not acquire lock")?
            {
                return Ok(Lock { key, token });
            }
            if attempts_left == 0 {
                return Err(QueueError::LockContended(member.to_string()).into());
            }
            let remaining = self.kv.ttl(ctx, &key).await?.unwrap_or_default();
            let jitter_cap = FAIL_TO_LOCK_SLEEP.as_millis() as u64 * attempts_left as u64;
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap));
            tokio::time::sleep(remaining + jitter).await;
            attempts_left -= 1;
        }
    }

    /// Best-effort release; a lock that cannot be released expires on its
    /// own after `lock_ttl`.
    async fn release_lock(&self, ctx: &Cancel, lock: Lock) {
        if let Err(err) = self.kv.del_if_equals(ctx, &lock.key, &lock.token).await {
            debug!("releasing lock {}: {err:#}", lock.key);
        }
    }

    /// Marks the member as running and moves it from pending to running.
    async fn claim(&self, ctx: &Cancel, member: &str) -> Result<()> {
        let ttl = if self.config.task_max_run.is_zero() {
            None
        } else {
            Some(self.config.task_max_run)
        };
        let mark = Self::running_mark_key(member);
        if !self.kv.set_nx(ctx, &mark, b"true".to_vec(), ttl).await? {
            return Err(anyhow!("task {member:?} already running"));
        }
        let moved = match self
            .kv
            .smove(ctx, &self.pending_set(), &self.running_set(), member)
            .await
        {
            Ok(moved) => moved,
            Err(err) => {
                let _ = self.kv.del(ctx, &mark).await;
                return Err(err).with_context(|| {
                    format!("moving {member:?} from pending set to running set")
                });
            }
        };
        if !moved {
            let _ = self.kv.del(ctx, &mark).await;
            return Err(anyhow!("task {member:?} no longer pending"));
        }
        Ok(())
    }

    fn task_context(&self) -> (Cancel, bool) {
        if self.config.task_max_run.is_zero() {
            (self.all_tasks.clone(), false)
        } else {
            (self.all_tasks.with_timeout(self.config.task_max_run), true)
        }
    }

    fn spawn_reaper(queue: &Arc<Self>) {
        let queue = Arc::clone(queue);
        tokio::spawn(async move {
            let period = queue.config.task_max_run / 2;
            loop {
                match queue.kv.sscan(&queue.all_tasks, &queue.running_set()).await {
                    Ok(members) => {
                        for member in members {
                            if queue.all_tasks.is_cancelled() {
                                return;
                            }
                            queue.reap_if_expired(&member).await;
                        }
                    }
                    Err(err) => warn!("queue reaper: scanning running tasks: {err:#}"),
                }
                tokio::select! {
                    _ = queue.all_tasks.cancelled() => return,
                    _ = tokio::time::sleep(period) => {}
                }
            }
        });
    }

    /// Returns the member to pending when its liveness mark has expired.
    async fn reap_if_expired(&self, member: &str) {
        let ctx = &self.all_tasks;
        let Ok(lock) = self.acquire_lock(ctx, member, 0).await else {
            return;
        };
        let expired = match self.kv.exists(ctx, &Self::running_mark_key(member)).await {
            Ok(exists) => !exists,
            Err(_) => false,
        };
        self.release_lock(ctx, lock).await;
        if expired {
            let id = Self::member_task_id(member);
            debug!(task = id, "returning timed out task to pending");
            if let Err(err) = self.drop_task(ctx, id).await {
                warn!("queue reaper: dropping task {id}: {err:#}");
            }
        }
    }
}

#[async_trait]
impl Queue for KvQueue {
    async fn push(&self, ctx: &Cancel, task: Task) -> Result<()> {
        let data = self
            .codec
            .encode(ctx, &task)
            .await
            .with_context(|| format!("pushing task {} to queue", task.id()))?;
        let member = self.task_member(task.id());
        let data_key = Self::data_key(&member);
        if !self
            .kv
            .set_nx(ctx, &data_key, data, None)
            .await
            .with_context(|| format!("pushing task {} to queue", task.id()))?
        {
            return Err(QueueError::DuplicateTask(task.id().to_string()).into());
        }
        if !self.kv.sadd(ctx, &self.pending_set(), &member).await? {
            let _ = self.kv.del(ctx, &data_key).await;
            return Err(QueueError::DuplicateTask(task.id().to_string()).into());
        }
        Ok(())
    }

    async fn pull(&self, ctx: &Cancel) -> Result<Option<PulledTask>> {
        let members = self
            .kv
            .sscan(ctx, &self.pending_set())
            .await
            .context("iterating over pending tasks")?;
        for member in members {
            let lock = match self.acquire_lock(ctx, &member, 0).await {
                Ok(lock) => lock,
                Err(_) => continue,
            };
            let claimed = self.claim(ctx, &member).await;
            self.release_lock(ctx, lock).await;
            if claimed.is_err() {
                continue;
            }

            let id = Self::member_task_id(&member).to_string();
            let decoded = match self.kv.get(ctx, &Self::data_key(&member)).await {
                Ok(Some(data)) => self.codec.decode(ctx, &data).await,
                Ok(None) => Err(anyhow!("task {id} has no payload")),
                Err(err) => Err(err),
            };
            match decoded {
                Ok(task) => {
                    let (tctx, cancel_on_drop) = self.task_context();
                    return Ok(Some(PulledTask::new(task, tctx, cancel_on_drop)));
                }
                Err(err) => {
                    // A payload this process cannot read should not wedge the
                    // queue; give the task back and try the next member.
                    debug!("pulling task {id}: {err:#}");
                    let _ = self.drop_task(ctx, &id).await;
                    continue;
                }
            }
        }
        Ok(None)
    }

    async fn drop_task(&self, ctx: &Cancel, id: &str) -> Result<()> {
        let member = self.task_member(id);
        let lock = self
            .acquire_lock(ctx, &member, LOCK_ATTEMPTS)
            .await
            .with_context(|| format!("dropping {id}"))?;
        let result: Result<()> = async {
            if self
                .kv
                .smove(ctx, &self.running_set(), &self.pending_set(), &member)
                .await?
            {
                self.kv.del(ctx, &Self::running_mark_key(&member)).await?;
            }
            Ok(())
        }
        .await;
        self.release_lock(ctx, lock).await;
        result.with_context(|| format!("dropping {id}"))
    }

    async fn complete(&self, ctx: &Cancel, id: &str) -> Result<()> {
        let member = self.task_member(id);
        let lock = self
            .acquire_lock(ctx, &member, LOCK_ATTEMPTS)
            .await
            .with_context(|| format!("completing {id}"))?;
        let result: Result<()> = async {
            if self.kv.srem(ctx, &self.running_set(), &member).await? {
                self.kv.del(ctx, &Self::running_mark_key(&member)).await?;
                self.kv.del(ctx, &Self::data_key(&member)).await?;
            }
            Ok(())
        }
        .await;
        self.release_lock(ctx, lock).await;
        result.with_context(|| format!("completing {id}"))
    }

    async fn count(&self, ctx: &Cancel) -> Result<(u64, u64)> {
        self.kv
            .scard2(ctx, &self.pending_set(), &self.running_set())
            .await
            .context("counting tasks")
    }

    async fn stop(&self, _ctx: &Cancel) -> Result<()> {
        self.all_tasks.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use canopy_dataset::{Dataset, MemoryCopy};
    use canopy_kv::MemoryKv;
    use canopy_tree::{MemoryNodeStore, Node, NodeStore};
    use canopy_types::{Feature, MapSample, Sample};

    use crate::codec::DatasetCodec;

    struct Fixture {
        queue: Arc<KvQueue>,
        kv: Arc<dyn KeyValue>,
        store: Arc<MemoryNodeStore>,
        root: Arc<dyn Dataset>,
        features: Vec<Arc<Feature>>,
    }

    fn fixture(task_max_run: Duration) -> Fixture {
        let features = vec![Feature::discrete("marital", ["married", "single"])];
        let samples: Vec<Arc<dyn Sample>> =
            vec![Arc::new(MapSample::new().with("marital", "married"))];
        let root: Arc<dyn Dataset> = MemoryCopy::new(samples);
        let store = MemoryNodeStore::new();
        let kv: Arc<dyn KeyValue> = Arc::new(MemoryKv::new());
        let codec = TaskCodec::new(
            features.clone(),
            DatasetCodec::new(root.clone(), "mem://train", features.clone()),
            store.clone(),
        );
        let queue = KvQueue::new(
            kv.clone(),
            codec,
            KvQueueConfig {
                prefix: "grow".to_string(),
                task_max_run,
                lock_ttl: Duration::from_millis(100),
            },
        );
        Fixture {
            queue,
            kv,
            store,
            root,
            features,
        }
    }

    async fn seeded_task(ctx: &Cancel, f: &Fixture) -> Task {
        let mut node = Node::new();
        f.store.create(ctx, &mut node).await.unwrap();
        Task::new(node, f.root.clone(), f.features.clone())
    }

    #[tokio::test]
    async fn test_push_pull_complete_cycle() {
        let ctx = Cancel::new();
        let f = fixture(Duration::ZERO);
        let task = seeded_task(&ctx, &f).await;
        let id = task.id().to_string();

        f.queue.push(&ctx, task).await.unwrap();
        assert_eq!(f.queue.count(&ctx).await.unwrap(), (1, 0));

        let pulled = f.queue.pull(&ctx).await.unwrap().unwrap();
        assert_eq!(pulled.task.id(), id);
        assert_eq!(f.queue.count(&ctx).await.unwrap(), (0, 1));

        f.queue.complete(&ctx, &id).await.unwrap();
        assert_eq!(f.queue.count(&ctx).await.unwrap(), (0, 0));
        assert!(f.queue.pull(&ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_push_rejects_duplicate() {
        let ctx = Cancel::new();
        let f = fixture(Duration::ZERO);
        let task = seeded_task(&ctx, &f).await;

        f.queue.push(&ctx, task.clone()).await.unwrap();
        let err = f.queue.push(&ctx, task).await.unwrap_err();
        assert!(err.downcast_ref::<QueueError>().is_some());
    }

    #[tokio::test]
    async fn test_drop_returns_task_to_pending() {
        let ctx = Cancel::new();
        let f = fixture(Duration::ZERO);
        let task = seeded_task(&ctx, &f).await;
        let id = task.id().to_string();

        f.queue.push(&ctx, task).await.unwrap();
        let pulled = f.queue.pull(&ctx).await.unwrap().unwrap();
        drop(pulled);
        f.queue.drop_task(&ctx, &id).await.unwrap();
        assert_eq!(f.queue.count(&ctx).await.unwrap(), (1, 0));

        let pulled = f.queue.pull(&ctx).await.unwrap().unwrap();
        assert_eq!(pulled.task.id(), id);
    }

    #[tokio::test]
    async fn test_pull_skips_undecodable_payload() {
        let ctx = Cancel::new();
        let f = fixture(Duration::ZERO);
        let task = seeded_task(&ctx, &f).await;
        let id = task.id().to_string();

        f.queue.push(&ctx, task).await.unwrap();
        let data_key = format!("grow:task:{id}:data");
        f.kv.set(&ctx, &data_key, b"not json".to_vec()).await.unwrap();

        assert!(f.queue.pull(&ctx).await.unwrap().is_none());
        // The task went back to pending rather than vanishing.
        assert_eq!(f.queue.count(&ctx).await.unwrap(), (1, 0));
    }

    #[tokio::test]
    async fn test_locked_member_is_skipped() {
        let ctx = Cancel::new();
        let f = fixture(Duration::ZERO);
        let task = seeded_task(&ctx, &f).await;
        let id = task.id().to_string();

        f.queue.push(&ctx, task).await.unwrap();
        let lock_key = format!("grow:task:{id}:lock");
        f.kv
            .set_nx(&ctx, &lock_key, b"other-holder".to_vec(), None)
            .await
            .unwrap();

        assert!(f.queue.pull(&ctx).await.unwrap().is_none());
        assert_eq!(f.queue.count(&ctx).await.unwrap(), (1, 0));
    }

    #[tokio::test]
    async fn test_task_deadline_cancels_context() {
        let ctx = Cancel::new();
        let f = fixture(Duration::from_millis(30));
        let task = seeded_task(&ctx, &f).await;

        f.queue.push(&ctx, task).await.unwrap();
        let pulled = f.queue.pull(&ctx).await.unwrap().unwrap();
        assert!(pulled.context().check().is_ok());
        pulled.context().cancelled().await;
        f.queue.stop(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_reaper_returns_expired_task() {
        let ctx = Cancel::new();
        let f = fixture(Duration::from_millis(40));
        let task = seeded_task(&ctx, &f).await;

        f.queue.push(&ctx, task).await.unwrap();
        let pulled = f.queue.pull(&ctx).await.unwrap().unwrap();
        assert_eq!(f.queue.count(&ctx).await.unwrap(), (0, 1));
        drop(pulled);

        // Liveness mark expires after 40ms; the reaper scans every 20ms.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(f.queue.count(&ctx).await.unwrap(), (1, 0));
        f.queue.stop(&ctx).await.unwrap();
    }
}
