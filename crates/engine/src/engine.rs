//! Engine configuration and the top-level growth orchestration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use canopy_dataset::{new_with_threshold, CriterionChain, Dataset, MemoryCopy, AUTO_CHAIN_THRESHOLD};
use canopy_kv::KeyValue;
use canopy_queue::{wait_for, DatasetCodec, KvQueue, KvQueueConfig, MemoryQueue, Queue, TaskCodec};
use canopy_tree::{KvNodeStore, MemoryNodeStore, NodeStore, Tree};
use canopy_types::{feature, Cancel, Feature, Sample};

use crate::grow::{seed, worker};
use crate::prune::{Pruner, PruningStrategy};

/// Configuration mistakes reported before any side effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("label feature '{0}' is not defined")]
    UnknownLabel(String),

    #[error("unknown feature '{0}' in available features")]
    UnknownFeature(String),

    #[error("label feature '{0}' cannot be listed as an available feature")]
    LabelListedAsAvailable(String),

    #[error("number of workers needs to be greater or equal than 1")]
    InvalidConcurrency,

    #[error("minimum entropy must not be negative")]
    NegativeMinimumEntropy,

    #[error("fixed minimum gain threshold must be finite")]
    NonFiniteGainThreshold,

    #[error("cannot contribute to an ongoing growth without external queue and node store backends")]
    WorkerOnlyNeedsBackends,
}

/// Pruning strategy selection.
#[derive(Debug, Clone, Default)]
pub enum Pruning {
    /// Minimum-description-length bar.
    #[default]
    Default,
    /// Keep every candidate split.
    None,
    /// Keep splits whose information gain exceeds the threshold.
    FixedMinimumGain(f64),
}

impl Pruning {
    fn pruner(&self) -> Pruner {
        match self {
            Pruning::Default => Pruner::MinimumDescriptionLength,
            Pruning::None => Pruner::None,
            Pruning::FixedMinimumGain(threshold) => Pruner::FixedMinimumGain(*threshold),
        }
    }
}

/// How in-memory datasets subset.
#[derive(Debug, Clone, Copy, Default)]
pub enum MemoryPolicy {
    /// Materialize subsets.
    MemoryCopy,
    /// Re-filter through the criteria chain.
    CriterionChain,
    /// Materialize up to the auto threshold, chain above it.
    #[default]
    Auto,
}

/// Queue selection: in-process, or a key-value store shared with other
/// processes growing the same tree.
#[derive(Clone)]
pub enum QueueBackend {
    InMemory,
    KeyValue {
        kv: Arc<dyn KeyValue>,
        prefix: String,
        task_max_run: Duration,
        lock_ttl: Duration,
    },
}

/// Node store selection.
#[derive(Clone)]
pub enum NodeStoreBackend {
    InMemory,
    KeyValue { kv: Arc<dyn KeyValue>, prefix: String },
}

#[derive(Clone)]
pub struct EngineConfig {
    /// Name of the feature the tree predicts. Required.
    pub label_feature: String,
    /// Names of the features available for splitting; `None` means every
    /// cataloged feature except the label.
    pub available_features: Option<Vec<String>>,
    pub pruning: Pruning,
    /// Nodes at or below this label entropy become leaves immediately.
    pub minimum_entropy: f64,
    /// Number of concurrent workers.
    pub concurrency: usize,
    pub memory_policy: MemoryPolicy,
    pub queue_backend: QueueBackend,
    pub node_store_backend: NodeStoreBackend,
    /// URI identifying the root training dataset in serialized task
    /// payloads (key-value queues only).
    pub dataset_uri: String,
    /// Contribute workers to an ongoing distributed growth instead of
    /// seeding a new tree. Requires key-value queue and node store.
    pub worker_only: bool,
    /// Seed for the feature shuffle preceding split selection. Fixing it
    /// makes growth reproducible.
    pub shuffle_seed: Option<u64>,
    /// How long a worker sleeps when the queue is momentarily empty.
    pub empty_queue_sleep: Duration,
    /// Log pending/running queue counts at this interval during growth.
    pub stats_interval: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            label_feature: String::new(),
            available_features: None,
            pruning: Pruning::default(),
            minimum_entropy: 0.0,
            concurrency: 1,
            memory_policy: MemoryPolicy::default(),
            queue_backend: QueueBackend::InMemory,
            node_store_backend: NodeStoreBackend::InMemory,
            dataset_uri: String::new(),
            worker_only: false,
            shuffle_seed: None,
            empty_queue_sleep: Duration::from_secs(1),
            stats_interval: None,
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.concurrency < 1 {
            return Err(ValidationError::InvalidConcurrency);
        }
        if self.minimum_entropy < 0.0 {
            return Err(ValidationError::NegativeMinimumEntropy);
        }
        if let Pruning::FixedMinimumGain(threshold) = self.pruning {
            if !threshold.is_finite() {
                return Err(ValidationError::NonFiniteGainThreshold);
            }
        }
        if self.worker_only {
            let distributed = matches!(self.queue_backend, QueueBackend::KeyValue { .. })
                && matches!(self.node_store_backend, NodeStoreBackend::KeyValue { .. });
            if !distributed {
                return Err(ValidationError::WorkerOnlyNeedsBackends);
            }
        }
        Ok(())
    }

    /// Builds an in-memory dataset from samples according to the configured
    /// memory policy.
    pub fn dataset_from_samples(&self, samples: Vec<Arc<dyn Sample>>) -> Arc<dyn Dataset> {
        match self.memory_policy {
            MemoryPolicy::MemoryCopy => MemoryCopy::new(samples),
            MemoryPolicy::CriterionChain => CriterionChain::new(samples),
            MemoryPolicy::Auto => new_with_threshold(samples, AUTO_CHAIN_THRESHOLD),
        }
    }
}

/// The assembled engine: validates its configuration up front, then grows
/// trees from datasets.
pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, ValidationError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Grows a tree predicting the configured label from `dataset`, using
    /// the given feature catalog. Blocks until the queue drains or a worker
    /// fails, in which case every other worker is cancelled and the first
    /// error is returned.
    pub async fn grow(
        &self,
        ctx: &Cancel,
        features: &[Arc<Feature>],
        dataset: Arc<dyn Dataset>,
    ) -> Result<Tree> {
        let label = feature::find(features, &self.config.label_feature)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownLabel(self.config.label_feature.clone()))?;
        let available = self.available_features(features, &label)?;

        let store = self.node_store(features);
        let queue = self.queue(features, &dataset, store.clone());
        let strategy = PruningStrategy::new(self.config.pruning.pruner(), self.config.minimum_entropy);

        let tree = if self.config.worker_only {
            Tree::new("", store, label.clone())
        } else {
            seed(
                ctx,
                label.clone(),
                available.clone(),
                dataset.clone(),
                queue.as_ref(),
                store,
            )
            .await?
        };

        let count = dataset.count(ctx).await?;
        info!(
            samples = count,
            features = available.len(),
            label = %label.name(),
            concurrency = self.config.concurrency,
            "growing tree"
        );

        let worker_ctx = ctx.child();
        let first_error: Arc<Mutex<Option<anyhow::Error>>> = Arc::new(Mutex::new(None));
        let mut handles = Vec::with_capacity(self.config.concurrency);
        for worker_index in 0..self.config.concurrency {
            let wctx = worker_ctx.clone();
            let tree = tree.clone();
            let queue = queue.clone();
            let strategy = strategy.clone();
            let first_error = first_error.clone();
            let empty_queue_sleep = self.config.empty_queue_sleep;
            let shuffle_seed = self.config.shuffle_seed;
            handles.push(tokio::spawn(async move {
                if let Err(err) = worker(
                    &wctx,
                    &tree,
                    queue.as_ref(),
                    &strategy,
                    empty_queue_sleep,
                    shuffle_seed,
                )
                .await
                {
                    // Workers parked on an empty queue are woken by the
                    // post-drain cancel; that is not a growth failure.
                    if err.downcast_ref::<canopy_types::Cancelled>().is_some() {
                        return;
                    }
                    warn!(worker = worker_index, "worker came across an error: {err:#}");
                    let mut slot = first_error.lock();
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                    drop(slot);
                    wctx.cancel();
                }
            }));
        }

        if let Some(interval) = self.config.stats_interval {
            let sctx = worker_ctx.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                loop {
                    match queue.count(&sctx).await {
                        Ok((pending, running)) => {
                            info!(pending, running, "queue stats");
                        }
                        Err(err) => warn!("cannot get queue stats: {err:#}"),
                    }
                    tokio::select! {
                        _ = sctx.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            });
        }

        let waited = wait_for(&worker_ctx, queue.as_ref()).await;
        worker_ctx.cancel();
        for handle in handles {
            let _ = handle.await;
        }
        let _ = queue.stop(ctx).await;

        if let Some(err) = first_error.lock().take() {
            return Err(err);
        }
        waited?;
        info!(label = %label.name(), "tree growth finished");
        Ok(tree)
    }

    fn available_features(
        &self,
        features: &[Arc<Feature>],
        label: &Arc<Feature>,
    ) -> Result<Vec<Arc<Feature>>, ValidationError> {
        match &self.config.available_features {
            None => Ok(features
                .iter()
                .filter(|f| f.name() != label.name())
                .cloned()
                .collect()),
            Some(names) => {
                let mut available = Vec::with_capacity(names.len());
                for name in names {
                    if name == label.name() {
                        return Err(ValidationError::LabelListedAsAvailable(name.clone()));
                    }
                    let feature = feature::find(features, name)
                        .cloned()
                        .ok_or_else(|| ValidationError::UnknownFeature(name.clone()))?;
                    available.push(feature);
                }
                Ok(available)
            }
        }
    }

    fn node_store(&self, features: &[Arc<Feature>]) -> Arc<dyn NodeStore> {
        match &self.config.node_store_backend {
            NodeStoreBackend::InMemory => MemoryNodeStore::new(),
            NodeStoreBackend::KeyValue { kv, prefix } => {
                KvNodeStore::new(kv.clone(), prefix.clone(), features.to_vec())
            }
        }
    }

    fn queue(
        &self,
        features: &[Arc<Feature>],
        dataset: &Arc<dyn Dataset>,
        store: Arc<dyn NodeStore>,
    ) -> Arc<dyn Queue> {
        match &self.config.queue_backend {
            QueueBackend::InMemory => MemoryQueue::new(),
            QueueBackend::KeyValue {
                kv,
                prefix,
                task_max_run,
                lock_ttl,
            } => {
                let codec = TaskCodec::new(
                    features.to_vec(),
                    DatasetCodec::new(
                        dataset.clone(),
                        self.config.dataset_uri.clone(),
                        features.to_vec(),
                    ),
                    store,
                );
                KvQueue::new(
                    kv.clone(),
                    codec,
                    KvQueueConfig {
                        prefix: prefix.clone(),
                        task_max_run: *task_max_run,
                        lock_ttl: *lock_ttl,
                    },
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_zero_concurrency() {
        let config = EngineConfig {
            label_feature: "label".to_string(),
            concurrency: 0,
            ..EngineConfig::default()
        };
        assert_eq!(Engine::new(config).err(), Some(ValidationError::InvalidConcurrency));
    }

    #[test]
    fn test_rejects_negative_minimum_entropy() {
        let config = EngineConfig {
            label_feature: "label".to_string(),
            minimum_entropy: -0.5,
            ..EngineConfig::default()
        };
        assert_eq!(
            Engine::new(config).err(),
            Some(ValidationError::NegativeMinimumEntropy)
        );
    }

    #[test]
    fn test_rejects_non_finite_gain_threshold() {
        let config = EngineConfig {
            label_feature: "label".to_string(),
            pruning: Pruning::FixedMinimumGain(f64::NAN),
            ..EngineConfig::default()
        };
        assert_eq!(
            Engine::new(config).err(),
            Some(ValidationError::NonFiniteGainThreshold)
        );
    }

    #[test]
    fn test_worker_only_requires_key_value_backends() {
        let config = EngineConfig {
            label_feature: "label".to_string(),
            worker_only: true,
            ..EngineConfig::default()
        };
        assert_eq!(
            Engine::new(config).err(),
            Some(ValidationError::WorkerOnlyNeedsBackends)
        );
    }

    #[tokio::test]
    async fn test_grow_rejects_unknown_label() {
        let config = EngineConfig {
            label_feature: "ghost".to_string(),
            ..EngineConfig::default()
        };
        let engine = Engine::new(config).unwrap();
        let ctx = Cancel::new();
        let features = vec![Feature::continuous("age")];
        let dataset = MemoryCopy::new(Vec::new());
        let err = engine.grow(&ctx, &features, dataset).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<ValidationError>(),
            Some(&ValidationError::UnknownLabel("ghost".to_string()))
        );
    }

    #[tokio::test]
    async fn test_grow_rejects_label_listed_as_available() {
        let config = EngineConfig {
            label_feature: "label".to_string(),
            available_features: Some(vec!["label".to_string()]),
            ..EngineConfig::default()
        };
        let engine = Engine::new(config).unwrap();
        let ctx = Cancel::new();
        let features = vec![Feature::discrete("label", ["yes", "no"])];
        let dataset = MemoryCopy::new(Vec::new());
        let err = engine.grow(&ctx, &features, dataset).await.unwrap_err();
        assert!(err.downcast_ref::<ValidationError>().is_some());
    }
}
