//! Wire formats for tasks whose queue state lives out of process.
//!
//! A task payload never carries samples: the dataset travels as the root
//! dataset's URI plus the criteria chain that refines it, and is
//! reconstituted by re-applying the chain to the configured root on decode.
//! The node itself is fetched from the node store by id.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use canopy_dataset::Dataset;
use canopy_tree::codec::{decode_criterion, encode_criterion, WireCriterion};
use canopy_tree::NodeStore;
use canopy_types::{feature, Cancel, Feature};

use crate::task::Task;

#[derive(Debug, Serialize, Deserialize)]
pub struct WireDataset {
    pub uri: String,
    pub criteria: Vec<WireCriterion>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireTask {
    id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    fs: Vec<String>,
    ds: WireDataset,
}

/// Encodes datasets as `{uri, criteria}` descriptors against a configured
/// root dataset.
pub struct DatasetCodec {
    root: Arc<dyn Dataset>,
    root_uri: String,
    features: Vec<Arc<Feature>>,
}

impl DatasetCodec {
    pub fn new(root: Arc<dyn Dataset>, root_uri: impl Into<String>, features: Vec<Arc<Feature>>) -> Self {
        Self {
            root,
            root_uri: root_uri.into(),
            features,
        }
    }

    pub async fn encode(&self, ctx: &Cancel, dataset: &dyn Dataset) -> Result<WireDataset> {
        let criteria = dataset
            .criteria(ctx)
            .await
            .context("obtaining dataset criteria")?;
        Ok(WireDataset {
            uri: self.root_uri.clone(),
            criteria: criteria.iter().map(encode_criterion).collect(),
        })
    }

    pub async fn decode(&self, ctx: &Cancel, wire: &WireDataset) -> Result<Arc<dyn Dataset>> {
        if wire.uri != self.root_uri {
            return Err(anyhow!(
                "decoded dataset does not have the right root dataset URI: found {:?}, expected {:?}",
                wire.uri,
                self.root_uri
            ));
        }
        let mut dataset = self.root.clone();
        for wire_criterion in &wire.criteria {
            let criterion = decode_criterion(wire_criterion, &self.features)
                .context("decoding dataset criteria")?;
            dataset = dataset
                .subset_with(ctx, criterion)
                .await
                .context("decoding dataset: applying criteria")?;
        }
        Ok(dataset)
    }
}

/// Encodes tasks as `{id, fs, ds}` payloads for key-value queues.
pub struct TaskCodec {
    features: Vec<Arc<Feature>>,
    datasets: DatasetCodec,
    store: Arc<dyn NodeStore>,
}

impl TaskCodec {
    pub fn new(features: Vec<Arc<Feature>>, datasets: DatasetCodec, store: Arc<dyn NodeStore>) -> Self {
        Self {
            features,
            datasets,
            store,
        }
    }

    pub async fn encode(&self, ctx: &Cancel, task: &Task) -> Result<Vec<u8>> {
        let wire = WireTask {
            id: task.id().to_string(),
            fs: task
                .available_features
                .iter()
                .map(|f| f.name().to_string())
                .collect(),
            ds: self.datasets.encode(ctx, task.dataset.as_ref()).await?,
        };
        serde_json::to_vec(&wire).context("encoding task as json")
    }

    pub async fn decode(&self, ctx: &Cancel, data: &[u8]) -> Result<Task> {
        let wire: WireTask = serde_json::from_slice(data).context("decoding task from json")?;
        let node = self
            .store
            .get(ctx, &wire.id)
            .await
            .context("decoding task: getting task node")?
            .ok_or_else(|| anyhow!("decoding task: node {:?} not found in node store", wire.id))?;
        let mut available_features = Vec::with_capacity(wire.fs.len());
        for name in &wire.fs {
            let feature = feature::find(&self.features, name)
                .cloned()
                .ok_or_else(|| anyhow!("decoding task: unknown feature {name:?}"))?;
            available_features.push(feature);
        }
        let dataset = self.datasets.decode(ctx, &wire.ds).await?;
        Ok(Task::new(node, dataset, available_features))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use canopy_dataset::MemoryCopy;
    use canopy_tree::{MemoryNodeStore, Node};
    use canopy_types::{Criterion, MapSample, Sample};

    fn catalog() -> Vec<Arc<Feature>> {
        vec![
            Feature::discrete("marital", ["married", "single"]),
            Feature::continuous("age"),
        ]
    }

    fn root_dataset() -> Arc<dyn Dataset> {
        let samples: Vec<Arc<dyn Sample>> = vec![
            Arc::new(MapSample::new().with("marital", "married").with("age", 30.0)),
            Arc::new(MapSample::new().with("marital", "married").with("age", 40.0)),
            Arc::new(MapSample::new().with("marital", "single").with("age", 20.0)),
        ];
        MemoryCopy::new(samples)
    }

    #[tokio::test]
    async fn test_dataset_round_trip_reapplies_criteria() {
        let ctx = Cancel::new();
        let features = catalog();
        let root = root_dataset();
        let codec = DatasetCodec::new(root.clone(), "mem://train", features.clone());

        let subset = root
            .subset_with(&ctx, Criterion::discrete(features[0].clone(), "married"))
            .await
            .unwrap();
        let wire = codec.encode(&ctx, subset.as_ref()).await.unwrap();
        assert_eq!(wire.uri, "mem://train");
        assert_eq!(wire.criteria.len(), 1);

        let decoded = codec.decode(&ctx, &wire).await.unwrap();
        assert_eq!(decoded.count(&ctx).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_dataset_decode_rejects_unknown_uri() {
        let ctx = Cancel::new();
        let codec = DatasetCodec::new(root_dataset(), "mem://train", catalog());
        let wire = WireDataset {
            uri: "mem://other".to_string(),
            criteria: Vec::new(),
        };
        assert!(codec.decode(&ctx, &wire).await.is_err());
    }

    #[tokio::test]
    async fn test_task_round_trip() {
        let ctx = Cancel::new();
        let features = catalog();
        let root = root_dataset();
        let store = MemoryNodeStore::new();

        let mut node = Node::new();
        store.create(&ctx, &mut node).await.unwrap();

        let codec = TaskCodec::new(
            features.clone(),
            DatasetCodec::new(root.clone(), "mem://train", features.clone()),
            store.clone(),
        );

        let task = Task::new(node.clone(), root, vec![features[1].clone()]);
        let data = codec.encode(&ctx, &task).await.unwrap();
        let decoded = codec.decode(&ctx, &data).await.unwrap();

        assert_eq!(decoded.id(), task.id());
        assert_eq!(decoded.available_features.len(), 1);
        assert_eq!(decoded.available_features[0].name(), "age");
        assert_eq!(decoded.dataset.count(&ctx).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_task_decode_fails_without_node() {
        let ctx = Cancel::new();
        let features = catalog();
        let codec = TaskCodec::new(
            features.clone(),
            DatasetCodec::new(root_dataset(), "mem://train", features),
            MemoryNodeStore::new(),
        );
        let data = br#"{"id":"missing","ds":{"uri":"mem://train","criteria":[]}}"#;
        assert!(codec.decode(&ctx, data).await.is_err());
    }
}
