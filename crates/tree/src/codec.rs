//! JSON wire formats for criteria, nodes and trees.
//!
//! The tree envelope is `{"rootID":…,"label":…,"nodes":[…]}` with nodes
//! emitted in pre-order, streamed one node at a time so a large tree never
//! has to be materialized in memory on the way out. Interval bounds are
//! rendered as fixed six-decimal strings, with infinite bounds as the
//! `"-Inf"` / `"+Inf"` sentinels.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use canopy_types::{feature, Cancel, Criterion, Feature};

use crate::node::Node;
use crate::prediction::Prediction;
use crate::store::NodeStore;
use crate::tree::Tree;

const KIND_CONTINUOUS: &str = "continuous";
const KIND_DISCRETE: &str = "discrete";
const KIND_UNDEFINED: &str = "undefined";

const NEG_INF: &str = "-Inf";
const POS_INF: &str = "+Inf";

/// Wire-format mismatches. Always fatal to the decoding operation; no
/// partially decoded tree is admitted into a store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("unknown feature '{0}'")]
    UnknownFeature(String),

    #[error("unknown feature criterion type '{0}'")]
    UnknownCriterionType(String),

    #[error("expected discrete feature for discrete criterion on '{0}'")]
    ExpectedDiscreteFeature(String),

    #[error("expected continuous feature for continuous criterion on '{0}'")]
    ExpectedContinuousFeature(String),

    #[error("criterion on '{0}' is missing its {1} field")]
    MissingField(String, &'static str),

    #[error("invalid interval bound '{0}'")]
    InvalidBound(String),

    #[error("no label feature defined")]
    MissingLabel,

    #[error("no root node id available")]
    MissingRootId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WireCriterion {
    #[serde(rename = "t")]
    pub kind: String,
    #[serde(rename = "f")]
    pub feature: String,
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(rename = "a", default, skip_serializing_if = "Option::is_none")]
    pub min: Option<String>,
    #[serde(rename = "b", default, skip_serializing_if = "Option::is_none")]
    pub max: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WirePrediction {
    #[serde(rename = "probs", default, skip_serializing_if = "BTreeMap::is_empty")]
    probabilities: BTreeMap<String, f64>,
    #[serde(rename = "w", default, skip_serializing_if = "is_zero")]
    weight: u64,
}

fn is_zero(weight: &u64) -> bool {
    *weight == 0
}

#[derive(Debug, Serialize, Deserialize)]
struct WireNode {
    id: String,
    #[serde(rename = "pId", default, skip_serializing_if = "String::is_empty")]
    parent_id: String,
    #[serde(rename = "stIds", default, skip_serializing_if = "Vec::is_empty")]
    subtree_ids: Vec<String>,
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    criterion: Option<WireCriterion>,
    #[serde(rename = "f", default, skip_serializing_if = "Option::is_none")]
    subtree_feature: Option<String>,
    #[serde(rename = "pred", default, skip_serializing_if = "Option::is_none")]
    prediction: Option<WirePrediction>,
}

#[derive(Debug, Deserialize)]
struct WireTree {
    #[serde(rename = "rootID", default)]
    root_id: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    nodes: Vec<WireNode>,
}

fn encode_bound(bound: f64) -> String {
    if bound == f64::NEG_INFINITY {
        NEG_INF.to_string()
    } else if bound == f64::INFINITY {
        POS_INF.to_string()
    } else {
        format!("{bound:.6}")
    }
}

fn decode_bound(raw: &str) -> Result<f64, FormatError> {
    match raw {
        NEG_INF => Ok(f64::NEG_INFINITY),
        POS_INF => Ok(f64::INFINITY),
        other => other
            .parse()
            .map_err(|_| FormatError::InvalidBound(other.to_string())),
    }
}

pub fn encode_criterion(criterion: &Criterion) -> WireCriterion {
    match criterion {
        Criterion::Discrete { feature, value } => WireCriterion {
            kind: KIND_DISCRETE.to_string(),
            feature: feature.name().to_string(),
            value: Some(value.clone()),
            min: None,
            max: None,
        },
        Criterion::Continuous { feature, min, max } => WireCriterion {
            kind: KIND_CONTINUOUS.to_string(),
            feature: feature.name().to_string(),
            value: None,
            min: Some(encode_bound(*min)),
            max: Some(encode_bound(*max)),
        },
        Criterion::Undefined { feature } => WireCriterion {
            kind: KIND_UNDEFINED.to_string(),
            feature: feature.name().to_string(),
            value: None,
            min: None,
            max: None,
        },
    }
}

pub fn decode_criterion(
    wire: &WireCriterion,
    features: &[Arc<Feature>],
) -> Result<Criterion, FormatError> {
    let feature = feature::find(features, &wire.feature)
        .ok_or_else(|| FormatError::UnknownFeature(wire.feature.clone()))?;
    match wire.kind.as_str() {
        KIND_DISCRETE => {
            if !feature.is_discrete() {
                return Err(FormatError::ExpectedDiscreteFeature(wire.feature.clone()));
            }
            let value = wire
                .value
                .as_ref()
                .ok_or_else(|| FormatError::MissingField(wire.feature.clone(), "value"))?;
            Ok(Criterion::discrete(feature.clone(), value.clone()))
        }
        KIND_CONTINUOUS => {
            if !feature.is_continuous() {
                return Err(FormatError::ExpectedContinuousFeature(wire.feature.clone()));
            }
            let min = wire
                .min
                .as_ref()
                .ok_or_else(|| FormatError::MissingField(wire.feature.clone(), "min"))?;
            let max = wire
                .max
                .as_ref()
                .ok_or_else(|| FormatError::MissingField(wire.feature.clone(), "max"))?;
            Ok(Criterion::continuous(
                feature.clone(),
                decode_bound(min)?,
                decode_bound(max)?,
            ))
        }
        KIND_UNDEFINED => Ok(Criterion::undefined(feature.clone())),
        other => Err(FormatError::UnknownCriterionType(other.to_string())),
    }
}

fn node_to_wire(node: &Node) -> WireNode {
    WireNode {
        id: node.id.clone(),
        parent_id: node.parent_id.clone(),
        subtree_ids: node.subtree_ids.clone(),
        criterion: node.criterion.as_ref().map(encode_criterion),
        subtree_feature: node.subtree_feature.as_ref().map(|f| f.name().to_string()),
        prediction: node.prediction.as_ref().map(|p| WirePrediction {
            probabilities: p.probabilities().clone(),
            weight: p.weight(),
        }),
    }
}

fn node_from_wire(wire: WireNode, features: &[Arc<Feature>]) -> Result<Node, FormatError> {
    let criterion = wire
        .criterion
        .as_ref()
        .map(|c| decode_criterion(c, features))
        .transpose()?;
    let subtree_feature = wire
        .subtree_feature
        .map(|name| {
            feature::find(features, &name)
                .cloned()
                .ok_or(FormatError::UnknownFeature(name))
        })
        .transpose()?;
    let prediction = wire
        .prediction
        .map(|p| Prediction::new(p.probabilities, p.weight));
    Ok(Node {
        id: wire.id,
        parent_id: wire.parent_id,
        subtree_ids: wire.subtree_ids,
        criterion,
        subtree_feature,
        prediction,
    })
}

/// Serializes a node to its wire bytes.
pub fn encode_node(node: &Node) -> Result<Vec<u8>> {
    serde_json::to_vec(&node_to_wire(node)).context("encoding node")
}

/// Decodes a node from its wire bytes, resolving feature names against the
/// catalog.
pub fn decode_node(data: &[u8], features: &[Arc<Feature>]) -> Result<Node> {
    let wire: WireNode = serde_json::from_slice(data).context("decoding node")?;
    Ok(node_from_wire(wire, features)?)
}

/// Writes the tree as its JSON envelope, streaming nodes in pre-order.
pub async fn write_tree<W>(ctx: &Cancel, tree: &Tree, w: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let header = format!(
        "{{\"rootID\":{},\"label\":{},\"nodes\":[",
        serde_json::to_string(&tree.root_id)?,
        serde_json::to_string(tree.label.name())?,
    );
    w.write_all(header.as_bytes()).await?;

    let mut pending = vec![tree.root_id.clone()];
    let mut written = 0usize;
    while let Some(id) = pending.pop() {
        ctx.check()?;
        let node = tree
            .store
            .get(ctx, &id)
            .await?
            .with_context(|| format!("writing tree: node {id} not found"))?;
        if written > 0 {
            w.write_all(b",").await?;
        }
        w.write_all(&encode_node(&node)?).await?;
        written += 1;
        for child in node.subtree_ids.iter().rev() {
            pending.push(child.clone());
        }
    }

    w.write_all(b"]}").await?;
    w.flush().await?;
    Ok(())
}

/// Reads a tree envelope, resolving the label against the catalog and
/// loading every node into the given store.
pub async fn read_tree<R>(
    ctx: &Cancel,
    store: Arc<dyn NodeStore>,
    features: &[Arc<Feature>],
    r: &mut R,
) -> Result<Tree>
where
    R: AsyncRead + Unpin + Send,
{
    let mut data = Vec::new();
    r.read_to_end(&mut data).await?;
    let wire: WireTree = serde_json::from_slice(&data).context("decoding tree")?;

    let label = feature::find(features, &wire.label)
        .cloned()
        .ok_or(FormatError::MissingLabel)?;
    if wire.root_id.is_empty() {
        return Err(FormatError::MissingRootId.into());
    }

    for wire_node in wire.nodes {
        ctx.check()?;
        let node = node_from_wire(wire_node, features)?;
        store.store(ctx, &node).await?;
    }
    Ok(Tree::new(wire.root_id, store, label))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<Arc<Feature>> {
        vec![
            Feature::discrete("marital", ["married", "single"]),
            Feature::continuous("age"),
        ]
    }

    #[test]
    fn test_criterion_round_trip() {
        let features = catalog();
        let marital = features[0].clone();
        let age = features[1].clone();

        for criterion in [
            Criterion::discrete(marital.clone(), "married"),
            Criterion::continuous(age.clone(), f64::NEG_INFINITY, 35.0),
            Criterion::continuous(age.clone(), 35.0, f64::INFINITY),
            Criterion::continuous(age.clone(), 20.0, 35.0),
            Criterion::undefined(marital.clone()),
        ] {
            let wire = encode_criterion(&criterion);
            let decoded = decode_criterion(&wire, &features).unwrap();
            assert_eq!(decoded, criterion);
        }
    }

    #[test]
    fn test_infinity_sentinels() {
        let features = catalog();
        let age = features[1].clone();
        let wire = encode_criterion(&Criterion::continuous(
            age,
            f64::NEG_INFINITY,
            f64::INFINITY,
        ));
        assert_eq!(wire.min.as_deref(), Some("-Inf"));
        assert_eq!(wire.max.as_deref(), Some("+Inf"));
    }

    #[test]
    fn test_decode_rejects_unknown_feature() {
        let wire = WireCriterion {
            kind: KIND_DISCRETE.to_string(),
            feature: "ghost".to_string(),
            value: Some("x".to_string()),
            min: None,
            max: None,
        };
        assert_eq!(
            decode_criterion(&wire, &catalog()),
            Err(FormatError::UnknownFeature("ghost".to_string()))
        );
    }

    #[test]
    fn test_decode_rejects_kind_mismatch() {
        let wire = WireCriterion {
            kind: KIND_CONTINUOUS.to_string(),
            feature: "marital".to_string(),
            value: None,
            min: Some("0.000000".to_string()),
            max: Some("+Inf".to_string()),
        };
        assert_eq!(
            decode_criterion(&wire, &catalog()),
            Err(FormatError::ExpectedContinuousFeature("marital".to_string()))
        );
    }

    #[test]
    fn test_node_wire_omits_absent_fields() {
        let node = Node::new();
        let data = encode_node(&node).unwrap();
        assert_eq!(String::from_utf8(data).unwrap(), r#"{"id":""}"#);
    }

    #[test]
    fn test_node_round_trip() {
        let features = catalog();
        let marital = features[0].clone();
        let node = Node {
            id: "7".to_string(),
            parent_id: "1".to_string(),
            subtree_ids: vec!["8".to_string(), "9".to_string()],
            criterion: Some(Criterion::discrete(marital.clone(), "single")),
            subtree_feature: Some(features[1].clone()),
            prediction: Some(Prediction::new(
                [("yes".to_string(), 1.0)].into_iter().collect(),
                2,
            )),
        };
        let decoded = decode_node(&encode_node(&node).unwrap(), &features).unwrap();
        assert_eq!(decoded, node);
    }
}
