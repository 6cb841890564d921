//! Node stores.
//!
//! Growth only ever touches nodes through a store: workers create children,
//! re-store the parent once its subtree ids are known, and the predictor
//! loads nodes by id. The in-memory store serializes access behind a
//! reader-writer lock; the key-value store delegates to a redis-style
//! backend and serializes nodes through the wire codec.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::distributions::Alphanumeric;
use rand::Rng;

use canopy_kv::KeyValue;
use canopy_types::{Cancel, Feature};

use crate::codec;
use crate::node::Node;

#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Assigns a fresh id to the node and inserts it.
    async fn create(&self, ctx: &Cancel, node: &mut Node) -> Result<()>;

    /// The node with the given id, if any.
    async fn get(&self, ctx: &Cancel, id: &str) -> Result<Option<Node>>;

    /// Overwrites the node under its id.
    async fn store(&self, ctx: &Cancel, node: &Node) -> Result<()>;

    /// Removes the node.
    async fn delete(&self, ctx: &Cancel, node: &Node) -> Result<()>;

    /// Releases any resources held by the store.
    async fn close(&self, ctx: &Cancel) -> Result<()>;
}

/// In-memory store; ids come from a monotone counter.
#[derive(Default)]
pub struct MemoryNodeStore {
    nodes: RwLock<HashMap<String, Node>>,
    next_id: AtomicU64,
}

impl MemoryNodeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn create(&self, ctx: &Cancel, node: &mut Node) -> Result<()> {
        ctx.check()?;
        let mut nodes = self.nodes.write();
        loop {
            let id = (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
            if !nodes.contains_key(&id) {
                node.id = id;
                break;
            }
        }
        nodes.insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn get(&self, ctx: &Cancel, id: &str) -> Result<Option<Node>> {
        ctx.check()?;
        Ok(self.nodes.read().get(id).cloned())
    }

    async fn store(&self, ctx: &Cancel, node: &Node) -> Result<()> {
        ctx.check()?;
        self.nodes.write().insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn delete(&self, ctx: &Cancel, node: &Node) -> Result<()> {
        ctx.check()?;
        self.nodes.write().remove(&node.id);
        Ok(())
    }

    async fn close(&self, _ctx: &Cancel) -> Result<()> {
        Ok(())
    }
}

const KV_ID_LEN: usize = 20;

/// Store backed by a redis-style key-value backend. Nodes live under
/// `"<prefix>:<id>"`; creation draws random ids and retries on collision.
pub struct KvNodeStore {
    kv: Arc<dyn KeyValue>,
    prefix: String,
    features: Vec<Arc<Feature>>,
}

impl KvNodeStore {
    pub fn new(kv: Arc<dyn KeyValue>, prefix: impl Into<String>, features: Vec<Arc<Feature>>) -> Arc<Self> {
        Arc::new(Self {
            kv,
            prefix: prefix.into(),
            features,
        })
    }

    fn key_for(&self, id: &str) -> String {
        format!("{}:{}", self.prefix, id)
    }
}

/// A random alphanumeric identifier, used for key-value node ids and lock
/// tokens.
pub(crate) fn random_id(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.sample(Alphanumeric) as char).collect()
}

#[async_trait]
impl NodeStore for KvNodeStore {
    async fn create(&self, ctx: &Cancel, node: &mut Node) -> Result<()> {
        loop {
            ctx.check()?;
            node.id = random_id(KV_ID_LEN);
            let data = codec::encode_node(node).context("creating node")?;
            if self
                .kv
                .set_nx(ctx, &self.key_for(&node.id), data, None)
                .await
                .context("creating node")?
            {
                return Ok(());
            }
        }
    }

    async fn get(&self, ctx: &Cancel, id: &str) -> Result<Option<Node>> {
        let Some(data) = self
            .kv
            .get(ctx, &self.key_for(id))
            .await
            .with_context(|| format!("retrieving node {id}"))?
        else {
            return Ok(None);
        };
        let node = codec::decode_node(&data, &self.features)
            .with_context(|| format!("retrieving node {id}"))?;
        Ok(Some(node))
    }

    async fn store(&self, ctx: &Cancel, node: &Node) -> Result<()> {
        let data = codec::encode_node(node).with_context(|| format!("storing node {}", node.id))?;
        self.kv
            .set(ctx, &self.key_for(&node.id), data)
            .await
            .with_context(|| format!("storing node {}", node.id))
    }

    async fn delete(&self, ctx: &Cancel, node: &Node) -> Result<()> {
        self.kv
            .del(ctx, &self.key_for(&node.id))
            .await
            .with_context(|| format!("deleting node {}", node.id))?;
        Ok(())
    }

    async fn close(&self, _ctx: &Cancel) -> Result<()> {
        Ok(())
    }
}
