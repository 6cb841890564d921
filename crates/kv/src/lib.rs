//! Key-value backend contract for the distributed queue and node store.
//!
//! The trait captures exactly the operations those backends assume of a
//! redis-style store: conditional string set with TTL, plain get/set/del,
//! set membership operations, and two server-side scripted operations
//! (conditional delete for lock release, atomic dual set-cardinality
//! count). A network client implementing this trait is an external
//! collaborator; [`MemoryKv`] is the in-process implementation used by
//! tests and single-host runs.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use canopy_types::Cancel;

#[async_trait]
pub trait KeyValue: Send + Sync {
    /// `SET key value NX [PX ttl]`: stores the value only if the key does
    /// not exist. Returns whether the value was stored.
    async fn set_nx(
        &self,
        ctx: &Cancel,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// `SET key value`: unconditional store.
    async fn set(&self, ctx: &Cancel, key: &str, value: Vec<u8>) -> Result<()>;

    /// `GET key`.
    async fn get(&self, ctx: &Cancel, key: &str) -> Result<Option<Vec<u8>>>;

    /// `DEL key`. Returns whether the key existed.
    async fn del(&self, ctx: &Cancel, key: &str) -> Result<bool>;

    /// Scripted conditional delete: removes the key only if its current
    /// value equals `expected`. Used to release locks without clobbering a
    /// successor's lock.
    async fn del_if_equals(&self, ctx: &Cancel, key: &str, expected: &[u8]) -> Result<bool>;

    /// `EXISTS key`.
    async fn exists(&self, ctx: &Cancel, key: &str) -> Result<bool>;

    /// `TTL key`: remaining time to live, `None` when the key is absent or
    /// has no expiry.
    async fn ttl(&self, ctx: &Cancel, key: &str) -> Result<Option<Duration>>;

    /// `SADD set member`. Returns whether the member was newly added.
    async fn sadd(&self, ctx: &Cancel, set: &str, member: &str) -> Result<bool>;

    /// `SREM set member`. Returns whether the member was present.
    async fn srem(&self, ctx: &Cancel, set: &str, member: &str) -> Result<bool>;

    /// `SMOVE src dst member`. Returns whether the member was moved.
    async fn smove(&self, ctx: &Cancel, src: &str, dst: &str, member: &str) -> Result<bool>;

    /// Full `SSCAN` of a set's members.
    async fn sscan(&self, ctx: &Cancel, set: &str) -> Result<Vec<String>>;

    /// Scripted atomic dual `SCARD`: both cardinalities observed in one
    /// round-trip, so a member moving between the sets is never counted in
    /// neither.
    async fn scard2(&self, ctx: &Cancel, first: &str, second: &str) -> Result<(u64, u64)>;
}

struct StringEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn live(&self) -> bool {
        self.expires_at.map(|at| Instant::now() < at).unwrap_or(true)
    }
}

#[derive(Default)]
struct State {
    strings: HashMap<String, StringEntry>,
    sets: HashMap<String, BTreeSet<String>>,
}

impl State {
    /// Drops the entry if its TTL has elapsed and reports whether a live
    /// entry remains.
    fn purge(&mut self, key: &str) -> bool {
        match self.strings.get(key) {
            Some(entry) if entry.live() => true,
            Some(_) => {
                self.strings.remove(key);
                false
            }
            None => false,
        }
    }
}

/// In-process [`KeyValue`] store with lazy TTL expiry.
#[derive(Default)]
pub struct MemoryKv {
    state: RwLock<State>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValue for MemoryKv {
    async fn set_nx(
        &self,
        ctx: &Cancel,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        ctx.check()?;
        let mut state = self.state.write();
        if state.purge(key) {
            return Ok(false);
        }
        state.strings.insert(
            key.to_string(),
            StringEntry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(true)
    }

    async fn set(&self, ctx: &Cancel, key: &str, value: Vec<u8>) -> Result<()> {
        ctx.check()?;
        self.state.write().strings.insert(
            key.to_string(),
            StringEntry {
                value,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn get(&self, ctx: &Cancel, key: &str) -> Result<Option<Vec<u8>>> {
        ctx.check()?;
        let mut state = self.state.write();
        if !state.purge(key) {
            return Ok(None);
        }
        Ok(state.strings.get(key).map(|entry| entry.value.clone()))
    }

    async fn del(&self, ctx: &Cancel, key: &str) -> Result<bool> {
        ctx.check()?;
        let mut state = self.state.write();
        let live = state.purge(key);
        state.strings.remove(key);
        Ok(live)
    }

    async fn del_if_equals(&self, ctx: &Cancel, key: &str, expected: &[u8]) -> Result<bool> {
        ctx.check()?;
        let mut state = self.state.write();
        if !state.purge(key) {
            return Ok(false);
        }
        let matches = state
            .strings
            .get(key)
            .map(|entry| entry.value == expected)
            .unwrap_or(false);
        if matches {
            state.strings.remove(key);
        }
        Ok(matches)
    }

    async fn exists(&self, ctx: &Cancel, key: &str) -> Result<bool> {
        ctx.check()?;
        Ok(self.state.write().purge(key))
    }

    async fn ttl(&self, ctx: &Cancel, key: &str) -> Result<Option<Duration>> {
        ctx.check()?;
        let mut state = self.state.write();
        if !state.purge(key) {
            return Ok(None);
        }
        Ok(state
            .strings
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn sadd(&self, ctx: &Cancel, set: &str, member: &str) -> Result<bool> {
        ctx.check()?;
        Ok(self
            .state
            .write()
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, ctx: &Cancel, set: &str, member: &str) -> Result<bool> {
        ctx.check()?;
        Ok(self
            .state
            .write()
            .sets
            .get_mut(set)
            .map(|members| members.remove(member))
            .unwrap_or(false))
    }

    async fn smove(&self, ctx: &Cancel, src: &str, dst: &str, member: &str) -> Result<bool> {
        ctx.check()?;
        let mut state = self.state.write();
        let moved = state
            .sets
            .get_mut(src)
            .map(|members| members.remove(member))
            .unwrap_or(false);
        if moved {
            state
                .sets
                .entry(dst.to_string())
                .or_default()
                .insert(member.to_string());
        }
        Ok(moved)
    }

    async fn sscan(&self, ctx: &Cancel, set: &str) -> Result<Vec<String>> {
        ctx.check()?;
        Ok(self
            .state
            .read()
            .sets
            .get(set)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn scard2(&self, ctx: &Cancel, first: &str, second: &str) -> Result<(u64, u64)> {
        ctx.check()?;
        let state = self.state.read();
        let card = |set: &str| state.sets.get(set).map(|members| members.len() as u64).unwrap_or(0);
        Ok((card(first), card(second)))
    }
}
