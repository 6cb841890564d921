//! Dataset abstraction for the canopy decision-tree engine.
//!
//! A dataset is a read-only, queryable view of samples refined from a root
//! collection by a chain of criteria. Refinement never mutates: subsetting
//! yields a new dataset and leaves the original untouched, so workers share
//! dataset handles freely.
//!
//! Two in-memory implementations are provided:
//! - [`MemoryCopy`] materializes the filtered samples on every subset,
//!   trading memory for query speed.
//! - [`CriterionChain`] keeps one shared sample slice and re-filters through
//!   the accumulated criteria chain on every query, trading CPU for memory.
//!
//! [`new_auto`] picks between them by sample count. Out-of-process backends
//! (SQL, document stores) are external collaborators that implement the same
//! trait.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use canopy_types::{Cancel, Criterion, Feature, Sample, Value};

mod memory;

pub use memory::{new_auto, new_with_threshold, CriterionChain, MemoryCopy, AUTO_CHAIN_THRESHOLD};

/// A logical collection of samples plus the criteria that refine it from its
/// root. All queries take a cancellation handle; backends that perform I/O
/// honor it.
#[async_trait]
pub trait Dataset: Send + Sync {
    /// Number of samples in the dataset.
    async fn count(&self, ctx: &Cancel) -> Result<u64>;

    /// Shannon entropy (natural log) of the observed values of `feature`.
    /// Samples without a value for the feature are excluded from both the
    /// numerator and the denominator.
    async fn entropy(&self, ctx: &Cancel, feature: &Feature) -> Result<f64>;

    /// Distinct observed values of `feature`, order unspecified.
    async fn feature_values(&self, ctx: &Cancel, feature: &Feature) -> Result<Vec<Value>>;

    /// Occurrence counts of `feature`'s observed values, keyed by their
    /// rendered form ([`Value::count_key`]).
    async fn count_feature_values(
        &self,
        ctx: &Cancel,
        feature: &Feature,
    ) -> Result<BTreeMap<String, u64>>;

    /// The samples themselves.
    async fn samples(&self, ctx: &Cancel) -> Result<Vec<Arc<dyn Sample>>>;

    /// A new dataset holding only the samples that satisfy `criterion`, with
    /// the criterion prepended to this dataset's criteria chain.
    async fn subset_with(&self, ctx: &Cancel, criterion: Criterion) -> Result<Arc<dyn Dataset>>;

    /// The criteria chain refining this dataset from its root, newest first.
    async fn criteria(&self, ctx: &Cancel) -> Result<Vec<Criterion>>;
}

/// Entropy of a value-count histogram, in nats.
pub(crate) fn entropy_of_counts(counts: &BTreeMap<String, u64>) -> f64 {
    let total: u64 = counts.values().sum();
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    let mut result = 0.0;
    for &count in counts.values() {
        let p = count as f64 / total;
        result -= p * p.ln();
    }
    result
}
