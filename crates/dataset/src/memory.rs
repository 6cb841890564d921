//! In-memory dataset backends.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use canopy_types::{Cancel, Criterion, Feature, Sample, Value};

use crate::{entropy_of_counts, Dataset};

/// Sample count above which [`new_auto`] switches from [`MemoryCopy`] to
/// [`CriterionChain`].
pub const AUTO_CHAIN_THRESHOLD: usize = 1000;

/// Builds a dataset from samples, choosing the backend by sample count:
/// [`CriterionChain`] above [`AUTO_CHAIN_THRESHOLD`], [`MemoryCopy`]
/// otherwise.
pub fn new_auto(samples: Vec<Arc<dyn Sample>>) -> Arc<dyn Dataset> {
    new_with_threshold(samples, AUTO_CHAIN_THRESHOLD)
}

/// Like [`new_auto`] with an explicit threshold.
pub fn new_with_threshold(samples: Vec<Arc<dyn Sample>>, threshold: usize) -> Arc<dyn Dataset> {
    if samples.len() > threshold {
        CriterionChain::new(samples)
    } else {
        MemoryCopy::new(samples)
    }
}

/// Entropy values are memoized per feature once computed; the memo is
/// guarded so concurrent readers observe a consistent cache.
#[derive(Default)]
struct EntropyMemo {
    by_feature: Mutex<BTreeMap<String, f64>>,
}

impl EntropyMemo {
    fn get(&self, feature: &Feature) -> Option<f64> {
        self.by_feature.lock().get(feature.name()).copied()
    }

    fn put(&self, feature: &Feature, entropy: f64) {
        self.by_feature.lock().insert(feature.name().to_string(), entropy);
    }
}

/// Materializing backend: every subset copies the filtered sample slice, so
/// later queries touch only the samples that belong to the subset.
pub struct MemoryCopy {
    samples: Vec<Arc<dyn Sample>>,
    criteria: Vec<Criterion>,
    entropy: EntropyMemo,
}

impl MemoryCopy {
    pub fn new(samples: Vec<Arc<dyn Sample>>) -> Arc<Self> {
        Arc::new(Self {
            samples,
            criteria: Vec::new(),
            entropy: EntropyMemo::default(),
        })
    }
}

#[async_trait]
impl Dataset for MemoryCopy {
    async fn count(&self, ctx: &Cancel) -> Result<u64> {
        ctx.check()?;
        Ok(self.samples.len() as u64)
    }

    async fn entropy(&self, ctx: &Cancel, feature: &Feature) -> Result<f64> {
        ctx.check()?;
        if let Some(memoized) = self.entropy.get(feature) {
            return Ok(memoized);
        }
        let counts = observed_value_counts(self.samples.iter(), feature)?;
        let result = entropy_of_counts(&counts);
        self.entropy.put(feature, result);
        Ok(result)
    }

    async fn feature_values(&self, ctx: &Cancel, feature: &Feature) -> Result<Vec<Value>> {
        ctx.check()?;
        distinct_values(self.samples.iter(), feature)
    }

    async fn count_feature_values(
        &self,
        ctx: &Cancel,
        feature: &Feature,
    ) -> Result<BTreeMap<String, u64>> {
        ctx.check()?;
        observed_value_counts(self.samples.iter(), feature)
    }

    async fn samples(&self, ctx: &Cancel) -> Result<Vec<Arc<dyn Sample>>> {
        ctx.check()?;
        Ok(self.samples.clone())
    }

    async fn subset_with(&self, ctx: &Cancel, criterion: Criterion) -> Result<Arc<dyn Dataset>> {
        ctx.check()?;
        let mut samples = Vec::new();
        for sample in &self.samples {
            if criterion.satisfied_by(sample.as_ref())? {
                samples.push(sample.clone());
            }
        }
        let mut criteria = Vec::with_capacity(self.criteria.len() + 1);
        criteria.push(criterion);
        criteria.extend(self.criteria.iter().cloned());
        Ok(Arc::new(Self {
            samples,
            criteria,
            entropy: EntropyMemo::default(),
        }))
    }

    async fn criteria(&self, ctx: &Cancel) -> Result<Vec<Criterion>> {
        ctx.check()?;
        Ok(self.criteria.clone())
    }
}

/// Re-filtering backend: one shared sample slice for the whole refinement
/// tree; every query walks the slice and applies the accumulated criteria
/// chain.
pub struct CriterionChain {
    samples: Arc<Vec<Arc<dyn Sample>>>,
    criteria: Vec<Criterion>,
    entropy: EntropyMemo,
    count: Mutex<Option<u64>>,
}

impl CriterionChain {
    pub fn new(samples: Vec<Arc<dyn Sample>>) -> Arc<Self> {
        Arc::new(Self {
            samples: Arc::new(samples),
            criteria: Vec::new(),
            entropy: EntropyMemo::default(),
            count: Mutex::new(None),
        })
    }

    /// Calls `visit` for every sample satisfying the criteria chain.
    fn for_each_selected(
        &self,
        ctx: &Cancel,
        mut visit: impl FnMut(&Arc<dyn Sample>) -> Result<()>,
    ) -> Result<()> {
        for sample in self.samples.iter() {
            ctx.check()?;
            let mut selected = true;
            for criterion in &self.criteria {
                if !criterion.satisfied_by(sample.as_ref())? {
                    selected = false;
                    break;
                }
            }
            if selected {
                visit(sample)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Dataset for CriterionChain {
    async fn count(&self, ctx: &Cancel) -> Result<u64> {
        ctx.check()?;
        if let Some(count) = *self.count.lock() {
            return Ok(count);
        }
        let mut count = 0u64;
        self.for_each_selected(ctx, |_| {
            count += 1;
            Ok(())
        })?;
        *self.count.lock() = Some(count);
        Ok(count)
    }

    async fn entropy(&self, ctx: &Cancel, feature: &Feature) -> Result<f64> {
        ctx.check()?;
        if let Some(memoized) = self.entropy.get(feature) {
            return Ok(memoized);
        }
        let mut counts = BTreeMap::new();
        self.for_each_selected(ctx, |sample| {
            if let Some(value) = sample.value_for(feature)? {
                *counts.entry(value.count_key()).or_insert(0u64) += 1;
            }
            Ok(())
        })?;
        let result = entropy_of_counts(&counts);
        self.entropy.put(feature, result);
        Ok(result)
    }

    async fn feature_values(&self, ctx: &Cancel, feature: &Feature) -> Result<Vec<Value>> {
        ctx.check()?;
        let mut seen = BTreeMap::new();
        self.for_each_selected(ctx, |sample| {
            if let Some(value) = sample.value_for(feature)? {
                seen.entry(value.count_key()).or_insert(value);
            }
            Ok(())
        })?;
        Ok(seen.into_values().collect())
    }

    async fn count_feature_values(
        &self,
        ctx: &Cancel,
        feature: &Feature,
    ) -> Result<BTreeMap<String, u64>> {
        ctx.check()?;
        let mut counts = BTreeMap::new();
        self.for_each_selected(ctx, |sample| {
            if let Some(value) = sample.value_for(feature)? {
                *counts.entry(value.count_key()).or_insert(0u64) += 1;
            }
            Ok(())
        })?;
        Ok(counts)
    }

    async fn samples(&self, ctx: &Cancel) -> Result<Vec<Arc<dyn Sample>>> {
        ctx.check()?;
        let mut samples = Vec::new();
        self.for_each_selected(ctx, |sample| {
            samples.push(sample.clone());
            Ok(())
        })?;
        Ok(samples)
    }

    async fn subset_with(&self, ctx: &Cancel, criterion: Criterion) -> Result<Arc<dyn Dataset>> {
        ctx.check()?;
        let mut criteria = Vec::with_capacity(self.criteria.len() + 1);
        criteria.push(criterion);
        criteria.extend(self.criteria.iter().cloned());
        Ok(Arc::new(Self {
            samples: self.samples.clone(),
            criteria,
            entropy: EntropyMemo::default(),
            count: Mutex::new(None),
        }))
    }

    async fn criteria(&self, ctx: &Cancel) -> Result<Vec<Criterion>> {
        ctx.check()?;
        Ok(self.criteria.clone())
    }
}

fn observed_value_counts<'a>(
    samples: impl Iterator<Item = &'a Arc<dyn Sample>>,
    feature: &Feature,
) -> Result<BTreeMap<String, u64>> {
    let mut counts = BTreeMap::new();
    for sample in samples {
        if let Some(value) = sample.value_for(feature)? {
            *counts.entry(value.count_key()).or_insert(0u64) += 1;
        }
    }
    Ok(counts)
}

fn distinct_values<'a>(
    samples: impl Iterator<Item = &'a Arc<dyn Sample>>,
    feature: &Feature,
) -> Result<Vec<Value>> {
    let mut seen = BTreeMap::new();
    for sample in samples {
        if let Some(value) = sample.value_for(feature)? {
            seen.entry(value.count_key()).or_insert(value);
        }
    }
    Ok(seen.into_values().collect())
}
