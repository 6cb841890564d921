//! Shared data model for the canopy decision-tree engine.
//!
//! Everything here is immutable once constructed and shared freely between
//! workers: feature descriptors, sample values, criteria, and the
//! cancellation handle threaded through every suspending operation.

pub mod cancel;
pub mod criterion;
pub mod feature;
pub mod sample;

pub use cancel::{Cancel, Cancelled};
pub use criterion::Criterion;
pub use feature::{Feature, FeatureError};
pub use sample::{MapSample, Sample, Value};
