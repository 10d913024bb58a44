//! Pluggable resource weighting
//!
//! A proposal's value is `confidence * weight(resources)`. The weight function
//! is supplied from outside the core and must be deterministic for identical
//! input.

use crate::state::ResourceSet;

/// External scoring of a resource set
pub trait ResourceWeightPolicy: Send + Sync {
    fn weight(&self, resources: &ResourceSet) -> f64;
}

/// Every resource set weighs 1.0, so value equals confidence
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformWeight;

impl ResourceWeightPolicy for UniformWeight {
    fn weight(&self, _resources: &ResourceSet) -> f64 {
        1.0
    }
}

impl<F> ResourceWeightPolicy for F
where
    F: Fn(&ResourceSet) -> f64 + Send + Sync,
{
    fn weight(&self, resources: &ResourceSet) -> f64 {
        self(resources)
    }
}
