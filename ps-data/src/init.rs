//! Sparse-table initializers: how a [`crate::value::Value`]'s parameter
//! tensor is materialized the first time a key is referenced.
//!
//! Mirrors the original system's table-registration protocol
//! (`apply_sparse_table_prot.h`), which carries a named initializer kind
//! plus a string-keyed float config map rather than a typed struct per
//! kind — kept here as `InitializerSpec` so registration RPCs can be
//! plain data.

use std::collections::HashMap;

use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};

use crate::device::DeviceContext;
use crate::element_type::ElementType;
use crate::shape::Shape;
use crate::tensor::Tensor;
use ps_errors::{PsError, PsResult};

/// A named initializer kind plus its config map, as carried on the wire by
/// `RegisterSparseTable`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializerSpec {
    /// The initializer kind's name (`"zeros"`, `"uniform"`, `"normal"`).
    pub kind: String,
    /// Config values keyed by name (e.g. `"low"`/`"high"` for uniform,
    /// `"mean"`/`"std"` for normal).
    pub config: HashMap<String, f64>,
}

impl InitializerSpec {
    /// The all-zeros initializer.
    pub fn zeros() -> Self {
        InitializerSpec {
            kind: "zeros".to_string(),
            config: HashMap::new(),
        }
    }

    /// A uniform initializer over `[low, high)`.
    pub fn uniform(low: f64, high: f64) -> Self {
        let mut config = HashMap::new();
        config.insert("low".to_string(), low);
        config.insert("high".to_string(), high);
        InitializerSpec {
            kind: "uniform".to_string(),
            config,
        }
    }

    /// A normal (Gaussian) initializer with the given mean and standard
    /// deviation.
    pub fn normal(mean: f64, std: f64) -> Self {
        let mut config = HashMap::new();
        config.insert("mean".to_string(), mean);
        config.insert("std".to_string(), std);
        InitializerSpec {
            kind: "normal".to_string(),
            config,
        }
    }

    fn config_or(&self, key: &str, default: f64) -> f64 {
        self.config.get(key).copied().unwrap_or(default)
    }

    /// Materialize a new tensor of `dimension` elements of `element_type`
    /// according to this spec, deterministically seeded from `seed` (a
    /// sparse key, typically) so concurrent initialization of the same key
    /// by racing pulls is reproducible within a single process run.
    pub fn apply(
        &self,
        dimension: usize,
        element_type: ElementType,
        seed: u64,
        device: &DeviceContext,
    ) -> PsResult<Tensor> {
        let shape = Shape::vector(dimension);
        match self.kind.as_str() {
            "zeros" => Ok(Tensor::zeros(shape, element_type, device)),
            "uniform" => {
                let low = self.config_or("low", -0.01);
                let high = self.config_or("high", 0.01);
                let mut rng = SmallRng::seed_from_u64(seed);
                Tensor::random_uniform(shape, element_type, low, high, &mut rng)
            }
            "normal" => {
                use rand_distr::{Distribution, Normal};
                let mean = self.config_or("mean", 0.0);
                let std = self.config_or("std", 1.0);
                let normal = Normal::new(mean, std)
                    .map_err(|e| PsError::internal(format!("invalid normal initializer: {e}")))?;
                let mut rng = SmallRng::seed_from_u64(seed);
                let values: Vec<f64> = (0..dimension).map(|_| normal.sample(&mut rng)).collect();
                Tensor::from_f64_slice(shape, element_type, &values)
            }
            other => Err(PsError::internal(format!("unknown initializer kind {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeros_initializer_produces_all_zero_tensor() {
        let spec = InitializerSpec::zeros();
        let t = spec
            .apply(4, ElementType::F32, 0, &DeviceContext::cpu())
            .unwrap();
        assert_eq!(t.as_f64_vec().unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn uniform_initializer_stays_in_bounds() {
        let spec = InitializerSpec::uniform(-0.1, 0.1);
        let t = spec
            .apply(16, ElementType::F32, 42, &DeviceContext::cpu())
            .unwrap();
        for v in t.as_f64_vec().unwrap() {
            assert!((-0.1..0.1).contains(&v));
        }
    }

    #[test]
    fn same_seed_is_deterministic() {
        let spec = InitializerSpec::uniform(-1.0, 1.0);
        let a = spec.apply(8, ElementType::F32, 7, &DeviceContext::cpu()).unwrap();
        let b = spec.apply(8, ElementType::F32, 7, &DeviceContext::cpu()).unwrap();
        assert_eq!(a.as_f64_vec().unwrap(), b.as_f64_vec().unwrap());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let spec = InitializerSpec {
            kind: "bogus".to_string(),
            config: HashMap::new(),
        };
        assert!(spec.apply(4, ElementType::F32, 0, &DeviceContext::cpu()).is_err());
    }
}
