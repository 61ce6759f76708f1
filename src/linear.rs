//! Bias-free dense projections.
//!
//! Projections expect inputs shaped `(batch, seq, in_dim)` and return
//! `(batch, seq, out_dim)`. Weights and activations are cast to
//! [`PrecisionPolicy::compute`] for the matmul and the result back to the
//! storage dtype. All backbone projections are bias-free, matching the
//! fused in/out projection layout of the attention and feed-forward
//! blocks.

use candle_core::{DType, Device, Tensor};

use crate::dtypes::PrecisionPolicy;
use crate::error::{BackboneError, Result};

/// Dense projection with mixed-precision aware forward pass.
#[derive(Debug, Clone)]
pub struct Linear {
    in_dim: usize,
    out_dim: usize,
    weight: Tensor,
}

impl Linear {
    /// Constructs a projection from a pre-existing `(out_dim, in_dim)` weight.
    pub fn new(in_dim: usize, out_dim: usize, weight: Tensor) -> Result<Self> {
        let dims = weight.dims();
        if dims != [out_dim, in_dim] {
            return Err(BackboneError::Config {
                message: format!(
                    "linear weight expected shape [{out_dim}, {in_dim}], got {dims:?}"
                ),
            });
        }
        Ok(Self {
            in_dim,
            out_dim,
            weight,
        })
    }

    /// Builds a projection with Xavier-uniform initialised weights.
    pub fn with_init(in_dim: usize, out_dim: usize, device: &Device, dtype: DType) -> Result<Self> {
        let bound = (6.0f64 / (in_dim as f64 + out_dim as f64)).sqrt();
        let weight = Tensor::rand(-bound as f32, bound as f32, (out_dim, in_dim), device)?;
        let weight = if dtype == DType::F32 {
            weight
        } else {
            weight.to_dtype(dtype)?
        };
        Self::new(in_dim, out_dim, weight)
    }

    /// Returns a clone of the underlying weight tensor.
    pub fn weight(&self) -> Tensor {
        self.weight.clone()
    }

    /// Applies the projection, promoting to the compute dtype when needed.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let (batch, seq, in_dim) = hidden.dims3()?;
        if in_dim != self.in_dim {
            return Err(BackboneError::Backend {
                message: format!(
                    "linear input expected last dim {}, got {}",
                    self.in_dim, in_dim
                ),
            });
        }

        let input = policy.cast_for_matmul(hidden)?.contiguous()?;
        let weight_t = policy.cast_for_matmul(&self.weight)?.t()?;

        let flat = input.reshape((batch * seq, self.in_dim))?;
        let projected = flat
            .matmul(&weight_t)?
            .reshape((batch, seq, self.out_dim))?;
        Ok(policy.cast_to_storage(&projected)?)
    }
}
