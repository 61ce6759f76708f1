//! Layer normalisation with unified shape and dtype handling.
//!
//! Inputs follow the `(batch, seq, hidden)` convention. Statistics are
//! computed in `f32` regardless of the storage dtype, then the output is
//! cast back through the precision policy.

use candle_core::{DType, Device, Tensor, D};

use crate::dtypes::PrecisionPolicy;
use crate::error::Result;

/// Standard LayerNorm with learnable scale and bias.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    hidden: usize,
    epsilon: f64,
    weight: Tensor,
    bias: Tensor,
}

impl LayerNorm {
    /// Constructs a LayerNorm with unit scale and zero bias.
    pub fn new(hidden: usize, epsilon: f64, device: &Device, dtype: DType) -> Result<Self> {
        let weight = Tensor::ones(hidden, dtype, device)?;
        let bias = Tensor::zeros(hidden, dtype, device)?;
        Ok(Self {
            hidden,
            epsilon,
            weight,
            bias,
        })
    }

    /// Applies the normalisation along the last axis.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let hidden_size = self.hidden as f64;
        let mut compute = hidden.to_dtype(DType::F32)?;

        let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
        compute = compute.broadcast_sub(&mean)?;

        let variance = (compute.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.epsilon)?.sqrt()?;
        let normalized = compute.broadcast_div(&denom)?;

        let weight = self.weight.to_dtype(DType::F32)?;
        let bias = self.bias.to_dtype(DType::F32)?;
        let affine = normalized.broadcast_mul(&weight)?.broadcast_add(&bias)?;
        Ok(policy.cast_to_storage(&affine)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn normalised_rows_have_zero_mean_unit_variance() -> Result<()> {
        let device = Device::Cpu;
        let norm = LayerNorm::new(4, 1e-5, &device, DType::F32)?;
        let input = Tensor::from_vec(
            vec![1.0f32, 2.0, 3.0, 4.0, -2.0, 0.0, 2.0, 4.0],
            (1, 2, 4),
            &device,
        )?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);

        let out = norm.forward(&input, &policy)?;
        let rows = out.flatten_all()?.to_vec1::<f32>()?;
        for row in rows.chunks(4) {
            let mean: f32 = row.iter().sum::<f32>() / 4.0;
            let var: f32 = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
        Ok(())
    }

    #[test]
    fn output_preserves_shape_and_dtype() -> Result<()> {
        let device = Device::Cpu;
        let norm = LayerNorm::new(8, 1e-5, &device, DType::BF16)?;
        let input = Tensor::rand(-1.0f32, 1.0, (2, 3, 8), &device)?.to_dtype(DType::BF16)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::BF16);
        let out = norm.forward(&input, &policy)?;
        assert_eq!(out.dims(), input.dims());
        assert_eq!(out.dtype(), DType::BF16);
        Ok(())
    }
}
