//! SiLU-gated feed-forward block.
//!
//! A single fused projection produces `(batch, seq, 2 * intermediate)`,
//! split along the feature axis into value and gate halves; the output
//! is the down-projection of `value * silu(gate)`.

use candle_core::{Tensor, D};

use crate::config::BackboneConfig;
use crate::dtypes::PrecisionPolicy;
use crate::error::Result;
use crate::linear::Linear;

/// Pointwise gated MLP applied to every token independently.
#[derive(Debug)]
pub struct FeedForward {
    fc1: Linear,
    fc2: Linear,
    intermediate: usize,
    policy: PrecisionPolicy,
}

impl FeedForward {
    pub fn new(config: &BackboneConfig) -> Result<Self> {
        let intermediate = config.attn_mlp_d_intermediate;
        let fc1 = Linear::with_init(
            config.d_model,
            2 * intermediate,
            &config.device,
            config.dtype,
        )?;
        let fc2 = Linear::with_init(intermediate, config.d_model, &config.device, config.dtype)?;
        Ok(Self {
            fc1,
            fc2,
            intermediate,
            policy: PrecisionPolicy::from_parameter_dtype(config.dtype),
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let fused = self.fc1.forward(x, &self.policy)?;
        let value = fused.narrow(D::Minus1, 0, self.intermediate)?;
        let gate = fused.narrow(D::Minus1, self.intermediate, self.intermediate)?;

        let gate = self.policy.cast_for_matmul(&gate)?.silu()?;
        let gated = self.policy.cast_for_matmul(&value)?.mul(&gate)?;
        self.fc2
            .forward(&self.policy.cast_to_storage(&gated)?, &self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Architecture, AttentionHeads, BackboneConfig};
    use candle_core::{DType, Device};

    fn tiny_config() -> BackboneConfig {
        BackboneConfig {
            d_model: 4,
            n_layer: 1,
            attn: AttentionHeads {
                num_heads: 2,
                num_heads_kv: 2,
            },
            attn_mlp_d_intermediate: 6,
            norm_epsilon: 1e-5,
            architecture: Architecture::Transformer,
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }

    #[test]
    fn output_matches_manual_gated_silu() -> Result<()> {
        let device = Device::Cpu;
        let config = tiny_config();
        let ff = FeedForward::new(&config)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);

        let x = Tensor::rand(-1.0f32, 1.0, (1, 2, 4), &device)?;
        let out = ff.forward(&x)?;

        let fused = ff.fc1.forward(&x, &policy)?;
        let value = fused.narrow(D::Minus1, 0, 6)?;
        let gate = fused.narrow(D::Minus1, 6, 6)?;
        let expected = ff.fc2.forward(&value.mul(&gate.silu()?)?, &policy)?;

        let diff = out.sub(&expected)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn preserves_hidden_shape() -> Result<()> {
        let config = tiny_config();
        let ff = FeedForward::new(&config)?;
        let x = Tensor::rand(-1.0f32, 1.0, (2, 3, 4), &Device::Cpu)?;
        let out = ff.forward(&x)?;
        assert_eq!(out.dims(), x.dims());
        Ok(())
    }
}
