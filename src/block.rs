//! Pre-norm residual transformer block.

use candle_core::{DType, Device, Tensor};

use crate::attention::Attention;
use crate::config::BackboneConfig;
use crate::dtypes::PrecisionPolicy;
use crate::error::Result;
use crate::feed_forward::FeedForward;
use crate::kv_cache::{DecodeState, LayerKvCache};
use crate::norm::LayerNorm;
use crate::rope::RotaryAngles;

/// One residual layer: `x + attn(norm(x))` followed by `x + mlp(norm2(x))`.
#[derive(Debug)]
pub struct TransformerBlock {
    norm: LayerNorm,
    mixer: Attention,
    norm2: LayerNorm,
    mlp: FeedForward,
    policy: PrecisionPolicy,
    num_heads_kv: usize,
    head_dim: usize,
}

impl TransformerBlock {
    pub fn new(config: &BackboneConfig, layer_idx: usize) -> Result<Self> {
        let norm = LayerNorm::new(
            config.d_model,
            config.norm_epsilon,
            &config.device,
            config.dtype,
        )?;
        let norm2 = LayerNorm::new(
            config.d_model,
            config.norm_epsilon,
            &config.device,
            config.dtype,
        )?;
        Ok(Self {
            norm,
            mixer: Attention::new(config, layer_idx)?,
            norm2,
            mlp: FeedForward::new(config)?,
            policy: PrecisionPolicy::from_parameter_dtype(config.dtype),
            num_heads_kv: config.attn.num_heads_kv,
            head_dim: config.head_dim(),
        })
    }

    /// Allocate this layer's kv cache sized for its head geometry.
    pub fn allocate_inference_cache(
        &self,
        batch: usize,
        max_seq_len: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<LayerKvCache> {
        LayerKvCache::allocate(
            batch,
            max_seq_len,
            self.num_heads_kv,
            self.head_dim,
            dtype,
            device,
        )
    }

    pub fn forward(
        &self,
        x: &Tensor,
        state: &mut DecodeState,
        angles: &RotaryAngles,
    ) -> Result<Tensor> {
        let normed = self.norm.forward(x, &self.policy)?;
        let x = x.add(&self.mixer.forward(&normed, state, angles)?)?;
        let normed2 = self.norm2.forward(&x, &self.policy)?;
        Ok(x.add(&self.mlp.forward(&normed2)?)?)
    }
}
