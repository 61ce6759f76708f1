//! Configuration for assembling the transformer backbone.

use candle_core::{DType, Device};

use crate::error::{BackboneError, Result};

/// Backbone variant selector.
///
/// Only the transformer case is implemented; the state-space variant is
/// declared so configurations parsed from upstream model descriptions can
/// name it, but [`BackboneConfig::validate`] rejects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Architecture {
    /// Stacked self-attention + feed-forward blocks.
    Transformer,
    /// State-space mixer variant, not supported by this crate.
    StateSpace,
}

/// Head counts for grouped-query attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionHeads {
    /// Number of query heads.
    pub num_heads: usize,
    /// Number of key/value heads; each is shared by
    /// `num_heads / num_heads_kv` query heads.
    pub num_heads_kv: usize,
}

/// High-level configuration for the decoder-only backbone.
///
/// Immutable once constructed; owned by [`Backbone`](crate::Backbone).
#[derive(Debug, Clone)]
pub struct BackboneConfig {
    pub d_model: usize,
    pub n_layer: usize,
    pub attn: AttentionHeads,
    /// Width of the gated feed-forward intermediate projection.
    pub attn_mlp_d_intermediate: usize,
    pub norm_epsilon: f64,
    pub architecture: Architecture,
    pub dtype: DType,
    pub device: Device,
}

impl BackboneConfig {
    /// Feature width per attention head.
    pub fn head_dim(&self) -> usize {
        self.d_model / self.attn.num_heads
    }

    /// Validate structural invariants before any layer is built.
    pub fn validate(&self) -> Result<()> {
        if self.architecture != Architecture::Transformer {
            return Err(BackboneError::Config {
                message: format!(
                    "this backbone only supports the transformer architecture, got {:?}",
                    self.architecture
                ),
            });
        }
        if self.d_model == 0 {
            return Err(BackboneError::Config {
                message: "d_model must be greater than zero".into(),
            });
        }
        if self.n_layer == 0 {
            return Err(BackboneError::Config {
                message: "n_layer must be greater than zero".into(),
            });
        }
        if self.attn.num_heads == 0 || self.attn.num_heads_kv == 0 {
            return Err(BackboneError::Config {
                message: "num_heads and num_heads_kv must be greater than zero".into(),
            });
        }
        if self.attn.num_heads_kv > self.attn.num_heads {
            return Err(BackboneError::Config {
                message: format!(
                    "num_heads_kv ({}) must not exceed num_heads ({})",
                    self.attn.num_heads_kv, self.attn.num_heads
                ),
            });
        }
        if self.attn.num_heads % self.attn.num_heads_kv != 0 {
            return Err(BackboneError::Config {
                message: format!(
                    "num_heads ({}) must be divisible by num_heads_kv ({}) for GQA",
                    self.attn.num_heads, self.attn.num_heads_kv
                ),
            });
        }
        if self.d_model % self.attn.num_heads != 0 {
            return Err(BackboneError::Config {
                message: format!(
                    "d_model ({}) must be divisible by num_heads ({})",
                    self.d_model, self.attn.num_heads
                ),
            });
        }
        if self.head_dim() % 2 != 0 {
            return Err(BackboneError::Config {
                message: format!(
                    "head_dim ({}) must be even so rotary pairs line up",
                    self.head_dim()
                ),
            });
        }
        if self.attn_mlp_d_intermediate == 0 {
            return Err(BackboneError::Config {
                message: "attn_mlp_d_intermediate must be greater than zero".into(),
            });
        }
        if self.norm_epsilon <= 0.0 {
            return Err(BackboneError::Config {
                message: "norm_epsilon must be positive".into(),
            });
        }
        Ok(())
    }
}
