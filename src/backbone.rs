//! Backbone orchestration: block stack, rotary table, final norm.

use std::collections::HashMap;

use candle_core::{DType, Tensor};

use crate::config::BackboneConfig;
use crate::dtypes::PrecisionPolicy;
use crate::error::{BackboneError, Result};
use crate::kv_cache::{DecodeState, LayerKvCache};
use crate::norm::LayerNorm;
use crate::rope::{RotaryTable, DEFAULT_ROPE_BASE, DEFAULT_TABLE_LEN};
use crate::TransformerBlock;

/// Decoder-only transformer backbone.
///
/// Construction builds the immutable layer stack; the rotary table and
/// per-layer caches come later through an explicit
/// [`allocate_inference_cache`](Backbone::allocate_inference_cache)
/// step. [`forward`](Backbone::forward) then transforms hidden states
/// while the caller-owned [`DecodeState`] carries the running offsets
/// and cache contents between calls.
#[derive(Debug)]
pub struct Backbone {
    config: BackboneConfig,
    layers: Vec<TransformerBlock>,
    norm_f: LayerNorm,
    rotary: Option<RotaryTable>,
    policy: PrecisionPolicy,
}

impl Backbone {
    /// Builds the backbone, rejecting non-transformer configurations.
    pub fn new(config: BackboneConfig) -> Result<Self> {
        config.validate()?;

        let mut layers = Vec::with_capacity(config.n_layer);
        for layer_idx in 0..config.n_layer {
            layers.push(TransformerBlock::new(&config, layer_idx)?);
        }
        let norm_f = LayerNorm::new(
            config.d_model,
            config.norm_epsilon,
            &config.device,
            config.dtype,
        )?;
        let policy = PrecisionPolicy::from_parameter_dtype(config.dtype);

        Ok(Self {
            config,
            layers,
            norm_f,
            rotary: None,
            policy,
        })
    }

    /// Returns the backbone configuration.
    pub fn config(&self) -> &BackboneConfig {
        &self.config
    }

    /// Prepare a generation session: materialise the rotary table and
    /// allocate every layer's kv cache.
    ///
    /// The returned map is meant to be stored into a [`DecodeState`]
    /// before any forward call. The rotary table is rebuilt when it is
    /// missing, shorter than `max(16384, max_seq_len)` positions, or
    /// resident on a different device than the backbone.
    pub fn allocate_inference_cache(
        &mut self,
        batch: usize,
        max_seq_len: usize,
        dtype: DType,
    ) -> Result<HashMap<usize, LayerKvCache>> {
        let table_len = DEFAULT_TABLE_LEN.max(max_seq_len);
        let needs_table = match &self.rotary {
            None => true,
            Some(table) => {
                table.table_len() < table_len
                    || !table.device().same_device(&self.config.device)
            }
        };
        if needs_table {
            self.rotary = Some(RotaryTable::precompute(
                table_len,
                self.config.head_dim(),
                DEFAULT_ROPE_BASE,
                &self.config.device,
            )?);
        }

        let mut caches = HashMap::with_capacity(self.layers.len());
        for (layer_idx, layer) in self.layers.iter().enumerate() {
            let cache =
                layer.allocate_inference_cache(batch, max_seq_len, dtype, &self.config.device)?;
            caches.insert(layer_idx, cache);
        }
        log::info!(
            "inference cache ready: layers={} batch={} max_seq_len={} dtype={:?}",
            self.layers.len(),
            batch,
            max_seq_len,
            dtype
        );
        Ok(caches)
    }

    /// Transform hidden states `(batch, seq_len, d_model)` through the
    /// stack, returning a tensor of the same shape. The only side effect
    /// is the documented kv-cache mutation inside each layer.
    ///
    /// The caller advances `state.seqlen_offset` after each call; this
    /// method only reads it to derive the absolute position range.
    pub fn forward(&self, hidden_states: &Tensor, state: &mut DecodeState) -> Result<Tensor> {
        let rotary = self.rotary.as_ref().ok_or_else(|| BackboneError::UsageOrder {
            message: "rotary table not initialized; call allocate_inference_cache first".into(),
        })?;

        let (_batch, seq_len, _d_model) = hidden_states.dims3()?;
        let angles = rotary.slice(state.seqlen_offset(), seq_len)?;

        let mut hidden = hidden_states.clone();
        for layer in &self.layers {
            hidden = layer.forward(&hidden, state, &angles)?;
        }
        self.norm_f.forward(&hidden, &self.policy)
    }
}
