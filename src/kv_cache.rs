//! Per-layer key/value cache and the cross-call decode state.
//!
//! Each layer owns one preallocated buffer shaped
//! `[max_batch, max_seq_len, 2, num_heads_kv, head_dim]` with slot 0
//! holding keys and slot 1 values. Writes go through
//! [`LayerKvCache::update_and_fetch`], which writes a bounded region and
//! returns a read-only view of the valid prefix. The valid region grows
//! monotonically with the caller's `seqlen_offset`; out-of-order or
//! overlapping writes are a caller contract violation and are not
//! detected here.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};

use crate::error::{BackboneError, Result};

const KEY_SLOT: usize = 0;
const VALUE_SLOT: usize = 1;

/// Preallocated key/value storage for a single layer.
#[derive(Debug, Clone)]
pub struct LayerKvCache {
    buffer: Tensor,
    max_batch: usize,
    max_seq_len: usize,
    num_heads_kv: usize,
    head_dim: usize,
}

impl LayerKvCache {
    /// Allocate a zeroed cache at fixed capacity.
    pub fn allocate(
        max_batch: usize,
        max_seq_len: usize,
        num_heads_kv: usize,
        head_dim: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let buffer = Tensor::zeros(
            (max_batch, max_seq_len, 2, num_heads_kv, head_dim),
            dtype,
            device,
        )?;
        log::info!(
            "kv-cache allocated: batch={} max_seq_len={} heads_kv={} head_dim={} dtype={:?}",
            max_batch,
            max_seq_len,
            num_heads_kv,
            head_dim,
            dtype
        );
        Ok(Self {
            buffer,
            max_batch,
            max_seq_len,
            num_heads_kv,
            head_dim,
        })
    }

    /// Maximum number of cached positions.
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Write `k`/`v` at the addressed offsets and return the valid prefix.
    ///
    /// `k` and `v` are shaped `(batch_chunk, seq_chunk, num_heads_kv,
    /// head_dim)`. The write lands at rows `[batch_offset,
    /// batch_offset + batch_chunk)` and columns `[seq_offset,
    /// seq_offset + seq_chunk)`. The returned keys/values cover the
    /// addressed batch rows and columns `[0, seq_offset + seq_chunk)`.
    pub fn update_and_fetch(
        &mut self,
        k: &Tensor,
        v: &Tensor,
        batch_offset: usize,
        seq_offset: usize,
    ) -> Result<(Tensor, Tensor)> {
        let (batch_chunk, seq_chunk, heads, dim) = k.dims4()?;
        if v.dims() != k.dims() {
            return Err(BackboneError::Backend {
                message: format!(
                    "value shape {:?} must match key shape {:?}",
                    v.dims(),
                    k.dims()
                ),
            });
        }
        if heads != self.num_heads_kv || dim != self.head_dim {
            return Err(BackboneError::Backend {
                message: format!(
                    "key/value head layout [{heads}, {dim}] does not match cache [{}, {}]",
                    self.num_heads_kv, self.head_dim
                ),
            });
        }

        let batch_end = batch_offset + batch_chunk;
        let seq_end = seq_offset + seq_chunk;
        if batch_end > self.max_batch {
            return Err(BackboneError::Capacity {
                context: format!(
                    "batch rows [{batch_offset}, {batch_end}) exceed cache capacity {}",
                    self.max_batch
                ),
            });
        }
        if seq_end > self.max_seq_len {
            return Err(BackboneError::Capacity {
                context: format!(
                    "sequence positions [{seq_offset}, {seq_end}) exceed cache capacity {}",
                    self.max_seq_len
                ),
            });
        }

        let k_slot = k.to_dtype(self.buffer.dtype())?.unsqueeze(2)?;
        let v_slot = v.to_dtype(self.buffer.dtype())?.unsqueeze(2)?;
        self.buffer = self.buffer.slice_assign(
            &[
                batch_offset..batch_end,
                seq_offset..seq_end,
                KEY_SLOT..KEY_SLOT + 1,
                0..self.num_heads_kv,
                0..self.head_dim,
            ],
            &k_slot,
        )?;
        self.buffer = self.buffer.slice_assign(
            &[
                batch_offset..batch_end,
                seq_offset..seq_end,
                VALUE_SLOT..VALUE_SLOT + 1,
                0..self.num_heads_kv,
                0..self.head_dim,
            ],
            &v_slot,
        )?;

        let valid = self
            .buffer
            .narrow(0, batch_offset, batch_chunk)?
            .narrow(1, 0, seq_end)?;
        let keys = valid.narrow(2, KEY_SLOT, 1)?.squeeze(2)?;
        let values = valid.narrow(2, VALUE_SLOT, 1)?.squeeze(2)?;
        Ok((keys, values))
    }
}

/// Cross-call mutable state driving incremental decoding.
///
/// Owned by the external generation loop: it stores the per-layer cache
/// map produced by
/// [`Backbone::allocate_inference_cache`](crate::Backbone::allocate_inference_cache)
/// and the running offsets. The backbone borrows it mutably for the
/// duration of each forward call.
#[derive(Debug)]
pub struct DecodeState {
    seqlen_offset: usize,
    batch_size_offset: usize,
    caches: HashMap<usize, LayerKvCache>,
}

impl DecodeState {
    /// Build a fresh state from the layer-index -> cache map.
    pub fn new(caches: HashMap<usize, LayerKvCache>) -> Self {
        Self {
            seqlen_offset: 0,
            batch_size_offset: 0,
            caches,
        }
    }

    /// Absolute position of the next token to write.
    pub fn seqlen_offset(&self) -> usize {
        self.seqlen_offset
    }

    /// Starting batch row for partial-batch calls.
    pub fn batch_size_offset(&self) -> usize {
        self.batch_size_offset
    }

    /// Advance the running position by the chunk just processed.
    pub fn advance(&mut self, seq_len: usize) {
        self.seqlen_offset += seq_len;
    }

    /// Address a different batch row range for subsequent calls.
    pub fn set_batch_size_offset(&mut self, offset: usize) {
        self.batch_size_offset = offset;
    }

    /// Rewind the position to start a fresh sequence over the same caches.
    pub fn reset(&mut self) {
        self.seqlen_offset = 0;
        self.batch_size_offset = 0;
    }

    pub(crate) fn cache_mut(&mut self, layer_idx: usize) -> Result<&mut LayerKvCache> {
        self.caches
            .get_mut(&layer_idx)
            .ok_or_else(|| BackboneError::UsageOrder {
                message: format!(
                    "no kv cache allocated for layer {layer_idx}; call allocate_inference_cache first"
                ),
            })
    }
}
