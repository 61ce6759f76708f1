//! Additive causal mask builder.
//!
//! Masks are `f32` tensors shaped `[1, 1, q_len, k_len]`, broadcast over
//! batch and heads when added to attention scores. Entries are `0.0`
//! where attention is permitted and `f32::NEG_INFINITY` otherwise.

use candle_core::{Device, Tensor};

use crate::error::Result;

/// Construct a causal mask for the supplied sequence dimensions.
///
/// When `k_len > q_len`, queries are aligned with the most recent
/// `q_len` keys so that position `i` of the current chunk may attend to
/// the entire cached prefix plus its own chunk up to `i`.
pub fn build_causal_mask(device: &Device, q_len: usize, k_len: usize) -> Result<Tensor> {
    let mut data = vec![0f32; q_len * k_len];
    let offset = k_len.saturating_sub(q_len);

    for q in 0..q_len {
        let row_start = q * k_len;
        let max_k = q + offset;
        for k in (max_k + 1)..k_len {
            data[row_start + k] = f32::NEG_INFINITY;
        }
    }

    Ok(Tensor::from_vec(data, (1, 1, q_len, k_len), device)?)
}
