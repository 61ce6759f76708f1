//! Grouped-query self-attention with incremental cache updates.
//!
//! Hidden states are projected to a fused query/key/value tensor, rotary
//! embeddings are applied to query and key, the layer's cache is updated
//! and the full valid prefix retrieved, key/value heads are expanded to
//! match the query head count, and scaled dot-product attention produces
//! the mixed output. A causal mask is applied only for multi-token
//! calls; a single decode step is by definition the newest position and
//! attends to the entire cached prefix.

use candle_core::Tensor;
use candle_nn::ops::softmax_last_dim;

use crate::config::BackboneConfig;
use crate::dtypes::PrecisionPolicy;
use crate::error::{BackboneError, Result};
use crate::kv_cache::DecodeState;
use crate::linear::Linear;
use crate::mask::build_causal_mask;
use crate::rope::{apply_rotary, RotaryAngles};

/// One layer's grouped-query attention mixer.
#[derive(Debug)]
pub struct Attention {
    layer_idx: usize,
    num_heads: usize,
    num_heads_kv: usize,
    head_dim: usize,
    in_proj: Linear,
    out_proj: Linear,
    policy: PrecisionPolicy,
}

impl Attention {
    /// Build the fused projections for layer `layer_idx`.
    pub fn new(config: &BackboneConfig, layer_idx: usize) -> Result<Self> {
        let num_heads = config.attn.num_heads;
        let num_heads_kv = config.attn.num_heads_kv;
        let head_dim = config.head_dim();

        let total_head_dim = (num_heads + 2 * num_heads_kv) * head_dim;
        let in_proj = Linear::with_init(
            config.d_model,
            total_head_dim,
            &config.device,
            config.dtype,
        )?;
        let out_proj = Linear::with_init(
            num_heads * head_dim,
            config.d_model,
            &config.device,
            config.dtype,
        )?;

        Ok(Self {
            layer_idx,
            num_heads,
            num_heads_kv,
            head_dim,
            in_proj,
            out_proj,
            policy: PrecisionPolicy::from_parameter_dtype(config.dtype),
        })
    }

    /// Attend over the cached prefix plus the current chunk.
    ///
    /// `x` holds pre-normalised hidden states `(batch, seq_len, d_model)`
    /// and `angles` the rotary rows for this call's absolute positions.
    /// Mutates the layer's cache through `state`.
    pub fn forward(
        &self,
        x: &Tensor,
        state: &mut DecodeState,
        angles: &RotaryAngles,
    ) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;

        let q_size = self.num_heads * self.head_dim;
        let kv_size = self.num_heads_kv * self.head_dim;
        let qkv = self.in_proj.forward(x, &self.policy)?;
        let q = qkv
            .narrow(2, 0, q_size)?
            .contiguous()?
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?;
        let k = qkv
            .narrow(2, q_size, kv_size)?
            .contiguous()?
            .reshape((batch, seq_len, self.num_heads_kv, self.head_dim))?;
        let v = qkv
            .narrow(2, q_size + kv_size, kv_size)?
            .contiguous()?
            .reshape((batch, seq_len, self.num_heads_kv, self.head_dim))?;

        // rotate query and key, never value
        let q = apply_rotary(&q, angles)?;
        let k = apply_rotary(&k, angles)?;

        let batch_offset = state.batch_size_offset();
        let seq_offset = state.seqlen_offset();
        let cache = state.cache_mut(self.layer_idx)?;
        let (k_all, v_all) = cache.update_and_fetch(&k, &v, batch_offset, seq_offset)?;

        let repeats = self.num_heads / self.num_heads_kv;
        let (k_all, v_all) = if repeats > 1 {
            (
                repeat_kv_heads(&k_all, repeats)?,
                repeat_kv_heads(&v_all, repeats)?,
            )
        } else {
            (k_all, v_all)
        };
        let k_len = k_all.dims4()?.1;

        let q_t = q.transpose(1, 2)?.contiguous()?;
        let k_t = k_all.transpose(1, 2)?.contiguous()?;
        let v_t = v_all.transpose(1, 2)?.contiguous()?;

        let mask = if seq_len > 1 {
            Some(build_causal_mask(x.device(), seq_len, k_len)?)
        } else {
            None
        };

        let attn = scaled_dot_product_attention(&q_t, &k_t, &v_t, mask.as_ref(), &self.policy)?;
        let merged = attn
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, q_size))?;
        self.out_proj.forward(&merged, &self.policy)
    }
}

/// Expand `(batch, seq, num_heads_kv, head_dim)` along the head axis by
/// repeating each key/value head contiguously `repeats` times.
pub(crate) fn repeat_kv_heads(x: &Tensor, repeats: usize) -> Result<Tensor> {
    if repeats == 0 {
        return Err(BackboneError::Config {
            message: "kv head repeat count must be greater than zero".into(),
        });
    }
    let (_, _, heads, _) = x.dims4()?;
    let mut pieces = Vec::with_capacity(heads * repeats);
    for head in 0..heads {
        let slice = x.narrow(2, head, 1)?.contiguous()?;
        for _ in 0..repeats {
            pieces.push(slice.clone());
        }
    }
    let refs: Vec<&Tensor> = pieces.iter().collect();
    Ok(Tensor::cat(&refs, 2)?)
}

/// `softmax(QK^T / sqrt(head_dim)) V` over `[batch, heads, seq, head_dim]`
/// inputs, with an optional additive mask broadcast over batch and heads.
pub(crate) fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    policy: &PrecisionPolicy,
) -> Result<Tensor> {
    let (batch, heads, q_len, head_dim) = q.dims4()?;
    let (_, _, k_len, _) = k.dims4()?;

    let q_work = policy.cast_for_matmul(q)?.contiguous()?;
    let k_work = policy.cast_for_matmul(k)?.contiguous()?;
    let v_work = policy.cast_for_matmul(v)?.contiguous()?;

    let merged = batch * heads;
    let q_view = q_work.reshape((merged, q_len, head_dim))?;
    let k_t = k_work.reshape((merged, k_len, head_dim))?.transpose(1, 2)?;
    let scale = 1.0 / (head_dim as f64).sqrt();
    let scores = q_view.matmul(&k_t)?.affine(scale, 0.0)?;

    let mut scores = scores.reshape((batch, heads, q_len, k_len))?;
    if let Some(mask) = mask {
        scores = scores.broadcast_add(mask)?;
    }

    let probs = softmax_last_dim(&scores.reshape((merged, q_len, k_len))?)?;
    let v_view = v_work.reshape((merged, k_len, head_dim))?;
    let output = probs
        .matmul(&v_view)?
        .reshape((batch, heads, q_len, head_dim))?;
    Ok(policy.cast_to_storage(&output)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn allclose(a: &Tensor, b: &Tensor, tol: f32) -> bool {
        let diff = a
            .to_dtype(DType::F32)
            .unwrap()
            .sub(&b.to_dtype(DType::F32).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        diff <= tol
    }

    #[test]
    fn kv_heads_repeat_contiguously() -> Result<()> {
        let device = Device::Cpu;
        let h0 = Tensor::full(1.0f32, (1, 2, 1, 3), &device)?;
        let h1 = Tensor::full(2.0f32, (1, 2, 1, 3), &device)?;
        let x = Tensor::cat(&[&h0, &h1], 2)?;

        let expanded = repeat_kv_heads(&x, 2)?;
        assert_eq!(expanded.dims(), &[1, 2, 4, 3]);
        let fills: Vec<f32> = (0..4)
            .map(|head| {
                expanded
                    .narrow(2, head, 1)
                    .unwrap()
                    .flatten_all()
                    .unwrap()
                    .to_vec1::<f32>()
                    .unwrap()[0]
            })
            .collect();
        assert_eq!(fills, vec![1.0, 1.0, 2.0, 2.0]);
        Ok(())
    }

    #[test]
    fn shared_kv_head_gives_identical_outputs_across_query_heads() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);

        // one query head's worth of data replicated across four heads
        let q_head = Tensor::rand(-1.0f32, 1.0, (1, 1, 3, 4), &device)?;
        let q = repeat_kv_heads(&q_head.transpose(1, 2)?.contiguous()?, 4)?
            .transpose(1, 2)?
            .contiguous()?;
        let kv_head = Tensor::rand(-1.0f32, 1.0, (1, 3, 1, 4), &device)?;
        let k = repeat_kv_heads(&kv_head, 4)?.transpose(1, 2)?.contiguous()?;
        let v = repeat_kv_heads(&kv_head, 4)?.transpose(1, 2)?.contiguous()?;

        let out = scaled_dot_product_attention(&q, &k, &v, None, &policy)?;
        let first = out.narrow(1, 0, 1)?;
        for head in 1..4 {
            let other = out.narrow(1, head, 1)?;
            assert!(allclose(&first, &other, 1e-6), "head {head} diverged");
        }
        Ok(())
    }

    #[test]
    fn causal_mask_hides_future_positions() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let q = Tensor::rand(-1.0f32, 1.0, (1, 2, 4, 8), &device)?;
        let k = Tensor::rand(-1.0f32, 1.0, (1, 2, 4, 8), &device)?;
        let v = Tensor::rand(-1.0f32, 1.0, (1, 2, 4, 8), &device)?;
        let mask = build_causal_mask(&device, 4, 4)?;

        let base = scaled_dot_product_attention(&q, &k, &v, Some(&mask), &policy)?;

        // perturb key/value at the last position only
        let bump = Tensor::full(7.5f32, (1, 2, 1, 8), &device)?;
        let k_mod = Tensor::cat(&[&k.narrow(2, 0, 3)?, &bump], 2)?;
        let v_mod = Tensor::cat(&[&v.narrow(2, 0, 3)?, &bump], 2)?;
        let modified = scaled_dot_product_attention(&q, &k_mod, &v_mod, Some(&mask), &policy)?;

        // query positions before the perturbed key are untouched
        assert!(allclose(
            &base.narrow(2, 0, 3)?,
            &modified.narrow(2, 0, 3)?,
            1e-6
        ));
        // the final query position must see the change
        assert!(!allclose(
            &base.narrow(2, 3, 1)?,
            &modified.narrow(2, 3, 1)?,
            1e-4
        ));
        Ok(())
    }

    #[test]
    fn unmasked_decode_step_sees_every_cached_position() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let q = Tensor::rand(-1.0f32, 1.0, (1, 2, 1, 8), &device)?;
        let k = Tensor::rand(-1.0f32, 1.0, (1, 2, 5, 8), &device)?;
        let v = Tensor::rand(-1.0f32, 1.0, (1, 2, 5, 8), &device)?;

        let base = scaled_dot_product_attention(&q, &k, &v, None, &policy)?;

        let bump = Tensor::full(7.5f32, (1, 2, 1, 8), &device)?;
        let v_mod = Tensor::cat(&[&v.narrow(2, 0, 4)?, &bump], 2)?;
        let modified = scaled_dot_product_attention(&q, &k, &v_mod, None, &policy)?;

        assert!(!allclose(&base, &modified, 1e-4));
        Ok(())
    }
}
