//! Rotary positional embeddings.
//!
//! Angles are precomputed once per session into separate sine/cosine
//! tables shaped `[table_len, head_dim / 2]` and sliced per call by
//! absolute position. Application treats the trailing head dimension as
//! `head_dim / 2` adjacent pairs and rotates each pair by its position's
//! angle: `(x0, x1) -> (x0*cos - x1*sin, x1*cos + x0*sin)`. The rotation
//! runs in `f32` and the output mirrors the input dtype.

use candle_core::{DType, Device, Tensor};

use crate::error::{BackboneError, Result};

/// Default base for the rotary frequency spectrum.
pub const DEFAULT_ROPE_BASE: f64 = 10_000.0;

/// Minimum number of positions materialised by the backbone.
pub const DEFAULT_TABLE_LEN: usize = 16_384;

/// Cos/sin rows for a contiguous range of absolute positions.
///
/// Both tensors are `f32` shaped `[seq_len, head_dim / 2]`.
#[derive(Debug, Clone)]
pub struct RotaryAngles {
    pub sin: Tensor,
    pub cos: Tensor,
}

/// Precomputed rotation coefficients indexed by absolute position.
#[derive(Debug, Clone)]
pub struct RotaryTable {
    sin: Tensor,
    cos: Tensor,
    table_len: usize,
    half_dim: usize,
    device: Device,
}

impl RotaryTable {
    /// Precompute coefficients for positions `0..table_len`.
    ///
    /// The angle for position `t` and pair index `i` is
    /// `t / base^(2i / head_dim)`. Fails if `head_dim` is zero or odd.
    pub fn precompute(
        table_len: usize,
        head_dim: usize,
        base: f64,
        device: &Device,
    ) -> Result<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(BackboneError::Config {
                message: format!("rotary head_dim must be even and non-zero, got {head_dim}"),
            });
        }
        if table_len == 0 {
            return Err(BackboneError::Config {
                message: "rotary table_len must be greater than zero".into(),
            });
        }

        let half_dim = head_dim / 2;
        let mut inv_freqs = Vec::with_capacity(half_dim);
        for idx in 0..half_dim {
            let exponent = (2 * idx) as f64 / head_dim as f64;
            inv_freqs.push(base.powf(-exponent));
        }

        let mut sin_data = Vec::with_capacity(table_len * half_dim);
        let mut cos_data = Vec::with_capacity(table_len * half_dim);
        for pos in 0..table_len {
            let pos_f = pos as f64;
            for &inv_freq in &inv_freqs {
                let angle = pos_f * inv_freq;
                sin_data.push(angle.sin() as f32);
                cos_data.push(angle.cos() as f32);
            }
        }

        let sin = Tensor::from_vec(sin_data, (table_len, half_dim), device)?;
        let cos = Tensor::from_vec(cos_data, (table_len, half_dim), device)?;
        log::debug!(
            "rotary table built: len={} half_dim={} base={}",
            table_len,
            half_dim,
            base
        );
        Ok(Self {
            sin,
            cos,
            table_len,
            half_dim,
            device: device.clone(),
        })
    }

    /// Number of positions covered by the table.
    pub fn table_len(&self) -> usize {
        self.table_len
    }

    /// Device the tables currently live on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Fetch the angle rows for positions `[start, start + len)`.
    pub fn slice(&self, start: usize, len: usize) -> Result<RotaryAngles> {
        if start + len > self.table_len {
            return Err(BackboneError::Capacity {
                context: format!(
                    "rotary positions [{start}, {}) exceed table length {}",
                    start + len,
                    self.table_len
                ),
            });
        }
        Ok(RotaryAngles {
            sin: self.sin.narrow(0, start, len)?,
            cos: self.cos.narrow(0, start, len)?,
        })
    }
}

/// Rotate the trailing dimension of `x` by the supplied angles.
///
/// `x` is shaped `(batch, seq, heads, head_dim)` with the angle rows
/// covering exactly `seq` positions. Applied to query and key
/// projections before any cache write, never to values.
pub fn apply_rotary(x: &Tensor, angles: &RotaryAngles) -> Result<Tensor> {
    let (batch, seq, heads, head_dim) = x.dims4()?;
    let half_dim = head_dim / 2;
    let (rows, angle_dim) = angles.sin.dims2()?;
    if rows != seq || angle_dim != half_dim {
        return Err(BackboneError::Backend {
            message: format!(
                "rotary angles shaped [{rows}, {angle_dim}] do not match input [.., {seq}, .., {head_dim}]"
            ),
        });
    }

    let dtype = x.dtype();
    let pairs = x
        .to_dtype(DType::F32)?
        .contiguous()?
        .reshape((batch, seq, heads, half_dim, 2))?;
    let chunks = pairs.chunk(2, 4)?;
    let even = chunks[0].squeeze(4)?;
    let odd = chunks[1].squeeze(4)?;

    let sin = angles
        .sin
        .reshape((1, seq, 1, half_dim))?
        .broadcast_as((batch, seq, heads, half_dim))?;
    let cos = angles
        .cos
        .reshape((1, seq, 1, half_dim))?
        .broadcast_as((batch, seq, heads, half_dim))?;

    let rotated_even = even.mul(&cos)?.sub(&odd.mul(&sin)?)?;
    let rotated_odd = odd.mul(&cos)?.add(&even.mul(&sin)?)?;

    let rotated = Tensor::cat(
        &[&rotated_even.unsqueeze(4)?, &rotated_odd.unsqueeze(4)?],
        4,
    )?
    .reshape((batch, seq, heads, head_dim))?
    .to_dtype(dtype)?;
    Ok(rotated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn rotate_at(table: &RotaryTable, x: &Tensor, pos: usize) -> Tensor {
        let angles = table.slice(pos, 1).unwrap();
        apply_rotary(x, &angles).unwrap()
    }

    fn dot(a: &Tensor, b: &Tensor) -> f32 {
        let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn odd_head_dim_is_rejected() {
        let err = RotaryTable::precompute(8, 5, DEFAULT_ROPE_BASE, &Device::Cpu).unwrap_err();
        assert!(matches!(err, BackboneError::Config { .. }));
    }

    #[test]
    fn slice_past_table_length_is_a_capacity_error() {
        let table = RotaryTable::precompute(8, 4, DEFAULT_ROPE_BASE, &Device::Cpu).unwrap();
        let err = table.slice(6, 3).unwrap_err();
        assert!(matches!(err, BackboneError::Capacity { .. }));
        assert!(table.slice(6, 2).is_ok());
    }

    #[test]
    fn position_zero_is_the_identity_rotation() -> Result<()> {
        let device = Device::Cpu;
        let table = RotaryTable::precompute(4, 6, DEFAULT_ROPE_BASE, &device)?;
        let x = Tensor::rand(-1.0f32, 1.0, (1, 1, 2, 6), &device)?;
        let rotated = rotate_at(&table, &x, 0);
        let diff = x.sub(&rotated)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn dot_products_depend_only_on_relative_offset() -> Result<()> {
        let device = Device::Cpu;
        let table = RotaryTable::precompute(64, 8, DEFAULT_ROPE_BASE, &device)?;
        let q = Tensor::rand(-1.0f32, 1.0, (1, 1, 1, 8), &device)?;
        let k = Tensor::rand(-1.0f32, 1.0, (1, 1, 1, 8), &device)?;

        let offset = 3;
        let mut reference = None;
        for start in [0usize, 7, 20, 41] {
            let q_rot = rotate_at(&table, &q, start);
            let k_rot = rotate_at(&table, &k, start + offset);
            let score = dot(&q_rot, &k_rot);
            match reference {
                None => reference = Some(score),
                Some(expected) => assert!(
                    (score - expected).abs() < 1e-4,
                    "score {score} at start {start} diverged from {expected}"
                ),
            }
        }
        Ok(())
    }

    #[test]
    fn rotation_preserves_vector_norm() -> Result<()> {
        let device = Device::Cpu;
        let table = RotaryTable::precompute(32, 8, DEFAULT_ROPE_BASE, &device)?;
        let x = Tensor::rand(-1.0f32, 1.0, (2, 3, 2, 8), &device)?;
        let angles = table.slice(5, 3)?;
        let rotated = apply_rotary(&x, &angles)?;
        let norm_in = x.sqr()?.sum_all()?.to_vec0::<f32>()?;
        let norm_out = rotated.sqr()?.sum_all()?.to_vec0::<f32>()?;
        assert!((norm_in - norm_out).abs() < 1e-3);
        Ok(())
    }
}
