//! Attention mask helpers
//!
//! Masks follow one convention everywhere: a non-zero entry marks a key
//! position that must receive no attention weight.

use candle_core::{DType, Tensor};

use crate::error::{AttentionError, Result};

/// Most negative finite value of `dtype`, used to knock out masked scores.
///
/// Using the finite minimum instead of `-inf` keeps rows that are entirely
/// masked free of NaNs after the softmax.
pub fn max_negative_value(dtype: DType) -> Result<f64> {
    match dtype {
        DType::F16 => Ok(f64::from(half::f16::MIN)),
        DType::BF16 => Ok(f64::from(half::bf16::MIN)),
        DType::F32 => Ok(f64::from(f32::MIN)),
        DType::F64 => Ok(f64::MIN),
        dtype => Err(AttentionError::UnsupportedDType(dtype)),
    }
}

/// Replace the entries of `on_false` selected by `mask` with `value`.
pub fn masked_fill(on_false: &Tensor, mask: &Tensor, value: f64) -> Result<Tensor> {
    let on_true = Tensor::new(value, on_false.device())?
        .to_dtype(on_false.dtype())?
        .broadcast_as(mask.shape().dims())?;
    Ok(mask.where_cond(&on_true, on_false)?)
}

/// Broadcast a user mask to a boolean `(B * heads, q_len, kv_len)` tensor.
///
/// Accepted inputs are key padding masks `(B, kv_len)`, rank-3 masks
/// broadcastable to `(B, q_len, kv_len)` and per-head masks already laid out as
/// `(B * heads, q_len or 1, kv_len or 1)`. A per-batch row is repeated once per
/// head, in the same order heads are folded into the batch axis.
pub fn expand_mask(
    mask: &Tensor,
    heads: usize,
    target: (usize, usize, usize),
) -> Result<Tensor> {
    let (b_heads, q_len, kv_len) = target;
    let shape_error = || AttentionError::MaskShape {
        mask: mask.dims().to_vec(),
        target: vec![b_heads, q_len, kv_len],
    };

    let expanded = match mask.rank() {
        2 => mask.unsqueeze(1)?,
        3 => mask.clone(),
        _ => return Err(shape_error()),
    };
    let (m_b, m_q, m_k) = expanded.dims3()?;
    if heads == 0 || b_heads % heads != 0 {
        return Err(shape_error());
    }
    let batch = b_heads / heads;
    if (m_b != 1 && m_b != batch && m_b != b_heads)
        || (m_q != 1 && m_q != q_len)
        || (m_k != 1 && m_k != kv_len)
    {
        return Err(shape_error());
    }

    let masked = expanded.ne(&expanded.zeros_like()?)?;
    if m_b == b_heads && m_b != batch {
        // already one row per head
        return Ok(masked.broadcast_as((b_heads, q_len, kv_len))?.contiguous()?);
    }
    let masked = masked
        .broadcast_as((batch, q_len, kv_len))?
        .unsqueeze(1)?
        .broadcast_as((batch, heads, q_len, kv_len))?
        .reshape((b_heads, q_len, kv_len))?;
    Ok(masked)
}
