//! Scaled dot-product attention on head-folded tensors
//!
//! Heads are folded into the batch axis batch-major: row `b * heads + h` of a
//! `(B * H, N, D)` tensor holds head `h` of batch item `b`.

use candle_core::{DType, Tensor};

use crate::common::{expand_mask, masked_fill, max_negative_value};
use crate::error::{AttentionError, Result, dims3};

/// `(B, N, H * D)` -> `(B * H, N, D)`
pub fn heads_to_batch(x: &Tensor, heads: usize) -> Result<Tensor> {
    let (b, n, channels) = dims3(x)?;
    if heads == 0 || channels % heads != 0 {
        return Err(AttentionError::HeadsMismatch {
            dim: channels,
            heads,
        });
    }
    let d = channels / heads;
    Ok(x.reshape((b, n, heads, d))?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((b * heads, n, d))?)
}

/// `(B * H, N, D)` -> `(B, N, H * D)`
pub fn batch_to_heads(x: &Tensor, heads: usize) -> Result<Tensor> {
    let (b_heads, n, d) = dims3(x)?;
    if heads == 0 || b_heads % heads != 0 {
        return Err(AttentionError::HeadsMismatch {
            dim: b_heads,
            heads,
        });
    }
    let b = b_heads / heads;
    Ok(x.reshape((b, heads, n, d))?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((b, n, heads * d))?)
}

/// `(B, N, H * D)` -> `(B, H, N, D)`, the layout fused kernels take.
pub fn split_heads(x: &Tensor, heads: usize) -> Result<Tensor> {
    let (b, n, channels) = dims3(x)?;
    if heads == 0 || channels % heads != 0 {
        return Err(AttentionError::HeadsMismatch {
            dim: channels,
            heads,
        });
    }
    Ok(x.reshape((b, n, heads, channels / heads))?
        .transpose(1, 2)?
        .contiguous()?)
}

/// `(B, H, N, D)` -> `(B, N, H * D)`
pub fn merge_heads(x: &Tensor) -> Result<Tensor> {
    let (b, heads, n, d) = x.dims4()?;
    Ok(x.transpose(1, 2)?.contiguous()?.reshape((b, n, heads * d))?)
}

/// Generic attention path. Holds no learned state.
#[derive(Debug, Clone)]
pub struct Attention {
    heads: usize,
    scale: f64,
}

impl Attention {
    pub fn new(dim_head: usize, heads: usize) -> Self {
        Self {
            heads,
            scale: (dim_head as f64).powf(-0.5),
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Softmax attention weights `(B * H, q_len, kv_len)`.
    ///
    /// Masked scores are set to the most negative finite value of the score
    /// dtype. The softmax runs in F32 for half precision scores, and the
    /// weights are returned in that softmax dtype.
    pub fn attention_probs(&self, q: &Tensor, k: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (b_heads, q_len, _) = dims3(q)?;
        let (_, kv_len, _) = dims3(k)?;

        let k_t = k.transpose(1, 2)?.contiguous()?;
        let mut sim = (q.contiguous()?.matmul(&k_t)? * self.scale)?;

        if let Some(mask) = mask {
            let mask = expand_mask(mask, self.heads, (b_heads, q_len, kv_len))?;
            sim = masked_fill(&sim, &mask, max_negative_value(sim.dtype())?)?;
        }

        let softmax_dtype = match sim.dtype() {
            DType::F16 | DType::BF16 => DType::F32,
            d => d,
        };
        Ok(candle_nn::ops::softmax_last_dim(&sim.to_dtype(softmax_dtype)?)?)
    }

    /// `q`: `(B * H, q_len, D)`, `k`/`v`: `(B * H, kv_len, D)` -> `(B * H, q_len, D)`
    pub fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let attn = self.attention_probs(q, k, mask)?.to_dtype(v.dtype())?;
        Ok(attn.matmul(&v.contiguous()?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_heads_to_batch_order() -> Result<()> {
        let device = Device::Cpu;
        // (B=1, N=1, H*D=4) with H=2: head 0 = [0, 1], head 1 = [2, 3]
        let x = Tensor::new(&[[[0f32, 1., 2., 3.]]], &device)?;
        let folded = heads_to_batch(&x, 2)?;
        assert_eq!(folded.dims(), &[2, 1, 2]);
        assert_eq!(
            folded.to_vec3::<f32>()?,
            vec![vec![vec![0., 1.]], vec![vec![2., 3.]]]
        );
        Ok(())
    }

    #[test]
    fn test_heads_mismatch() -> Result<()> {
        let x = Tensor::zeros((1, 3, 10), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            heads_to_batch(&x, 3),
            Err(AttentionError::HeadsMismatch { dim: 10, heads: 3 })
        ));
        Ok(())
    }

    #[test]
    fn test_split_merge_matches_folding() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (2, 5, 12), &device)?;
        let split = split_heads(&x, 3)?;
        let folded = heads_to_batch(&x, 3)?;
        let diff = (split.reshape((6, 5, 4))? - &folded)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        let merged = merge_heads(&split)?;
        assert_eq!(merged.to_vec3::<f32>()?, x.to_vec3::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_attention_uniform_keys() -> Result<()> {
        let device = Device::Cpu;
        // identical keys give uniform weights, so the output is the mean value
        let q = Tensor::randn(0f32, 1.0, (2, 3, 4), &device)?;
        let k = Tensor::ones((2, 5, 4), DType::F32, &device)?;
        let v = Tensor::randn(0f32, 1.0, (2, 5, 4), &device)?;
        let attn = Attention::new(4, 1);

        let out = attn.attend(&q, &k, &v, None)?;
        assert_eq!(out.dims(), &[2, 3, 4]);

        let mean = v.mean_keepdim(1)?.broadcast_as((2, 3, 4))?;
        let diff = (out - mean)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5, "diff = {diff}");
        Ok(())
    }
}
