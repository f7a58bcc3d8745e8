//! Multi-head self/cross attention with an optional fused kernel path

use std::sync::Arc;

use candle_core::{DType, Module, ModuleT, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder, linear, linear_no_bias};
use tracing::trace;

use super::attention::{Attention, batch_to_heads, heads_to_batch, merge_heads, split_heads};
use super::config::CrossAttentionConfig;
use crate::common::{
    AttentionShape, FusedAttentionKernel, FusedGate, FusedPolicy, expand_mask, fused_eligible,
    resolve_kernel,
};
use crate::error::{AttentionError, Result, dims3};

/// Cross/Self Attention
///
/// Queries come from `x`, keys and values from the context (or from `x` when
/// no context is given). Each call goes either to the fused kernel resolved at
/// construction or to the generic [`Attention`] path.
#[derive(Debug)]
pub struct CrossAttention {
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    to_out: Linear,
    dropout: Dropout,
    attention: Attention,
    heads: usize,
    head_dim: usize,
    kernel: Option<Arc<dyn FusedAttentionKernel>>,
}

impl CrossAttention {
    pub fn new(vb: VarBuilder, config: &CrossAttentionConfig) -> Result<Self> {
        Self::with_kernel(vb, config, None)
    }

    /// Build with an explicit fused kernel instead of the backend default.
    ///
    /// The kernel is kept only if `config.enable_flash_attention` is set and
    /// the kernel reports itself available on the builder's device.
    pub fn with_kernel(
        vb: VarBuilder,
        config: &CrossAttentionConfig,
        kernel: Option<Arc<dyn FusedAttentionKernel>>,
    ) -> Result<Self> {
        let inner_dim = config.inner_dim();
        let kv_dim = config.kv_dim();

        let to_q = linear_no_bias(config.query_dim, inner_dim, vb.pp("to_q"))?;
        let to_k = linear_no_bias(kv_dim, inner_dim, vb.pp("to_k"))?;
        let to_v = linear_no_bias(kv_dim, inner_dim, vb.pp("to_v"))?;
        let to_out = linear(inner_dim, config.query_dim, vb.pp("to_out").pp("0"))?;

        let kernel = resolve_kernel(config.enable_flash_attention, kernel, vb.device());

        Ok(Self {
            to_q,
            to_k,
            to_v,
            to_out,
            dropout: Dropout::new(config.dropout),
            attention: Attention::new(config.dim_head, config.heads),
            heads: config.heads,
            head_dim: config.dim_head,
            kernel,
        })
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Whether a fused kernel was resolved at construction.
    pub fn has_fused_kernel(&self) -> bool {
        self.kernel.is_some()
    }

    pub fn forward(&self, x: &Tensor, context: Option<&Tensor>, mask: Option<&Tensor>) -> Result<Tensor> {
        self.forward_t(x, context, mask, false)
    }

    /// `x`: `(B, q_len, query_dim)`, `context`: `(B, kv_len, context_dim)`,
    /// `mask`: broadcastable to `(B, q_len, kv_len)`, non-zero = masked.
    /// Returns `(B, q_len, query_dim)` in the dtype of `x`.
    pub fn forward_t(
        &self,
        x: &Tensor,
        context: Option<&Tensor>,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let context = context.unwrap_or(x);
        let (q, k, v) = self.project(x, context)?;
        self.attend_projected(x.dtype(), &q, &k, &v, mask, FusedGate::Full, train)
    }

    /// Query, key and value projections in the layer's parameter dtype.
    pub(crate) fn project(&self, x: &Tensor, context: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (_, q_len, _) = dims3(x)?;
        let (_, kv_len, _) = dims3(context)?;
        if q_len == 0 || kv_len == 0 {
            return Err(AttentionError::EmptySequence {
                query: x.dims().to_vec(),
                context: context.dims().to_vec(),
            });
        }
        let dtype = self.to_q.weight().dtype();
        let x = x.to_dtype(dtype)?;
        let context = context.to_dtype(dtype)?;

        let q = self.to_q.forward(&x)?;
        let k = self.to_k.forward(&context)?;
        let v = self.to_v.forward(&context)?;
        Ok((q, k, v))
    }

    /// Attention over projected `(B, N, H * D)` tensors, output projection and
    /// cast back to `out_dtype`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn attend_projected(
        &self,
        out_dtype: DType,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        gate: FusedGate,
        train: bool,
    ) -> Result<Tensor> {
        let (batch, q_len, _) = dims3(q)?;
        let (_, kv_len, _) = dims3(k)?;
        let shape = AttentionShape {
            q_len,
            kv_len,
            head_dim: self.head_dim,
        };
        // fused kernels take one mask per batch item, not per head
        let per_head_mask = self.heads > 1
            && mask.is_some_and(|m| m.rank() == 3 && m.dims()[0] == batch * self.heads);
        let policy = FusedPolicy {
            enabled: self.kernel.is_some() && !per_head_mask,
            gate,
        };

        let out = match &self.kernel {
            Some(kernel) if fused_eligible(&shape, &policy) => {
                trace!(kernel = kernel.name(), q_len, kv_len, "fused attention");
                self.fused(kernel.as_ref(), q, k, v, mask)?
            }
            _ => {
                trace!(q_len, kv_len, head_dim = self.head_dim, "generic attention");
                self.generic(q, k, v, mask)?
            }
        };

        let out = self.to_out.forward(&out)?;
        let out = self.dropout.forward_t(&out, train)?;
        Ok(out.to_dtype(out_dtype)?)
    }

    fn generic(&self, q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        // (b, n, h*d) -> (b*h, n, d)
        let q = heads_to_batch(q, self.heads)?;
        let k = heads_to_batch(k, self.heads)?;
        let v = heads_to_batch(v, self.heads)?;

        let out = self.attention.attend(&q, &k, &v, mask)?;
        // (b*h, n, d) -> (b, n, h*d)
        batch_to_heads(&out, self.heads)
    }

    fn fused(
        &self,
        kernel: &dyn FusedAttentionKernel,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let param_dtype = q.dtype();
        let compute_dtype = kernel.compute_dtype();

        // (b, n, h*d) -> (b, h, n, d)
        let q = split_heads(q, self.heads)?.to_dtype(compute_dtype)?;
        let k = split_heads(k, self.heads)?.to_dtype(compute_dtype)?;
        let v = split_heads(v, self.heads)?.to_dtype(compute_dtype)?;

        let (b, _, q_len, _) = q.dims4()?;
        let kv_len = k.dim(2)?;
        // the kernel always takes a mask; an absent one hides nothing
        let mask = match mask {
            Some(mask) => expand_mask(mask, 1, (b, q_len, kv_len))?.to_dtype(kernel.mask_dtype())?,
            None => Tensor::zeros((b, q_len, kv_len), kernel.mask_dtype(), q.device())?,
        };

        let out = kernel.forward(&q, &k, &v, &mask, self.attention.scale())?;
        // (b, h, n, d) -> (b, n, h*d)
        Ok(merge_heads(&out)?.to_dtype(param_dtype)?)
    }
}
