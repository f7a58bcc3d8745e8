//! Accelerated attention dispatch
//!
//! Fused attention kernels share one fixed interface: heads kept separate in a
//! `(B, H, N, D)` layout, inputs in a reduced precision and an explicit mask.
//! - CUDA: Flash Attention (when compiled with the `flash-attn` feature)
//! - Metal: SDPA kernel via candle_nn::ops::sdpa
//! - CPU: no fused kernel, layers run the generic attention path
//!
//! Whether a call may use a kernel is decided by [`fused_eligible`], a pure
//! predicate over the call's shapes.

use std::fmt::Debug;
use std::sync::Arc;

use candle_core::{D, DType, Device, Tensor};
use tracing::{debug, info};

use super::mask::{masked_fill, max_negative_value};
use crate::error::Result;

// Flash Attention wrapper for CUDA
#[cfg(feature = "flash-attn")]
fn flash_attn(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    softmax_scale: f32,
    causal: bool,
) -> candle_core::Result<Tensor> {
    candle_flash_attn::flash_attn(q, k, v, softmax_scale, causal)
}

#[cfg(not(feature = "flash-attn"))]
fn flash_attn(_: &Tensor, _: &Tensor, _: &Tensor, _: f32, _: bool) -> candle_core::Result<Tensor> {
    candle_core::bail!("flash-attn feature not enabled, compile with '--features flash-attn'")
}

/// Query and key lengths must both be multiples of this for the fused path.
pub const FUSED_SEQ_MULTIPLE: usize = 16;

/// Largest head dimension sent to a fused kernel. Head dim 160 produces wrong
/// results on the kernels this was tuned against.
pub const FUSED_MAX_HEAD_DIM: usize = 128;

/// A fused attention kernel.
///
/// `q` is `(B, H, q_len, D)`, `k` and `v` are `(B, H, kv_len, D)`, all in
/// [`compute_dtype`](Self::compute_dtype). `mask` is `(B, q_len, kv_len)` in
/// [`mask_dtype`](Self::mask_dtype) with non-zero entries masked. The output
/// is `(B, H, q_len, D)`.
pub trait FusedAttentionKernel: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Backend capability query, performed once when a layer is built.
    fn is_available(&self, device: &Device) -> bool;

    fn compute_dtype(&self) -> DType {
        DType::F16
    }

    fn mask_dtype(&self) -> DType {
        DType::U8
    }

    fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor, mask: &Tensor, scale: f64)
    -> Result<Tensor>;
}

/// Kernels provided by candle backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKernel {
    FlashAttn,
    MetalSdpa,
}

impl BackendKernel {
    /// First built-in kernel usable on `device`, if any.
    pub fn for_device(device: &Device) -> Option<Self> {
        [Self::FlashAttn, Self::MetalSdpa]
            .into_iter()
            .find(|kernel| kernel.is_available(device))
    }

    /// CUDA: Flash Attention. It has no mask input, so a mask that hides
    /// anything is handled by eager attention in the kernel's precision.
    fn flash(&self, q: &Tensor, k: &Tensor, v: &Tensor, mask: &Tensor, scale: f64) -> Result<Tensor> {
        let any_masked = mask.to_dtype(DType::F32)?.abs()?.max_all()?.to_scalar::<f32>()? > 0.0;
        if any_masked {
            return eager_attention(q, k, v, mask, scale);
        }

        // Flash-attn expects (batch, seq_len, num_heads, head_size)
        let q = q.transpose(1, 2)?.contiguous()?;
        let k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;

        let out = flash_attn(&q, &k, &v, scale as f32, false)?;
        Ok(out.transpose(1, 2)?)
    }

    /// Metal: fused SDPA kernel with an additive mask.
    fn sdpa(&self, q: &Tensor, k: &Tensor, v: &Tensor, mask: &Tensor, scale: f64) -> Result<Tensor> {
        let bias = additive_mask(mask, q)?;
        Ok(candle_nn::ops::sdpa(
            q,
            k,
            v,
            Some(&bias),
            false,
            scale as f32,
            1.0,
        )?)
    }
}

impl FusedAttentionKernel for BackendKernel {
    fn name(&self) -> &'static str {
        match self {
            Self::FlashAttn => "flash-attn",
            Self::MetalSdpa => "metal-sdpa",
        }
    }

    fn is_available(&self, device: &Device) -> bool {
        match self {
            Self::FlashAttn => cfg!(feature = "flash-attn") && device.is_cuda(),
            Self::MetalSdpa => device.is_metal(),
        }
    }

    fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: &Tensor,
        scale: f64,
    ) -> Result<Tensor> {
        match self {
            Self::FlashAttn => self.flash(q, k, v, mask, scale),
            Self::MetalSdpa => self.sdpa(q, k, v, mask, scale),
        }
    }
}

/// `(B, q_len, kv_len)` boolean mask to a `(B, H, q_len, kv_len)` additive bias.
fn additive_mask(mask: &Tensor, q: &Tensor) -> Result<Tensor> {
    let (b, h, q_len, _) = q.dims4()?;
    let kv_len = mask.dim(D::Minus1)?;
    let zeros = Tensor::zeros((b, q_len, kv_len), q.dtype(), q.device())?;
    let masked = mask.ne(&mask.zeros_like()?)?;
    let bias = masked_fill(&zeros, &masked, max_negative_value(q.dtype())?)?;
    Ok(bias
        .unsqueeze(1)?
        .broadcast_as((b, h, q_len, kv_len))?
        .contiguous()?)
}

/// Masked attention in the `(B, H, N, D)` layout, softmax in F32.
fn eager_attention(q: &Tensor, k: &Tensor, v: &Tensor, mask: &Tensor, scale: f64) -> Result<Tensor> {
    let bias = additive_mask(mask, q)?;
    let k_t = k.transpose(2, 3)?.contiguous()?;
    let sim = (q.matmul(&k_t)? * scale)?.broadcast_add(&bias)?;
    let probs = candle_nn::ops::softmax_last_dim(&sim.to_dtype(DType::F32)?)?;
    Ok(probs.to_dtype(v.dtype())?.matmul(v)?)
}

/// Which conditions gate the fused path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusedGate {
    /// Sequence divisibility and the head dimension bound.
    Full,
    /// Sequence divisibility only.
    DivisibilityOnly,
}

/// Shape of one attention call, as seen by the dispatch predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionShape {
    pub q_len: usize,
    pub kv_len: usize,
    pub head_dim: usize,
}

/// Construction-time fused path settings of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FusedPolicy {
    /// Kernel requested by config and available on the layer's device.
    pub enabled: bool,
    pub gate: FusedGate,
}

/// True when a call of `shape` may run on the fused kernel.
pub fn fused_eligible(shape: &AttentionShape, policy: &FusedPolicy) -> bool {
    if !policy.enabled || shape.q_len == 0 || shape.kv_len == 0 {
        return false;
    }
    let divisible =
        shape.q_len % FUSED_SEQ_MULTIPLE == 0 && shape.kv_len % FUSED_SEQ_MULTIPLE == 0;
    match policy.gate {
        FusedGate::Full => divisible && shape.head_dim <= FUSED_MAX_HEAD_DIM,
        FusedGate::DivisibilityOnly => divisible,
    }
}

/// Resolve the kernel a layer keeps for its lifetime.
///
/// Returns `None` when the fused path is disabled or the kernel cannot run on
/// `device`; the layer then always uses generic attention.
pub fn resolve_kernel(
    enable: bool,
    kernel: Option<Arc<dyn FusedAttentionKernel>>,
    device: &Device,
) -> Option<Arc<dyn FusedAttentionKernel>> {
    if !enable {
        return None;
    }
    let kernel = kernel.or_else(|| {
        BackendKernel::for_device(device).map(|k| Arc::new(k) as Arc<dyn FusedAttentionKernel>)
    });
    match kernel {
        Some(kernel) if kernel.is_available(device) => {
            info!(kernel = kernel.name(), "Fused attention is available");
            Some(kernel)
        }
        _ => {
            debug!(?device, "Fused attention requested but unavailable, using generic attention");
            None
        }
    }
}
