//! Normalization layers
//!
//! - Normalize: GroupNorm(32) computed in F32 for image-grid activations
//! - layer_norm_f32: LayerNorm whose statistics are taken in F32

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{GroupNorm, LayerNorm, VarBuilder};

/// Group count used by [`Normalize`].
pub const GROUP_NORM_GROUPS: usize = 32;

fn internal_dtype(dtype: DType) -> DType {
    match dtype {
        DType::F16 | DType::BF16 => DType::F32,
        d => d,
    }
}

/// GroupNorm over `(B, C, H, W)` with 32 groups and eps 1e-6.
///
/// Affine parameters are kept in F32 and the normalization runs in F32 even
/// for half precision activations; the result is cast back to the input dtype.
#[derive(Debug, Clone)]
pub struct Normalize {
    norm: GroupNorm,
}

impl Normalize {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let norm = candle_nn::group_norm(
            GROUP_NORM_GROUPS,
            channels,
            1e-6,
            vb.set_dtype(DType::F32),
        )?;
        Ok(Self { norm })
    }
}

impl Module for Normalize {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x_dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        self.norm.forward(&x)?.to_dtype(x_dtype)
    }
}

/// LayerNorm over the last dimension that upcasts half precision inputs.
#[derive(Debug, Clone)]
pub struct LayerNorm32 {
    norm: LayerNorm,
}

impl Module for LayerNorm32 {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x_dtype = x.dtype();
        let x = x.to_dtype(internal_dtype(x_dtype))?;
        self.norm.forward(&x)?.to_dtype(x_dtype)
    }
}

/// Pre-normalization used by the transformer block (eps 1e-5).
pub fn layer_norm_f32(dim: usize, vb: VarBuilder) -> Result<LayerNorm32> {
    let norm = candle_nn::layer_norm(dim, 1e-5, vb.set_dtype(DType::F32))?;
    Ok(LayerNorm32 { norm })
}
