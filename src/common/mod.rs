//! Building blocks shared by the attention layers:
//!
//! - **attention**: fused kernel interface (CUDA Flash-Attn / Metal SDPA) and the dispatch predicate
//! - **mask**: mask broadcasting and finite masking constants
//! - **norms**: GroupNorm / LayerNorm computed in F32
//! - **projection**: 1x1 conv or linear channel projections, optionally zero-initialized

pub mod attention;
pub mod mask;
pub mod norms;
pub mod projection;

// Attention exports
pub use attention::{
    AttentionShape, BackendKernel, FUSED_MAX_HEAD_DIM, FUSED_SEQ_MULTIPLE, FusedAttentionKernel,
    FusedGate, FusedPolicy, fused_eligible, resolve_kernel,
};

// Mask exports
pub use mask::{expand_mask, masked_fill, max_negative_value};

// Normalization exports
pub use norms::{GROUP_NORM_GROUPS, LayerNorm32, Normalize, layer_norm_f32};

pub use projection::Projection;
