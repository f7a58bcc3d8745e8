//! Attention implementation chosen once per block

use std::sync::Arc;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use super::config::{AttentionKind, CrossAttentionConfig, CrossFrameConfig};
use super::cross_attention::CrossAttention;
use super::cross_frame::CrossFrameAttention;
use crate::common::FusedAttentionKernel;
use crate::error::Result;

#[derive(Debug)]
pub enum AttentionLayer {
    Cross(CrossAttention),
    CrossFrame(CrossFrameAttention),
}

impl AttentionLayer {
    pub fn new(
        vb: VarBuilder,
        kind: AttentionKind,
        config: &CrossAttentionConfig,
        cross_frame: &CrossFrameConfig,
        kernel: Option<Arc<dyn FusedAttentionKernel>>,
    ) -> Result<Self> {
        Ok(match kind {
            AttentionKind::Cross => Self::Cross(CrossAttention::with_kernel(vb, config, kernel)?),
            AttentionKind::CrossFrame => Self::CrossFrame(CrossFrameAttention::with_kernel(
                vb,
                config,
                cross_frame,
                kernel,
            )?),
        })
    }

    pub fn kind(&self) -> AttentionKind {
        match self {
            Self::Cross(_) => AttentionKind::Cross,
            Self::CrossFrame(_) => AttentionKind::CrossFrame,
        }
    }

    pub fn forward_t(
        &self,
        x: &Tensor,
        context: Option<&Tensor>,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        match self {
            Self::Cross(attn) => attn.forward_t(x, context, mask, train),
            Self::CrossFrame(attn) => attn.forward_t(x, context, mask, train),
        }
    }
}
