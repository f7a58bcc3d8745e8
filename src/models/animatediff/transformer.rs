//! Transformer blocks for image-grid activations
//!
//! BasicTransformerBlock applies self-attention, cross-attention and a
//! feed-forward network, each pre-normalized with a residual connection.
//! SpatialTransformer runs a stack of them over the pixels of a feature map.

use std::sync::Arc;

use candle_core::{DType, Module, Tensor};
use candle_nn::VarBuilder;
use tracing::debug;

use super::config::{SpatialTransformerConfig, TransformerBlockConfig};
use super::feed_forward::FeedForward;
use super::layer::AttentionLayer;
use crate::common::{FusedAttentionKernel, LayerNorm32, Normalize, Projection, layer_norm_f32};
use crate::error::{AttentionError, Result, dims4};

/// Basic transformer block
#[derive(Debug)]
pub struct BasicTransformerBlock {
    norm1: LayerNorm32,
    attn1: AttentionLayer,
    norm2: LayerNorm32,
    attn2: AttentionLayer,
    norm3: LayerNorm32,
    ff: FeedForward,
}

impl BasicTransformerBlock {
    pub fn new(vb: VarBuilder, config: &TransformerBlockConfig) -> Result<Self> {
        Self::with_kernel(vb, config, None)
    }

    pub fn with_kernel(
        vb: VarBuilder,
        config: &TransformerBlockConfig,
        kernel: Option<Arc<dyn FusedAttentionKernel>>,
    ) -> Result<Self> {
        let attn1 = AttentionLayer::new(
            vb.pp("attn1"),
            config.attention,
            &config.self_attention(),
            &config.cross_frame,
            kernel.clone(),
        )?;
        let attn2 = AttentionLayer::new(
            vb.pp("attn2"),
            config.attention,
            &config.cross_attention(),
            &config.cross_frame,
            kernel,
        )?;

        Ok(Self {
            norm1: layer_norm_f32(config.dim, vb.pp("norm1"))?,
            attn1,
            norm2: layer_norm_f32(config.dim, vb.pp("norm2"))?,
            attn2,
            norm3: layer_norm_f32(config.dim, vb.pp("norm3"))?,
            ff: FeedForward::new(vb.pp("ff"), &config.feed_forward())?,
        })
    }

    pub fn attn1(&self) -> &AttentionLayer {
        &self.attn1
    }

    pub fn attn2(&self) -> &AttentionLayer {
        &self.attn2
    }

    pub fn forward(&self, hidden_states: &Tensor, context: Option<&Tensor>) -> Result<Tensor> {
        self.forward_t(hidden_states, context, None, false)
    }

    /// `context_mask` applies to attn2 only (e.g. text padding).
    pub fn forward_t(
        &self,
        hidden_states: &Tensor,
        context: Option<&Tensor>,
        context_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let residual = hidden_states;
        let h = self
            .attn1
            .forward_t(&self.norm1.forward(hidden_states)?, None, None, train)?;
        let h = (h + residual)?;

        let residual = &h;
        let h = self
            .attn2
            .forward_t(&self.norm2.forward(&h)?, context, context_mask, train)?;
        let h = (h + residual)?;

        let residual = &h;
        let h = self.ff.forward_t(&self.norm3.forward(&h)?, train)?;
        Ok((h + residual)?)
    }
}

/// Spatial transformer
///
/// `(B, C, H, W)` -> GroupNorm -> proj_in -> `(B, H*W, inner_dim)` tokens ->
/// transformer blocks -> proj_out -> `(B, C, H, W)` + input. proj_out starts at
/// zero, so a freshly built layer is the identity.
#[derive(Debug)]
pub struct SpatialTransformer {
    norm: Normalize,
    proj_in: Projection,
    transformer_blocks: Vec<BasicTransformerBlock>,
    proj_out: Projection,
    in_channels: usize,
    inner_dim: usize,
    dtype: DType,
}

impl SpatialTransformer {
    pub fn new(vb: VarBuilder, config: &SpatialTransformerConfig) -> Result<Self> {
        Self::with_kernel(vb, config, None)
    }

    pub fn with_kernel(
        vb: VarBuilder,
        config: &SpatialTransformerConfig,
        kernel: Option<Arc<dyn FusedAttentionKernel>>,
    ) -> Result<Self> {
        let in_channels = config.in_channels;
        let inner_dim = config.inner_dim();

        let norm = Normalize::new(in_channels, vb.pp("norm"))?;
        let proj_in = Projection::new(in_channels, inner_dim, config.use_linear, vb.pp("proj_in"))?;

        let block_config = config.block();
        let mut transformer_blocks = Vec::with_capacity(config.depth);
        for i in 0..config.depth {
            transformer_blocks.push(BasicTransformerBlock::with_kernel(
                vb.pp("transformer_blocks").pp(i),
                &block_config,
                kernel.clone(),
            )?);
        }

        let proj_out =
            Projection::zeroed(inner_dim, in_channels, config.use_linear, vb.pp("proj_out"))?;

        debug!(
            in_channels,
            inner_dim,
            depth = config.depth,
            attention = ?config.attention,
            use_linear = config.use_linear,
            "Built spatial transformer"
        );

        Ok(Self {
            norm,
            proj_in,
            transformer_blocks,
            proj_out,
            in_channels,
            inner_dim,
            dtype: vb.dtype(),
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn inner_dim(&self) -> usize {
        self.inner_dim
    }

    pub fn blocks(&self) -> &[BasicTransformerBlock] {
        &self.transformer_blocks
    }

    pub fn forward(&self, hidden_states: &Tensor, context: Option<&Tensor>) -> Result<Tensor> {
        self.forward_t(hidden_states, context, None, false)
    }

    /// Every block receives the same `context` and `context_mask`.
    pub fn forward_t(
        &self,
        hidden_states: &Tensor,
        context: Option<&Tensor>,
        context_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (b, c, h, w) = dims4(hidden_states)?;
        if c != self.in_channels {
            return Err(AttentionError::Channels {
                expected: self.in_channels,
                actual: c,
            });
        }
        let residual = hidden_states;

        let mut x = self.norm.forward(hidden_states)?.to_dtype(self.dtype)?;
        if !self.proj_in.is_linear() {
            x = self.proj_in.forward(&x)?;
        }
        let channels = x.dim(1)?;
        // (b, c, h, w) -> (b, h*w, c)
        x = x.reshape((b, channels, h * w))?.transpose(1, 2)?.contiguous()?;
        if self.proj_in.is_linear() {
            x = self.proj_in.forward(&x)?;
        }

        for block in &self.transformer_blocks {
            x = block.forward_t(&x, context, context_mask, train)?;
        }

        if self.proj_out.is_linear() {
            x = self.proj_out.forward(&x)?;
        }
        let channels = x.dim(2)?;
        // (b, h*w, c) -> (b, c, h, w)
        x = x.transpose(1, 2)?.contiguous()?.reshape((b, channels, h, w))?;
        if !self.proj_out.is_linear() {
            x = self.proj_out.forward(&x)?;
        }

        Ok((x.to_dtype(residual.dtype())? + residual)?)
    }
}
