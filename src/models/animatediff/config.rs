//! Configuration structures for the AnimateDiff attention layers

use std::path::Path;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{AttentionError, Result};

/// Attention implementation used by a transformer block, fixed at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionKind {
    /// Plain self/cross attention
    #[default]
    Cross,
    /// Self-attention reads keys/values from a reference frame
    CrossFrame,
}

/// Which frame each frame of a chunk takes its keys/values from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceFrames {
    /// Every frame reads frame 0
    #[default]
    First,
    /// Frame i reads frame i - 1 (frame 0 reads itself)
    Previous,
    /// Explicit table, one entry per frame of the video
    Explicit(Vec<usize>),
}

/// Cross-frame attention settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossFrameConfig {
    /// Number of frame groups in the batch (2 = unconditional + conditional)
    pub chunk_size: usize,
    /// Reference frame policy applied inside each chunk
    pub reference_frames: ReferenceFrames,
}

impl Default for CrossFrameConfig {
    fn default() -> Self {
        Self {
            chunk_size: 2,
            reference_frames: ReferenceFrames::First,
        }
    }
}

/// Multi-head attention configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossAttentionConfig {
    /// Channels of the query input
    pub query_dim: usize,
    /// Channels of the context; None means same as query_dim
    pub context_dim: Option<usize>,
    /// Number of attention heads
    pub heads: usize,
    /// Channels per head
    pub dim_head: usize,
    /// Dropout probability after the output projection
    pub dropout: f32,
    /// Use a fused attention kernel when the backend provides one
    pub enable_flash_attention: bool,
}

impl Default for CrossAttentionConfig {
    fn default() -> Self {
        Self {
            query_dim: 320,
            context_dim: None,
            heads: 8,
            dim_head: 64,
            dropout: 0.0,
            enable_flash_attention: false,
        }
    }
}

impl CrossAttentionConfig {
    pub fn inner_dim(&self) -> usize {
        self.heads * self.dim_head
    }

    pub fn kv_dim(&self) -> usize {
        self.context_dim.unwrap_or(self.query_dim)
    }
}

/// Feed-forward configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedForwardConfig {
    pub dim: usize,
    /// Output channels; None means same as dim
    pub dim_out: Option<usize>,
    /// inner_dim = dim * mult
    pub mult: usize,
    /// GEGLU gating instead of a plain GELU projection
    pub glu: bool,
    pub dropout: f32,
}

impl Default for FeedForwardConfig {
    fn default() -> Self {
        Self {
            dim: 320,
            dim_out: None,
            mult: 4,
            glu: false,
            dropout: 0.0,
        }
    }
}

impl FeedForwardConfig {
    pub fn inner_dim(&self) -> usize {
        self.dim * self.mult
    }

    pub fn out_dim(&self) -> usize {
        self.dim_out.unwrap_or(self.dim)
    }
}

/// Transformer block configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformerBlockConfig {
    /// Token channels
    pub dim: usize,
    pub n_heads: usize,
    pub d_head: usize,
    pub dropout: f32,
    /// Channels of the conditioning context (text embeddings)
    pub context_dim: Option<usize>,
    /// GEGLU feed-forward
    pub gated_ff: bool,
    pub enable_flash_attention: bool,
    pub attention: AttentionKind,
    pub cross_frame: CrossFrameConfig,
}

impl Default for TransformerBlockConfig {
    fn default() -> Self {
        Self {
            dim: 320,
            n_heads: 8,
            d_head: 40,
            dropout: 0.0,
            context_dim: Some(768),
            gated_ff: true,
            enable_flash_attention: false,
            attention: AttentionKind::Cross,
            cross_frame: CrossFrameConfig::default(),
        }
    }
}

impl TransformerBlockConfig {
    /// attn1: always self-attention
    pub fn self_attention(&self) -> CrossAttentionConfig {
        CrossAttentionConfig {
            query_dim: self.dim,
            context_dim: None,
            heads: self.n_heads,
            dim_head: self.d_head,
            dropout: self.dropout,
            enable_flash_attention: self.enable_flash_attention,
        }
    }

    /// attn2: cross-attention on the context, self-attention without one
    pub fn cross_attention(&self) -> CrossAttentionConfig {
        CrossAttentionConfig {
            context_dim: self.context_dim,
            ..self.self_attention()
        }
    }

    pub fn feed_forward(&self) -> FeedForwardConfig {
        FeedForwardConfig {
            dim: self.dim,
            dim_out: None,
            mult: 4,
            glu: self.gated_ff,
            dropout: self.dropout,
        }
    }
}

/// Spatial transformer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialTransformerConfig {
    /// Channels of the (B, C, H, W) input
    pub in_channels: usize,
    pub n_heads: usize,
    pub d_head: usize,
    /// Number of stacked transformer blocks
    pub depth: usize,
    pub dropout: f32,
    pub context_dim: Option<usize>,
    /// Linear proj_in/proj_out on tokens instead of 1x1 convolutions on the grid
    pub use_linear: bool,
    pub gated_ff: bool,
    pub enable_flash_attention: bool,
    pub attention: AttentionKind,
    pub cross_frame: CrossFrameConfig,
}

impl Default for SpatialTransformerConfig {
    fn default() -> Self {
        Self {
            in_channels: 320,
            n_heads: 8,
            d_head: 40,
            depth: 1,
            dropout: 0.0,
            context_dim: Some(768),
            use_linear: false,
            gated_ff: true,
            enable_flash_attention: false,
            attention: AttentionKind::Cross,
            cross_frame: CrossFrameConfig::default(),
        }
    }
}

impl SpatialTransformerConfig {
    pub fn inner_dim(&self) -> usize {
        self.n_heads * self.d_head
    }

    pub fn block(&self) -> TransformerBlockConfig {
        TransformerBlockConfig {
            dim: self.inner_dim(),
            n_heads: self.n_heads,
            d_head: self.d_head,
            dropout: self.dropout,
            context_dim: self.context_dim,
            gated_ff: self.gated_ff,
            enable_flash_attention: self.enable_flash_attention,
            attention: self.attention,
            cross_frame: self.cross_frame.clone(),
        }
    }
}

/// Load a JSON config file; missing fields take their defaults.
pub fn load_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| AttentionError::ConfigRead {
        path: path.display().to_string(),
        source: e,
    })?;
    serde_json::from_str(&content).map_err(|e| AttentionError::ConfigParse {
        path: path.display().to_string(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs() {
        let config = SpatialTransformerConfig::default();
        assert_eq!(config.inner_dim(), 320);
        assert_eq!(config.cross_frame.chunk_size, 2);
        assert_eq!(config.cross_frame.reference_frames, ReferenceFrames::First);

        let block = config.block();
        assert_eq!(block.self_attention().context_dim, None);
        assert_eq!(block.cross_attention().kv_dim(), 768);
        assert!(block.feed_forward().glu);
        assert_eq!(block.feed_forward().inner_dim(), 1280);
    }

    #[test]
    fn test_partial_json() {
        let json = r#"{
            "in_channels": 64,
            "n_heads": 2,
            "d_head": 32,
            "attention": "cross_frame",
            "cross_frame": { "reference_frames": { "explicit": [0, 0, 1] } }
        }"#;
        let config: SpatialTransformerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.attention, AttentionKind::CrossFrame);
        assert_eq!(config.cross_frame.chunk_size, 2);
        assert_eq!(
            config.cross_frame.reference_frames,
            ReferenceFrames::Explicit(vec![0, 0, 1])
        );
        assert_eq!(config.depth, 1);
    }
}
