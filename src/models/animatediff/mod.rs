//! AnimateDiff attention layers
//!
//! Attention and feed-forward machinery of the AnimateDiff UNet:
//! - Attention: scaled dot-product attention on head-folded tensors
//! - CrossAttention: projections plus generic/fused dispatch
//! - CrossFrameAttention: self-attention on a reference frame's keys/values
//! - FeedForward: GEGLU or GELU MLP
//! - BasicTransformerBlock / SpatialTransformer: pre-norm residual composition

pub mod attention;
pub mod config;
pub mod cross_attention;
pub mod cross_frame;
pub mod feed_forward;
pub mod layer;
pub mod transformer;

// Re-exports
pub use attention::{Attention, batch_to_heads, heads_to_batch, merge_heads, split_heads};
pub use config::{
    AttentionKind, CrossAttentionConfig, CrossFrameConfig, FeedForwardConfig, ReferenceFrames,
    SpatialTransformerConfig, TransformerBlockConfig, load_config,
};
pub use cross_attention::CrossAttention;
pub use cross_frame::{CrossFrameAttention, share_reference_frames};
pub use feed_forward::{FeedForward, GeGlu, GeluProj};
pub use layer::AttentionLayer;
pub use transformer::{BasicTransformerBlock, SpatialTransformer};
