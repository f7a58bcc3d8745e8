//! Candle-AnimateDiff: attention layers for video diffusion on Candle.
//!
//! This crate provides the attention and feed-forward blocks of an
//! AnimateDiff-style UNet: self/cross attention with an optional fused kernel
//! path, cross-frame attention for temporally consistent frames, and the
//! spatial transformer that wraps them.

pub mod common;
pub mod error;
pub mod models;

pub use common::{BackendKernel, FusedAttentionKernel};
pub use error::{AttentionError, Result};
pub use models::animatediff::*;
