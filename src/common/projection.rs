//! Channel projections for the spatial transformer
//!
//! A projection is either a 1x1 convolution applied to `(B, C, H, W)` grids or
//! a linear layer applied to `(B, H*W, C)` token sequences.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Linear, VarBuilder, init};

#[derive(Debug, Clone)]
pub enum Projection {
    Conv(Conv2d),
    Linear(Linear),
}

impl Projection {
    /// Projection with default (random) initialization.
    pub fn new(in_dim: usize, out_dim: usize, use_linear: bool, vb: VarBuilder) -> Result<Self> {
        if use_linear {
            Ok(Self::Linear(candle_nn::linear(in_dim, out_dim, vb)?))
        } else {
            Ok(Self::Conv(candle_nn::conv2d(
                in_dim,
                out_dim,
                1,
                Conv2dConfig::default(),
                vb,
            )?))
        }
    }

    /// Projection whose weight and bias start at zero.
    ///
    /// The zero init is a construction hint: a fresh `VarMap` materializes
    /// zeros, while a builder backed by stored weights returns those instead.
    pub fn zeroed(in_dim: usize, out_dim: usize, use_linear: bool, vb: VarBuilder) -> Result<Self> {
        let bias = vb.get_with_hints(out_dim, "bias", init::ZERO)?;
        if use_linear {
            let weight = vb.get_with_hints((out_dim, in_dim), "weight", init::ZERO)?;
            Ok(Self::Linear(Linear::new(weight, Some(bias))))
        } else {
            let weight = vb.get_with_hints((out_dim, in_dim, 1, 1), "weight", init::ZERO)?;
            Ok(Self::Conv(Conv2d::new(
                weight,
                Some(bias),
                Conv2dConfig::default(),
            )))
        }
    }

    pub fn is_linear(&self) -> bool {
        matches!(self, Self::Linear(_))
    }
}

impl Module for Projection {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Conv(conv) => conv.forward(x),
            Self::Linear(linear) => linear.forward(x),
        }
    }
}
