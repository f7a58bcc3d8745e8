//! Position-wise feed-forward network

use candle_core::{D, Module, ModuleT, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder, linear};

use super::config::FeedForwardConfig;
use crate::error::Result;

/// GEGLU: one projection to twice the inner dim, split into value and gate,
/// `value * gelu(gate)`.
#[derive(Debug)]
pub struct GeGlu {
    proj: Linear,
    inner_dim: usize,
}

impl GeGlu {
    pub fn new(vb: VarBuilder, dim_in: usize, inner_dim: usize) -> Result<Self> {
        let proj = linear(dim_in, inner_dim * 2, vb.pp("proj"))?;
        Ok(Self { proj, inner_dim })
    }
}

impl Module for GeGlu {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.proj.forward(x)?;
        let value = h.narrow(D::Minus1, 0, self.inner_dim)?;
        let gate = h.narrow(D::Minus1, self.inner_dim, self.inner_dim)?;
        value * gate.gelu_erf()?
    }
}

/// Linear projection followed by tanh-approximated GELU.
#[derive(Debug)]
pub struct GeluProj {
    proj: Linear,
}

impl GeluProj {
    pub fn new(vb: VarBuilder, dim_in: usize, inner_dim: usize) -> Result<Self> {
        let proj = linear(dim_in, inner_dim, vb.pp("proj"))?;
        Ok(Self { proj })
    }
}

impl Module for GeluProj {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        self.proj.forward(x)?.gelu()
    }
}

#[derive(Debug)]
enum ProjectIn {
    GeGlu(GeGlu),
    Gelu(GeluProj),
}

/// Feed-forward network with GEGLU or GELU activation
///
/// Weight names:
/// - net.0.proj.weight, net.0.proj.bias: input projection (doubled for GEGLU)
/// - net.2.weight, net.2.bias: Linear(inner_dim, dim_out)
#[derive(Debug)]
pub struct FeedForward {
    project_in: ProjectIn,
    dropout: Dropout,
    proj_out: Linear,
}

impl FeedForward {
    pub fn new(vb: VarBuilder, config: &FeedForwardConfig) -> Result<Self> {
        let inner_dim = config.inner_dim();
        let project_in = if config.glu {
            ProjectIn::GeGlu(GeGlu::new(vb.pp("net").pp("0"), config.dim, inner_dim)?)
        } else {
            ProjectIn::Gelu(GeluProj::new(vb.pp("net").pp("0"), config.dim, inner_dim)?)
        };
        let proj_out = linear(inner_dim, config.out_dim(), vb.pp("net").pp("2"))?;
        Ok(Self {
            project_in,
            dropout: Dropout::new(config.dropout),
            proj_out,
        })
    }

    pub fn is_gated(&self) -> bool {
        matches!(self.project_in, ProjectIn::GeGlu(_))
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_t(x, false)
    }

    /// `(..., dim)` -> `(..., dim_out)`
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = match &self.project_in {
            ProjectIn::GeGlu(geglu) => geglu.forward(x)?,
            ProjectIn::Gelu(gelu) => gelu.forward(x)?,
        };
        let h = self.dropout.forward_t(&h, train)?;
        Ok(self.proj_out.forward(&h)?)
    }
}
