//! Spatial transformer sanity check
//!
//! Builds a randomly initialized SpatialTransformer on CPU, runs it on random
//! activations and reports output shape, dtype and the distance from the
//! identity a freshly built layer must have.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin attention_check -- \
//!     --frames 8 --channels 320 --size 32 --cross-frame
//! ```

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Result, ensure};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use tracing::info;

use candle_animatediff::{AttentionKind, SpatialTransformer, SpatialTransformerConfig, load_config};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a spatial transformer on random activations")]
struct Args {
    /// JSON SpatialTransformerConfig; overrides the shape flags below
    #[arg(long)]
    config: Option<PathBuf>,

    /// Frames per chunk (batch = chunk_size * frames)
    #[arg(long, default_value_t = 4)]
    frames: usize,

    /// Input channels (multiple of 32)
    #[arg(long, default_value_t = 64)]
    channels: usize,

    /// Attention heads
    #[arg(long, default_value_t = 2)]
    heads: usize,

    /// Feature map height and width
    #[arg(long, default_value_t = 16)]
    size: usize,

    /// Context tokens (0 = no context, attn2 becomes self-attention)
    #[arg(long, default_value_t = 0)]
    context_len: usize,

    /// Use cross-frame attention
    #[arg(long)]
    cross_frame: bool,

    /// Linear projections instead of 1x1 convolutions
    #[arg(long)]
    use_linear: bool,

    /// Run activations in F16
    #[arg(long)]
    f16: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_animatediff=info".parse()?)
                .add_directive("attention_check=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let device = Device::Cpu;

    let config: SpatialTransformerConfig = match &args.config {
        Some(path) => load_config(path)?,
        None => {
            ensure!(
                args.heads > 0 && args.channels % args.heads == 0,
                "--channels must be divisible by --heads"
            );
            SpatialTransformerConfig {
                in_channels: args.channels,
                n_heads: args.heads,
                d_head: args.channels / args.heads,
                context_dim: (args.context_len > 0).then_some(args.channels),
                use_linear: args.use_linear,
                attention: if args.cross_frame {
                    AttentionKind::CrossFrame
                } else {
                    AttentionKind::Cross
                },
                ..Default::default()
            }
        }
    };
    info!(?config, "Spatial transformer config");

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = SpatialTransformer::new(vb, &config)?;

    let batch = config.cross_frame.chunk_size * args.frames;
    let dtype = if args.f16 { DType::F16 } else { DType::F32 };
    let x = Tensor::randn(0f32, 1.0, (batch, config.in_channels, args.size, args.size), &device)?
        .to_dtype(dtype)?;
    let context = match config.context_dim {
        Some(dim) if args.context_len > 0 => {
            Some(Tensor::randn(0f32, 1.0, (batch, args.context_len, dim), &device)?)
        }
        _ => None,
    };

    info!(input = ?x.dims(), dtype = ?x.dtype(), "Running forward");
    let start = Instant::now();
    let out = model.forward(&x, context.as_ref())?;
    let elapsed = start.elapsed();

    let identity_error = (out.to_dtype(DType::F32)? - x.to_dtype(DType::F32)?)?
        .abs()?
        .max_all()?
        .to_scalar::<f32>()?;

    info!(output = ?out.dims(), dtype = ?out.dtype(), ?elapsed, "Forward done");
    info!(identity_error, "Max |out - x| (zero-initialized proj_out)");

    ensure!(out.dims() == x.dims(), "shape changed: {:?} -> {:?}", x.dims(), out.dims());
    ensure!(out.dtype() == x.dtype(), "dtype changed: {:?} -> {:?}", x.dtype(), out.dtype());
    Ok(())
}
