//! Error types shared by the attention layers.

use candle_core::DType;

/// Errors raised by attention, transformer block and config code.
///
/// Shape and precision errors are caller contract violations and are never
/// recovered locally. An unavailable accelerated kernel is not an error: the
/// layers fall back to the generic attention path instead.
#[derive(Debug, thiserror::Error)]
pub enum AttentionError {
    #[error("dimension {dim} is not divisible by {heads} heads")]
    HeadsMismatch { dim: usize, heads: usize },

    #[error("expected {expected} channels, got {actual}")]
    Channels { expected: usize, actual: usize },

    #[error("attention mask of shape {mask:?} cannot be broadcast to {target:?}")]
    MaskShape {
        mask: Vec<usize>,
        target: Vec<usize>,
    },

    #[error("expected a rank-{expected} tensor, got shape {shape:?}")]
    Rank { expected: usize, shape: Vec<usize> },

    #[error("attention over an empty sequence: query {query:?}, context {context:?}")]
    EmptySequence {
        query: Vec<usize>,
        context: Vec<usize>,
    },

    #[error("batch of {batch} frames is not divisible by chunk size {chunk_size}")]
    FrameChunk { batch: usize, chunk_size: usize },

    #[error("reference frame table {indices:?} does not fit video length {video_length}")]
    ReferenceFrame {
        indices: Vec<usize>,
        video_length: usize,
    },

    #[error("unsupported dtype {0:?} for attention masking")]
    UnsupportedDType(DType),

    #[error("Failed to read config: {path}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse JSON config: {path}")]
    ConfigParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl AttentionError {
    /// True for the shape family of errors (head split, mask broadcast, frame grouping).
    pub fn is_shape_error(&self) -> bool {
        matches!(
            self,
            Self::HeadsMismatch { .. }
                | Self::Channels { .. }
                | Self::MaskShape { .. }
                | Self::Rank { .. }
                | Self::EmptySequence { .. }
                | Self::FrameChunk { .. }
                | Self::ReferenceFrame { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AttentionError>;

pub(crate) fn dims3(x: &candle_core::Tensor) -> Result<(usize, usize, usize)> {
    match x.dims() {
        &[a, b, c] => Ok((a, b, c)),
        dims => Err(AttentionError::Rank {
            expected: 3,
            shape: dims.to_vec(),
        }),
    }
}

pub(crate) fn dims4(x: &candle_core::Tensor) -> Result<(usize, usize, usize, usize)> {
    match x.dims() {
        &[a, b, c, d] => Ok((a, b, c, d)),
        dims => Err(AttentionError::Rank {
            expected: 4,
            shape: dims.to_vec(),
        }),
    }
}
