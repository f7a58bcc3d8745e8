//! Cross-frame attention for temporally consistent video generation
//!
//! In self-attention mode every frame attends to the keys and values of a
//! reference frame instead of its own, so all frames of a clip share the
//! reference frame's appearance. The batch is laid out as `chunk_size` groups
//! of `video_length` frames (for guided sampling: unconditional frames, then
//! conditional frames), and the reference lookup stays inside each group.

use std::sync::Arc;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use super::config::{CrossAttentionConfig, CrossFrameConfig, ReferenceFrames};
use super::cross_attention::CrossAttention;
use crate::common::{FusedAttentionKernel, FusedGate};
use crate::error::{AttentionError, Result, dims3};

impl ReferenceFrames {
    /// Reference frame of each of the `video_length` frames of a chunk.
    pub fn indices(&self, video_length: usize) -> Result<Vec<usize>> {
        match self {
            Self::First => Ok(vec![0; video_length]),
            Self::Previous => Ok((0..video_length).map(|i| i.saturating_sub(1)).collect()),
            Self::Explicit(table) => {
                if table.len() != video_length || table.iter().any(|&i| i >= video_length) {
                    return Err(AttentionError::ReferenceFrame {
                        indices: table.clone(),
                        video_length,
                    });
                }
                Ok(table.clone())
            }
        }
    }
}

/// Replace every frame of `x` (`(batch, N, C)`) by its reference frame.
///
/// `batch` must be a multiple of `chunk_size`; `video_length = batch / chunk_size`.
pub fn share_reference_frames(
    x: &Tensor,
    chunk_size: usize,
    reference_frames: &ReferenceFrames,
) -> Result<Tensor> {
    let (batch, n, c) = dims3(x)?;
    if chunk_size == 0 || batch % chunk_size != 0 {
        return Err(AttentionError::FrameChunk { batch, chunk_size });
    }
    let video_length = batch / chunk_size;
    let indices = reference_frames
        .indices(video_length)?
        .into_iter()
        .map(|i| i as u32)
        .collect::<Vec<_>>();
    let indices = Tensor::from_vec(indices, video_length, x.device())?;

    // (b, n, c) -> (b/f, f, n, c) -> gather frames -> (b, n, c)
    let frames = x.reshape((chunk_size, video_length, n, c))?;
    Ok(frames.index_select(&indices, 1)?.reshape((batch, n, c))?)
}

/// Cross-frame attention
///
/// Same projections and dispatch as [`CrossAttention`]. The fused path is
/// gated on sequence divisibility only: head dims above the usual bound still
/// go to the kernel.
#[derive(Debug)]
pub struct CrossFrameAttention {
    inner: CrossAttention,
    chunk_size: usize,
    reference_frames: ReferenceFrames,
}

impl CrossFrameAttention {
    pub fn new(
        vb: VarBuilder,
        config: &CrossAttentionConfig,
        cross_frame: &CrossFrameConfig,
    ) -> Result<Self> {
        Self::with_kernel(vb, config, cross_frame, None)
    }

    pub fn with_kernel(
        vb: VarBuilder,
        config: &CrossAttentionConfig,
        cross_frame: &CrossFrameConfig,
        kernel: Option<Arc<dyn FusedAttentionKernel>>,
    ) -> Result<Self> {
        if cross_frame.chunk_size == 0 {
            return Err(AttentionError::FrameChunk {
                batch: 0,
                chunk_size: 0,
            });
        }
        Ok(Self {
            inner: CrossAttention::with_kernel(vb, config, kernel)?,
            chunk_size: cross_frame.chunk_size,
            reference_frames: cross_frame.reference_frames.clone(),
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn reference_frames(&self) -> &ReferenceFrames {
        &self.reference_frames
    }

    pub fn has_fused_kernel(&self) -> bool {
        self.inner.has_fused_kernel()
    }

    pub fn forward(&self, x: &Tensor, context: Option<&Tensor>, mask: Option<&Tensor>) -> Result<Tensor> {
        self.forward_t(x, context, mask, false)
    }

    /// Without a context this is self-attention on reference-frame keys and
    /// values; with a context it is plain cross-attention.
    pub fn forward_t(
        &self,
        x: &Tensor,
        context: Option<&Tensor>,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let is_cross_attention = context.is_some();
        let (q, k, v) = self.inner.project(x, context.unwrap_or(x))?;

        let (k, v) = if is_cross_attention {
            (k, v)
        } else {
            (
                share_reference_frames(&k, self.chunk_size, &self.reference_frames)?,
                share_reference_frames(&v, self.chunk_size, &self.reference_frames)?,
            )
        };

        self.inner.attend_projected(
            x.dtype(),
            &q,
            &k,
            &v,
            mask,
            FusedGate::DivisibilityOnly,
            train,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, IndexOp};

    #[test]
    fn test_reference_indices() -> Result<()> {
        assert_eq!(ReferenceFrames::First.indices(3)?, vec![0, 0, 0]);
        assert_eq!(ReferenceFrames::Previous.indices(4)?, vec![0, 0, 1, 2]);
        assert_eq!(
            ReferenceFrames::Explicit(vec![0, 0, 1]).indices(3)?,
            vec![0, 0, 1]
        );
        assert!(ReferenceFrames::Explicit(vec![0, 3, 1]).indices(3).is_err());
        assert!(ReferenceFrames::Explicit(vec![0, 0]).indices(3).is_err());
        Ok(())
    }

    #[test]
    fn test_share_reference_frames_previous() -> Result<()> {
        let device = Device::Cpu;
        // 2 chunks x 3 frames, each frame filled with its batch index
        let x = Tensor::arange(0f32, 6., &device)?
            .reshape((6, 1, 1))?
            .broadcast_as((6, 2, 4))?
            .contiguous()?;
        let shared = share_reference_frames(&x, 2, &ReferenceFrames::Previous)?;
        let firsts = shared.i((.., 0, 0))?.to_vec1::<f32>()?;
        assert_eq!(firsts, vec![0., 0., 1., 3., 3., 4.]);
        Ok(())
    }

    #[test]
    fn test_share_reference_frames_bad_batch() -> Result<()> {
        let x = Tensor::zeros((5, 2, 4), candle_core::DType::F32, &Device::Cpu)?;
        assert!(matches!(
            share_reference_frames(&x, 2, &ReferenceFrames::First),
            Err(AttentionError::FrameChunk {
                batch: 5,
                chunk_size: 2
            })
        ));
        Ok(())
    }
}
