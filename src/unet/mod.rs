//! Denoiser contract shared by the frozen teacher and the trainable student.
//!
//! The networks are opaque: a noisy 5-D video latent, per-sample timesteps and
//! the text conditioning go in, a residual of the same shape comes out.
use tch::Tensor;

use crate::error::{DistillError, Result};

/// Text conditioning passed to both networks.
#[derive(Debug)]
pub struct Conditioning {
    /// Prompt embeddings, `(batch, tokens, dim)`.
    pub context: Tensor,
    /// Frame-rate conditioning for video backbones that accept it.
    pub fps: Option<i64>,
}

impl Conditioning {
    pub fn new(context: Tensor, fps: Option<i64>) -> Self {
        Self { context, fps }
    }

    /// Same fps, different prompt embeddings.
    pub fn with_context(&self, context: Tensor) -> Self {
        Self { context, fps: self.fps }
    }
}

impl Clone for Conditioning {
    fn clone(&self) -> Self {
        Self { context: self.context.shallow_clone(), fps: self.fps }
    }
}

pub trait Denoiser {
    /// `timestep_cond` carries the guidance-scale embedding of the student; the
    /// teacher is called with `None`.
    fn forward(
        &self,
        sample: &Tensor,
        timesteps: &Tensor,
        cond: &Conditioning,
        timestep_cond: Option<&Tensor>,
    ) -> Tensor;
}

/// Runs `model` and rejects outputs whose shape differs from the input sample.
pub(crate) fn checked_forward(
    model: &dyn Denoiser,
    context: &'static str,
    sample: &Tensor,
    timesteps: &Tensor,
    cond: &Conditioning,
    timestep_cond: Option<&Tensor>,
) -> Result<Tensor> {
    let output = model.forward(sample, timesteps, cond, timestep_cond);
    if output.size() != sample.size() {
        return Err(DistillError::ShapeMismatch {
            context,
            expected: sample.size(),
            actual: output.size(),
        });
    }
    Ok(output)
}
