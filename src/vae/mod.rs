//! # Variational Auto-Encoder (VAE) contract.
//!
//! Auto-encoder models compress their input to a usually smaller latent space
//! before expanding it back to its original shape. The distillation step only
//! sees them through [`VideoAutoencoder`]: frames are encoded one image at a
//! time, `(n, 3, h, w) -> (n, c, h / f, w / f)`, and decoded the same way.
use tch::Tensor;

use crate::error::{DistillError, Result};

/// Posterior returned by the encoder, parameterized by mean and log-variance.
#[derive(Debug)]
pub struct DiagonalGaussianDistribution {
    mean: Tensor,
    std: Tensor,
}

impl DiagonalGaussianDistribution {
    /// Splits `parameters` along the channel dimension into mean and log-variance.
    pub fn new(parameters: &Tensor) -> Result<Self> {
        let shape = parameters.size();
        let even_channels = shape.len() >= 2 && shape[1] > 0 && shape[1] % 2 == 0;
        if !even_channels {
            return Err(DistillError::ShapeMismatch {
                context: "posterior parameters with an even channel count",
                expected: vec![],
                actual: shape,
            });
        }
        let mut parameters = parameters.chunk(2, 1).into_iter();
        let (Some(mean), Some(logvar)) = (parameters.next(), parameters.next()) else {
            return Err(DistillError::ShapeMismatch {
                context: "posterior parameters with an even channel count",
                expected: vec![],
                actual: shape,
            });
        };
        let std = (logvar.clamp(-30., 20.) * 0.5).exp();
        Ok(Self { mean, std })
    }

    /// A posterior with zero variance: `sample()` returns the mean.
    pub fn point_mass(mean: Tensor) -> Self {
        let std = mean.zeros_like();
        Self { mean, std }
    }

    pub fn sample(&self) -> Tensor {
        let sample = self.mean.randn_like();
        &self.mean + &self.std * sample
    }

    pub fn mode(&self) -> Tensor {
        self.mean.shallow_clone()
    }
}

/// Frozen image autoencoder applied frame by frame.
pub trait VideoAutoencoder {
    /// Returns the distribution in the latent space.
    fn encode(&self, xs: &Tensor) -> DiagonalGaussianDistribution;

    /// Takes as input some sampled latent values.
    fn decode(&self, xs: &Tensor) -> Tensor;
}
