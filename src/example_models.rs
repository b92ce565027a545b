//! Small stand-ins for the pretrained networks, used by the tests and the
//! synthetic demo. They are cheap, deterministic given their parameters and
//! keep every tensor shape of the real models.
use std::cell::Cell;
use std::rc::Rc;

use tch::{nn, Device, Kind, Tensor};

use crate::reward::RewardFn;
use crate::text_encoder::TextEncoder;
use crate::unet::{Conditioning, Denoiser};
use crate::vae::{DiagonalGaussianDistribution, VideoAutoencoder};

fn per_sample(xs: &Tensor) -> Tensor {
    xs.flatten(1, -1).mean_dim(Some([1].as_slice()), false, Kind::Float).reshape([-1, 1, 1, 1, 1])
}

fn per_channel(xs: &Tensor) -> Tensor {
    xs.reshape([1, -1, 1, 1, 1])
}

/// Trainable per-channel affine noise predictor, shifted by the guidance
/// embedding and the prompt.
#[derive(Debug)]
pub struct LinearDenoiser {
    weight: Tensor,
    bias: Tensor,
    cond_scale: Tensor,
}

impl LinearDenoiser {
    pub fn new(vs: nn::Path, channels: i64) -> Self {
        let weight = vs.var("weight", &[channels], nn::Init::Const(0.1));
        let bias = vs.zeros("bias", &[channels]);
        let cond_scale = vs.var("cond_scale", &[1], nn::Init::Const(0.01));
        Self { weight, bias, cond_scale }
    }
}

impl Denoiser for LinearDenoiser {
    fn forward(
        &self,
        sample: &Tensor,
        _timesteps: &Tensor,
        cond: &Conditioning,
        timestep_cond: Option<&Tensor>,
    ) -> Tensor {
        let out = sample * per_channel(&self.weight) + per_channel(&self.bias);
        let prompt = per_sample(&cond.context).to_kind(sample.kind());
        let out = out + prompt * &self.cond_scale;
        match timestep_cond {
            Some(emb) => out + per_sample(emb).to_kind(sample.kind()) * &self.cond_scale,
            None => out,
        }
    }
}

/// Frozen teacher predicting `(scale + prompt_weight * mean(context)) * sample`.
#[derive(Debug, Clone, Copy)]
pub struct ScaledDenoiser {
    pub scale: f64,
    pub prompt_weight: f64,
}

impl Default for ScaledDenoiser {
    fn default() -> Self {
        Self { scale: 0.5, prompt_weight: 0.2 }
    }
}

impl Denoiser for ScaledDenoiser {
    fn forward(
        &self,
        sample: &Tensor,
        _: &Tensor,
        cond: &Conditioning,
        _: Option<&Tensor>,
    ) -> Tensor {
        let prompt = per_sample(&cond.context).to_kind(sample.kind());
        let factor = prompt * self.prompt_weight + self.scale;
        sample * factor
    }
}

/// Maps pixels to latents by averaging over colour channels, without spatial
/// downsampling. Counts decode calls.
#[derive(Debug)]
pub struct ChannelMeanAutoencoder {
    latent_channels: i64,
    decode_calls: Rc<Cell<usize>>,
}

impl ChannelMeanAutoencoder {
    pub fn new(latent_channels: i64) -> Self {
        Self { latent_channels, decode_calls: Rc::new(Cell::new(0)) }
    }

    /// Handle that keeps counting after the autoencoder is boxed.
    pub fn decode_calls(&self) -> Rc<Cell<usize>> {
        self.decode_calls.clone()
    }
}

impl VideoAutoencoder for ChannelMeanAutoencoder {
    fn encode(&self, xs: &Tensor) -> DiagonalGaussianDistribution {
        let mean = xs.mean_dim(Some([1].as_slice()), true, Kind::Float);
        DiagonalGaussianDistribution::point_mass(mean.repeat([1, self.latent_channels, 1, 1]))
    }

    fn decode(&self, xs: &Tensor) -> Tensor {
        self.decode_calls.set(self.decode_calls.get() + 1);
        xs.mean_dim(Some([1].as_slice()), true, Kind::Float).repeat([1, 3, 1, 1])
    }
}

/// Embeds each caption as a constant `(tokens, dim)` block of `0.01 * len(caption)`.
#[derive(Debug, Clone, Copy)]
pub struct LengthTextEncoder {
    pub tokens: i64,
    pub dim: i64,
}

impl Default for LengthTextEncoder {
    fn default() -> Self {
        Self { tokens: 4, dim: 8 }
    }
}

impl TextEncoder for LengthTextEncoder {
    fn encode(&self, captions: &[String]) -> anyhow::Result<Tensor> {
        if captions.is_empty() {
            anyhow::bail!("no captions to encode");
        }
        let options = (Kind::Float, Device::Cpu);
        let rows: Vec<Tensor> = captions
            .iter()
            .map(|c| Tensor::full([self.tokens, self.dim], 0.01 * c.len() as f64, options))
            .collect();
        Ok(Tensor::stack(&rows, 0))
    }
}

/// Scores frames by their mean brightness. Counts calls.
#[derive(Debug, Default)]
pub struct BrightnessReward {
    calls: Rc<Cell<usize>>,
}

impl BrightnessReward {
    pub fn calls(&self) -> Rc<Cell<usize>> {
        self.calls.clone()
    }
}

impl RewardFn for BrightnessReward {
    fn score(&self, pixels: &Tensor, _captions: &[String]) -> anyhow::Result<Tensor> {
        self.calls.set(self.calls.get() + 1);
        Ok(pixels.flatten(1, -1).mean_dim(Some([1].as_slice()), false, Kind::Float))
    }
}
