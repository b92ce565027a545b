//! Reward feedback on the student's consistency prediction.
//!
//! Each path decodes a few frames of `model_pred` back to pixels, scores them
//! with an external reward model and adds `-mean(reward) * scale` to the loss.
//! A path with a non-positive scale is never built, so it costs nothing.
//!
//! Both paths currently require a per-device batch size of one: frame indices
//! are drawn once for the whole batch.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};
use tracing::{debug, info};

use crate::error::{DistillError, Result};
use crate::vae::VideoAutoencoder;

/// Differentiable scorer of decoded pixels in `[0, 1]`.
///
/// Image rewards receive `(n, 3, h, w)`, video rewards `(b, n, 3, h, w)`;
/// both return one score per image or clip.
pub trait RewardFn {
    fn score(&self, pixels: &Tensor, captions: &[String]) -> anyhow::Result<Tensor>;
}

/// Reward models the host has loaded, looked up by configured name.
#[derive(Default)]
pub struct RewardRegistry {
    fns: HashMap<String, Box<dyn RewardFn>>,
}

impl RewardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, reward_fn: Box<dyn RewardFn>) -> Self {
        self.fns.insert(name.into(), reward_fn);
        self
    }

    fn take(&mut self, name: &str) -> Result<Box<dyn RewardFn>> {
        self.fns.remove(name).ok_or_else(|| {
            DistillError::config(format!("reward function {name:?} is not registered"))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    /// Image reward weight, `<= 0` disables the path.
    pub reward_scale: f64,
    /// Frames scored by the image reward per step.
    pub reward_batch_size: usize,
    pub reward_fn_name: String,
    /// Video reward weight, `<= 0` disables the path.
    pub video_reward_scale: f64,
    /// Frames per clip scored by the video reward.
    pub video_rm_batch_size: usize,
    pub video_rm_name: String,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            reward_scale: 0.0,
            reward_batch_size: 5,
            reward_fn_name: "hpsv2".to_string(),
            video_reward_scale: 0.0,
            video_rm_batch_size: 8,
            video_rm_name: "vi_clip2".to_string(),
        }
    }
}

impl RewardConfig {
    /// Preconditions checked before any step runs.
    pub fn validate(&self, train_batch_size: usize, n_frames: usize) -> Result<()> {
        if self.reward_scale > 0.0 {
            if train_batch_size != 1 {
                return Err(DistillError::config(format!(
                    "the image reward path requires train_batch_size = 1, got {train_batch_size}"
                )));
            }
            if self.reward_batch_size == 0 {
                return Err(DistillError::config("reward_batch_size must be positive"));
            }
        }
        if self.video_reward_scale > 0.0 {
            if train_batch_size != 1 {
                return Err(DistillError::config(format!(
                    "the video reward path requires train_batch_size = 1, got {train_batch_size}"
                )));
            }
            if self.video_rm_batch_size == 0 || n_frames <= self.video_rm_batch_size {
                return Err(DistillError::config(format!(
                    "video_rm_batch_size must be in [1, n_frames), got {} with n_frames = {}",
                    self.video_rm_batch_size, n_frames
                )));
            }
        }
        Ok(())
    }
}

struct RewardPath {
    reward_fn: Box<dyn RewardFn>,
    scale: f64,
    batch_size: usize,
}

pub struct RewardAugmenter {
    image: Option<RewardPath>,
    video: Option<RewardPath>,
    vae_scale_factor: f64,
}

impl RewardAugmenter {
    pub fn new(
        config: &RewardConfig,
        train_batch_size: usize,
        n_frames: usize,
        vae_scale_factor: f64,
        registry: &mut RewardRegistry,
    ) -> Result<Self> {
        config.validate(train_batch_size, n_frames)?;
        let image = if config.reward_scale > 0.0 {
            info!(
                name = %config.reward_fn_name,
                scale = config.reward_scale,
                "image reward enabled"
            );
            Some(RewardPath {
                reward_fn: registry.take(&config.reward_fn_name)?,
                scale: config.reward_scale,
                batch_size: config.reward_batch_size,
            })
        } else {
            None
        };
        let video = if config.video_reward_scale > 0.0 {
            info!(
                name = %config.video_rm_name,
                scale = config.video_reward_scale,
                "video reward enabled"
            );
            Some(RewardPath {
                reward_fn: registry.take(&config.video_rm_name)?,
                scale: config.video_reward_scale,
                batch_size: config.video_rm_batch_size,
            })
        } else {
            None
        };
        Ok(Self { image, video, vae_scale_factor })
    }

    /// Neither path enabled.
    pub fn disabled(vae_scale_factor: f64) -> Self {
        Self { image: None, video: None, vae_scale_factor }
    }

    pub fn image_enabled(&self) -> bool {
        self.image.is_some()
    }

    pub fn video_enabled(&self) -> bool {
        self.video.is_some()
    }

    /// Decodes frames `idx` of `(b, c, t, h, w)` latents to `(b * n, 3, h', w')`
    /// pixels in `[0, 1]`.
    fn decode_frames(&self, latents: &Tensor, idx: &Tensor, vae: &dyn VideoAutoencoder) -> Tensor {
        let selected = latents.index_select(2, idx) / self.vae_scale_factor;
        let selected = selected.permute([0, 2, 1, 3, 4]);
        let size = selected.size();
        let selected = selected.reshape([size[0] * size[1], size[2], size[3], size[4]]);
        (vae.decode(&selected) / 2.0 + 0.5).clamp(0.0, 1.0)
    }

    fn check_batch(model_pred: &Tensor, path: &'static str) -> Result<(i64, i64)> {
        let size = model_pred.size();
        if size.len() != 5 {
            return Err(DistillError::ShapeMismatch {
                context: "reward input latents (b, c, t, h, w)",
                expected: vec![1, -1, -1, -1, -1],
                actual: size,
            });
        }
        if size[0] != 1 {
            return Err(DistillError::config(format!(
                "the {path} reward path requires batch size 1, got {}",
                size[0]
            )));
        }
        Ok((size[0], size[2]))
    }

    /// `None` when the image path is disabled.
    pub fn image_reward_loss(
        &self,
        model_pred: &Tensor,
        captions: &[String],
        vae: &dyn VideoAutoencoder,
    ) -> Result<Option<Tensor>> {
        let Some(path) = &self.image else { return Ok(None) };
        let (_, frames) = Self::check_batch(model_pred, "image")?;
        let options = (Kind::Int64, model_pred.device());
        let idx = Tensor::randint(frames, [path.batch_size as i64], options);
        let decoded = self.decode_frames(model_pred, &idx, vae);
        let rewards = path.reward_fn.score(&decoded, captions)?;
        let loss = rewards.mean(Kind::Float).neg() * path.scale;
        debug!(frames = path.batch_size, "scored image reward");
        Ok(Some(loss))
    }

    /// `None` when the video path is disabled.
    pub fn video_reward_loss(
        &self,
        model_pred: &Tensor,
        captions: &[String],
        vae: &dyn VideoAutoencoder,
    ) -> Result<Option<Tensor>> {
        let Some(path) = &self.video else { return Ok(None) };
        let (batch, frames) = Self::check_batch(model_pred, "video")?;
        let n = path.batch_size as i64;
        let idx = strided_frame_indices(frames, n, model_pred.device())?;
        let decoded = self.decode_frames(model_pred, &idx, vae);
        let size = decoded.size();
        let clip = decoded.reshape([batch, n, size[1], size[2], size[3]]);
        let rewards = path.reward_fn.score(&clip, captions)?;
        let loss = rewards.mean(Kind::Float).neg() * path.scale;
        debug!(frames = n, "scored video reward");
        Ok(Some(loss))
    }
}

/// `n` evenly spaced frame indices with stride `frames / n` and a random
/// phase in `[0, stride)`.
pub fn strided_frame_indices(frames: i64, n: i64, device: Device) -> Result<Tensor> {
    if n <= 0 || frames <= n {
        return Err(DistillError::config(format!(
            "video reward needs more than {n} frames, got {frames}"
        )));
    }
    let skip = frames / n;
    let start = Tensor::randint(skip, [1], (Kind::Int64, Device::Cpu)).int64_value(&[0]);
    let idx = Tensor::arange_start_step(start, frames, skip, (Kind::Int64, device)).narrow(0, 0, n);
    Ok(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct MeanPixel;

    impl RewardFn for MeanPixel {
        fn score(&self, pixels: &Tensor, _: &[String]) -> anyhow::Result<Tensor> {
            Ok(pixels.flatten(1, -1).mean_dim(Some([1].as_slice()), false, Kind::Float))
        }
    }

    struct Identity;

    impl VideoAutoencoder for Identity {
        fn encode(&self, xs: &Tensor) -> crate::vae::DiagonalGaussianDistribution {
            crate::vae::DiagonalGaussianDistribution::point_mass(xs.shallow_clone())
        }
        fn decode(&self, xs: &Tensor) -> Tensor {
            xs.shallow_clone()
        }
    }

    fn enabled_config() -> RewardConfig {
        RewardConfig {
            reward_scale: 2.0,
            reward_batch_size: 3,
            reward_fn_name: "mean".into(),
            video_reward_scale: 0.5,
            video_rm_batch_size: 4,
            video_rm_name: "mean_video".into(),
        }
    }

    fn registry() -> RewardRegistry {
        RewardRegistry::new()
            .register("mean", Box::new(MeanPixel))
            .register("mean_video", Box::new(MeanPixel))
    }

    #[test]
    fn test_validate_preconditions() {
        let cfg = enabled_config();
        assert!(cfg.validate(1, 16).is_ok());
        assert!(cfg.validate(2, 16).is_err());
        assert!(cfg.validate(1, 4).is_err());
        assert!(RewardConfig::default().validate(8, 1).is_ok());
    }

    #[test]
    fn test_missing_reward_fn_is_config_error() {
        let mut empty = RewardRegistry::new();
        let err = RewardAugmenter::new(&enabled_config(), 1, 16, 0.18215, &mut empty)
            .err()
            .unwrap();
        assert!(matches!(err, DistillError::InvalidConfig(_)));
    }

    #[test]
    #[serial]
    fn test_strided_frame_indices() {
        for seed in 0..8 {
            tch::manual_seed(seed);
            let idx = strided_frame_indices(16, 4, Device::Cpu).unwrap();
            let idx = Vec::<i64>::try_from(&idx).unwrap();
            assert_eq!(idx.len(), 4);
            assert!(idx[0] < 4);
            assert!(idx.windows(2).all(|w| w[1] - w[0] == 4));
        }
        let idx = Vec::<i64>::try_from(&strided_frame_indices(9, 4, Device::Cpu).unwrap()).unwrap();
        assert_eq!(idx.len(), 4);
        assert!(strided_frame_indices(4, 4, Device::Cpu).is_err());
    }

    #[test]
    #[serial]
    fn test_reward_losses() {
        let augmenter =
            RewardAugmenter::new(&enabled_config(), 1, 16, 1.0, &mut registry()).unwrap();
        // latents of 0 decode to pixel value 0.5 everywhere
        let model_pred = Tensor::zeros([1, 3, 16, 4, 4], (Kind::Float, Device::Cpu));
        let captions = vec!["a dog".to_string()];
        let image =
            augmenter.image_reward_loss(&model_pred, &captions, &Identity).unwrap().unwrap();
        assert!(augmenter.image_enabled() && augmenter.video_enabled());
        assert!((image.double_value(&[]) + 1.0).abs() < 1e-6);
        let video =
            augmenter.video_reward_loss(&model_pred, &captions, &Identity).unwrap().unwrap();
        assert!((video.double_value(&[]) + 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_reward_rejects_larger_batches_at_runtime() {
        let augmenter =
            RewardAugmenter::new(&enabled_config(), 1, 16, 1.0, &mut registry()).unwrap();
        let model_pred = Tensor::zeros([2, 3, 16, 4, 4], (Kind::Float, Device::Cpu));
        assert!(augmenter.image_reward_loss(&model_pred, &[], &Identity).is_err());
    }

    #[test]
    fn test_disabled_paths_return_none() {
        let augmenter = RewardAugmenter::disabled(0.18215);
        assert!(!augmenter.image_enabled() && !augmenter.video_enabled());
        let model_pred = Tensor::zeros([2, 4, 5, 4, 4], (Kind::Float, Device::Cpu));
        assert!(augmenter.image_reward_loss(&model_pred, &[], &Identity).unwrap().is_none());
        assert!(augmenter.video_reward_loss(&model_pred, &[], &Identity).unwrap().is_none());
    }
}
