//! Classifier-free guidance: weight sampling, weight embedding and the
//! dual-teacher estimate used as the ODE solver input.
use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

use crate::error::{DistillError, Result};
use crate::schedulers::{NoiseSchedule, PredictionType};
use crate::unet::{checked_forward, Conditioning, Denoiser};

/// Uniform range the per-sample guidance weight `w` is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GuidanceRange {
    pub w_min: f64,
    pub w_max: f64,
}

impl GuidanceRange {
    pub fn new(w_min: f64, w_max: f64) -> Result<Self> {
        if !(w_min <= w_max) {
            return Err(DistillError::config(format!(
                "guidance range is empty: w_min = {w_min} > w_max = {w_max}"
            )));
        }
        Ok(Self { w_min, w_max })
    }

    /// `w ~ U[w_min, w_max]`, shape `(batch,)`.
    pub fn sample(&self, batch: i64, device: Device) -> Tensor {
        Tensor::rand([batch], (Kind::Float, device)) * (self.w_max - self.w_min) + self.w_min
    }
}

/// Sinusoidal embedding of the guidance weight, `(batch, embedding_dim)`.
pub fn guidance_scale_embedding(w: &Tensor, embedding_dim: i64) -> Tensor {
    let w = w.to_kind(Kind::Float) * 1000.0;
    let half_dim = embedding_dim / 2;
    let log_step = 10000f64.ln() / (half_dim - 1) as f64;
    let freqs = (Tensor::arange(half_dim, (Kind::Float, w.device())) * -log_step).exp();
    let emb = w.unsqueeze(1) * freqs.unsqueeze(0);
    let emb = Tensor::cat(&[emb.sin(), emb.cos()], 1);
    if embedding_dim % 2 == 1 {
        let pad = Tensor::zeros([emb.size()[0], 1], (Kind::Float, emb.device()));
        Tensor::cat(&[emb, pad], 1)
    } else {
        emb
    }
}

/// `cond + w * (cond - uncond)`.
pub fn guided(cond: &Tensor, uncond: &Tensor, w: &Tensor) -> Tensor {
    cond + (cond - uncond) * w
}

#[derive(Debug)]
pub struct GuidedEstimate {
    pub pred_x0: Tensor,
    pub pred_noise: Tensor,
}

/// Evaluates the frozen teacher with and without the prompt and forms the
/// guided clean-sample and noise estimates.
pub struct DualTeacherRollout<'a> {
    pub teacher: &'a dyn Denoiser,
    pub schedule: &'a NoiseSchedule,
    pub prediction_type: PredictionType,
}

impl DualTeacherRollout<'_> {
    fn single(
        &self,
        sample: &Tensor,
        timesteps: &Tensor,
        cond: &Conditioning,
    ) -> Result<GuidedEstimate> {
        let output = checked_forward(self.teacher, "teacher", sample, timesteps, cond, None)?;
        Ok(GuidedEstimate {
            pred_x0: self
                .schedule
                .predicted_original_sample(&output, timesteps, sample, self.prediction_type)?,
            pred_noise: self
                .schedule
                .predicted_noise(&output, timesteps, sample, self.prediction_type)?,
        })
    }

    /// `w` must already be broadcastable to `noisy_latents`.
    pub fn estimate(
        &self,
        noisy_latents: &Tensor,
        timesteps: &Tensor,
        cond: &Conditioning,
        uncond: &Conditioning,
        w: &Tensor,
    ) -> Result<GuidedEstimate> {
        tch::no_grad(|| {
            let cond_est = self.single(noisy_latents, timesteps, cond)?;
            let uncond_est = self.single(noisy_latents, timesteps, uncond)?;
            let w = w.to_kind(noisy_latents.kind());
            Ok(GuidedEstimate {
                pred_x0: guided(&cond_est.pred_x0, &uncond_est.pred_x0, &w),
                pred_noise: guided(&cond_est.pred_noise, &uncond_est.pred_noise, &w),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use crate::schedulers::NoiseScheduleConfig;
    use crate::utils::append_dims;

    /// Returns `scale(prompt) * sample`, where the scale depends on the mean prompt embedding.
    struct PromptScaled;

    impl Denoiser for PromptScaled {
        fn forward(
            &self,
            sample: &Tensor,
            _: &Tensor,
            cond: &Conditioning,
            _: Option<&Tensor>,
        ) -> Tensor {
            sample * (cond.context.mean(Kind::Float) + 0.5)
        }
    }

    fn conds() -> (Conditioning, Conditioning) {
        let cond = Conditioning::new(Tensor::ones([1, 3, 8], (Kind::Float, Device::Cpu)), None);
        let uncond = cond.with_context(Tensor::zeros([1, 3, 8], (Kind::Float, Device::Cpu)));
        (cond, uncond)
    }

    #[test]
    #[serial]
    fn test_guidance_range() {
        assert!(GuidanceRange::new(15.0, 5.0).is_err());
        let range = GuidanceRange::new(5.0, 5.0).unwrap();
        let w = range.sample(3, Device::Cpu);
        assert_eq!(Vec::<f32>::try_from(&w).unwrap(), vec![5.0; 3]);
        let w = GuidanceRange::new(2.0, 8.0).unwrap().sample(64, Device::Cpu);
        assert!(w.min().double_value(&[]) >= 2.0);
        assert!(w.max().double_value(&[]) <= 8.0);
    }

    #[test]
    fn test_guidance_scale_embedding() {
        let w = Tensor::from_slice(&[0f32, 1.5]);
        let emb = guidance_scale_embedding(&w, 256);
        assert_eq!(emb.size(), vec![2, 256]);
        // w = 0: sin half is zero, cos half is one
        assert_eq!(emb.double_value(&[0, 0]), 0.0);
        assert_eq!(emb.double_value(&[0, 128]), 1.0);
        // first frequency is 1.0
        assert!((emb.double_value(&[1, 0]) - 1500f64.sin()).abs() < 1e-3);

        let emb = guidance_scale_embedding(&w, 9);
        assert_eq!(emb.size(), vec![2, 9]);
        assert_eq!(emb.double_value(&[1, 8]), 0.0);
    }

    #[test]
    #[serial]
    fn test_cfg_at_zero_weight_is_conditional_estimate() {
        let schedule = NoiseSchedule::new(&NoiseScheduleConfig::default(), Device::Cpu).unwrap();
        let rollout = DualTeacherRollout {
            teacher: &PromptScaled,
            schedule: &schedule,
            prediction_type: PredictionType::Epsilon,
        };
        let (cond, uncond) = conds();
        let x = Tensor::randn([1, 4, 3, 4, 4], (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[499i64]);
        let w = append_dims(&Tensor::from_slice(&[0f32]), 5).unwrap();
        let guided_est = rollout.estimate(&x, &t, &cond, &uncond, &w).unwrap();
        let cond_only = rollout.single(&x, &t, &cond).unwrap();
        assert!(guided_est.pred_x0.equal(&cond_only.pred_x0));
        assert!(guided_est.pred_noise.equal(&cond_only.pred_noise));
        assert!(!guided_est.pred_x0.requires_grad());
    }

    #[test]
    fn test_cfg_extrapolates_away_from_unconditional() {
        let cond = Tensor::from_slice(&[2f32]);
        let uncond = Tensor::from_slice(&[1f32]);
        let w = Tensor::from_slice(&[3f32]);
        assert_eq!(guided(&cond, &uncond, &w).double_value(&[0]), 5.0);
    }
}
