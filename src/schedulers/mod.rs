use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};
use tracing::debug;

use crate::error::{DistillError, Result};
use crate::utils::append_dims;

pub mod ddim_solver;
pub mod lcm;
pub mod types;

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta.
    ScaledLinear,
    /// Glide cosine schedule
    SquaredcosCapV2,
}

/// What the denoiser network is trained to predict.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    #[default]
    Epsilon,
    VPrediction,
    Sample,
}

/// Create a beta schedule that discretizes the given alpha_t_bar function, which
/// defines the cumulative product of `(1-beta)` over time from `t = [0,1]`.
pub(crate) fn betas_for_alpha_bar(num_diffusion_timesteps: usize, max_beta: f64) -> Vec<f64> {
    let alpha_bar = |time_step: f64| {
        f64::cos((time_step + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).powi(2)
    };
    (0..num_diffusion_timesteps)
        .map(|i| {
            let t1 = i as f64 / num_diffusion_timesteps as f64;
            let t2 = (i + 1) as f64 / num_diffusion_timesteps as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}

fn linspace(start: f64, end: f64, steps: usize) -> Vec<f64> {
    if steps <= 1 {
        return vec![start];
    }
    let delta = (end - start) / (steps - 1) as f64;
    (0..steps).map(|i| start + delta * i as f64).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoiseScheduleConfig {
    pub num_train_timesteps: usize,
    pub beta_schedule: BetaSchedule,
    pub linear_start: f64,
    pub linear_end: f64,
}

impl Default for NoiseScheduleConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_schedule: BetaSchedule::ScaledLinear,
            linear_start: 0.00085,
            linear_end: 0.012,
        }
    }
}

impl NoiseScheduleConfig {
    pub fn betas(&self) -> Vec<f64> {
        let steps = self.num_train_timesteps;
        match self.beta_schedule {
            BetaSchedule::Linear => linspace(self.linear_start, self.linear_end, steps),
            BetaSchedule::ScaledLinear => {
                linspace(self.linear_start.sqrt(), self.linear_end.sqrt(), steps)
                    .into_iter()
                    .map(|b| b * b)
                    .collect()
            }
            BetaSchedule::SquaredcosCapV2 => betas_for_alpha_bar(steps, 0.999),
        }
    }
}

/// Cumulative-product noise coefficients over the full training timestep range.
///
/// `alpha(t) = sqrt(alphas_cumprod[t])` and `sigma(t) = sqrt(1 - alphas_cumprod[t])`
/// are kept on the device so that per-sample lookups stay on the accelerator.
#[derive(Debug)]
pub struct NoiseSchedule {
    alphas_cumprod: Vec<f64>,
    alpha_schedule: Tensor,
    sigma_schedule: Tensor,
}

impl Clone for NoiseSchedule {
    fn clone(&self) -> Self {
        Self {
            alphas_cumprod: self.alphas_cumprod.clone(),
            alpha_schedule: self.alpha_schedule.shallow_clone(),
            sigma_schedule: self.sigma_schedule.shallow_clone(),
        }
    }
}

impl NoiseSchedule {
    pub fn new(config: &NoiseScheduleConfig, device: Device) -> Result<Self> {
        if config.num_train_timesteps == 0 {
            return Err(DistillError::config("num_train_timesteps must be positive"));
        }
        let mut alphas_cumprod = Vec::with_capacity(config.num_train_timesteps);
        let mut acc = 1.0;
        for beta in config.betas() {
            acc *= 1.0 - beta;
            alphas_cumprod.push(acc);
        }
        Self::from_alphas_cumprod(alphas_cumprod, device)
    }

    pub fn from_alphas_cumprod(alphas_cumprod: Vec<f64>, device: Device) -> Result<Self> {
        if alphas_cumprod.is_empty() {
            return Err(DistillError::config("empty noise schedule"));
        }
        if let Some(bad) = alphas_cumprod.iter().find(|&&a| !(a > 0.0 && a <= 1.0)) {
            return Err(DistillError::config(format!(
                "alphas_cumprod must lie in (0, 1], found {bad}"
            )));
        }
        if alphas_cumprod.windows(2).any(|w| w[1] > w[0]) {
            return Err(DistillError::config("alphas_cumprod must be non-increasing"));
        }
        let alphas: Vec<f64> = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sigmas: Vec<f64> = alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect();
        let to_device = |v: &[f64]| Tensor::from_slice(v).to_kind(Kind::Float).to_device(device);
        debug!(
            num_train_timesteps = alphas_cumprod.len(),
            first = alphas_cumprod[0],
            last = alphas_cumprod[alphas_cumprod.len() - 1],
            "built noise schedule"
        );
        Ok(Self {
            alpha_schedule: to_device(&alphas),
            sigma_schedule: to_device(&sigmas),
            alphas_cumprod,
        })
    }

    pub fn device(&self) -> Device {
        self.alpha_schedule.device()
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    fn lookup(&self, schedule: &Tensor, timesteps: &Tensor, like: &Tensor) -> Result<Tensor> {
        let index = timesteps.to_kind(Kind::Int64).to_device(schedule.device());
        let values = schedule.index_select(0, &index).to_kind(like.kind());
        append_dims(&values, like.dim())
    }

    /// `sqrt(alphas_cumprod[t])` broadcast to the rank of `like`.
    pub fn alpha(&self, timesteps: &Tensor, like: &Tensor) -> Result<Tensor> {
        self.lookup(&self.alpha_schedule, timesteps, like)
    }

    /// `sqrt(1 - alphas_cumprod[t])` broadcast to the rank of `like`.
    pub fn sigma(&self, timesteps: &Tensor, like: &Tensor) -> Result<Tensor> {
        self.lookup(&self.sigma_schedule, timesteps, like)
    }

    /// Forward diffusion: `alpha(t) * x_0 + sigma(t) * noise`.
    pub fn add_noise(
        &self,
        original_samples: &Tensor,
        noise: &Tensor,
        timesteps: &Tensor,
    ) -> Result<Tensor> {
        let alpha = self.alpha(timesteps, original_samples)?;
        let sigma = self.sigma(timesteps, original_samples)?;
        Ok(original_samples * alpha + noise * sigma)
    }

    pub fn predicted_original_sample(
        &self,
        model_output: &Tensor,
        timesteps: &Tensor,
        sample: &Tensor,
        prediction_type: PredictionType,
    ) -> Result<Tensor> {
        let alpha = self.alpha(timesteps, sample)?;
        let sigma = self.sigma(timesteps, sample)?;
        let pred_x0 = match prediction_type {
            PredictionType::Epsilon => (sample - model_output * sigma) / alpha,
            PredictionType::Sample => model_output.shallow_clone(),
            PredictionType::VPrediction => sample * alpha - model_output * sigma,
        };
        Ok(pred_x0)
    }

    pub fn predicted_noise(
        &self,
        model_output: &Tensor,
        timesteps: &Tensor,
        sample: &Tensor,
        prediction_type: PredictionType,
    ) -> Result<Tensor> {
        let alpha = self.alpha(timesteps, sample)?;
        let sigma = self.sigma(timesteps, sample)?;
        let pred_noise = match prediction_type {
            PredictionType::Epsilon => model_output.shallow_clone(),
            PredictionType::Sample => (sample - model_output * alpha) / sigma,
            PredictionType::VPrediction => model_output * alpha + sample * sigma,
        };
        Ok(pred_noise)
    }
}
