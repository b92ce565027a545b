//! Multistep consistency sampler for the distilled student.
use std::fs;

use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};

use super::{types::Scheduler, NoiseSchedule, PredictionType};
use crate::consistency::BoundaryCondition;
use crate::error::{DistillError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LcmSchedulerConfig {
    pub num_inference_steps: usize,
    /// Size of the DDIM sub-schedule the student was distilled on.
    pub original_inference_steps: usize,
    #[serde(default)]
    pub prediction_type: PredictionType,
    #[serde(default)]
    pub boundary: BoundaryCondition,
}

impl Default for LcmSchedulerConfig {
    fn default() -> Self {
        Self {
            num_inference_steps: 4,
            original_inference_steps: 50,
            prediction_type: PredictionType::Epsilon,
            boundary: BoundaryCondition::default(),
        }
    }
}

impl LcmSchedulerConfig {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> anyhow::Result<Self> {
        let file = fs::read_to_string(path)?;
        let cfg: LcmSchedulerConfig = toml::from_str(&file)?;
        Ok(cfg)
    }
}

pub struct LcmScheduler {
    schedule: NoiseSchedule,
    timesteps: Vec<i64>,
    config: LcmSchedulerConfig,
}

impl LcmScheduler {
    pub fn new(schedule: &NoiseSchedule, config: LcmSchedulerConfig) -> Result<Self> {
        let timesteps = Self::compute_timesteps(
            schedule.num_train_timesteps(),
            config.original_inference_steps,
            config.num_inference_steps,
        )?;
        Ok(Self { schedule: schedule.clone(), timesteps, config })
    }

    /// Reverses the origin schedule `(i + 1) * (T / K) - 1` and strides it down to `n` steps.
    fn compute_timesteps(num_train: usize, original: usize, n: usize) -> Result<Vec<i64>> {
        if original == 0 || original > num_train {
            return Err(DistillError::config(format!(
                "original_inference_steps must be in [1, {num_train}], got {original}"
            )));
        }
        if n == 0 || n > original {
            return Err(DistillError::config(format!(
                "num_inference_steps must be in [1, {original}], got {n}"
            )));
        }
        let c = (num_train / original) as i64;
        let skipping_step = original / n;
        Ok((1..=original as i64)
            .rev()
            .map(|i| i * c - 1)
            .step_by(skipping_step)
            .take(n)
            .collect())
    }

    fn next_timestep(&self, timestep: i64) -> Result<Option<i64>> {
        let position = self.timesteps.iter().position(|&t| t == timestep).ok_or_else(|| {
            DistillError::config(format!("timestep {timestep} is not in the LCM schedule"))
        })?;
        Ok(self.timesteps.get(position + 1).copied())
    }
}

impl Scheduler for LcmScheduler {
    fn timesteps(&self) -> &[i64] {
        &self.timesteps
    }

    fn step(&self, model_output: &Tensor, timestep: i64, sample: &Tensor) -> Result<Tensor> {
        let batch = sample.size()[0];
        let t = Tensor::full([batch], timestep, (Kind::Int64, sample.device()));
        let pred_x0 = self.schedule.predicted_original_sample(
            model_output,
            &t,
            sample,
            self.config.prediction_type,
        )?;
        let denoised = self.config.boundary.apply(sample, &pred_x0, &t)?;
        match self.next_timestep(timestep)? {
            None => Ok(denoised),
            Some(prev) => {
                let prev = Tensor::full([batch], prev, (Kind::Int64, sample.device()));
                let noise = denoised.randn_like();
                self.schedule.add_noise(&denoised, &noise, &prev)
            }
        }
    }

    fn init_noise_sigma(&self) -> f64 {
        1.0
    }
}
