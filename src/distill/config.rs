use std::io::Read;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::consistency::BoundaryCondition;
use crate::error::{DistillError, Result};
use crate::guidance::GuidanceRange;
use crate::losses::DistillLoss;
use crate::model_kind::ModelKind;
use crate::reward::RewardConfig;
use crate::schedulers::ddim_solver::SolverMode;
use crate::schedulers::{BetaSchedule, NoiseScheduleConfig, PredictionType};
use crate::utils::file_open;

pub const DEFAULT_CONFIG: &str = include_str!("config.default.toml");

/// Hyper-parameters of consistency distillation with reward feedback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistillConfig {
    // noise schedule
    pub num_train_timesteps: usize,
    pub beta_schedule: BetaSchedule,
    pub linear_start: f64,
    pub linear_end: f64,
    pub prediction_type: PredictionType,

    // solver
    /// Number of sparse DDIM timesteps `K`.
    pub num_ddim_timesteps: usize,
    /// How far the target timestep lags the start timestep.
    pub topk: i64,
    pub ddim_eta: f64,
    pub set_alpha_to_one: bool,
    /// Scaled `x_0` parameterization, not supported.
    pub use_scale: bool,
    pub scale_b: f64,

    // guidance
    pub w_min: f64,
    pub w_max: f64,
    pub time_cond_proj_dim: i64,

    // consistency boundary
    pub timestep_scaling_factor: f64,
    pub sigma_data: f64,
    pub loss_type: DistillLoss,

    #[serde(flatten)]
    pub reward: RewardConfig,

    // data and autoencoder
    pub vae_scale_factor: f64,
    pub vae_encode_batch_size: usize,
    pub train_batch_size: usize,
    pub n_frames: usize,
    /// Absent for backbones without frame-rate conditioning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<i64>,

    // training loop
    pub seed: i64,
    pub max_grad_norm: f64,
    pub learning_rate: f64,
    pub max_train_steps: usize,
}

impl Default for DistillConfig {
    fn default() -> Self {
        let schedule = NoiseScheduleConfig::default();
        let boundary = BoundaryCondition::default();
        Self {
            num_train_timesteps: schedule.num_train_timesteps,
            beta_schedule: schedule.beta_schedule,
            linear_start: schedule.linear_start,
            linear_end: schedule.linear_end,
            prediction_type: PredictionType::Epsilon,
            num_ddim_timesteps: 50,
            topk: 20,
            ddim_eta: 0.0,
            set_alpha_to_one: true,
            use_scale: false,
            scale_b: 0.7,
            w_min: 5.0,
            w_max: 15.0,
            time_cond_proj_dim: 256,
            timestep_scaling_factor: boundary.timestep_scaling,
            sigma_data: boundary.sigma_data,
            loss_type: DistillLoss::Huber { huber_c: 0.001 },
            reward: RewardConfig::default(),
            vae_scale_factor: 0.18215,
            vae_encode_batch_size: 8,
            train_batch_size: 1,
            n_frames: 16,
            fps: Some(16),
            seed: 453645634,
            max_grad_norm: 10.0,
            learning_rate: 1e-5,
            max_train_steps: 10000,
        }
    }
}

impl FromStr for DistillConfig {
    type Err = DistillError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

impl DistillConfig {
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let mut file = file_open(path)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        content.parse()
    }

    /// The configuration shipped with the crate.
    pub fn bundled() -> Result<Self> {
        DEFAULT_CONFIG.parse()
    }

    /// Defaults with the model-derived values of `kind`.
    pub fn for_model(kind: ModelKind) -> Self {
        kind.apply(Self::default())
    }

    pub fn noise_schedule(&self) -> NoiseScheduleConfig {
        NoiseScheduleConfig {
            num_train_timesteps: self.num_train_timesteps,
            beta_schedule: self.beta_schedule,
            linear_start: self.linear_start,
            linear_end: self.linear_end,
        }
    }

    pub fn boundary(&self) -> BoundaryCondition {
        BoundaryCondition {
            sigma_data: self.sigma_data,
            timestep_scaling: self.timestep_scaling_factor,
        }
    }

    pub fn guidance_range(&self) -> Result<GuidanceRange> {
        GuidanceRange::new(self.w_min, self.w_max)
    }

    pub fn solver_mode(&self) -> SolverMode {
        if self.use_scale {
            SolverMode::Scaled { scale_b: self.scale_b }
        } else {
            SolverMode::Deterministic
        }
    }

    /// Checks every precondition of the distillation step.
    pub fn validate(&self) -> Result<()> {
        if self.use_scale {
            return Err(DistillError::Unsupported(format!(
                "use_scale = true (scale_b = {})",
                self.scale_b
            )));
        }
        let t = self.num_train_timesteps;
        let k = self.num_ddim_timesteps;
        if t == 0 {
            return Err(DistillError::config("num_train_timesteps must be positive"));
        }
        if k == 0 || k > t {
            return Err(DistillError::config(format!(
                "num_ddim_timesteps must be in [1, {t}], got {k}"
            )));
        }
        if self.topk < 0 {
            return Err(DistillError::config(format!(
                "topk must be non-negative, got {}",
                self.topk
            )));
        }
        let ordered_betas = 0.0 < self.linear_start
            && self.linear_start <= self.linear_end
            && self.linear_end < 1.0;
        if self.beta_schedule != BetaSchedule::SquaredcosCapV2 && !ordered_betas {
            return Err(DistillError::config(format!(
                "beta range must satisfy 0 < linear_start <= linear_end < 1, got [{}, {}]",
                self.linear_start, self.linear_end
            )));
        }
        self.guidance_range()?;
        if self.time_cond_proj_dim < 4 {
            return Err(DistillError::config(format!(
                "time_cond_proj_dim must be at least 4, got {}",
                self.time_cond_proj_dim
            )));
        }
        if !(self.sigma_data > 0.0) || !(self.timestep_scaling_factor > 0.0) {
            return Err(DistillError::config(
                "sigma_data and timestep_scaling_factor must be positive",
            ));
        }
        self.loss_type.validate()?;
        if self.vae_encode_batch_size == 0 || self.train_batch_size == 0 || self.n_frames == 0 {
            return Err(DistillError::config(
                "vae_encode_batch_size, train_batch_size and n_frames must be positive",
            ));
        }
        if !(self.vae_scale_factor > 0.0) {
            return Err(DistillError::config("vae_scale_factor must be positive"));
        }
        self.reward.validate(self.train_batch_size, self.n_frames)
    }
}
