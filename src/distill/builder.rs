use tch::Device;
use tracing::info;

use crate::error::{DistillError, Result};
use crate::reward::{RewardAugmenter, RewardRegistry};
use crate::schedulers::ddim_solver::DdimSolver;
use crate::schedulers::NoiseSchedule;
use crate::text_encoder::{unconditional_embeddings, TextEncoder};
use crate::unet::Denoiser;
use crate::utils::get_device;
use crate::vae::VideoAutoencoder;

use super::config::DistillConfig;
use super::ConsistencyDistiller;

/// Collects the frozen collaborators and the student, then validates the
/// configuration and precomputes everything a step reuses.
pub struct DistillerBuilder {
    config: DistillConfig,
    device: Device,
    vae: Option<Box<dyn VideoAutoencoder>>,
    text_encoder: Option<Box<dyn TextEncoder>>,
    teacher: Option<Box<dyn Denoiser>>,
    student: Option<Box<dyn Denoiser>>,
    rewards: RewardRegistry,
}

impl DistillerBuilder {
    pub fn new(config: DistillConfig) -> Self {
        Self {
            config,
            device: get_device(),
            vae: None,
            text_encoder: None,
            teacher: None,
            student: None,
            rewards: RewardRegistry::new(),
        }
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn vae(mut self, vae: Box<dyn VideoAutoencoder>) -> Self {
        self.vae = Some(vae);
        self
    }

    pub fn text_encoder(mut self, text_encoder: Box<dyn TextEncoder>) -> Self {
        self.text_encoder = Some(text_encoder);
        self
    }

    pub fn teacher(mut self, teacher: Box<dyn Denoiser>) -> Self {
        self.teacher = Some(teacher);
        self
    }

    pub fn student(mut self, student: Box<dyn Denoiser>) -> Self {
        self.student = Some(student);
        self
    }

    pub fn rewards(mut self, rewards: RewardRegistry) -> Self {
        self.rewards = rewards;
        self
    }

    fn required<T>(value: Option<T>, name: &str) -> Result<T> {
        value.ok_or_else(|| DistillError::config(format!("no {name} was provided to the builder")))
    }

    pub fn build(mut self) -> Result<ConsistencyDistiller> {
        let config = self.config;
        config.validate()?;
        let vae = Self::required(self.vae, "autoencoder")?;
        let text_encoder = Self::required(self.text_encoder, "text encoder")?;
        let teacher = Self::required(self.teacher, "teacher")?;
        let student = Self::required(self.student, "student")?;

        let schedule = NoiseSchedule::new(&config.noise_schedule(), self.device)?;
        let solver = DdimSolver::new(
            &schedule,
            config.num_ddim_timesteps,
            config.solver_mode(),
            config.ddim_eta,
            config.set_alpha_to_one,
            self.device,
        )?;
        let rewards = RewardAugmenter::new(
            &config.reward,
            config.train_batch_size,
            config.n_frames,
            config.vae_scale_factor,
            &mut self.rewards,
        )?;
        let uncond_context =
            unconditional_embeddings(text_encoder.as_ref(), 1)?.to_device(self.device);
        info!(
            device = ?self.device,
            num_ddim_timesteps = config.num_ddim_timesteps,
            topk = config.topk,
            w_min = config.w_min,
            w_max = config.w_max,
            loss = ?config.loss_type,
            ddim_eta = solver.eta(),
            image_reward = rewards.image_enabled(),
            video_reward = rewards.video_enabled(),
            "built consistency distiller"
        );

        Ok(ConsistencyDistiller {
            device: self.device,
            guidance: config.guidance_range()?,
            boundary: config.boundary(),
            loss_fn: config.loss_type.resolve()?,
            schedule,
            solver,
            rewards,
            uncond_context,
            vae,
            text_encoder,
            teacher,
            student,
            config,
        })
    }
}
