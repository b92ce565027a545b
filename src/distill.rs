//! # Consistency distillation step.
//!
//! One call samples a point on the teacher's probability-flow trajectory,
//! advances it one sparse DDIM step with the classifier-free-guided teacher and
//! trains the student to map both points to the same clean sample. Optional
//! reward terms score decoded frames of the student's prediction.
pub mod builder;
pub mod config;
mod types;

use tch::{Device, Kind, Tensor};
use tracing::{debug, warn};

use crate::consistency::BoundaryCondition;
use crate::error::{DistillError, Result};
use crate::guidance::{guidance_scale_embedding, DualTeacherRollout, GuidanceRange};
use crate::losses::LossFn;
use crate::reward::RewardAugmenter;
use crate::schedulers::ddim_solver::DdimSolver;
use crate::schedulers::NoiseSchedule;
use crate::text_encoder::{encode_prompts, select_captions, Caption, TextEncoder};
use crate::unet::{checked_forward, Conditioning, Denoiser};
use crate::utils::{append_dims, count_nan, has_nan};
use crate::vae::VideoAutoencoder;

pub use builder::DistillerBuilder;
pub use config::DistillConfig;
pub use types::{LossScalars, StepOutput, StepStage};

pub struct ConsistencyDistiller {
    config: DistillConfig,
    device: Device,
    schedule: NoiseSchedule,
    solver: DdimSolver,
    boundary: BoundaryCondition,
    guidance: GuidanceRange,
    loss_fn: LossFn,
    rewards: RewardAugmenter,
    /// Embedding of one empty prompt, repeated to the batch size.
    uncond_context: Tensor,
    vae: Box<dyn VideoAutoencoder>,
    text_encoder: Box<dyn TextEncoder>,
    teacher: Box<dyn Denoiser>,
    student: Box<dyn Denoiser>,
}

fn latent_dims(xs: &Tensor, context: &'static str) -> Result<[i64; 5]> {
    let size = xs.size();
    match <[i64; 5]>::try_from(size.as_slice()) {
        Ok(dims) => Ok(dims),
        Err(_) => Err(DistillError::ShapeMismatch {
            context,
            expected: vec![-1; 5],
            actual: size,
        }),
    }
}

impl ConsistencyDistiller {
    pub fn config(&self) -> &DistillConfig {
        &self.config
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn solver(&self) -> &DdimSolver {
        &self.solver
    }

    pub fn student(&self) -> &dyn Denoiser {
        self.student.as_ref()
    }

    pub fn vae(&self) -> &dyn VideoAutoencoder {
        self.vae.as_ref()
    }

    pub fn text_encoder(&self) -> &dyn TextEncoder {
        self.text_encoder.as_ref()
    }

    /// Encodes `(b, t, 3, h, w)` pixels in `[-1, 1]` to scaled `(b, c, t, h', w')` latents.
    pub fn encode_latents(&self, pixels: &Tensor) -> Result<Tensor> {
        debug!(stage = %StepStage::Encode, "step stage");
        let [b, t, c, h, w] = latent_dims(pixels, "pixel values (b, t, c, h, w)")?;
        let frames = pixels.to_device(self.device).to_kind(Kind::Float).reshape([b * t, c, h, w]);
        let chunk = self.config.vae_encode_batch_size as i64;
        let latents = tch::no_grad(|| {
            let chunks: Vec<Tensor> = frames
                .split(chunk, 0)
                .iter()
                .map(|frames| self.vae.encode(frames).sample())
                .collect();
            Tensor::cat(&chunks, 0)
        });
        let size = latents.size();
        if size.len() != 4 || size[0] != b * t {
            return Err(DistillError::ShapeMismatch {
                context: "encoded frames (b * t, c, h, w)",
                expected: vec![b * t, -1, -1, -1],
                actual: size,
            });
        }
        let latents = latents
            .reshape([b, t, size[1], size[2], size[3]])
            .permute([0, 2, 1, 3, 4])
            .contiguous();
        Ok(latents * self.config.vae_scale_factor)
    }

    /// Full step from raw videos.
    pub fn train_step(&self, pixels: &Tensor, captions: &[Caption]) -> Result<StepOutput> {
        let latents = self.encode_latents(pixels)?;
        self.distill_latents(&latents, captions)
    }

    fn unconditional(&self, batch: i64) -> Tensor {
        let mut repeats = vec![1i64; self.uncond_context.dim()];
        repeats[0] = batch;
        self.uncond_context.repeat(repeats.as_slice())
    }

    /// Step from already encoded and scaled `(b, c, t, h, w)` latents.
    pub fn distill_latents(&self, latents: &Tensor, captions: &[Caption]) -> Result<StepOutput> {
        let [b, ..] = latent_dims(latents, "latents (b, c, t, h, w)")?;
        if captions.len() as i64 != b {
            return Err(DistillError::ShapeMismatch {
                context: "one caption per sample",
                expected: vec![b],
                actual: vec![captions.len() as i64],
            });
        }
        let latents = latents.to_device(self.device);
        let ndim = latents.dim();
        let prompts = select_captions(captions, true);
        let context = encode_prompts(self.text_encoder.as_ref(), &prompts)?.to_device(self.device);
        let cond = Conditioning::new(context, self.config.fps);
        let uncond = cond.with_context(self.unconditional(b));

        debug!(stage = %StepStage::SampleTimesteps, "step stage");
        let k = self.solver.num_ddim_timesteps() as i64;
        let index = Tensor::randint(k, [b], (Kind::Int64, self.device));
        let start_timesteps = self.solver.timesteps_at(&index);
        let timesteps = start_timesteps.g_sub_scalar(self.config.topk).clamp_min(0i64);
        let noise = latents.randn_like();
        let noisy_latents = self.schedule.add_noise(&latents, &noise, &start_timesteps)?;
        let w = self.guidance.sample(b, self.device);
        let w_embedding =
            guidance_scale_embedding(&w, self.config.time_cond_proj_dim).to_kind(latents.kind());
        let w = append_dims(&w, ndim)?;

        debug!(stage = %StepStage::StudentForwardStart, "step stage");
        let noise_pred = checked_forward(
            self.student.as_ref(),
            "student",
            &noisy_latents,
            &start_timesteps,
            &cond,
            Some(&w_embedding),
        )?;
        let pred_x0 = self.schedule.predicted_original_sample(
            &noise_pred,
            &start_timesteps,
            &noisy_latents,
            self.config.prediction_type,
        )?;
        let model_pred = self.boundary.apply(&noisy_latents, &pred_x0, &start_timesteps)?;

        let zero = || Tensor::from(0f32).to_device(self.device);
        let image_reward_loss = self
            .rewards
            .image_reward_loss(&model_pred, &prompts, self.vae.as_ref())?
            .unwrap_or_else(zero);
        let video_reward_loss = self
            .rewards
            .video_reward_loss(&model_pred, &prompts, self.vae.as_ref())?
            .unwrap_or_else(zero);

        debug!(stage = %StepStage::TeacherDualForward, "step stage");
        let rollout = DualTeacherRollout {
            teacher: self.teacher.as_ref(),
            schedule: &self.schedule,
            prediction_type: self.config.prediction_type,
        };
        let estimate = rollout.estimate(&noisy_latents, &start_timesteps, &cond, &uncond, &w)?;

        debug!(stage = %StepStage::OdeStep, "step stage");
        let x_prev = tch::no_grad(|| {
            self.solver.ddim_step(&estimate.pred_x0, &estimate.pred_noise, &index)
        })?;

        debug!(stage = %StepStage::StudentForwardTarget, "step stage");
        let target = tch::no_grad(|| {
            let target_noise_pred = checked_forward(
                self.student.as_ref(),
                "student target",
                &x_prev,
                &timesteps,
                &cond,
                Some(&w_embedding),
            )?;
            let pred_x0 = self.schedule.predicted_original_sample(
                &target_noise_pred,
                &timesteps,
                &x_prev,
                self.config.prediction_type,
            )?;
            self.boundary.apply(&x_prev, &pred_x0, &timesteps)
        })?;

        debug!(stage = %StepStage::ComposeLoss, "step stage");
        let distill_loss = (self.loss_fn)(&model_pred, &target.detach());
        let loss = &distill_loss + &image_reward_loss + &video_reward_loss;
        if has_nan(&loss) {
            warn!(nan_predictions = count_nan(&model_pred), "distillation loss is NaN");
        }
        Ok(StepOutput { loss, distill_loss, image_reward_loss, video_reward_loss })
    }
}
