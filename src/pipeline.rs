//! Few-step text-to-video sampling with a distilled student.
use tch::{Device, Kind, Tensor};
use tracing::{debug, info};

use crate::distill::ConsistencyDistiller;
use crate::error::{DistillError, Result};
use crate::guidance::guidance_scale_embedding;
use crate::schedulers::lcm::{LcmScheduler, LcmSchedulerConfig};
use crate::schedulers::types::Scheduler;
use crate::text_encoder::{encode_prompts, TextEncoder};
use crate::unet::{checked_forward, Conditioning, Denoiser};
use crate::vae::VideoAutoencoder;

pub struct TurboPipeline<'a> {
    pub student: &'a dyn Denoiser,
    pub vae: &'a dyn VideoAutoencoder,
    pub text_encoder: &'a dyn TextEncoder,
    pub scheduler: LcmScheduler,
    pub vae_scale_factor: f64,
    pub time_cond_proj_dim: i64,
    pub fps: Option<i64>,
    pub device: Device,
}

impl<'a> TurboPipeline<'a> {
    /// Samples with the distiller's student and collaborators.
    pub fn from_distiller(
        distiller: &'a ConsistencyDistiller,
        config: LcmSchedulerConfig,
    ) -> Result<Self> {
        let cfg = distiller.config();
        let config = LcmSchedulerConfig {
            prediction_type: cfg.prediction_type,
            boundary: cfg.boundary(),
            ..config
        };
        Ok(Self {
            student: distiller.student(),
            vae: distiller.vae(),
            text_encoder: distiller.text_encoder(),
            scheduler: LcmScheduler::new(distiller.schedule(), config)?,
            vae_scale_factor: cfg.vae_scale_factor,
            time_cond_proj_dim: cfg.time_cond_proj_dim,
            fps: cfg.fps,
            device: distiller.device(),
        })
    }

    /// Generates one clip per prompt. `latent_shape` is `(c, t, h, w)`; the
    /// result is `(b, t, 3, h', w')` in `[0, 1]`.
    pub fn generate(
        &self,
        prompts: &[String],
        guidance_scale: f64,
        latent_shape: (i64, i64, i64, i64),
    ) -> Result<Tensor> {
        if prompts.is_empty() {
            return Err(DistillError::config("at least one prompt is required"));
        }
        let b = prompts.len() as i64;
        let (c, t, h, w) = latent_shape;
        info!(prompts = b, steps = self.scheduler.timesteps().len(), guidance_scale, "generating");
        tch::no_grad(|| {
            let context = encode_prompts(self.text_encoder, prompts)?.to_device(self.device);
            let cond = Conditioning::new(context, self.fps);
            let w_embedding = guidance_scale_embedding(
                &Tensor::full([b], guidance_scale, (Kind::Float, self.device)),
                self.time_cond_proj_dim,
            );
            let mut latents = Tensor::randn([b, c, t, h, w], (Kind::Float, self.device))
                * self.scheduler.init_noise_sigma();
            for (i, &timestep) in self.scheduler.timesteps().iter().enumerate() {
                debug!(step = i, timestep, "denoising");
                let timesteps = Tensor::full([b], timestep, (Kind::Int64, self.device));
                let noise_pred = checked_forward(
                    self.student,
                    "student",
                    &latents,
                    &timesteps,
                    &cond,
                    Some(&w_embedding),
                )?;
                latents = self.scheduler.step(&noise_pred, timestep, &latents)?;
            }
            self.decode(&latents, b, t)
        })
    }

    fn decode(&self, latents: &Tensor, b: i64, t: i64) -> Result<Tensor> {
        let size = latents.size();
        let frames = (latents / self.vae_scale_factor)
            .permute([0, 2, 1, 3, 4])
            .reshape([b * t, size[1], size[3], size[4]]);
        let images = self.vae.decode(&frames);
        let decoded = images.size();
        if decoded.len() != 4 || decoded[0] != b * t {
            return Err(DistillError::ShapeMismatch {
                context: "decoded frames (b * t, 3, h, w)",
                expected: vec![b * t, 3, -1, -1],
                actual: decoded,
            });
        }
        let video = images.reshape([b, t, decoded[1], decoded[2], decoded[3]]);
        Ok((video / 2.0 + 0.5).clamp(0.0, 1.0))
    }
}
