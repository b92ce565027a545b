use serde::{Deserialize, Serialize};

use crate::distill::config::DistillConfig;
use crate::schedulers::{BetaSchedule, PredictionType};

/// Text-to-video teachers with known latent and schedule settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    VideoCrafter2,
    ModelScope,
}

impl ModelKind {
    /// Pixel resolution `(height, width)` the teacher was trained at.
    pub fn resolution(&self) -> (i64, i64) {
        match self {
            ModelKind::VideoCrafter2 => (320, 512),
            ModelKind::ModelScope => (256, 256),
        }
    }

    pub fn latent_channels(&self) -> i64 {
        4
    }

    /// Spatial downsampling of the autoencoder.
    pub fn vae_downsample(&self) -> i64 {
        8
    }

    /// Whether the denoiser takes a frame-rate condition.
    pub fn fps_conditioned(&self) -> bool {
        matches!(self, ModelKind::VideoCrafter2)
    }

    /// Overwrites the model-derived fields of `cfg`.
    pub fn apply(&self, cfg: DistillConfig) -> DistillConfig {
        DistillConfig {
            num_train_timesteps: 1000,
            beta_schedule: BetaSchedule::ScaledLinear,
            linear_start: 0.00085,
            linear_end: 0.012,
            prediction_type: PredictionType::Epsilon,
            vae_scale_factor: 0.18215,
            time_cond_proj_dim: 256,
            n_frames: 16,
            fps: if self.fps_conditioned() { Some(16) } else { None },
            ..cfg
        }
    }

    /// Latent shape `(c, t, h, w)` of one clip.
    pub fn latent_shape(&self, n_frames: i64) -> (i64, i64, i64, i64) {
        let (h, w) = self.resolution();
        let f = self.vae_downsample();
        (self.latent_channels(), n_frames, h / f, w / f)
    }
}
