pub mod error;
pub mod utils;
pub mod schedulers;
pub mod consistency;
pub mod guidance;
pub mod losses;
pub mod unet;
pub mod vae;
pub mod text_encoder;
pub mod reward;
pub mod distill;
pub mod pipeline;
pub mod model_kind;
pub mod example_models;

pub use distill::{
    ConsistencyDistiller, DistillConfig, DistillerBuilder, LossScalars, StepOutput, StepStage,
};
pub use error::{DistillError, Result};
pub use text_encoder::Caption;
