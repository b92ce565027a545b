use std::fmt;

use tch::Tensor;

use crate::error::Result;
use crate::utils::scalar;

/// Phases of one distillation step, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStage {
    Encode,
    SampleTimesteps,
    StudentForwardStart,
    TeacherDualForward,
    OdeStep,
    StudentForwardTarget,
    ComposeLoss,
}

impl fmt::Display for StepStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepStage::Encode => "encode",
            StepStage::SampleTimesteps => "sample_timesteps",
            StepStage::StudentForwardStart => "student_forward_start",
            StepStage::TeacherDualForward => "teacher_dual_forward",
            StepStage::OdeStep => "ode_step",
            StepStage::StudentForwardTarget => "student_forward_target",
            StepStage::ComposeLoss => "compose_loss",
        };
        f.write_str(name)
    }
}

/// Scalar losses of one step. `loss` keeps the autograd graph back to the
/// student parameters, the components are reported for logging.
#[derive(Debug)]
pub struct StepOutput {
    pub loss: Tensor,
    pub distill_loss: Tensor,
    pub image_reward_loss: Tensor,
    pub video_reward_loss: Tensor,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossScalars {
    pub loss: f64,
    pub distill_loss: f64,
    pub image_reward_loss: f64,
    pub video_reward_loss: f64,
}

impl StepOutput {
    pub fn scalars(&self) -> Result<LossScalars> {
        Ok(LossScalars {
            loss: scalar(&self.loss)?,
            distill_loss: scalar(&self.distill_loss)?,
            image_reward_loss: scalar(&self.image_reward_loss)?,
            video_reward_loss: scalar(&self.video_reward_loss)?,
        })
    }
}

impl LossScalars {
    /// Largest absolute component-wise difference.
    pub fn max_abs_diff(&self, other: &LossScalars) -> f64 {
        [
            self.loss - other.loss,
            self.distill_loss - other.distill_loss,
            self.image_reward_loss - other.image_reward_loss,
            self.video_reward_loss - other.video_reward_loss,
        ]
        .iter()
        .fold(0.0, |acc, d| acc.max(d.abs()))
    }
}

impl fmt::Display for LossScalars {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loss {:.6} (distill {:.6}, image reward {:.6}, video reward {:.6})",
            self.loss, self.distill_loss, self.image_reward_loss, self.video_reward_loss
        )
    }
}
